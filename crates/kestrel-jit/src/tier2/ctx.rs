use std::sync::Arc;

use kestrel_types::{CodeDescriptor, ObjRef};

use super::deps::DependencySet;
use super::frame::AbstractFrame;
use super::opt::OptConfig;
use super::sym::{SymArena, SymId, SymValue};
use crate::error::OptError;
use crate::uop::UopKind;

/// A frame built by a call-init uop, waiting for the matching `PushFrame`.
#[derive(Clone, Debug)]
struct PendingFrame {
    frame: AbstractFrame,
    marker: SymId,
}

/// State of one optimization attempt.
///
/// Owns the symbol arena, the shared slot space every abstract frame is a window into, the frame
/// stack (entry frame at the bottom) and the dependency set. A context is never shared between
/// attempts.
///
/// Invariants:
/// - `frames` is never empty and never longer than the configured max depth.
/// - Every frame's window lies inside `[0, n_consumed)`.
/// - An empty slot (`None`) reads as a fresh `Unknown`, which is then stored so later reads of the
///   same slot observe the same symbol.
#[derive(Debug)]
pub struct OptContext {
    arena: SymArena,
    slots: Vec<Option<SymId>>,
    max_slots: usize,
    n_consumed: usize,
    frames: Vec<AbstractFrame>,
    max_frame_depth: usize,
    pending: Option<PendingFrame>,
    deps: DependencySet,
}

impl OptContext {
    /// Seeds a context with the entry frame of `entry`, holding `stack_depth` unknown values.
    pub fn new(
        entry: Arc<CodeDescriptor>,
        stack_depth: usize,
        cfg: &OptConfig,
    ) -> Result<Self, OptError> {
        let mut ctx = Self {
            arena: SymArena::new(cfg.max_symbols),
            slots: Vec::new(),
            max_slots: cfg.max_slots,
            n_consumed: 0,
            frames: Vec::with_capacity(cfg.max_frame_depth.max(1)),
            max_frame_depth: cfg.max_frame_depth.max(1),
            pending: None,
            deps: DependencySet::new(),
        };
        let mut frame = ctx.frame_new(entry, 0, 0)?;
        if stack_depth > frame.stack_capacity() {
            return Err(OptError::StackOverflow);
        }
        frame.stack_pointer += stack_depth;
        ctx.frames.push(frame);
        Ok(ctx)
    }

    pub fn arena(&self) -> &SymArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut SymArena {
        &mut self.arena
    }

    pub fn value(&self, id: SymId) -> &SymValue {
        self.arena.get(id)
    }

    pub fn dependencies(&self) -> &DependencySet {
        &self.deps
    }

    pub fn add_dependency(&mut self, obj: &ObjRef) {
        self.deps.add(obj);
    }

    pub(crate) fn into_dependencies(self) -> DependencySet {
        self.deps
    }

    /// Number of frames on the abstract frame stack, entry frame included.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn max_frame_depth(&self) -> usize {
        self.max_frame_depth
    }

    /// First slot past every live frame window.
    pub fn n_consumed(&self) -> usize {
        self.n_consumed
    }

    pub fn frame(&self) -> &AbstractFrame {
        // `frames` always holds the entry frame.
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut AbstractFrame {
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }

    pub fn frames(&self) -> &[AbstractFrame] {
        &self.frames
    }

    pub fn code(&self) -> &Arc<CodeDescriptor> {
        &self.frame().code
    }

    pub fn has_pending_frame(&self) -> bool {
        self.pending.is_some()
    }

    /// Builds a frame for `code` whose locals start at slot `localsplus_start`.
    ///
    /// The first `n_filled` locals keep whatever symbols already occupy those slots; the rest of
    /// the window is cleared to lazily-materialized `Unknown`.
    pub fn frame_new(
        &mut self,
        code: Arc<CodeDescriptor>,
        localsplus_start: usize,
        n_filled: usize,
    ) -> Result<AbstractFrame, OptError> {
        let frame = AbstractFrame::new(code, localsplus_start);
        if frame.stack_limit > self.max_slots {
            return Err(OptError::SlotLimit {
                needed: frame.stack_limit,
                limit: self.max_slots,
            });
        }
        if n_filled > frame.nlocalsplus() {
            return Err(OptError::ArityMismatch {
                given: n_filled,
                expected: frame.nlocalsplus(),
            });
        }
        if self.slots.len() < frame.stack_limit {
            self.slots.resize(frame.stack_limit, None);
        }
        for slot in &mut self.slots[localsplus_start + n_filled..frame.stack_limit] {
            *slot = None;
        }
        self.n_consumed = self.n_consumed.max(frame.stack_limit);
        Ok(frame)
    }

    pub(crate) fn set_pending(&mut self, frame: AbstractFrame, marker: SymId) {
        self.pending = Some(PendingFrame { frame, marker });
    }

    pub(crate) fn take_pending(
        &mut self,
        marker: SymId,
        kind: UopKind,
    ) -> Result<AbstractFrame, OptError> {
        match self.pending.take() {
            Some(pending) if pending.marker == marker => Ok(pending.frame),
            _ => Err(OptError::NoPendingFrame { kind }),
        }
    }

    /// Makes `frame` the current frame. The caller's stack pointer stays saved in its own frame.
    pub fn push_frame(&mut self, frame: AbstractFrame) -> Result<(), OptError> {
        if self.frames.len() >= self.max_frame_depth {
            return Err(OptError::FrameDepthExceeded {
                max_depth: self.max_frame_depth,
            });
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Drops the current frame and resumes its caller.
    pub fn pop_frame(&mut self) -> Result<AbstractFrame, OptError> {
        if self.frames.len() <= 1 {
            return Err(OptError::FrameUnderflow);
        }
        let frame = self.frames.pop().ok_or(OptError::FrameUnderflow)?;
        self.n_consumed = self
            .frames
            .iter()
            .map(|f| f.stack_limit)
            .max()
            .unwrap_or(0);
        Ok(frame)
    }

    fn materialize(&mut self, index: usize) -> Result<SymId, OptError> {
        match self.slots.get(index).copied() {
            Some(Some(id)) => Ok(id),
            Some(None) => {
                let id = self.arena.unknown()?;
                self.slots[index] = Some(id);
                Ok(id)
            }
            None => Err(OptError::SlotLimit {
                needed: index + 1,
                limit: self.slots.len(),
            }),
        }
    }

    pub fn stack_depth(&self) -> usize {
        self.frame().stack_depth()
    }

    pub fn push(&mut self, id: SymId) -> Result<(), OptError> {
        let frame = self.frame();
        if frame.stack_pointer >= frame.stack_limit {
            return Err(OptError::StackOverflow);
        }
        let sp = frame.stack_pointer;
        self.slots[sp] = Some(id);
        self.frame_mut().stack_pointer += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<SymId, OptError> {
        let frame = self.frame();
        if frame.stack_pointer <= frame.stack_base {
            return Err(OptError::StackUnderflow);
        }
        let sp = frame.stack_pointer - 1;
        let id = self.materialize(sp)?;
        self.frame_mut().stack_pointer = sp;
        Ok(id)
    }

    /// Discards the top `n` stack entries without reading them.
    pub fn drop_top(&mut self, n: usize) -> Result<(), OptError> {
        if n > self.stack_depth() {
            return Err(OptError::StackUnderflow);
        }
        self.frame_mut().stack_pointer -= n;
        Ok(())
    }

    fn stack_index(&self, n: usize) -> Result<usize, OptError> {
        if n == 0 || n > self.stack_depth() {
            return Err(OptError::StackUnderflow);
        }
        Ok(self.frame().stack_pointer - n)
    }

    /// Symbol `n` entries from the top (`1` is the top).
    pub fn peek(&mut self, n: usize) -> Result<SymId, OptError> {
        let index = self.stack_index(n)?;
        self.materialize(index)
    }

    pub fn set_peek(&mut self, n: usize, id: SymId) -> Result<(), OptError> {
        let index = self.stack_index(n)?;
        self.slots[index] = Some(id);
        Ok(())
    }

    fn local_index(&self, index: usize) -> Result<usize, OptError> {
        let frame = self.frame();
        if index >= frame.nlocalsplus() {
            return Err(OptError::BadLocal {
                index: index as i64,
                nlocalsplus: frame.nlocalsplus(),
            });
        }
        Ok(frame.locals_base + index)
    }

    pub fn local(&mut self, index: usize) -> Result<SymId, OptError> {
        let slot = self.local_index(index)?;
        self.materialize(slot)
    }

    pub fn set_local(&mut self, index: usize, id: SymId) -> Result<(), OptError> {
        let slot = self.local_index(index)?;
        self.slots[slot] = Some(id);
        Ok(())
    }

    /// Symbol in stack entry `n` from the top, if it has been materialized.
    pub fn stack_slot(&self, n: usize) -> Option<SymId> {
        let index = self.stack_index(n).ok()?;
        self.slots.get(index).copied().flatten()
    }

    /// Symbol in local `index` of the current frame, if it has been materialized.
    pub fn local_slot(&self, index: usize) -> Option<SymId> {
        let slot = self.local_index(index).ok()?;
        self.slots.get(slot).copied().flatten()
    }
}
