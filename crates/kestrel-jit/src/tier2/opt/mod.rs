//! The tier-2 optimizer pass: one forward abstract interpretation over a trace.

mod transfer;

use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span};

use super::ctx::OptContext;
use super::deps::DependencySet;
use crate::error::{FailureClass, OptError};
use crate::uop::{Trace, UopKind};

/// What to keep when the pass bails out part-way through a trace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContradictionPolicy {
    /// Keep rewrites already proven on the analyzed prefix; leave the remainder untouched.
    #[default]
    KeepPrefix,
    /// Restore the original trace on any bail-out.
    DiscardAll,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptConfig {
    /// Size of the abstract frame stack, entry frame included. Deeper inlining aborts the pass.
    pub max_frame_depth: usize,
    /// Capacity of the symbol arena.
    pub max_symbols: usize,
    /// Slot space shared by the locals and stacks of every abstract frame.
    pub max_slots: usize,
    pub contradiction_policy: ContradictionPolicy,
    /// Delete `Nop` uops once the pass is done.
    pub strip_nops: bool,
}

impl Default for OptConfig {
    fn default() -> Self {
        Self {
            max_frame_depth: 8,
            max_symbols: 2560,
            max_slots: 2048,
            contradiction_policy: ContradictionPolicy::KeepPrefix,
            strip_nops: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OptStatus {
    Complete,
    /// The pass stopped at uop `at` (an index into the trace as it was passed in).
    Aborted { at: usize, error: OptError },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OptStats {
    /// Uops whose kind was changed in place.
    pub rewrites: usize,
    /// Guards turned into `Nop`.
    pub guards_removed: usize,
    /// `LoadFastCheck` uops relaxed to `LoadFast`.
    pub checks_relaxed: usize,
    /// `PushFrame` uops analyzed across.
    pub frames_inlined: usize,
    /// Deepest abstract frame stack reached.
    pub max_depth: usize,
    /// Uops analyzed before the pass finished or stopped.
    pub analyzed: usize,
}

#[derive(Clone, Debug)]
pub struct OptReport {
    pub status: OptStatus,
    pub stats: OptStats,
    /// External facts the rewritten trace relies on.
    pub dependencies: DependencySet,
}

impl OptReport {
    pub fn is_complete(&self) -> bool {
        matches!(self.status, OptStatus::Complete)
    }

    pub fn failure_class(&self) -> Option<FailureClass> {
        match &self.status {
            OptStatus::Complete => None,
            OptStatus::Aborted { error, .. } => Some(error.class()),
        }
    }
}

pub fn optimize_trace(trace: &mut Trace, cfg: &OptConfig) -> OptReport {
    optimize_trace_observed(trace, cfg, |_, _| {})
}

/// Like [`optimize_trace`], calling `observe(index, ctx)` after each successfully analyzed uop.
pub fn optimize_trace_observed<F>(trace: &mut Trace, cfg: &OptConfig, mut observe: F) -> OptReport
where
    F: FnMut(usize, &OptContext),
{
    let span = debug_span!(
        "tier2_optimize",
        uops = trace.uops.len(),
        entry = %trace.entry.name
    );
    let _enter = span.enter();

    let original = match cfg.contradiction_policy {
        ContradictionPolicy::DiscardAll => Some(trace.uops.clone()),
        ContradictionPolicy::KeepPrefix => None,
    };

    let mut stats = OptStats::default();
    let (status, mut dependencies) =
        match OptContext::new(trace.entry.clone(), trace.entry_stack_depth, cfg) {
            Ok(mut ctx) => {
                stats.max_depth = ctx.depth();
                let status = run_pass(&mut ctx, trace, &mut stats, &mut observe);
                (status, ctx.into_dependencies())
            }
            Err(error) => {
                debug!(%error, "tier-2 context setup failed");
                (
                    OptStatus::Aborted { at: 0, error },
                    DependencySet::new(),
                )
            }
        };

    if let (OptStatus::Aborted { .. }, Some(original)) = (&status, original) {
        trace.uops = original;
        stats = OptStats {
            analyzed: stats.analyzed,
            ..OptStats::default()
        };
        dependencies.clear();
        return OptReport {
            status,
            stats,
            dependencies,
        };
    }

    if cfg.strip_nops {
        trace.uops.retain(|uop| uop.kind != UopKind::Nop);
    }

    debug!(
        complete = matches!(status, OptStatus::Complete),
        rewrites = stats.rewrites,
        guards_removed = stats.guards_removed,
        frames_inlined = stats.frames_inlined,
        remaining = trace.uops.len(),
        "tier-2 optimization finished"
    );

    OptReport {
        status,
        stats,
        dependencies,
    }
}

fn run_pass<F>(
    ctx: &mut OptContext,
    trace: &mut Trace,
    stats: &mut OptStats,
    observe: &mut F,
) -> OptStatus
where
    F: FnMut(usize, &OptContext),
{
    let Trace {
        uops, constants, ..
    } = trace;

    for (index, uop) in uops.iter_mut().enumerate() {
        match transfer::apply(ctx, constants, uop, stats) {
            Ok(flow) => {
                stats.analyzed = index + 1;
                stats.max_depth = stats.max_depth.max(ctx.depth());
                observe(index, ctx);
                if flow == transfer::Flow::Stop {
                    break;
                }
            }
            Err(error) => {
                debug!(
                    index,
                    kind = %uop.kind,
                    class = ?error.class(),
                    %error,
                    "tier-2 optimization bailed out"
                );
                return OptStatus::Aborted { at: index, error };
            }
        }
    }

    OptStatus::Complete
}
