//! Trace executor: runs a (possibly optimized) trace against a live machine state.

use std::sync::Arc;

use kestrel_types::{CodeDescriptor, FunctionAttrs, ObjRef, Object, TypeTag};

use crate::error::{ExecError, RaisedError};
use crate::stats::UopCounters;
use crate::uop::{Trace, Uop, UopKind};

/// One evaluation-stack entry.
#[derive(Clone, Debug, PartialEq)]
pub enum StackRef {
    Null,
    Obj(ObjRef),
    /// A call frame built by a call-init uop, consumed by the next `PushFrame`.
    Frame(Box<Frame>),
}

impl StackRef {
    fn describe(&self) -> String {
        match self {
            StackRef::Null => "null".to_string(),
            StackRef::Obj(obj) => obj.type_tag().name().to_string(),
            StackRef::Frame(_) => "frame".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub code: Arc<CodeDescriptor>,
    /// Function whose closure feeds `CopyFreeVars`.
    pub func: Option<ObjRef>,
    /// Locals followed by free-variable cells; `None` is unbound.
    pub locals: Vec<Option<ObjRef>>,
    pub stack: Vec<StackRef>,
    /// Bytecode offset most recently published by `SetIp`.
    pub ip: i32,
    pub return_offset: i32,
}

impl Frame {
    pub fn new(code: Arc<CodeDescriptor>, func: Option<ObjRef>) -> Self {
        let nlocalsplus = code.nlocalsplus();
        Self {
            code,
            func,
            locals: vec![None; nlocalsplus],
            stack: Vec::new(),
            ip: 0,
            return_offset: 0,
        }
    }

    #[must_use]
    pub fn with_local(mut self, index: usize, value: ObjRef) -> Self {
        if let Some(slot) = self.locals.get_mut(index) {
            *slot = Some(value);
        }
        self
    }

    #[must_use]
    pub fn with_stack(mut self, values: impl IntoIterator<Item = ObjRef>) -> Self {
        self.stack.extend(values.into_iter().map(StackRef::Obj));
        self
    }
}

/// Live machine state a trace executes against.
///
/// `modified` logs every function object mutated by `SetFunctionAttribute`, oldest first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Machine {
    pub frames: Vec<Frame>,
    pub modified: Vec<ObjRef>,
}

impl Machine {
    pub fn new(entry: Frame) -> Self {
        Self {
            frames: vec![entry],
            modified: Vec::new(),
        }
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// How a trace run ended.
#[derive(Clone, Debug, PartialEq)]
pub enum TraceExit {
    /// `ExitTrace`, or the end of a linear trace.
    Exit { ip: i32 },
    /// A guard failed; the interpreter resumes at `ip`.
    SideExit { ip: i32 },
    /// `PopFrame` out of the entry frame.
    Return(ObjRef),
    /// The guest program raised.
    Raised { ip: i32, error: RaisedError },
    /// `JumpToTop` was taken `max_iterations` times.
    IterationLimit,
}

enum Step {
    Next,
    Restart,
    Exit(TraceExit),
}

/// Runs `trace` on `machine`, counting each executed uop in `counters`.
///
/// Loop traces restart at `JumpToTop` until it has been taken `max_iterations` times.
pub fn run_trace(
    trace: &Trace,
    machine: &mut Machine,
    counters: &mut UopCounters,
    max_iterations: u64,
) -> Result<TraceExit, ExecError> {
    let mut iterations = 0u64;
    let mut pc = 0usize;
    loop {
        let Some(uop) = trace.uops.get(pc) else {
            let ip = machine.frame().ok_or(ExecError::NoFrame)?.ip;
            return Ok(TraceExit::Exit { ip });
        };
        counters.record(uop.kind);
        match step(trace, machine, pc, uop)? {
            Step::Next => pc += 1,
            Step::Restart => {
                iterations += 1;
                if iterations >= max_iterations {
                    return Ok(TraceExit::IterationLimit);
                }
                pc = 0;
            }
            Step::Exit(exit) => return Ok(exit),
        }
    }
}

struct Cursor<'a> {
    pc: usize,
    uop: &'a Uop,
}

impl Cursor<'_> {
    fn oparg(&self) -> Result<usize, ExecError> {
        usize::try_from(self.uop.oparg).map_err(|_| self.bad_oparg())
    }

    fn bad_oparg(&self) -> ExecError {
        ExecError::BadOparg {
            ip: self.pc,
            kind: self.uop.kind,
            oparg: self.uop.oparg,
        }
    }

    fn underflow(&self) -> ExecError {
        ExecError::StackUnderflow {
            ip: self.pc,
            kind: self.uop.kind,
        }
    }

    fn mismatch(&self, expected: TypeTag, found: &StackRef) -> ExecError {
        ExecError::TypeMismatch {
            ip: self.pc,
            kind: self.uop.kind,
            expected,
            found: found.describe(),
        }
    }

    fn pop_any(&self, frame: &mut Frame) -> Result<StackRef, ExecError> {
        frame.stack.pop().ok_or_else(|| self.underflow())
    }

    fn pop(&self, frame: &mut Frame) -> Result<ObjRef, ExecError> {
        match self.pop_any(frame)? {
            StackRef::Obj(obj) => Ok(obj),
            _ => Err(ExecError::NotAValue {
                ip: self.pc,
                kind: self.uop.kind,
            }),
        }
    }

    fn peek<'f>(&self, frame: &'f Frame, n: usize) -> Result<&'f StackRef, ExecError> {
        let len = frame.stack.len();
        if n == 0 || n > len {
            return Err(self.underflow());
        }
        Ok(&frame.stack[len - n])
    }

    fn local<'f>(&self, frame: &'f mut Frame) -> Result<&'f mut Option<ObjRef>, ExecError> {
        let index = self.oparg()?;
        let err = self.bad_oparg();
        frame.locals.get_mut(index).ok_or(err)
    }
}

fn raised(frame: &Frame, error: RaisedError) -> Step {
    Step::Exit(TraceExit::Raised {
        ip: frame.ip,
        error,
    })
}

fn side_exit(frame: &Frame) -> Step {
    Step::Exit(TraceExit::SideExit { ip: frame.ip })
}

fn has_type(item: &StackRef, ty: TypeTag) -> bool {
    matches!(item, StackRef::Obj(obj) if obj.type_tag() == ty)
}

fn step(trace: &Trace, machine: &mut Machine, pc: usize, uop: &Uop) -> Result<Step, ExecError> {
    use UopKind::*;

    let cur = Cursor { pc, uop };
    let Machine { frames, modified } = machine;
    let frame = frames.last_mut().ok_or(ExecError::NoFrame)?;

    match uop.kind {
        Nop => {}

        LoadFast => {
            let value = cur.local(frame)?.clone();
            frame.stack.push(value.map_or(StackRef::Null, StackRef::Obj));
        }
        LoadFastCheck => {
            let index = cur.oparg()?;
            let Some(value) = cur.local(frame)?.clone() else {
                return Ok(raised(frame, RaisedError::UnboundLocal { index }));
            };
            frame.stack.push(StackRef::Obj(value));
        }
        LoadFastAndClear => {
            let value = cur.local(frame)?.take();
            frame.stack.push(value.map_or(StackRef::Null, StackRef::Obj));
        }
        StoreFast => {
            let value = cur.pop(frame)?;
            *cur.local(frame)? = Some(value);
        }
        StoreFastMaybeNull => {
            let value = match cur.pop_any(frame)? {
                StackRef::Obj(obj) => Some(obj),
                StackRef::Null => None,
                StackRef::Frame(_) => return Err(ExecError::NotAValue { ip: pc, kind: uop.kind }),
            };
            *cur.local(frame)? = value;
        }
        PopTop => {
            cur.pop_any(frame)?;
        }
        PushNull => frame.stack.push(StackRef::Null),

        LoadConst => {
            let index = cur.oparg()?;
            let value = frame
                .code
                .consts
                .get(index)
                .cloned()
                .ok_or(ExecError::MissingConstant { ip: pc, kind: uop.kind })?;
            frame.stack.push(StackRef::Obj(value));
        }
        LoadConstInline | LoadConstInlineWithNull => {
            let value = uop
                .operand
                .and_then(|op| trace.constant(op))
                .cloned()
                .ok_or(ExecError::MissingConstant { ip: pc, kind: uop.kind })?;
            frame.stack.push(StackRef::Obj(value));
            if uop.kind == LoadConstInlineWithNull {
                frame.stack.push(StackRef::Null);
            }
        }

        Copy => {
            let n = cur.oparg()?;
            let value = cur.peek(frame, n)?.clone();
            frame.stack.push(value);
        }
        Swap => {
            let n = cur.oparg()?;
            if n < 2 {
                return Err(cur.bad_oparg());
            }
            cur.peek(frame, n)?;
            let len = frame.stack.len();
            frame.stack.swap(len - 1, len - n);
        }

        GuardBothInt | GuardBothFloat | GuardBothUnicode => {
            let ty = match uop.kind {
                GuardBothInt => TypeTag::Int,
                GuardBothFloat => TypeTag::Float,
                _ => TypeTag::Str,
            };
            let left = cur.peek(frame, 2)?;
            let right = cur.peek(frame, 1)?;
            if !(has_type(left, ty) && has_type(right, ty)) {
                return Ok(side_exit(frame));
            }
        }

        BinaryOpAddInt | BinaryOpSubtractInt | BinaryOpMultiplyInt => {
            let right = cur.pop(frame)?;
            let left = cur.pop(frame)?;
            let (Some(l), Some(r)) = (left.as_int(), right.as_int()) else {
                let bad = if left.as_int().is_none() { left } else { right };
                return Err(cur.mismatch(TypeTag::Int, &StackRef::Obj(bad)));
            };
            let res = match uop.kind {
                BinaryOpAddInt => l.checked_add(r),
                BinaryOpSubtractInt => l.checked_sub(r),
                _ => l.checked_mul(r),
            };
            let Some(res) = res else {
                return Ok(raised(frame, RaisedError::Overflow { kind: uop.kind }));
            };
            frame.stack.push(StackRef::Obj(Object::int(res)));
        }
        BinaryOpAddFloat | BinaryOpSubtractFloat | BinaryOpMultiplyFloat => {
            let right = cur.pop(frame)?;
            let left = cur.pop(frame)?;
            let (Some(l), Some(r)) = (left.as_float(), right.as_float()) else {
                let bad = if left.as_float().is_none() { left } else { right };
                return Err(cur.mismatch(TypeTag::Float, &StackRef::Obj(bad)));
            };
            let res = match uop.kind {
                BinaryOpAddFloat => l + r,
                BinaryOpSubtractFloat => l - r,
                _ => l * r,
            };
            frame.stack.push(StackRef::Obj(Object::float(res)));
        }
        BinaryOpAddUnicode => {
            let right = cur.pop(frame)?;
            let left = cur.pop(frame)?;
            let (Some(l), Some(r)) = (left.as_str(), right.as_str()) else {
                let bad = if left.as_str().is_none() {
                    left.clone()
                } else {
                    right.clone()
                };
                return Err(cur.mismatch(TypeTag::Str, &StackRef::Obj(bad)));
            };
            let joined = format!("{l}{r}");
            frame.stack.push(StackRef::Obj(Object::str(&joined)));
        }

        LoadAttr => {
            let oparg = cur.oparg()?;
            let name = frame
                .code
                .name_at(oparg >> 1)
                .map(str::to_string)
                .ok_or_else(|| cur.bad_oparg())?;
            let owner = cur.pop(frame)?;
            let Some(ns) = owner.as_namespace() else {
                let error = RaisedError::Attribute {
                    owner: owner.type_tag().name().to_string(),
                    name,
                };
                return Ok(raised(frame, error));
            };
            let missing = || RaisedError::Attribute {
                owner: ns.name().to_string(),
                name: name.clone(),
            };
            if oparg & 1 == 1 {
                if let Some(func) = ns.method(&name) {
                    frame.stack.push(StackRef::Obj(func.clone()));
                    frame.stack.push(StackRef::Obj(owner.clone()));
                } else if let Some(attr) = ns.attr(&name) {
                    frame.stack.push(StackRef::Obj(attr.clone()));
                    frame.stack.push(StackRef::Null);
                } else {
                    let error = missing();
                    return Ok(raised(frame, error));
                }
            } else if let Some(attr) = ns.attr(&name) {
                frame.stack.push(StackRef::Obj(attr.clone()));
            } else if let Some(func) = ns.method(&name) {
                let bound = Object::bound_method(func.clone(), owner.clone());
                frame.stack.push(StackRef::Obj(bound));
            } else {
                let error = missing();
                return Ok(raised(frame, error));
            }
        }

        MakeFunction => {
            let code_obj = cur.pop(frame)?;
            let Some(code) = code_obj.as_code() else {
                return Err(cur.mismatch(TypeTag::Code, &StackRef::Obj(code_obj)));
            };
            frame.stack.push(StackRef::Obj(Object::function(code.clone())));
        }
        SetFunctionAttribute => {
            let bits = u32::try_from(uop.oparg).map_err(|_| cur.bad_oparg())?;
            let func_obj = cur.pop(frame)?;
            let value = cur.pop(frame)?;
            let Some(func) = func_obj.as_function() else {
                return Err(cur.mismatch(TypeTag::Function, &StackRef::Obj(func_obj)));
            };
            if let Err(err) = func.set_attribute(FunctionAttrs::from_bits_retain(bits), value) {
                return Ok(raised(frame, RaisedError::Object(err)));
            }
            modified.push(func_obj.clone());
            frame.stack.push(StackRef::Obj(func_obj));
        }
        CopyFreeVars => {
            let n = cur.oparg()?;
            let closure: Vec<ObjRef> = frame
                .func
                .as_ref()
                .and_then(|f| f.as_function())
                .and_then(|f| f.closure())
                .map(|cells| cells.to_vec())
                .unwrap_or_default();
            if n != usize::from(frame.code.nfreevars) || closure.len() < n {
                return Err(cur.bad_oparg());
            }
            let offset = frame.code.nlocalsplus() - n;
            for (slot, cell) in frame.locals[offset..offset + n].iter_mut().zip(closure) {
                *slot = Some(cell);
            }
        }

        CheckCallBoundMethodExactArgs => {
            let argc = cur.oparg()?;
            let callable = cur.peek(frame, argc + 2)?;
            let null = cur.peek(frame, argc + 1)?;
            if !(has_type(callable, TypeTag::BoundMethod) && *null == StackRef::Null) {
                return Ok(side_exit(frame));
            }
        }
        InitCallBoundMethodExactArgs => {
            let argc = cur.oparg()?;
            let callable = cur.peek(frame, argc + 2)?.clone();
            cur.peek(frame, argc + 1)?;
            let method = match &callable {
                StackRef::Obj(obj) => obj.as_bound_method(),
                _ => None,
            };
            let Some(method) = method else {
                return Err(cur.mismatch(TypeTag::BoundMethod, &callable));
            };
            let len = frame.stack.len();
            frame.stack[len - argc - 2] = StackRef::Obj(method.func.clone());
            frame.stack[len - argc - 1] = StackRef::Obj(method.self_obj.clone());
        }
        CheckFunctionExactArgs => {
            let argc = cur.oparg()?;
            let callable = cur.peek(frame, argc + 2)?;
            let self_or_null = cur.peek(frame, argc + 1)?;
            let func = match callable {
                StackRef::Obj(obj) => obj.as_function(),
                _ => None,
            };
            let given = argc + usize::from(matches!(self_or_null, StackRef::Obj(_)));
            let ok = func.is_some_and(|f| usize::from(f.code().argcount) == given);
            if !ok {
                return Ok(side_exit(frame));
            }
        }

        InitCallPyExactArgs0 | InitCallPyExactArgs1 | InitCallPyExactArgs2
        | InitCallPyExactArgs3 | InitCallPyExactArgs4 | InitCallPyExactArgs => {
            let argc = uop
                .kind
                .call_arity(uop.oparg)
                .ok_or_else(|| cur.bad_oparg())?;
            if frame.stack.len() < argc + 2 {
                return Err(cur.underflow());
            }
            let args = frame.stack.split_off(frame.stack.len() - argc);
            let self_or_null = cur.pop_any(frame)?;
            let callable = cur.pop(frame)?;
            let Some(func) = callable.as_function() else {
                return Err(cur.mismatch(TypeTag::Function, &StackRef::Obj(callable)));
            };

            let mut callee = Frame::new(func.code().clone(), Some(callable.clone()));
            let bound = match self_or_null {
                StackRef::Obj(obj) => Some(StackRef::Obj(obj)),
                StackRef::Null => None,
                StackRef::Frame(_) => return Err(ExecError::NotAValue { ip: pc, kind: uop.kind }),
            };
            let given = argc + usize::from(bound.is_some());
            let expected = usize::from(callee.code.argcount);
            if given != expected {
                return Err(ExecError::ArityMismatch {
                    ip: pc,
                    given,
                    expected,
                });
            }
            for (slot, arg) in callee.locals.iter_mut().zip(bound.into_iter().chain(args)) {
                match arg {
                    StackRef::Obj(obj) => *slot = Some(obj),
                    _ => return Err(ExecError::NotAValue { ip: pc, kind: uop.kind }),
                }
            }
            frame.stack.push(StackRef::Frame(Box::new(callee)));
        }
        SaveReturnOffset => frame.return_offset = uop.oparg,
        PushFrame => {
            let StackRef::Frame(callee) = cur.pop_any(frame)? else {
                return Err(ExecError::NotAValue { ip: pc, kind: uop.kind });
            };
            frames.push(*callee);
        }
        PopFrame => {
            let retval = cur.pop(frame)?;
            if frames.len() == 1 {
                return Ok(Step::Exit(TraceExit::Return(retval)));
            }
            frames.pop();
            let caller = frames.last_mut().ok_or(ExecError::NoFrame)?;
            caller.stack.push(StackRef::Obj(retval));
        }

        UnpackSequence => {
            let n = cur.oparg()?;
            let seq = cur.pop(frame)?;
            let Some(items) = seq.as_sequence() else {
                let error = RaisedError::Unpack {
                    expected: n.to_string(),
                    found: format!("non-iterable {}", seq.type_tag()),
                };
                return Ok(raised(frame, error));
            };
            if items.len() != n {
                let error = RaisedError::Unpack {
                    expected: n.to_string(),
                    found: items.len().to_string(),
                };
                return Ok(raised(frame, error));
            }
            frame
                .stack
                .extend(items.iter().rev().cloned().map(StackRef::Obj));
        }
        UnpackEx => {
            let oparg = cur.oparg()?;
            let (before, after) = (oparg & 0xFF, oparg >> 8);
            let seq = cur.pop(frame)?;
            let Some(items) = seq.as_sequence() else {
                let error = RaisedError::Unpack {
                    expected: format!("at least {}", before + after),
                    found: format!("non-iterable {}", seq.type_tag()),
                };
                return Ok(raised(frame, error));
            };
            let len = items.len();
            if len < before + after {
                let error = RaisedError::Unpack {
                    expected: format!("at least {}", before + after),
                    found: len.to_string(),
                };
                return Ok(raised(frame, error));
            }
            let rest = Object::list(items[before..len - after].to_vec());
            frame
                .stack
                .extend(items[len - after..].iter().rev().cloned().map(StackRef::Obj));
            frame.stack.push(StackRef::Obj(rest));
            frame
                .stack
                .extend(items[..before].iter().rev().cloned().map(StackRef::Obj));
        }

        SetIp => frame.ip = uop.oparg,
        ExitTrace => {
            frame.ip = uop.oparg;
            return Ok(Step::Exit(TraceExit::Exit { ip: uop.oparg }));
        }
        JumpToTop => return Ok(Step::Restart),
    }

    Ok(Step::Next)
}
