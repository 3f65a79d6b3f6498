//! Per-uop transfer functions.
//!
//! Each arm pops and pushes symbols to mirror the uop's effect on the real stack, and may rewrite
//! the uop in place once the symbolic state proves a cheaper form equivalent. Rewrites happen only
//! after every fallible step of the arm has succeeded.

use kestrel_types::{FunctionAttrs, ObjRef, Object, TypeTag};
use tracing::trace;

use super::OptStats;
use crate::error::OptError;
use crate::tier2::ctx::OptContext;
use crate::tier2::sym::SymId;
use crate::uop::{Uop, UopKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Flow {
    Continue,
    /// The uop ends straight-line analysis (trace exit or loop back edge).
    Stop,
}

fn oparg_usize(uop: &Uop) -> Result<usize, OptError> {
    usize::try_from(uop.oparg).map_err(|_| OptError::BadOparg {
        kind: uop.kind,
        oparg: uop.oparg,
    })
}

fn rewrite(uop: &mut Uop, kind: UopKind, stats: &mut OptStats) {
    trace!(from = %uop.kind, to = %kind, "tier-2 rewrite");
    if kind == UopKind::Nop {
        *uop = Uop::NOP;
    } else {
        uop.kind = kind;
    }
    stats.rewrites += 1;
}

fn remove_guard(uop: &mut Uop, stats: &mut OptStats) {
    rewrite(uop, UopKind::Nop, stats);
    stats.guards_removed += 1;
}

/// A guard whose operand is already proven incompatible can never pass.
fn guard_conflict(kind: UopKind) -> impl FnOnce(OptError) -> OptError {
    move |err| match err {
        OptError::RefinementConflict { proven, asserted } => OptError::GuardNeverPasses {
            kind,
            reason: format!("operand is {proven}, guard requires {asserted}"),
        },
        other => other,
    }
}

fn guard_type(kind: UopKind) -> Option<TypeTag> {
    match kind {
        UopKind::GuardBothInt => Some(TypeTag::Int),
        UopKind::GuardBothFloat => Some(TypeTag::Float),
        UopKind::GuardBothUnicode => Some(TypeTag::Str),
        _ => None,
    }
}

fn binop_result(kind: UopKind) -> Option<TypeTag> {
    match kind {
        UopKind::BinaryOpAddInt | UopKind::BinaryOpSubtractInt | UopKind::BinaryOpMultiplyInt => {
            Some(TypeTag::Int)
        }
        UopKind::BinaryOpAddFloat
        | UopKind::BinaryOpSubtractFloat
        | UopKind::BinaryOpMultiplyFloat => Some(TypeTag::Float),
        UopKind::BinaryOpAddUnicode => Some(TypeTag::Str),
        _ => None,
    }
}

/// Whether the `self` slot of a call is known to hold a receiver.
fn self_presence(ctx: &OptContext, self_or_null: SymId) -> Option<bool> {
    let arena = ctx.arena();
    if arena.is_null(self_or_null) {
        Some(false)
    } else if arena.is_not_null(self_or_null) {
        Some(true)
    } else {
        None
    }
}

pub(super) fn apply(
    ctx: &mut OptContext,
    constants: &[ObjRef],
    uop: &mut Uop,
    stats: &mut OptStats,
) -> Result<Flow, OptError> {
    use UopKind::*;

    // A pending zero-copy callee window overlaps the caller's stack above the marker.
    if ctx.has_pending_frame() && !matches!(uop.kind, Nop | SaveReturnOffset | SetIp | PushFrame) {
        return Err(OptError::InterleavedCallSetup { kind: uop.kind });
    }

    match uop.kind {
        Nop | SaveReturnOffset | SetIp => {}

        LoadFast => {
            let value = ctx.local(oparg_usize(uop)?)?;
            ctx.push(value)?;
        }
        LoadFastCheck => {
            let index = oparg_usize(uop)?;
            let value = ctx.local(index)?;
            if ctx.arena().is_null(value) {
                return Err(OptError::UnboundLocal { index });
            }
            ctx.push(value)?;
            if ctx.arena().is_not_null(value) {
                rewrite(uop, LoadFast, stats);
                stats.checks_relaxed += 1;
            }
        }
        LoadFastAndClear => {
            let index = oparg_usize(uop)?;
            let value = ctx.local(index)?;
            let cleared = ctx.arena_mut().null()?;
            ctx.set_local(index, cleared)?;
            ctx.push(value)?;
        }
        StoreFast | StoreFastMaybeNull => {
            let index = oparg_usize(uop)?;
            let value = ctx.pop()?;
            ctx.set_local(index, value)?;
        }
        PopTop => {
            ctx.pop()?;
        }
        PushNull => {
            let null = ctx.arena_mut().null()?;
            ctx.push(null)?;
        }

        LoadConst => {
            let index = oparg_usize(uop)?;
            let value = ctx
                .code()
                .consts
                .get(index)
                .cloned()
                .ok_or(OptError::MissingConstant {
                    kind: uop.kind,
                    index: i64::from(uop.oparg),
                })?;
            let sym = ctx.arena_mut().constant(value)?;
            ctx.push(sym)?;
        }
        LoadConstInline | LoadConstInlineWithNull => {
            let value = uop
                .operand
                .and_then(|op| constants.get(op as usize))
                .cloned()
                .ok_or(OptError::MissingConstant {
                    kind: uop.kind,
                    index: uop.operand.map_or(-1, i64::from),
                })?;
            let sym = ctx.arena_mut().constant(value)?;
            ctx.push(sym)?;
            if uop.kind == LoadConstInlineWithNull {
                let null = ctx.arena_mut().null()?;
                ctx.push(null)?;
            }
        }

        Copy => {
            let n = oparg_usize(uop)?;
            if n == 0 {
                return Err(OptError::BadOparg {
                    kind: uop.kind,
                    oparg: uop.oparg,
                });
            }
            let bottom = ctx.peek(n)?;
            ctx.push(bottom)?;
        }
        Swap => {
            let n = oparg_usize(uop)?;
            if n < 2 {
                return Err(OptError::BadOparg {
                    kind: uop.kind,
                    oparg: uop.oparg,
                });
            }
            let top = ctx.peek(1)?;
            let bottom = ctx.peek(n)?;
            ctx.set_peek(1, bottom)?;
            ctx.set_peek(n, top)?;
        }

        GuardBothInt | GuardBothFloat | GuardBothUnicode => {
            let ty = guard_type(uop.kind).ok_or(OptError::BadOparg {
                kind: uop.kind,
                oparg: uop.oparg,
            })?;
            let left = ctx.peek(2)?;
            let right = ctx.peek(1)?;
            let arena = ctx.arena();
            if arena.matches_type(left, ty, true) && arena.matches_type(right, ty, true) {
                remove_guard(uop, stats);
            } else {
                let arena = ctx.arena_mut();
                arena
                    .refine_type(left, ty)
                    .map_err(guard_conflict(uop.kind))?;
                arena
                    .refine_type(right, ty)
                    .map_err(guard_conflict(uop.kind))?;
            }
        }

        BinaryOpAddInt | BinaryOpSubtractInt | BinaryOpMultiplyInt | BinaryOpAddFloat
        | BinaryOpSubtractFloat | BinaryOpMultiplyFloat | BinaryOpAddUnicode => {
            let ty = binop_result(uop.kind).ok_or(OptError::BadOparg {
                kind: uop.kind,
                oparg: uop.oparg,
            })?;
            ctx.pop()?;
            ctx.pop()?;
            let res = ctx.arena_mut().exact_type(ty)?;
            ctx.push(res)?;
        }

        LoadAttr => load_attr(ctx, uop)?,

        MakeFunction => {
            ctx.pop()?;
            let func = ctx.arena_mut().exact_type(TypeTag::Function)?;
            ctx.push(func)?;
        }
        SetFunctionAttribute => {
            let bits = u32::try_from(uop.oparg).ok();
            let valid = bits
                .and_then(FunctionAttrs::from_bits)
                .is_some_and(|attr| attr.bits().count_ones() == 1);
            if !valid {
                return Err(OptError::BadOparg {
                    kind: uop.kind,
                    oparg: uop.oparg,
                });
            }
            let func = ctx.pop()?;
            ctx.pop()?;
            ctx.push(func)?;
        }
        CopyFreeVars => {
            let n = oparg_usize(uop)?;
            let code = ctx.code().clone();
            if n != usize::from(code.nfreevars) {
                return Err(OptError::BadOparg {
                    kind: uop.kind,
                    oparg: uop.oparg,
                });
            }
            let offset = code.nlocalsplus() - n;
            for i in 0..n {
                let cell = ctx.arena_mut().unknown()?;
                ctx.set_local(offset + i, cell)?;
            }
        }

        CheckCallBoundMethodExactArgs => {
            let argc = oparg_usize(uop)?;
            let callable = ctx.peek(argc + 2)?;
            let null = ctx.peek(argc + 1)?;
            let arena = ctx.arena();
            if arena.matches_type(callable, TypeTag::BoundMethod, true) && arena.is_null(null) {
                remove_guard(uop, stats);
            } else {
                let arena = ctx.arena_mut();
                arena
                    .refine_type(callable, TypeTag::BoundMethod)
                    .map_err(guard_conflict(uop.kind))?;
                arena.refine_null(null).map_err(guard_conflict(uop.kind))?;
            }
        }
        InitCallBoundMethodExactArgs => {
            let argc = oparg_usize(uop)?;
            let callable = ctx.peek(argc + 2)?;
            ctx.peek(argc + 1)?;
            let bound = ctx
                .arena()
                .const_value(callable)
                .and_then(|obj| obj.as_bound_method())
                .map(|m| (m.func.clone(), m.self_obj.clone()));
            let (func, self_obj) = match bound {
                Some((func, self_obj)) => (
                    ctx.arena_mut().constant(func)?,
                    ctx.arena_mut().constant(self_obj)?,
                ),
                None => (ctx.arena_mut().unknown()?, ctx.arena_mut().unknown()?),
            };
            ctx.set_peek(argc + 2, func)?;
            ctx.set_peek(argc + 1, self_obj)?;
        }
        CheckFunctionExactArgs => check_function_exact_args(ctx, uop, stats)?,

        InitCallPyExactArgs0 | InitCallPyExactArgs1 | InitCallPyExactArgs2
        | InitCallPyExactArgs3 | InitCallPyExactArgs4 | InitCallPyExactArgs => {
            let argc = uop.kind.call_arity(uop.oparg).ok_or(OptError::BadOparg {
                kind: uop.kind,
                oparg: uop.oparg,
            })?;
            init_call(ctx, uop.kind, argc)?;
        }
        PushFrame => {
            let marker = ctx.pop()?;
            let frame = ctx.take_pending(marker, uop.kind)?;
            ctx.push_frame(frame)?;
            stats.frames_inlined += 1;
        }
        PopFrame => {
            let retval = ctx.pop()?;
            ctx.pop_frame()?;
            ctx.push(retval)?;
        }

        UnpackSequence | UnpackEx => {
            let n = oparg_usize(uop)?;
            let count = if uop.kind == UnpackSequence {
                n
            } else {
                (n & 0xFF) + (n >> 8) + 1
            };
            ctx.pop()?;
            for _ in 0..count {
                let value = ctx.arena_mut().unknown()?;
                ctx.push(value)?;
            }
        }

        ExitTrace | JumpToTop => return Ok(Flow::Stop),
    }

    Ok(Flow::Continue)
}

/// `LoadAttr`: the attribute name is `names[oparg >> 1]`; the low bit requests a method-style load
/// that also pushes the receiver (or null).
///
/// Owners are immutable, so a constant owner resolves the load to constants without recording a
/// dependency.
fn load_attr(ctx: &mut OptContext, uop: &Uop) -> Result<(), OptError> {
    let oparg = oparg_usize(uop)?;
    let method = oparg & 1 == 1;
    let name = ctx
        .code()
        .names
        .get(oparg >> 1)
        .cloned()
        .ok_or(OptError::BadOparg {
            kind: uop.kind,
            oparg: uop.oparg,
        })?;

    let owner = ctx.pop()?;
    let owner_obj = ctx.arena().const_value(owner).cloned();
    let ns = owner_obj.as_ref().and_then(|obj| obj.as_namespace());

    if method {
        let resolved = ns.and_then(|ns| match ns.method(&name) {
            Some(func) => Some((func.clone(), true)),
            None => ns.attr(&name).map(|attr| (attr.clone(), false)),
        });
        match resolved {
            Some((func, true)) => {
                let attr = ctx.arena_mut().constant(func)?;
                ctx.push(attr)?;
                ctx.push(owner)?;
            }
            Some((attr, false)) => {
                let attr = ctx.arena_mut().constant(attr)?;
                let null = ctx.arena_mut().null()?;
                ctx.push(attr)?;
                ctx.push(null)?;
            }
            None => {
                let attr = ctx.arena_mut().unknown()?;
                let self_or_null = ctx.arena_mut().self_or_null()?;
                ctx.push(attr)?;
                ctx.push(self_or_null)?;
            }
        }
    } else {
        let attr = match ns {
            Some(ns) => match (ns.attr(&name), ns.method(&name)) {
                (Some(attr), _) => {
                    let attr = attr.clone();
                    ctx.arena_mut().constant(attr)?
                }
                (None, Some(_)) => ctx.arena_mut().exact_type(TypeTag::BoundMethod)?,
                (None, None) => ctx.arena_mut().unknown()?,
            },
            None => ctx.arena_mut().unknown()?,
        };
        ctx.push(attr)?;
    }
    Ok(())
}

/// Constant function held by `callable`, if proven.
fn known_function(ctx: &OptContext, callable: SymId) -> Option<ObjRef> {
    ctx.arena()
        .const_value(callable)
        .filter(|obj| matches!(***obj, Object::Function(_)))
        .cloned()
}

fn check_function_exact_args(
    ctx: &mut OptContext,
    uop: &mut Uop,
    stats: &mut OptStats,
) -> Result<(), OptError> {
    let argc = oparg_usize(uop)?;
    let callable = ctx.peek(argc + 2)?;
    let self_or_null = ctx.peek(argc + 1)?;

    let Some(func_obj) = known_function(ctx, callable) else {
        return ctx
            .arena_mut()
            .refine_type(callable, TypeTag::Function)
            .map_err(guard_conflict(uop.kind));
    };
    let Some(func) = func_obj.as_function() else {
        return Ok(());
    };
    let Some(has_self) = self_presence(ctx, self_or_null) else {
        return Ok(());
    };

    let given = argc + usize::from(has_self);
    let expected = usize::from(func.code().argcount);
    if given != expected {
        return Err(OptError::GuardNeverPasses {
            kind: uop.kind,
            reason: format!("{} takes {expected} arguments, call passes {given}", func.code().name),
        });
    }
    ctx.add_dependency(&func_obj);
    remove_guard(uop, stats);
    Ok(())
}

/// Sets up the callee frame of a `InitCallPyExactArgs*` uop.
///
/// Stack before: `[callable, self_or_null, args[argc]]`; after: a marker symbol standing for the
/// pending frame. With `self` proven absent or present, the callee's locals are the argument slots
/// (plus `self`) where they already sit on the caller's stack. Otherwise the callee gets a fresh
/// window of unknown locals past every live frame.
fn init_call(ctx: &mut OptContext, kind: UopKind, argc: usize) -> Result<(), OptError> {
    let callable = ctx.peek(argc + 2)?;
    let self_or_null = ctx.peek(argc + 1)?;

    let code = known_function(ctx, callable)
        .and_then(|obj| obj.as_function().map(|f| f.code().clone()))
        .ok_or(OptError::UnresolvedCallee { kind })?;

    let presence = self_presence(ctx, self_or_null);
    let expected = usize::from(code.argcount);
    let arity_ok = match presence {
        Some(has_self) => argc + usize::from(has_self) == expected,
        None => argc == expected || argc + 1 == expected,
    };
    if !arity_ok {
        return Err(OptError::ArityMismatch {
            given: argc + usize::from(presence == Some(true)),
            expected,
        });
    }

    let sp = ctx.frame().stack_pointer;
    let (start, n_filled) = match presence {
        Some(false) => (sp - argc, argc),
        Some(true) => (sp - argc - 1, argc + 1),
        None => (ctx.n_consumed(), 0),
    };

    ctx.drop_top(argc + 2)?;
    let frame = ctx.frame_new(code, start, n_filled)?;
    let marker = ctx.arena_mut().unknown()?;
    ctx.push(marker)?;
    ctx.set_pending(frame, marker);
    Ok(())
}
