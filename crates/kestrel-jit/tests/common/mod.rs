//! Shared helpers for `kestrel-jit` integration tests: code objects, machines and a generator of
//! random well-formed traces.
//!
//! Generated traces never trip an executor invariant (`ExecError`): binary ops always follow a
//! matching pairwise guard, stores accept null, attribute owners are never null, and every call is
//! preceded by the check that makes a mismatched call side-exit. They may still side-exit or raise,
//! which both the original and the optimized trace must do identically.

#![allow(dead_code)]

use std::sync::Arc;

use kestrel_jit::{Frame, Machine, Trace, TraceBuilder, UopKind};
use kestrel_types::{CodeDescriptor, FunctionAttrs, Namespace, ObjRef, Object};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

pub const NLOCALS: u16 = 4;
pub const STACKSIZE: u16 = 16;

pub fn entry_code() -> Arc<CodeDescriptor> {
    CodeDescriptor::builder("hot_loop")
        .nlocals(NLOCALS)
        .stacksize(STACKSIZE)
        .names(&["step", "bump", "nope"])
        .consts(vec![
            Object::int(3),
            Object::float(1.5),
            Object::str("k"),
            Object::int(i64::MAX / 2),
        ])
        .build()
}

/// `def add2(a, b): return a + b`
pub fn add2_function() -> ObjRef {
    Object::function(
        CodeDescriptor::builder("add2")
            .argcount(2)
            .nlocals(2)
            .stacksize(2)
            .build(),
    )
}

/// Objects the random generator builds calls and attribute loads from.
pub struct Fixtures {
    /// `def add2(a, b): return a + b`
    pub add2: ObjRef,
    /// `def sum5(a, b, c, d, e)`, returning the sum of two of its arguments.
    pub sum5: ObjRef,
    /// `def bump(self, n): return n`
    pub bump: ObjRef,
    /// Namespace with attribute `step` and method `bump`.
    pub owner: ObjRef,
    /// `def inner(x): return x + captured`
    pub inner: Arc<CodeDescriptor>,
}

pub fn fixtures() -> Fixtures {
    let bump = Object::function(
        CodeDescriptor::builder("bump")
            .argcount(2)
            .stacksize(2)
            .build(),
    );
    let owner = Object::namespace(
        Namespace::new("Counter")
            .with_attr("step", Object::int(1))
            .with_method("bump", bump.clone()),
    );
    Fixtures {
        add2: add2_function(),
        sum5: Object::function(
            CodeDescriptor::builder("sum5")
                .argcount(5)
                .stacksize(2)
                .build(),
        ),
        bump,
        owner,
        inner: CodeDescriptor::builder("inner")
            .argcount(1)
            .nfreevars(1)
            .stacksize(2)
            .build(),
    }
}

pub fn machine_for(code: &Arc<CodeDescriptor>) -> Machine {
    Machine::new(Frame::new(code.clone(), None))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Int,
    Float,
    Str,
    Any,
}

fn const_slot(index: usize) -> Slot {
    match index {
        1 => Slot::Float,
        2 => Slot::Str,
        _ => Slot::Int,
    }
}

fn random_scalar(rng: &mut ChaCha8Rng) -> (ObjRef, Slot) {
    match rng.gen_range(0..4u32) {
        0 | 1 => (Object::int(rng.gen_range(-20..20)), Slot::Int),
        2 => (Object::float(f64::from(rng.gen_range(-8..8i32)) * 0.5), Slot::Float),
        _ => {
            let s = ["a", "b", "xy"][rng.gen_range(0..3usize)];
            (Object::str(s), Slot::Str)
        }
    }
}

pub fn make_random_machine(
    rng: &mut ChaCha8Rng,
    entry: &Arc<CodeDescriptor>,
    fx: &Fixtures,
) -> Machine {
    let mut frame = Frame::new(entry.clone(), None);
    for index in 0..usize::from(NLOCALS) {
        let value = match rng.gen_range(0..10u32) {
            0 | 1 => continue,
            2 => Object::int(i64::MAX / 3),
            3 => fx.owner.clone(),
            4 => Object::bound_method(fx.bump.clone(), fx.owner.clone()),
            _ => random_scalar(rng).0,
        };
        frame = frame.with_local(index, value);
    }
    Machine::new(frame)
}

fn random_arg(rng: &mut ChaCha8Rng) -> (ObjRef, Slot) {
    if rng.gen_bool(0.8) {
        (Object::int(rng.gen_range(-5..5)), Slot::Int)
    } else {
        (Object::float(0.25), Slot::Float)
    }
}

/// Linear trace of roughly `max_steps` uop groups ending in `ExitTrace`.
pub fn gen_random_trace(
    rng: &mut ChaCha8Rng,
    entry: &Arc<CodeDescriptor>,
    fx: &Fixtures,
    max_steps: usize,
) -> Trace {
    let mut b = TraceBuilder::new(entry.clone());
    gen_body(rng, &mut b, fx, max_steps);
    b.push(UopKind::ExitTrace, rng.gen_range(0..100));
    b.finish()
}

/// Loop trace: a stack-neutral body followed by `JumpToTop`.
pub fn gen_random_loop(
    rng: &mut ChaCha8Rng,
    entry: &Arc<CodeDescriptor>,
    fx: &Fixtures,
    max_steps: usize,
) -> Trace {
    let mut b = TraceBuilder::new(entry.clone());
    let stack = gen_body(rng, &mut b, fx, max_steps);
    for _ in 0..stack.len() {
        b.op(UopKind::PopTop);
    }
    b.op(UopKind::JumpToTop);
    b.finish()
}

/// Emits the call sequence shared by every inlined call: the exact-args check, the call-init uop
/// and the frame push. Sometimes publishes an ip or a return offset before the push.
fn call(rng: &mut ChaCha8Rng, b: &mut TraceBuilder, argc: usize) {
    b.push(UopKind::CheckFunctionExactArgs, argc as i32)
        .push(UopKind::init_call_for_arity(argc), argc as i32);
    match rng.gen_range(0..4u32) {
        0 => {
            b.push(UopKind::SaveReturnOffset, rng.gen_range(0..16));
        }
        1 => {
            b.push(UopKind::SetIp, rng.gen_range(0..100));
        }
        _ => {}
    }
    b.op(UopKind::PushFrame);
}

fn gen_body(
    rng: &mut ChaCha8Rng,
    b: &mut TraceBuilder,
    fx: &Fixtures,
    max_steps: usize,
) -> Vec<Slot> {
    let mut stack: Vec<Slot> = Vec::new();
    let cap = usize::from(STACKSIZE);
    let nlocals = i32::from(NLOCALS);

    for _ in 0..max_steps {
        let room = cap - stack.len();
        match rng.gen_range(0..128u32) {
            0..=11 if room >= 1 => {
                b.push(UopKind::LoadFast, rng.gen_range(0..nlocals));
                stack.push(Slot::Any);
            }
            12..=15 if room >= 1 => {
                b.push(UopKind::LoadFastCheck, rng.gen_range(0..nlocals));
                stack.push(Slot::Any);
            }
            16..=18 if room >= 1 => {
                b.push(UopKind::LoadFastAndClear, rng.gen_range(0..nlocals));
                stack.push(Slot::Any);
            }
            19..=26 if !stack.is_empty() => {
                b.push(UopKind::StoreFastMaybeNull, rng.gen_range(0..nlocals));
                stack.pop();
            }
            27..=30 if !stack.is_empty() => {
                b.op(UopKind::PopTop);
                stack.pop();
            }
            31..=32 if room >= 1 => {
                b.op(UopKind::PushNull);
                stack.push(Slot::Any);
            }
            33..=38 if room >= 1 => {
                let index = rng.gen_range(0..4usize);
                b.push(UopKind::LoadConst, index as i32);
                stack.push(const_slot(index));
            }
            39..=50 if room >= 1 => {
                let (value, slot) = random_scalar(rng);
                b.load_const_inline(value);
                stack.push(slot);
            }
            51..=55 if !stack.is_empty() && room >= 1 => {
                let n = rng.gen_range(1..=stack.len());
                b.push(UopKind::Copy, n as i32);
                stack.push(stack[stack.len() - n]);
            }
            56..=60 if stack.len() >= 2 => {
                let n = rng.gen_range(2..=stack.len());
                b.push(UopKind::Swap, n as i32);
                let top = stack.len() - 1;
                stack.swap(top, top + 1 - n);
            }
            61..=78 if stack.len() >= 2 => {
                let (l, r) = (stack[stack.len() - 2], stack[stack.len() - 1]);
                let ty = if l == r && l != Slot::Any && rng.gen_bool(0.7) {
                    l
                } else {
                    [Slot::Int, Slot::Float, Slot::Str][rng.gen_range(0..3usize)]
                };
                let (guard, op) = match ty {
                    Slot::Int => (
                        UopKind::GuardBothInt,
                        [
                            UopKind::BinaryOpAddInt,
                            UopKind::BinaryOpSubtractInt,
                            UopKind::BinaryOpMultiplyInt,
                        ][rng.gen_range(0..3usize)],
                    ),
                    Slot::Float => (
                        UopKind::GuardBothFloat,
                        [
                            UopKind::BinaryOpAddFloat,
                            UopKind::BinaryOpSubtractFloat,
                            UopKind::BinaryOpMultiplyFloat,
                        ][rng.gen_range(0..3usize)],
                    ),
                    _ => (UopKind::GuardBothUnicode, UopKind::BinaryOpAddUnicode),
                };
                b.op(guard).op(op);
                stack.pop();
                stack.pop();
                stack.push(ty);
            }
            79..=82 => {
                b.push(UopKind::SetIp, rng.gen_range(0..100));
            }
            83..=85 if room >= 4 => {
                let len = rng.gen_range(1..=3usize);
                let items = (0..len).map(|i| Object::int(i as i64)).collect();
                b.load_const_inline(Object::tuple(items));
                let n = if rng.gen_bool(0.9) { len } else { len + 1 };
                b.push(UopKind::UnpackSequence, n as i32);
                stack.extend(std::iter::repeat(Slot::Any).take(n));
            }
            86..=88 if room >= 4 => {
                let len = rng.gen_range(0..=4usize);
                let items = (0..len).map(|i| Object::int(i as i64)).collect();
                let (before, after) = (rng.gen_range(0..=2usize), rng.gen_range(0..=1usize));
                b.load_const_inline(Object::tuple(items))
                    .push(UopKind::UnpackEx, (before | (after << 8)) as i32);
                stack.extend(std::iter::repeat(Slot::Any).take(before + after + 1));
            }
            // add2(x, y): self proven absent, arguments become the callee's locals in place.
            89..=94 if room >= 4 => {
                b.load_const_inline(fx.add2.clone()).op(UopKind::PushNull);
                for _ in 0..2 {
                    b.load_const_inline(random_arg(rng).0);
                }
                if rng.gen_bool(0.25) {
                    // Stack traffic above the pending frame before it is pushed.
                    b.push(UopKind::CheckFunctionExactArgs, 2)
                        .op(UopKind::InitCallPyExactArgs2);
                    let k = rng.gen_range(1..=3usize);
                    for _ in 0..k {
                        b.load_const_inline(Object::int(rng.gen_range(0..4)));
                    }
                    for _ in 0..k {
                        b.op(UopKind::PopTop);
                    }
                    b.op(UopKind::PushFrame);
                } else {
                    call(rng, b, 2);
                }
                b.push(UopKind::LoadFast, 0)
                    .push(UopKind::LoadFast, 1)
                    .op(UopKind::GuardBothInt)
                    .op(UopKind::BinaryOpAddInt)
                    .op(UopKind::PopFrame);
                stack.push(Slot::Int);
            }
            // sum5(...) through the general-arity call-init uop.
            95..=97 if room >= 7 => {
                b.load_const_inline(fx.sum5.clone()).op(UopKind::PushNull);
                for _ in 0..5 {
                    b.load_const_inline(random_arg(rng).0);
                }
                call(rng, b, 5);
                b.push(UopKind::LoadFast, rng.gen_range(0..5))
                    .push(UopKind::LoadFast, rng.gen_range(0..5))
                    .op(UopKind::GuardBothInt)
                    .op(UopKind::BinaryOpAddInt)
                    .op(UopKind::PopFrame);
                stack.push(Slot::Int);
            }
            // add2 with a local in the self slot: presence is unknown, so the callee gets a
            // fresh window. A null local makes the exact-args check side-exit.
            98..=100 if room >= 3 => {
                b.load_const_inline(fx.add2.clone())
                    .push(UopKind::LoadFast, rng.gen_range(0..nlocals))
                    .load_const_inline(random_arg(rng).0);
                call(rng, b, 1);
                b.push(UopKind::LoadFast, 0)
                    .push(UopKind::LoadFast, 1)
                    .op(UopKind::GuardBothInt)
                    .op(UopKind::BinaryOpAddInt)
                    .op(UopKind::PopFrame);
                stack.push(Slot::Int);
            }
            101..=103 if room >= 1 => {
                let name = rng.gen_range(0..3i32);
                b.load_const_inline(fx.owner.clone())
                    .push(UopKind::LoadAttr, name << 1);
                stack.push(Slot::Any);
            }
            // owner.<name>(arg) with a constant or a local owner.
            104..=108 if room >= 3 => {
                let name = rng.gen_range(0..3i32);
                if rng.gen_bool(0.6) {
                    b.load_const_inline(fx.owner.clone());
                } else {
                    b.push(UopKind::LoadFastCheck, rng.gen_range(0..nlocals));
                }
                let (arg, slot) = random_arg(rng);
                b.push(UopKind::LoadAttr, (name << 1) | 1)
                    .load_const_inline(arg);
                call(rng, b, 1);
                b.push(UopKind::LoadFast, 1).op(UopKind::PopFrame);
                stack.push(slot);
            }
            // Call through a bound method, constant or read from a local.
            109..=111 if room >= 3 => {
                if rng.gen_bool(0.7) {
                    b.load_const_inline(Object::bound_method(fx.bump.clone(), fx.owner.clone()));
                } else {
                    b.push(UopKind::LoadFast, rng.gen_range(0..nlocals));
                }
                let (arg, slot) = random_arg(rng);
                b.op(UopKind::PushNull)
                    .load_const_inline(arg)
                    .push(UopKind::CheckCallBoundMethodExactArgs, 1)
                    .push(UopKind::InitCallBoundMethodExactArgs, 1);
                call(rng, b, 1);
                b.push(UopKind::LoadFast, 1).op(UopKind::PopFrame);
                stack.push(slot);
            }
            // A fresh closure, called once.
            112..=114 if room >= 3 => {
                let (cell, _) = random_arg(rng);
                b.load_const_inline(Object::tuple(vec![cell]))
                    .load_const_inline(Object::code(fx.inner.clone()))
                    .op(UopKind::MakeFunction)
                    .push(
                        UopKind::SetFunctionAttribute,
                        FunctionAttrs::CLOSURE.bits() as i32,
                    )
                    .op(UopKind::PushNull)
                    .load_const_inline(random_arg(rng).0);
                call(rng, b, 1);
                b.push(UopKind::CopyFreeVars, 1)
                    .push(UopKind::LoadFast, 0)
                    .push(UopKind::LoadFast, 1)
                    .op(UopKind::GuardBothInt)
                    .op(UopKind::BinaryOpAddInt)
                    .op(UopKind::PopFrame);
                stack.push(Slot::Int);
            }
            115..=116 if room >= 2 => {
                b.load_const_inline(Object::tuple(vec![Object::int(0)]))
                    .load_const_inline(Object::code(fx.inner.clone()))
                    .op(UopKind::MakeFunction)
                    .push(
                        UopKind::SetFunctionAttribute,
                        FunctionAttrs::DEFAULTS.bits() as i32,
                    );
                stack.push(Slot::Any);
            }
            117..=118 if room >= 1 => {
                b.load_const_inline(fx.owner.clone());
                stack.push(Slot::Any);
            }
            _ => {
                b.op(UopKind::Nop);
            }
        }
    }

    stack
}

/// `n` nested calls to a zero-argument function, each returning what its callee returned.
pub fn nested_call_trace(n: usize) -> Trace {
    let leaf = CodeDescriptor::builder("nest").stacksize(2).build();
    let func = Object::function(leaf);
    let entry = CodeDescriptor::builder("outer").stacksize(2).build();
    let mut b = TraceBuilder::new(entry);
    for _ in 0..n {
        b.load_const_inline(func.clone())
            .op(UopKind::PushNull)
            .op(UopKind::InitCallPyExactArgs0)
            .op(UopKind::PushFrame);
    }
    b.load_const_inline(Object::none());
    for _ in 0..n {
        b.op(UopKind::PopFrame);
    }
    b.op(UopKind::ExitTrace);
    b.finish()
}
