//! Boundary to a platform code generator.

use std::convert::Infallible;

use crate::uop::Trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome<H> {
    Native(H),
    /// Run the optimized uop trace directly.
    Declined,
}

/// Compiles finished traces to native code. Every handle returned from `compile` is passed to
/// `free` exactly once.
pub trait NativeBackend {
    type Handle;

    fn compile(&mut self, trace: &Trace) -> CompileOutcome<Self::Handle>;

    fn free(&mut self, handle: Self::Handle);
}

impl<B: NativeBackend + ?Sized> NativeBackend for Box<B> {
    type Handle = B::Handle;

    fn compile(&mut self, trace: &Trace) -> CompileOutcome<Self::Handle> {
        (**self).compile(trace)
    }

    fn free(&mut self, handle: Self::Handle) {
        (**self).free(handle)
    }
}

/// Backend that declines every trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterpretOnly;

impl NativeBackend for InterpretOnly {
    type Handle = Infallible;

    fn compile(&mut self, _trace: &Trace) -> CompileOutcome<Infallible> {
        CompileOutcome::Declined
    }

    fn free(&mut self, handle: Infallible) {
        match handle {}
    }
}
