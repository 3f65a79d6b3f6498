//! Kestrel tier-2 JIT: trace optimizer, trace executor and the native compile boundary.
//!
//! The baseline interpreter records hot loops as [`Trace`]s of micro-operations. A trace is
//! optimized in place by [`optimize_trace`], then either handed to a [`NativeBackend`] or run
//! directly by [`run_trace`]. [`TraceCache`] ties the pieces together and discards traces whose
//! assumptions were invalidated.

pub mod cache;
pub mod error;
pub mod exec;
pub mod native;
pub mod stats;
pub mod tier2;
pub mod uop;

pub use cache::{CompiledTrace, TraceCache, TraceId};
pub use error::{CacheError, ExecError, FailureClass, OptError, RaisedError, UnknownUopKind};
pub use exec::{run_trace, Frame, Machine, StackRef, TraceExit};
pub use native::{CompileOutcome, InterpretOnly, NativeBackend};
pub use stats::{UopCounters, UopCountersSnapshot};
pub use tier2::{optimize_trace, optimize_trace_observed, OptConfig, OptReport, OptStatus};
pub use uop::{Trace, TraceBuilder, Uop, UopFlags, UopKind};
