//! Tier-2 trace optimizer.
//!
//! A single forward abstract interpretation over a recorded uop trace. Every stack and local slot
//! carries a [`SymValue`]; guards already proven by earlier uops become `Nop`, and calls into
//! known functions are followed into an inlined [`AbstractFrame`]. Any fact the analysis cannot
//! reconcile stops the pass and leaves the remainder of the trace as it was.

pub mod ctx;
pub mod deps;
pub mod frame;
pub mod opt;
pub mod sym;

pub use ctx::OptContext;
pub use deps::DependencySet;
pub use frame::AbstractFrame;
pub use opt::{
    optimize_trace, optimize_trace_observed, ContradictionPolicy, OptConfig, OptReport, OptStats,
    OptStatus,
};
pub use sym::{SymArena, SymId, SymValue};
