use kestrel_types::{ObjectError, TypeTag};
use thiserror::Error;

use crate::uop::UopKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown uop kind {0}")]
pub struct UnknownUopKind(pub u16);

/// Coarse classification of an optimizer bail-out. All three are recoverable: the caller falls
/// back to the untouched remainder of the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// The trace asserts facts the analysis cannot reconcile.
    Contradiction,
    /// Symbol arena, slot space or frame stack exhausted.
    ResourceLimit,
    /// The traced path provably raises or side-exits when executed.
    WillError,
}

/// Reasons the abstract interpreter stops early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptError {
    #[error("symbol arena exhausted ({limit} symbols)")]
    SymbolLimit { limit: usize },

    #[error("abstract slot space exhausted: need {needed}, limit {limit}")]
    SlotLimit { needed: usize, limit: usize },

    #[error("abstract frame stack exhausted (max depth {max_depth})")]
    FrameDepthExceeded { max_depth: usize },

    #[error("symbolic stack underflow")]
    StackUnderflow,

    #[error("symbolic stack overflow")]
    StackOverflow,

    #[error("local slot {index} out of range for a frame with {nlocalsplus} slots")]
    BadLocal { index: i64, nlocalsplus: usize },

    #[error("invalid oparg {oparg} for {kind}")]
    BadOparg { kind: UopKind, oparg: i32 },

    #[error("missing constant for {kind} (index {index})")]
    MissingConstant { kind: UopKind, index: i64 },

    #[error("{kind} without a pending call setup")]
    NoPendingFrame { kind: UopKind },

    #[error("{kind} runs between a call setup and its PushFrame")]
    InterleavedCallSetup { kind: UopKind },

    #[error("return out of the trace entry frame")]
    FrameUnderflow,

    #[error("callee of {kind} is not a known function")]
    UnresolvedCallee { kind: UopKind },

    #[error("call passes {given} arguments to a function taking {expected}")]
    ArityMismatch { given: usize, expected: usize },

    #[error("conflicting facts: slot proven {proven}, now asserted {asserted}")]
    RefinementConflict { proven: String, asserted: String },

    #[error("{kind} can never pass: {reason}")]
    GuardNeverPasses { kind: UopKind, reason: String },

    #[error("local slot {index} is provably unbound")]
    UnboundLocal { index: usize },
}

impl OptError {
    pub fn class(&self) -> FailureClass {
        match self {
            OptError::SymbolLimit { .. }
            | OptError::SlotLimit { .. }
            | OptError::FrameDepthExceeded { .. } => FailureClass::ResourceLimit,
            OptError::GuardNeverPasses { .. } | OptError::UnboundLocal { .. } => {
                FailureClass::WillError
            }
            OptError::StackUnderflow
            | OptError::StackOverflow
            | OptError::BadLocal { .. }
            | OptError::BadOparg { .. }
            | OptError::MissingConstant { .. }
            | OptError::NoPendingFrame { .. }
            | OptError::InterleavedCallSetup { .. }
            | OptError::FrameUnderflow
            | OptError::UnresolvedCallee { .. }
            | OptError::ArityMismatch { .. }
            | OptError::RefinementConflict { .. } => FailureClass::Contradiction,
        }
    }
}

/// Executor invariant violations: a malformed trace reached the live machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("stack underflow at uop {ip} ({kind})")]
    StackUnderflow { ip: usize, kind: UopKind },

    #[error("{kind} at uop {ip} expected {expected}, found {found}")]
    TypeMismatch {
        ip: usize,
        kind: UopKind,
        expected: TypeTag,
        found: String,
    },

    #[error("{kind} at uop {ip} used a frame or null stack item as a value")]
    NotAValue { ip: usize, kind: UopKind },

    #[error("{kind} at uop {ip} has invalid oparg {oparg}")]
    BadOparg { ip: usize, kind: UopKind, oparg: i32 },

    #[error("missing constant for {kind} at uop {ip}")]
    MissingConstant { ip: usize, kind: UopKind },

    #[error("call at uop {ip} passes {given} arguments to a function taking {expected}")]
    ArityMismatch {
        ip: usize,
        given: usize,
        expected: usize,
    },

    #[error("no frame to execute")]
    NoFrame,
}

/// Errors raised by the guest program during real execution. These are trace outcomes, not Rust
/// failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaisedError {
    #[error("local variable {index} referenced before assignment")]
    UnboundLocal { index: usize },

    #[error("integer overflow in {kind}")]
    Overflow { kind: UopKind },

    #[error("unpack expected {expected} values, got {found}")]
    Unpack { expected: String, found: String },

    #[error("'{owner}' object has no attribute '{name}'")]
    Attribute { owner: String, name: String },

    #[error(transparent)]
    Object(#[from] ObjectError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("no trace installed for entry {0}")]
    NotInstalled(u64),

    #[error(transparent)]
    Exec(#[from] ExecError),
}
