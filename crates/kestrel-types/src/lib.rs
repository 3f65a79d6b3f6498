//! Object-model contracts consumed by Kestrel's tier-2 trace optimizer.
//!
//! The optimizer and the trace executor only ever read a small slice of the host object model:
//! - an object's exact type ([`TypeTag`]),
//! - the shape of a code object ([`CodeDescriptor`]: argument count, local slots, free
//!   variables, stack size, constant table),
//! - the write-once attribute cells of a function ([`FunctionObject`]),
//! - bound methods and attribute owners ([`BoundMethod`], [`Namespace`]).
//!
//! Values are shared through [`ObjRef`] (`Arc<Object>`) and are immutable once built, apart from
//! the write-once function attributes. That lets independent optimization attempts read them from
//! different threads without coordination.

mod code;
mod function;
mod object;

pub use code::{CodeBuilder, CodeDescriptor, MAX_FIXED_ARITY};
pub use function::{FunctionAttrs, FunctionObject};
pub use object::{object_addr, BoundMethod, Namespace, ObjRef, Object, TypeTag};

use thiserror::Error;

/// Errors surfaced by object-model mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    #[error("function attribute {attr:?} is already set")]
    AttributeAlreadySet { attr: FunctionAttrs },

    #[error("function attribute {attr:?} expects a {expected} value, got {found}")]
    AttributeType {
        attr: FunctionAttrs,
        expected: TypeTag,
        found: TypeTag,
    },

    #[error("invalid function attribute selector 0x{0:x}")]
    InvalidAttribute(u32),
}
