//! Symbolic value lattice.
//!
//! ```text
//!            Unknown
//!          /    |    \
//!  SelfOrNull ExactType(T)
//!      |   \     |
//!     Null  Constant(v)   (type_tag(v) == T)
//! ```
//!
//! Symbols live in a [`SymArena`] and are addressed by [`SymId`]. Stack and local slots hold ids,
//! so copying a slot shares the symbol and a later refinement is visible through every alias.

use std::fmt;
use std::sync::Arc;

use kestrel_types::{ObjRef, TypeTag};

use crate::error::OptError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymId(u32);

static UNKNOWN: SymValue = SymValue::Unknown;

impl SymId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SymId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// What the analysis knows about one runtime value.
#[derive(Clone, Debug)]
pub enum SymValue {
    Unknown,
    ExactType(TypeTag),
    Constant(ObjRef),
    Null,
    /// Either a bound `self` receiver or null, produced by method-style attribute loads.
    SelfOrNull,
}

impl SymValue {
    pub fn is_unknown(&self) -> bool {
        matches!(self, SymValue::Unknown)
    }

    /// Proven exact type, if any.
    pub fn type_tag(&self) -> Option<TypeTag> {
        match self {
            SymValue::ExactType(ty) => Some(*ty),
            SymValue::Constant(value) => Some(value.type_tag()),
            _ => None,
        }
    }
}

impl PartialEq for SymValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SymValue::Unknown, SymValue::Unknown)
            | (SymValue::Null, SymValue::Null)
            | (SymValue::SelfOrNull, SymValue::SelfOrNull) => true,
            (SymValue::ExactType(a), SymValue::ExactType(b)) => a == b,
            (SymValue::Constant(a), SymValue::Constant(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for SymValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymValue::Unknown => f.write_str("unknown"),
            SymValue::ExactType(ty) => write!(f, "type {ty}"),
            SymValue::Constant(value) => write!(f, "const {value}"),
            SymValue::Null => f.write_str("null"),
            SymValue::SelfOrNull => f.write_str("self-or-null"),
        }
    }
}

/// Bump arena of symbols, bulk-freed with the owning context.
#[derive(Debug, Clone)]
pub struct SymArena {
    values: Vec<SymValue>,
    limit: usize,
}

impl SymArena {
    pub fn new(limit: usize) -> Self {
        Self {
            values: Vec::with_capacity(limit.min(256)),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn alloc(&mut self, value: SymValue) -> Result<SymId, OptError> {
        if self.values.len() >= self.limit {
            return Err(OptError::SymbolLimit { limit: self.limit });
        }
        let id = SymId(self.values.len() as u32);
        self.values.push(value);
        Ok(id)
    }

    pub fn unknown(&mut self) -> Result<SymId, OptError> {
        self.alloc(SymValue::Unknown)
    }

    pub fn constant(&mut self, value: ObjRef) -> Result<SymId, OptError> {
        self.alloc(SymValue::Constant(value))
    }

    pub fn null(&mut self) -> Result<SymId, OptError> {
        self.alloc(SymValue::Null)
    }

    pub fn self_or_null(&mut self) -> Result<SymId, OptError> {
        self.alloc(SymValue::SelfOrNull)
    }

    pub fn exact_type(&mut self, ty: TypeTag) -> Result<SymId, OptError> {
        self.alloc(SymValue::ExactType(ty))
    }

    /// Ids from another arena read as `Unknown`.
    pub fn get(&self, id: SymId) -> &SymValue {
        self.values.get(id.index()).unwrap_or(&UNKNOWN)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymId, &SymValue)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (SymId(i as u32), v))
    }

    /// Whether `id` is proven to hold a value of type `ty`.
    ///
    /// With `strict`, the proven type must be exactly `ty`; otherwise a proven subtype also matches.
    pub fn matches_type(&self, id: SymId, ty: TypeTag, strict: bool) -> bool {
        match self.get(id).type_tag() {
            Some(proven) if strict => proven == ty,
            Some(proven) => proven.is_subtype_of(ty),
            None => false,
        }
    }

    pub fn is_const(&self, id: SymId) -> bool {
        matches!(self.get(id), SymValue::Constant(_))
    }

    pub fn const_value(&self, id: SymId) -> Option<&ObjRef> {
        match self.get(id) {
            SymValue::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_null(&self, id: SymId) -> bool {
        matches!(self.get(id), SymValue::Null)
    }

    /// Proven to hold a real object (never null).
    pub fn is_not_null(&self, id: SymId) -> bool {
        matches!(self.get(id), SymValue::Constant(_) | SymValue::ExactType(_))
    }

    /// Both symbols are proven to be the same constant object.
    pub fn same_constant(&self, a: SymId, b: SymId) -> bool {
        match (self.const_value(a), self.const_value(b)) {
            (Some(x), Some(y)) => Arc::ptr_eq(x, y),
            _ => false,
        }
    }

    /// Narrows `id` to exact type `ty`. Never widens; a conflicting fact is an error and leaves
    /// the symbol unchanged.
    pub fn refine_type(&mut self, id: SymId, ty: TypeTag) -> Result<(), OptError> {
        let Some(slot) = self.values.get_mut(id.index()) else {
            return Ok(());
        };
        match slot {
            SymValue::Unknown | SymValue::SelfOrNull => {
                *slot = SymValue::ExactType(ty);
                Ok(())
            }
            SymValue::ExactType(proven) if *proven == ty => Ok(()),
            SymValue::Constant(value) if value.type_tag() == ty => Ok(()),
            other => Err(OptError::RefinementConflict {
                proven: other.to_string(),
                asserted: format!("type {ty}"),
            }),
        }
    }

    /// Narrows `id` to null.
    pub fn refine_null(&mut self, id: SymId) -> Result<(), OptError> {
        let Some(slot) = self.values.get_mut(id.index()) else {
            return Ok(());
        };
        match slot {
            SymValue::Unknown | SymValue::SelfOrNull => {
                *slot = SymValue::Null;
                Ok(())
            }
            SymValue::Null => Ok(()),
            other => Err(OptError::RefinementConflict {
                proven: other.to_string(),
                asserted: "null".to_string(),
            }),
        }
    }
}
