use std::sync::{Arc, OnceLock};

use bitflags::bitflags;

use crate::code::CodeDescriptor;
use crate::object::{ObjRef, TypeTag};
use crate::ObjectError;

bitflags! {
    /// Function attribute cells, selected by the `SetFunctionAttribute` oparg.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FunctionAttrs: u32 {
        const DEFAULTS = 0x01;
        const KWDEFAULTS = 0x02;
        const ANNOTATIONS = 0x04;
        const CLOSURE = 0x08;
    }
}

impl FunctionAttrs {
    /// Type an attribute value must have, if the cell constrains it.
    fn expected_type(self) -> Option<TypeTag> {
        if self == FunctionAttrs::DEFAULTS || self == FunctionAttrs::CLOSURE {
            Some(TypeTag::Tuple)
        } else if self == FunctionAttrs::KWDEFAULTS {
            Some(TypeTag::Dict)
        } else {
            None
        }
    }
}

/// A function object: a code object plus write-once attribute cells.
///
/// Attributes are filled in by `SetFunctionAttribute` right after `MakeFunction`; each cell can
/// be written at most once.
#[derive(Debug)]
pub struct FunctionObject {
    code: Arc<CodeDescriptor>,
    defaults: OnceLock<ObjRef>,
    kwdefaults: OnceLock<ObjRef>,
    annotations: OnceLock<ObjRef>,
    closure: OnceLock<ObjRef>,
}

impl FunctionObject {
    pub fn new(code: Arc<CodeDescriptor>) -> Self {
        Self {
            code,
            defaults: OnceLock::new(),
            kwdefaults: OnceLock::new(),
            annotations: OnceLock::new(),
            closure: OnceLock::new(),
        }
    }

    pub fn code(&self) -> &Arc<CodeDescriptor> {
        &self.code
    }

    fn cell(&self, attr: FunctionAttrs) -> Result<&OnceLock<ObjRef>, ObjectError> {
        if attr == FunctionAttrs::DEFAULTS {
            Ok(&self.defaults)
        } else if attr == FunctionAttrs::KWDEFAULTS {
            Ok(&self.kwdefaults)
        } else if attr == FunctionAttrs::ANNOTATIONS {
            Ok(&self.annotations)
        } else if attr == FunctionAttrs::CLOSURE {
            Ok(&self.closure)
        } else {
            Err(ObjectError::InvalidAttribute(attr.bits()))
        }
    }

    pub fn attribute(&self, attr: FunctionAttrs) -> Option<&ObjRef> {
        self.cell(attr).ok().and_then(OnceLock::get)
    }

    /// Writes one attribute cell. `attr` must name exactly one cell.
    pub fn set_attribute(&self, attr: FunctionAttrs, value: ObjRef) -> Result<(), ObjectError> {
        let cell = self.cell(attr)?;
        if let Some(expected) = attr.expected_type() {
            let found = value.type_tag();
            if found != expected {
                return Err(ObjectError::AttributeType {
                    attr,
                    expected,
                    found,
                });
            }
        }
        cell.set(value)
            .map_err(|_| ObjectError::AttributeAlreadySet { attr })
    }

    pub fn closure(&self) -> Option<&[ObjRef]> {
        self.closure.get().and_then(|c| c.as_sequence())
    }

    /// Cells that have been written so far.
    pub fn set_attributes(&self) -> FunctionAttrs {
        let mut out = FunctionAttrs::empty();
        for attr in FunctionAttrs::all().iter() {
            if self.attribute(attr).is_some() {
                out |= attr;
            }
        }
        out
    }
}

impl PartialEq for FunctionObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.code, &other.code)
            && self.defaults.get() == other.defaults.get()
            && self.kwdefaults.get() == other.kwdefaults.get()
            && self.annotations.get() == other.annotations.get()
            && self.closure.get() == other.closure.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Object;

    fn func() -> FunctionObject {
        FunctionObject::new(CodeDescriptor::builder("f").argcount(1).nfreevars(1).build())
    }

    #[test]
    fn attributes_are_write_once() {
        let f = func();
        f.set_attribute(FunctionAttrs::DEFAULTS, Object::tuple(vec![Object::int(1)]))
            .unwrap();
        let err = f
            .set_attribute(FunctionAttrs::DEFAULTS, Object::tuple(vec![]))
            .unwrap_err();
        assert_eq!(
            err,
            ObjectError::AttributeAlreadySet {
                attr: FunctionAttrs::DEFAULTS
            }
        );
        assert_eq!(f.set_attributes(), FunctionAttrs::DEFAULTS);
    }

    #[test]
    fn attribute_values_are_type_checked() {
        let f = func();
        let err = f
            .set_attribute(FunctionAttrs::KWDEFAULTS, Object::int(3))
            .unwrap_err();
        assert_eq!(
            err,
            ObjectError::AttributeType {
                attr: FunctionAttrs::KWDEFAULTS,
                expected: TypeTag::Dict,
                found: TypeTag::Int,
            }
        );
        assert!(f.attribute(FunctionAttrs::KWDEFAULTS).is_none());
        f.set_attribute(FunctionAttrs::ANNOTATIONS, Object::int(3))
            .unwrap();
    }

    #[test]
    fn combined_selectors_are_rejected() {
        let f = func();
        let err = f
            .set_attribute(
                FunctionAttrs::DEFAULTS | FunctionAttrs::CLOSURE,
                Object::tuple(vec![]),
            )
            .unwrap_err();
        assert_eq!(err, ObjectError::InvalidAttribute(0x09));
    }

    #[test]
    fn closure_exposes_cell_contents() {
        let f = func();
        assert!(f.closure().is_none());
        f.set_attribute(FunctionAttrs::CLOSURE, Object::tuple(vec![Object::int(7)]))
            .unwrap();
        assert_eq!(f.closure().map(<[_]>::len), Some(1));
    }
}
