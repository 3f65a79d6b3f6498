use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::code::CodeDescriptor;
use crate::function::FunctionObject;

/// Shared handle to a runtime value.
pub type ObjRef = Arc<Object>;

/// Exact-type handle of a runtime value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeTag {
    NoneType,
    Bool,
    Int,
    Float,
    Str,
    Tuple,
    List,
    Dict,
    Code,
    Function,
    BoundMethod,
    Namespace,
}

impl TypeTag {
    pub const fn name(self) -> &'static str {
        match self {
            TypeTag::NoneType => "NoneType",
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Str => "str",
            TypeTag::Tuple => "tuple",
            TypeTag::List => "list",
            TypeTag::Dict => "dict",
            TypeTag::Code => "code",
            TypeTag::Function => "function",
            TypeTag::BoundMethod => "method",
            TypeTag::Namespace => "namespace",
        }
    }

    /// Immediate base type. `bool` is the only builtin subtype (of `int`).
    pub const fn base(self) -> Option<TypeTag> {
        match self {
            TypeTag::Bool => Some(TypeTag::Int),
            _ => None,
        }
    }

    pub fn is_subtype_of(self, other: TypeTag) -> bool {
        self == other || self.base() == Some(other)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A bound method: a callable paired with the receiver that becomes its first argument.
#[derive(Debug, PartialEq)]
pub struct BoundMethod {
    pub func: ObjRef,
    pub self_obj: ObjRef,
}

/// Attribute owner (module-like object).
///
/// Plain attributes load as-is. Methods are class-level functions: a method-style load binds the
/// owner as `self`.
#[derive(Debug, PartialEq)]
pub struct Namespace {
    name: Arc<str>,
    attrs: BTreeMap<Arc<str>, ObjRef>,
    methods: BTreeMap<Arc<str>, ObjRef>,
}

impl Namespace {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            attrs: BTreeMap::new(),
            methods: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_attr(mut self, name: &str, value: ObjRef) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_method(mut self, name: &str, func: ObjRef) -> Self {
        self.methods.insert(name.into(), func);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr(&self, name: &str) -> Option<&ObjRef> {
        self.attrs.get(name)
    }

    pub fn method(&self, name: &str) -> Option<&ObjRef> {
        self.methods.get(name)
    }
}

#[derive(Debug)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Vec<ObjRef>),
    List(Vec<ObjRef>),
    Dict(Vec<(ObjRef, ObjRef)>),
    Code(Arc<CodeDescriptor>),
    Function(FunctionObject),
    BoundMethod(BoundMethod),
    Namespace(Namespace),
}

impl Object {
    pub fn none() -> ObjRef {
        Arc::new(Object::None)
    }

    pub fn bool(v: bool) -> ObjRef {
        Arc::new(Object::Bool(v))
    }

    pub fn int(v: i64) -> ObjRef {
        Arc::new(Object::Int(v))
    }

    pub fn float(v: f64) -> ObjRef {
        Arc::new(Object::Float(v))
    }

    pub fn str(v: &str) -> ObjRef {
        Arc::new(Object::Str(v.into()))
    }

    pub fn tuple(items: Vec<ObjRef>) -> ObjRef {
        Arc::new(Object::Tuple(items))
    }

    pub fn list(items: Vec<ObjRef>) -> ObjRef {
        Arc::new(Object::List(items))
    }

    pub fn dict(items: Vec<(ObjRef, ObjRef)>) -> ObjRef {
        Arc::new(Object::Dict(items))
    }

    pub fn code(code: Arc<CodeDescriptor>) -> ObjRef {
        Arc::new(Object::Code(code))
    }

    pub fn function(code: Arc<CodeDescriptor>) -> ObjRef {
        Arc::new(Object::Function(FunctionObject::new(code)))
    }

    pub fn bound_method(func: ObjRef, self_obj: ObjRef) -> ObjRef {
        Arc::new(Object::BoundMethod(BoundMethod { func, self_obj }))
    }

    pub fn namespace(ns: Namespace) -> ObjRef {
        Arc::new(Object::Namespace(ns))
    }

    pub fn type_tag(&self) -> TypeTag {
        match self {
            Object::None => TypeTag::NoneType,
            Object::Bool(_) => TypeTag::Bool,
            Object::Int(_) => TypeTag::Int,
            Object::Float(_) => TypeTag::Float,
            Object::Str(_) => TypeTag::Str,
            Object::Tuple(_) => TypeTag::Tuple,
            Object::List(_) => TypeTag::List,
            Object::Dict(_) => TypeTag::Dict,
            Object::Code(_) => TypeTag::Code,
            Object::Function(_) => TypeTag::Function,
            Object::BoundMethod(_) => TypeTag::BoundMethod,
            Object::Namespace(_) => TypeTag::Namespace,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Object::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Object::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Object::Str(v) => Some(&**v),
            _ => None,
        }
    }

    pub fn as_code(&self) -> Option<&Arc<CodeDescriptor>> {
        match self {
            Object::Code(code) => Some(code),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionObject> {
        match self {
            Object::Function(func) => Some(func),
            _ => None,
        }
    }

    pub fn as_bound_method(&self) -> Option<&BoundMethod> {
        match self {
            Object::BoundMethod(method) => Some(method),
            _ => None,
        }
    }

    pub fn as_namespace(&self) -> Option<&Namespace> {
        match self {
            Object::Namespace(ns) => Some(ns),
            _ => None,
        }
    }

    /// Items of a tuple or list.
    pub fn as_sequence(&self) -> Option<&[ObjRef]> {
        match self {
            Object::Tuple(items) | Object::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }
}

// Functions, code objects and namespaces compare by identity of their code/contents; scalars and
// containers compare structurally. Floats compare bitwise so NaN payloads stay comparable.
impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Object::None, Object::None) => true,
            (Object::Bool(a), Object::Bool(b)) => a == b,
            (Object::Int(a), Object::Int(b)) => a == b,
            (Object::Float(a), Object::Float(b)) => a.to_bits() == b.to_bits(),
            (Object::Str(a), Object::Str(b)) => a == b,
            (Object::Tuple(a), Object::Tuple(b)) | (Object::List(a), Object::List(b)) => a == b,
            (Object::Dict(a), Object::Dict(b)) => a == b,
            (Object::Code(a), Object::Code(b)) => Arc::ptr_eq(a, b),
            (Object::Function(a), Object::Function(b)) => a == b,
            (Object::BoundMethod(a), Object::BoundMethod(b)) => a == b,
            (Object::Namespace(a), Object::Namespace(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::None => f.write_str("None"),
            Object::Bool(true) => f.write_str("True"),
            Object::Bool(false) => f.write_str("False"),
            Object::Int(v) => write!(f, "{v}"),
            Object::Float(v) => write!(f, "{v:?}"),
            Object::Str(v) => write!(f, "{v:?}"),
            Object::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Object::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Object::Dict(items) => {
                f.write_str("{")?;
                for (i, (k, v)) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Object::Code(code) => write!(f, "<code {}>", code.name),
            Object::Function(func) => write!(f, "<function {}>", func.code().name),
            Object::BoundMethod(m) => write!(f, "<bound method {} of {}>", m.func, m.self_obj),
            Object::Namespace(ns) => write!(f, "<namespace {}>", ns.name()),
        }
    }
}

/// Identity of a shared object, as used by dependency tracking.
pub fn object_addr(obj: &ObjRef) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_is_an_int_subtype_but_not_the_reverse() {
        assert!(TypeTag::Bool.is_subtype_of(TypeTag::Int));
        assert!(TypeTag::Int.is_subtype_of(TypeTag::Int));
        assert!(!TypeTag::Int.is_subtype_of(TypeTag::Bool));
        assert!(!TypeTag::Float.is_subtype_of(TypeTag::Int));
    }

    #[test]
    fn scalars_compare_structurally_and_floats_bitwise() {
        assert_eq!(*Object::int(3), *Object::int(3));
        assert_ne!(*Object::int(3), *Object::float(3.0));
        assert_eq!(*Object::float(f64::NAN), *Object::float(f64::NAN));
        assert_eq!(
            *Object::tuple(vec![Object::int(1), Object::str("a")]),
            *Object::tuple(vec![Object::int(1), Object::str("a")])
        );
    }

    #[test]
    fn namespace_separates_attrs_from_methods() {
        let code = CodeDescriptor::builder("m").argcount(1).build();
        let ns = Namespace::new("ns")
            .with_attr("x", Object::int(1))
            .with_method("m", Object::function(code));
        assert!(ns.attr("x").is_some());
        assert!(ns.method("x").is_none());
        assert!(ns.method("m").is_some());
        assert_eq!(ns.name(), "ns");
    }

    #[test]
    fn display_renders_python_like_reprs() {
        let t = Object::tuple(vec![Object::int(1)]);
        assert_eq!(t.to_string(), "(1,)");
        assert_eq!(Object::str("hi").to_string(), "\"hi\"");
        assert_eq!(Object::none().to_string(), "None");
    }
}
