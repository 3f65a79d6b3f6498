use std::sync::Arc;

use crate::object::ObjRef;

/// Largest argument count that has a dedicated fixed-arity call-init uop.
pub const MAX_FIXED_ARITY: usize = 4;

/// Shape of a compiled code object.
///
/// Invariants:
/// - `nlocals >= argcount` (arguments occupy the first local slots).
/// - Free-variable cells follow the plain locals, so the locals-plus region of a frame is
///   `nlocals + nfreevars` slots wide.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeDescriptor {
    pub name: Arc<str>,
    pub argcount: u16,
    pub nlocals: u16,
    pub nfreevars: u16,
    pub stacksize: u16,
    pub consts: Vec<ObjRef>,
    pub names: Vec<Arc<str>>,
}

impl CodeDescriptor {
    pub fn builder(name: &str) -> CodeBuilder {
        CodeBuilder::new(name)
    }

    /// Local slots plus free-variable cells.
    pub fn nlocalsplus(&self) -> usize {
        usize::from(self.nlocals) + usize::from(self.nfreevars)
    }

    /// Slots a frame for this code needs: locals-plus followed by the evaluation stack.
    pub fn frame_size(&self) -> usize {
        self.nlocalsplus() + usize::from(self.stacksize)
    }

    /// Index of the first free-variable cell within the locals-plus region.
    pub fn free_var_offset(&self) -> usize {
        usize::from(self.nlocals)
    }

    /// Argument count when it is small enough for a fixed-arity call-init uop.
    pub fn fixed_arity(&self) -> Option<usize> {
        let argc = usize::from(self.argcount);
        (argc <= MAX_FIXED_ARITY).then_some(argc)
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(|n| &**n)
    }
}

#[derive(Debug, Clone)]
pub struct CodeBuilder {
    name: Arc<str>,
    argcount: u16,
    nlocals: u16,
    nfreevars: u16,
    stacksize: u16,
    consts: Vec<ObjRef>,
    names: Vec<Arc<str>>,
}

impl CodeBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            argcount: 0,
            nlocals: 0,
            nfreevars: 0,
            stacksize: 4,
            consts: Vec::new(),
            names: Vec::new(),
        }
    }

    #[must_use]
    pub fn argcount(mut self, argcount: u16) -> Self {
        self.argcount = argcount;
        self
    }

    #[must_use]
    pub fn nlocals(mut self, nlocals: u16) -> Self {
        self.nlocals = nlocals;
        self
    }

    #[must_use]
    pub fn nfreevars(mut self, nfreevars: u16) -> Self {
        self.nfreevars = nfreevars;
        self
    }

    #[must_use]
    pub fn stacksize(mut self, stacksize: u16) -> Self {
        self.stacksize = stacksize;
        self
    }

    #[must_use]
    pub fn consts(mut self, consts: Vec<ObjRef>) -> Self {
        self.consts = consts;
        self
    }

    #[must_use]
    pub fn names(mut self, names: &[&str]) -> Self {
        self.names = names.iter().map(|n| Arc::from(*n)).collect();
        self
    }

    pub fn build(self) -> Arc<CodeDescriptor> {
        Arc::new(CodeDescriptor {
            name: self.name,
            argcount: self.argcount,
            nlocals: self.nlocals.max(self.argcount),
            nfreevars: self.nfreevars,
            stacksize: self.stacksize,
            consts: self.consts,
            names: self.names,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_widens_locals_to_cover_arguments() {
        let code = CodeDescriptor::builder("f").argcount(3).nlocals(1).build();
        assert_eq!(code.nlocals, 3);
        assert_eq!(code.nlocalsplus(), 3);
    }

    #[test]
    fn frame_size_counts_free_vars_and_stack() {
        let code = CodeDescriptor::builder("g")
            .argcount(1)
            .nlocals(2)
            .nfreevars(2)
            .stacksize(5)
            .build();
        assert_eq!(code.free_var_offset(), 2);
        assert_eq!(code.nlocalsplus(), 4);
        assert_eq!(code.frame_size(), 9);
    }

    #[test]
    fn fixed_arity_stops_at_four() {
        let small = CodeDescriptor::builder("a").argcount(4).build();
        let big = CodeDescriptor::builder("b").argcount(5).build();
        assert_eq!(small.fixed_arity(), Some(4));
        assert_eq!(big.fixed_arity(), None);
    }
}
