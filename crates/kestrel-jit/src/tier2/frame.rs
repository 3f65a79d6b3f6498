use std::sync::Arc;

use kestrel_types::CodeDescriptor;

/// Symbolic view of one (possibly inlined) call frame.
///
/// A frame does not own its slots: it is a window `[locals_base, stack_limit)` into the context's
/// shared slot space. Locals-plus occupy `[locals_base, stack_base)` and the evaluation stack grows
/// from `stack_base`. A callee window may start inside its caller's stack, which is how arguments
/// already on the caller's stack become the callee's first locals without copying.
#[derive(Clone, Debug, PartialEq)]
pub struct AbstractFrame {
    pub code: Arc<CodeDescriptor>,
    pub locals_base: usize,
    pub stack_base: usize,
    pub stack_pointer: usize,
    pub stack_limit: usize,
}

impl AbstractFrame {
    pub(crate) fn new(code: Arc<CodeDescriptor>, locals_base: usize) -> Self {
        let stack_base = locals_base + code.nlocalsplus();
        let stack_limit = locals_base + code.frame_size();
        Self {
            code,
            locals_base,
            stack_base,
            stack_pointer: stack_base,
            stack_limit,
        }
    }

    pub fn nlocalsplus(&self) -> usize {
        self.stack_base - self.locals_base
    }

    pub fn stack_depth(&self) -> usize {
        self.stack_pointer - self.stack_base
    }

    pub fn stack_capacity(&self) -> usize {
        self.stack_limit - self.stack_base
    }
}
