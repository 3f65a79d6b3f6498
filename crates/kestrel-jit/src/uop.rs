//! Micro-operation vocabulary and the linear trace container.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use kestrel_types::{CodeDescriptor, ObjRef};

use crate::error::UnknownUopKind;

macro_rules! uop_kinds {
    ($($name:ident = $id:literal => $label:literal,)*) => {
        /// Wire-level micro-operation kind. Discriminants are the `u16` kinds recorded by the trace
        /// producer.
        #[repr(u16)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum UopKind {
            $($name = $id,)*
        }

        impl UopKind {
            /// Every kind, indexed by its discriminant.
            pub const ALL: [UopKind; UopKind::COUNT] = [$(UopKind::$name,)*];

            pub const fn name(self) -> &'static str {
                match self {
                    $(UopKind::$name => $label,)*
                }
            }
        }
    };
}

uop_kinds! {
    Nop = 0 => "NOP",
    LoadFast = 1 => "LOAD_FAST",
    LoadFastCheck = 2 => "LOAD_FAST_CHECK",
    LoadFastAndClear = 3 => "LOAD_FAST_AND_CLEAR",
    StoreFast = 4 => "STORE_FAST",
    StoreFastMaybeNull = 5 => "STORE_FAST_MAYBE_NULL",
    PopTop = 6 => "POP_TOP",
    PushNull = 7 => "PUSH_NULL",
    LoadConst = 8 => "LOAD_CONST",
    LoadConstInline = 9 => "LOAD_CONST_INLINE",
    LoadConstInlineWithNull = 10 => "LOAD_CONST_INLINE_WITH_NULL",
    Copy = 11 => "COPY",
    Swap = 12 => "SWAP",
    GuardBothInt = 13 => "GUARD_BOTH_INT",
    GuardBothFloat = 14 => "GUARD_BOTH_FLOAT",
    GuardBothUnicode = 15 => "GUARD_BOTH_UNICODE",
    BinaryOpAddInt = 16 => "BINARY_OP_ADD_INT",
    BinaryOpSubtractInt = 17 => "BINARY_OP_SUBTRACT_INT",
    BinaryOpMultiplyInt = 18 => "BINARY_OP_MULTIPLY_INT",
    BinaryOpAddFloat = 19 => "BINARY_OP_ADD_FLOAT",
    BinaryOpSubtractFloat = 20 => "BINARY_OP_SUBTRACT_FLOAT",
    BinaryOpMultiplyFloat = 21 => "BINARY_OP_MULTIPLY_FLOAT",
    BinaryOpAddUnicode = 22 => "BINARY_OP_ADD_UNICODE",
    LoadAttr = 23 => "LOAD_ATTR",
    MakeFunction = 24 => "MAKE_FUNCTION",
    SetFunctionAttribute = 25 => "SET_FUNCTION_ATTRIBUTE",
    CopyFreeVars = 26 => "COPY_FREE_VARS",
    CheckCallBoundMethodExactArgs = 27 => "CHECK_CALL_BOUND_METHOD_EXACT_ARGS",
    InitCallBoundMethodExactArgs = 28 => "INIT_CALL_BOUND_METHOD_EXACT_ARGS",
    CheckFunctionExactArgs = 29 => "CHECK_FUNCTION_EXACT_ARGS",
    InitCallPyExactArgs0 = 30 => "INIT_CALL_PY_EXACT_ARGS_0",
    InitCallPyExactArgs1 = 31 => "INIT_CALL_PY_EXACT_ARGS_1",
    InitCallPyExactArgs2 = 32 => "INIT_CALL_PY_EXACT_ARGS_2",
    InitCallPyExactArgs3 = 33 => "INIT_CALL_PY_EXACT_ARGS_3",
    InitCallPyExactArgs4 = 34 => "INIT_CALL_PY_EXACT_ARGS_4",
    InitCallPyExactArgs = 35 => "INIT_CALL_PY_EXACT_ARGS",
    SaveReturnOffset = 36 => "SAVE_RETURN_OFFSET",
    PushFrame = 37 => "PUSH_FRAME",
    PopFrame = 38 => "POP_FRAME",
    UnpackSequence = 39 => "UNPACK_SEQUENCE",
    UnpackEx = 40 => "UNPACK_EX",
    SetIp = 41 => "SET_IP",
    ExitTrace = 42 => "EXIT_TRACE",
    JumpToTop = 43 => "JUMP_TO_TOP",
}

bitflags! {
    /// Static properties of a uop kind.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct UopFlags: u8 {
        /// The immediate (`oparg`) is meaningful.
        const HAS_ARG = 1 << 0;
        /// The uop carries an inline constant reference.
        const HAS_OPERAND = 1 << 1;
        /// The uop side-exits when its precondition does not hold.
        const GUARD = 1 << 2;
        /// Real execution may raise.
        const ERROR = 1 << 3;
        /// The uop creates, enters or leaves a call frame.
        const FRAME = 1 << 4;
        /// Control does not fall through to the next uop.
        const TERMINATOR = 1 << 5;
    }
}

impl UopKind {
    pub const COUNT: usize = 44;

    pub fn flags(self) -> UopFlags {
        use UopKind::*;

        match self {
            Nop | PopTop | PushNull | MakeFunction => UopFlags::empty(),
            PushFrame | PopFrame => UopFlags::FRAME,
            LoadFast | LoadFastAndClear | StoreFast | StoreFastMaybeNull | LoadConst | Copy
            | Swap | CopyFreeVars | SetIp => UopFlags::HAS_ARG,
            LoadFastCheck => UopFlags::HAS_ARG | UopFlags::ERROR,
            LoadConstInline | LoadConstInlineWithNull => UopFlags::HAS_OPERAND,
            GuardBothInt | GuardBothFloat | GuardBothUnicode => UopFlags::GUARD,
            BinaryOpAddInt | BinaryOpSubtractInt | BinaryOpMultiplyInt => UopFlags::ERROR,
            BinaryOpAddFloat | BinaryOpSubtractFloat | BinaryOpMultiplyFloat
            | BinaryOpAddUnicode => UopFlags::empty(),
            LoadAttr | SetFunctionAttribute | UnpackSequence | UnpackEx => {
                UopFlags::HAS_ARG | UopFlags::ERROR
            }
            CheckCallBoundMethodExactArgs | CheckFunctionExactArgs => {
                UopFlags::HAS_ARG | UopFlags::GUARD
            }
            InitCallBoundMethodExactArgs => UopFlags::HAS_ARG,
            InitCallPyExactArgs0 | InitCallPyExactArgs1 | InitCallPyExactArgs2
            | InitCallPyExactArgs3 | InitCallPyExactArgs4 => UopFlags::FRAME,
            InitCallPyExactArgs => UopFlags::HAS_ARG | UopFlags::FRAME,
            SaveReturnOffset => UopFlags::HAS_ARG,
            ExitTrace => UopFlags::HAS_ARG | UopFlags::TERMINATOR,
            JumpToTop => UopFlags::TERMINATOR,
        }
    }

    pub fn is_guard(self) -> bool {
        self.flags().contains(UopFlags::GUARD)
    }

    /// Argument count of a call-init uop. Fixed-arity variants ignore `oparg`.
    pub fn call_arity(self, oparg: i32) -> Option<usize> {
        match self {
            UopKind::InitCallPyExactArgs0 => Some(0),
            UopKind::InitCallPyExactArgs1 => Some(1),
            UopKind::InitCallPyExactArgs2 => Some(2),
            UopKind::InitCallPyExactArgs3 => Some(3),
            UopKind::InitCallPyExactArgs4 => Some(4),
            UopKind::InitCallPyExactArgs => usize::try_from(oparg).ok(),
            _ => None,
        }
    }

    /// Fixed-arity call-init kind for `argc`, falling back to the general form.
    pub fn init_call_for_arity(argc: usize) -> UopKind {
        match argc {
            0 => UopKind::InitCallPyExactArgs0,
            1 => UopKind::InitCallPyExactArgs1,
            2 => UopKind::InitCallPyExactArgs2,
            3 => UopKind::InitCallPyExactArgs3,
            4 => UopKind::InitCallPyExactArgs4,
            _ => UopKind::InitCallPyExactArgs,
        }
    }

    /// `(pops, pushes)` on the current frame's stack, or `None` if `oparg` is out of range.
    ///
    /// `PushFrame` pops the pending frame from the caller; `PopFrame` pops the return value from the
    /// callee and pushes it onto the caller.
    pub fn stack_effect(self, oparg: i32) -> Option<(usize, usize)> {
        use UopKind::*;

        let n = usize::try_from(oparg).ok();
        Some(match self {
            Nop | CopyFreeVars | SaveReturnOffset | SetIp | ExitTrace | JumpToTop => (0, 0),
            LoadFast | LoadFastCheck | LoadFastAndClear | PushNull | LoadConst
            | LoadConstInline => (0, 1),
            LoadConstInlineWithNull => (0, 2),
            StoreFast | StoreFastMaybeNull | PopTop => (1, 0),
            Copy => {
                let n = n.filter(|&n| n >= 1)?;
                (n, n + 1)
            }
            Swap => {
                let n = n.filter(|&n| n >= 2)?;
                (n, n)
            }
            GuardBothInt | GuardBothFloat | GuardBothUnicode => (2, 2),
            BinaryOpAddInt | BinaryOpSubtractInt | BinaryOpMultiplyInt | BinaryOpAddFloat
            | BinaryOpSubtractFloat | BinaryOpMultiplyFloat | BinaryOpAddUnicode => (2, 1),
            LoadAttr => (1, 1 + (n? & 1)),
            MakeFunction => (1, 1),
            SetFunctionAttribute => (2, 1),
            CheckCallBoundMethodExactArgs | InitCallBoundMethodExactArgs
            | CheckFunctionExactArgs => (n? + 2, n? + 2),
            InitCallPyExactArgs0 | InitCallPyExactArgs1 | InitCallPyExactArgs2
            | InitCallPyExactArgs3 | InitCallPyExactArgs4 | InitCallPyExactArgs => {
                (self.call_arity(oparg)? + 2, 1)
            }
            PushFrame => (1, 0),
            PopFrame => (1, 1),
            UnpackSequence => (1, n?),
            UnpackEx => {
                let n = n?;
                (1, (n & 0xFF) + (n >> 8) + 1)
            }
        })
    }
}

impl TryFrom<u16> for UopKind {
    type Error = UnknownUopKind;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        UopKind::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(UnknownUopKind(value))
    }
}

impl fmt::Display for UopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One recorded micro-operation.
///
/// `operand` is the inline constant reference, an index into [`Trace::constants`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Uop {
    pub kind: UopKind,
    pub oparg: i32,
    pub operand: Option<u32>,
}

impl Uop {
    pub const NOP: Uop = Uop::new(UopKind::Nop, 0);

    pub const fn new(kind: UopKind, oparg: i32) -> Self {
        Self {
            kind,
            oparg,
            operand: None,
        }
    }

    pub const fn with_operand(kind: UopKind, oparg: i32, operand: u32) -> Self {
        Self {
            kind,
            oparg,
            operand: Some(operand),
        }
    }
}

impl fmt::Display for Uop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if self.kind.flags().contains(UopFlags::HAS_ARG) {
            write!(f, " {}", self.oparg)?;
        }
        if let Some(operand) = self.operand {
            write!(f, " @{operand}")?;
        }
        Ok(())
    }
}

/// A linear recording of uops executed by a hot loop.
///
/// Invariants:
/// - Execution starts in a frame running `entry` with `entry_stack_depth` values already on its
///   evaluation stack.
/// - Every `operand` indexes `constants`.
#[derive(Clone, Debug)]
pub struct Trace {
    pub entry: Arc<CodeDescriptor>,
    pub entry_stack_depth: usize,
    pub uops: Vec<Uop>,
    pub constants: Vec<ObjRef>,
}

impl Trace {
    pub fn new(entry: Arc<CodeDescriptor>) -> Self {
        Self {
            entry,
            entry_stack_depth: 0,
            uops: Vec::new(),
            constants: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.uops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uops.is_empty()
    }

    pub fn constant(&self, operand: u32) -> Option<&ObjRef> {
        self.constants.get(usize::try_from(operand).ok()?)
    }

    pub fn kinds(&self) -> impl Iterator<Item = UopKind> + '_ {
        self.uops.iter().map(|u| u.kind)
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "trace {} (entry depth {}):", self.entry.name, self.entry_stack_depth)?;
        for (i, uop) in self.uops.iter().enumerate() {
            writeln!(f, "  {i:4}: {uop}")?;
        }
        Ok(())
    }
}

/// Incremental trace recorder.
#[derive(Clone, Debug)]
pub struct TraceBuilder {
    trace: Trace,
}

impl TraceBuilder {
    pub fn new(entry: Arc<CodeDescriptor>) -> Self {
        Self {
            trace: Trace::new(entry),
        }
    }

    #[must_use]
    pub fn entry_stack_depth(mut self, depth: usize) -> Self {
        self.trace.entry_stack_depth = depth;
        self
    }

    pub fn push(&mut self, kind: UopKind, oparg: i32) -> &mut Self {
        self.trace.uops.push(Uop::new(kind, oparg));
        self
    }

    pub fn op(&mut self, kind: UopKind) -> &mut Self {
        self.push(kind, 0)
    }

    /// Interns `value` in the trace constant table and returns its operand index.
    pub fn intern(&mut self, value: ObjRef) -> u32 {
        if let Some(idx) = self
            .trace
            .constants
            .iter()
            .position(|c| Arc::ptr_eq(c, &value))
        {
            return idx as u32;
        }
        self.trace.constants.push(value);
        (self.trace.constants.len() - 1) as u32
    }

    pub fn load_const_inline(&mut self, value: ObjRef) -> &mut Self {
        let operand = self.intern(value);
        self.trace
            .uops
            .push(Uop::with_operand(UopKind::LoadConstInline, 0, operand));
        self
    }

    pub fn load_const_inline_with_null(&mut self, value: ObjRef) -> &mut Self {
        let operand = self.intern(value);
        self.trace
            .uops
            .push(Uop::with_operand(UopKind::LoadConstInlineWithNull, 0, operand));
        self
    }

    pub fn finish(self) -> Trace {
        self.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_match_table_positions() {
        for (idx, kind) in UopKind::ALL.iter().enumerate() {
            assert_eq!(*kind as u16 as usize, idx);
            assert_eq!(UopKind::try_from(idx as u16), Ok(*kind));
        }
        assert_eq!(
            UopKind::try_from(UopKind::COUNT as u16),
            Err(UnknownUopKind(UopKind::COUNT as u16))
        );
    }

    #[test]
    fn stack_effects_follow_oparg() {
        assert_eq!(UopKind::Copy.stack_effect(1), Some((1, 2)));
        assert_eq!(UopKind::Copy.stack_effect(0), None);
        assert_eq!(UopKind::Swap.stack_effect(1), None);
        assert_eq!(UopKind::Swap.stack_effect(3), Some((3, 3)));
        assert_eq!(UopKind::LoadAttr.stack_effect(5), Some((1, 2)));
        assert_eq!(UopKind::LoadAttr.stack_effect(4), Some((1, 1)));
        assert_eq!(UopKind::InitCallPyExactArgs2.stack_effect(99), Some((4, 1)));
        assert_eq!(UopKind::InitCallPyExactArgs.stack_effect(6), Some((8, 1)));
        assert_eq!(UopKind::UnpackEx.stack_effect(0x0201), Some((1, 4)));
        assert_eq!(UopKind::UnpackSequence.stack_effect(-1), None);
    }

    #[test]
    fn flags_classify_guards_and_terminators() {
        assert!(UopKind::GuardBothInt.is_guard());
        assert!(UopKind::CheckFunctionExactArgs.is_guard());
        assert!(!UopKind::LoadFastCheck.is_guard());
        assert!(UopKind::JumpToTop.flags().contains(UopFlags::TERMINATOR));
        assert!(UopKind::PushFrame.flags().contains(UopFlags::FRAME));
        assert!(UopKind::LoadConstInline
            .flags()
            .contains(UopFlags::HAS_OPERAND));
    }

    #[test]
    fn builder_interns_inline_constants_by_identity() {
        let code = CodeDescriptor::builder("loop").build();
        let five = kestrel_types::Object::int(5);
        let mut b = TraceBuilder::new(code);
        b.load_const_inline(five.clone())
            .load_const_inline(five)
            .load_const_inline(kestrel_types::Object::int(5));
        let trace = b.finish();
        assert_eq!(trace.constants.len(), 2);
        assert_eq!(trace.uops[0].operand, trace.uops[1].operand);
        assert_eq!(trace.uops[2].operand, Some(1));
    }

    #[test]
    fn init_call_arity_round_trips_through_kind_selection() {
        for argc in 0..=6usize {
            let kind = UopKind::init_call_for_arity(argc);
            assert_eq!(kind.call_arity(argc as i32), Some(argc));
        }
    }
}
