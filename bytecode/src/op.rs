/// Operand layout of an opcode. The length of an instruction is the
/// opcode byte plus the format's operand bytes. Multi-byte operands are
/// little-endian signed 32-bit unless noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// No operands.
    Plain,
    /// One unsigned byte.
    Byte,
    /// One 32-bit operand.
    Int32,
    /// Two unsigned bytes.
    ByteByte,
    /// One unsigned byte followed by one 32-bit operand.
    ByteInt32,
    /// Two 32-bit operands.
    Int32Int32,
}

impl Format {
    #[inline(always)]
    pub const fn length(self) -> usize {
        match self {
            Format::Plain => 1,
            Format::Byte => 2,
            Format::Int32 => 5,
            Format::ByteByte => 3,
            Format::ByteInt32 => 6,
            Format::Int32Int32 => 9,
        }
    }
}

/// Dispatch family of an invoke opcode. The per-builtin aliases
/// (`InvokeAdd`, `InvokeEq`, …) share the handler of the plain form
/// they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    None,
    Normal,
    Fast,
    Vtable,
}

/// Declared stack delta for opcodes whose effect depends on an operand
/// (invokes, returns, pop-and-branch). Resolved by the stack walker.
pub const VAR_DIFF: i8 = i8::MIN;

macro_rules! opcodes {
    ($($name:ident => $format:ident, $delta:expr, $branch:expr, $family:ident;)*) => {
        /// The opcode catalogue.
        ///
        /// Every instruction is one opcode byte followed by the operand
        /// bytes of its [`Format`]. "Unfold" variants read their constant
        /// inline via a bcp-relative offset instead of a pool index.
        /// `MethodEnd` is a stream terminator and must never execute.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Opcode {
            $($name),*
        }

        impl Opcode {
            #[inline(always)]
            pub const fn format(self) -> Format {
                match self { $(Opcode::$name => Format::$format),* }
            }

            /// Declared operand-stack delta; [`VAR_DIFF`] when the
            /// effect depends on the operands.
            #[inline(always)]
            pub const fn stack_delta(self) -> i8 {
                match self { $(Opcode::$name => $delta),* }
            }

            #[inline(always)]
            pub const fn is_branching(self) -> bool {
                match self { $(Opcode::$name => $branch),* }
            }

            #[inline(always)]
            const fn family(self) -> Family {
                match self { $(Opcode::$name => Family::$family),* }
            }

            pub const fn mnemonic(self) -> &'static str {
                match self { $(Opcode::$name => stringify!($name)),* }
            }
        }
    };
}

opcodes! {
    // ── Loads ──────────────────────────────────────────────────────
    LoadLocal0          => Plain, 1, false, None;
    LoadLocal1          => Plain, 1, false, None;
    LoadLocal2          => Plain, 1, false, None;
    LoadLocal           => Byte, 1, false, None;
    LoadBoxed           => Byte, 1, false, None;
    LoadStatic          => Int32, 1, false, None;
    LoadStaticInit      => Int32, 1, false, None;
    LoadField           => Byte, 0, false, None;
    LoadConst           => Int32, 1, false, None;
    LoadConstUnfold     => Int32, 1, false, None;
    LoadLiteralNull     => Plain, 1, false, None;
    LoadLiteralTrue     => Plain, 1, false, None;
    LoadLiteralFalse    => Plain, 1, false, None;
    LoadLiteral0        => Plain, 1, false, None;
    LoadLiteral1        => Plain, 1, false, None;
    LoadLiteral         => Byte, 1, false, None;
    LoadLiteralWide     => Int32, 1, false, None;

    // ── Stores ─────────────────────────────────────────────────────
    StoreLocal          => Byte, 0, false, None;
    StoreBoxed          => Byte, 0, false, None;
    StoreStatic         => Int32, 0, false, None;
    StoreField          => Byte, -1, false, None;

    // ── Invocations ────────────────────────────────────────────────
    InvokeMethod        => Int32, VAR_DIFF, false, Normal;
    InvokeMethodFast    => Int32, VAR_DIFF, false, Fast;
    InvokeMethodVtable  => Int32, VAR_DIFF, false, Vtable;
    InvokeStatic        => Int32, VAR_DIFF, false, None;
    InvokeStaticUnfold  => Int32, VAR_DIFF, false, None;
    InvokeFactory       => Int32, VAR_DIFF, false, None;
    InvokeFactoryUnfold => Int32, VAR_DIFF, false, None;
    InvokeNative        => ByteByte, 1, false, None;
    InvokeNativeYield   => ByteByte, 1, false, None;
    InvokeTest          => Int32, 0, false, None;
    InvokeTestFast      => Int32, 0, false, None;
    InvokeTestVtable    => Int32, 0, false, None;

    // ── Builtin-selector aliases ───────────────────────────────────
    InvokeEq            => Int32, VAR_DIFF, false, Normal;
    InvokeEqFast        => Int32, VAR_DIFF, false, Fast;
    InvokeEqVtable      => Int32, VAR_DIFF, false, Vtable;
    InvokeLt            => Int32, VAR_DIFF, false, Normal;
    InvokeLtFast        => Int32, VAR_DIFF, false, Fast;
    InvokeLtVtable      => Int32, VAR_DIFF, false, Vtable;
    InvokeLe            => Int32, VAR_DIFF, false, Normal;
    InvokeLeFast        => Int32, VAR_DIFF, false, Fast;
    InvokeLeVtable      => Int32, VAR_DIFF, false, Vtable;
    InvokeGt            => Int32, VAR_DIFF, false, Normal;
    InvokeGtFast        => Int32, VAR_DIFF, false, Fast;
    InvokeGtVtable      => Int32, VAR_DIFF, false, Vtable;
    InvokeGe            => Int32, VAR_DIFF, false, Normal;
    InvokeGeFast        => Int32, VAR_DIFF, false, Fast;
    InvokeGeVtable      => Int32, VAR_DIFF, false, Vtable;
    InvokeAdd           => Int32, VAR_DIFF, false, Normal;
    InvokeAddFast       => Int32, VAR_DIFF, false, Fast;
    InvokeAddVtable     => Int32, VAR_DIFF, false, Vtable;
    InvokeSub           => Int32, VAR_DIFF, false, Normal;
    InvokeSubFast       => Int32, VAR_DIFF, false, Fast;
    InvokeSubVtable     => Int32, VAR_DIFF, false, Vtable;
    InvokeMod           => Int32, VAR_DIFF, false, Normal;
    InvokeModFast       => Int32, VAR_DIFF, false, Fast;
    InvokeModVtable     => Int32, VAR_DIFF, false, Vtable;
    InvokeMul           => Int32, VAR_DIFF, false, Normal;
    InvokeMulFast       => Int32, VAR_DIFF, false, Fast;
    InvokeMulVtable     => Int32, VAR_DIFF, false, Vtable;
    InvokeTruncDiv      => Int32, VAR_DIFF, false, Normal;
    InvokeTruncDivFast  => Int32, VAR_DIFF, false, Fast;
    InvokeTruncDivVtable => Int32, VAR_DIFF, false, Vtable;
    InvokeBitNot        => Int32, VAR_DIFF, false, Normal;
    InvokeBitNotFast    => Int32, VAR_DIFF, false, Fast;
    InvokeBitNotVtable  => Int32, VAR_DIFF, false, Vtable;
    InvokeBitAnd        => Int32, VAR_DIFF, false, Normal;
    InvokeBitAndFast    => Int32, VAR_DIFF, false, Fast;
    InvokeBitAndVtable  => Int32, VAR_DIFF, false, Vtable;
    InvokeBitOr         => Int32, VAR_DIFF, false, Normal;
    InvokeBitOrFast     => Int32, VAR_DIFF, false, Fast;
    InvokeBitOrVtable   => Int32, VAR_DIFF, false, Vtable;
    InvokeBitXor        => Int32, VAR_DIFF, false, Normal;
    InvokeBitXorFast    => Int32, VAR_DIFF, false, Fast;
    InvokeBitXorVtable  => Int32, VAR_DIFF, false, Vtable;
    InvokeBitShr        => Int32, VAR_DIFF, false, Normal;
    InvokeBitShrFast    => Int32, VAR_DIFF, false, Fast;
    InvokeBitShrVtable  => Int32, VAR_DIFF, false, Vtable;
    InvokeBitShl        => Int32, VAR_DIFF, false, Normal;
    InvokeBitShlFast    => Int32, VAR_DIFF, false, Fast;
    InvokeBitShlVtable  => Int32, VAR_DIFF, false, Vtable;

    // ── Control ────────────────────────────────────────────────────
    Pop                 => Plain, -1, false, None;
    Return              => ByteByte, VAR_DIFF, false, None;
    BranchLong          => Int32, 0, true, None;
    BranchIfTrueLong    => Int32, -1, true, None;
    BranchIfFalseLong   => Int32, -1, true, None;
    BranchBack          => Byte, 0, true, None;
    BranchBackIfTrue    => Byte, -1, true, None;
    BranchBackIfFalse   => Byte, -1, true, None;
    BranchBackLong      => Int32, 0, true, None;
    BranchBackIfTrueLong => Int32, -1, true, None;
    BranchBackIfFalseLong => Int32, -1, true, None;
    PopAndBranchLong    => ByteInt32, VAR_DIFF, true, None;
    PopAndBranchBackLong => ByteInt32, VAR_DIFF, true, None;
    Throw               => Plain, 0, true, None;
    SubroutineCall      => Int32Int32, 0, true, None;
    SubroutineReturn    => Plain, 0, true, None;

    // ── Allocation ─────────────────────────────────────────────────
    Allocate            => Int32, VAR_DIFF, false, None;
    AllocateUnfold      => Int32, VAR_DIFF, false, None;
    AllocateImmutable   => Int32, VAR_DIFF, false, None;
    AllocateImmutableUnfold => Int32, VAR_DIFF, false, None;
    AllocateBoxed       => Plain, 0, false, None;

    // ── Misc ───────────────────────────────────────────────────────
    Negate              => Plain, 0, false, None;
    StackOverflowCheck  => Int32, 0, false, None;
    Identical           => Plain, -1, false, None;
    IdenticalNonNumeric => Plain, -1, false, None;
    ProcessYield        => Plain, 0, false, None;
    CoroutineChange     => Plain, -1, false, None;
    EnterNoSuchMethod   => Plain, 3, false, None;
    ExitNoSuchMethod    => Plain, VAR_DIFF, false, None;
    FrameSize           => Byte, 0, false, None;
    MethodEnd           => Int32, 0, false, None;
}

impl Opcode {
    pub const COUNT: usize = Opcode::MethodEnd as usize + 1;

    /// Total instruction length in bytes, opcode included.
    #[inline(always)]
    pub const fn length(self) -> usize {
        self.format().length()
    }

    /// `InvokeMethod` or a builtin alias of it.
    #[inline(always)]
    pub const fn is_invoke_normal(self) -> bool {
        matches!(self.family(), Family::Normal)
    }

    /// `InvokeMethodFast` or a builtin alias of it.
    #[inline(always)]
    pub const fn is_invoke_fast(self) -> bool {
        matches!(self.family(), Family::Fast)
    }

    /// `InvokeMethodVtable` or a builtin alias of it.
    #[inline(always)]
    pub const fn is_invoke_vtable(self) -> bool {
        matches!(self.family(), Family::Vtable)
    }

    /// Convert a raw byte to an opcode without a bounds check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< Opcode::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!((byte as usize) < Self::COUNT, "invalid opcode: 0x{byte:02x}");
        core::mem::transmute::<u8, Opcode>(byte)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Opcode is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Opcode>(byte) })
        } else {
            Err(byte)
        }
    }
}

/// Render the instruction at `pos` and return the rendered text together
/// with the offset of the next instruction.
pub fn disassemble_at(bytes: &[u8], pos: usize) -> (String, usize) {
    let op = match Opcode::try_from(bytes[pos]) {
        Ok(op) => op,
        Err(byte) => return (format!("<bad 0x{byte:02x}>"), pos + 1),
    };
    let text = match op.format() {
        Format::Plain => op.mnemonic().to_string(),
        Format::Byte => format!("{} {}", op.mnemonic(), bytes[pos + 1]),
        Format::Int32 => {
            let v = i32::from_le_bytes(bytes[pos + 1..pos + 5].try_into().unwrap());
            format!("{} {v}", op.mnemonic())
        }
        Format::ByteByte => format!("{} {} {}", op.mnemonic(), bytes[pos + 1], bytes[pos + 2]),
        Format::ByteInt32 => {
            let v = i32::from_le_bytes(bytes[pos + 2..pos + 6].try_into().unwrap());
            format!("{} {} {v}", op.mnemonic(), bytes[pos + 1])
        }
        Format::Int32Int32 => {
            let a = i32::from_le_bytes(bytes[pos + 1..pos + 5].try_into().unwrap());
            let b = i32::from_le_bytes(bytes[pos + 5..pos + 9].try_into().unwrap());
            format!("{} {a} {b}", op.mnemonic())
        }
    };
    (text, pos + op.length())
}
