use crate::op::{Format, Opcode};
use crate::selector::Selector;

/// A forward branch whose offset has not yet been resolved.
///
/// Created by the `branch*` methods; resolve with
/// [`FunctionAsm::bind`].
#[derive(Debug)]
pub struct Label {
    /// Offset of the branch opcode (branch deltas are relative to it).
    op_pos: usize,
    /// Position of the i32 delta bytes in the buffer.
    offset_pos: usize,
}

/// A `SubroutineCall` with both deltas unresolved. Bind the jump target
/// with [`FunctionAsm::bind_subroutine`] and the return delta with
/// [`FunctionAsm::subroutine_return`].
#[derive(Debug)]
pub struct SubroutineLabel {
    op_pos: usize,
    delta_pos: usize,
    return_delta_pos: usize,
}

/// A protected bytecode range and its handler, recorded while
/// assembling and materialized into the function's catch table.
#[derive(Debug, Clone, Copy)]
pub struct CatchRange {
    pub start: usize,
    pub end: usize,
    pub target: usize,
    /// Live frame slots (locals + operands, exception included) at `target`.
    pub height: usize,
}

/// A `*Unfold` operand awaiting a literal address patch.
#[derive(Debug, Clone, Copy)]
pub struct LiteralRef {
    /// Position of the i32 operand in the buffer.
    pub operand_pos: usize,
    /// Index into the function's literal area.
    pub literal: u16,
}

/// Assembles one function's bytecode stream.
///
/// The stream conventionally starts with `FrameSize` and must end with
/// [`method_end`](Self::method_end), which records its own offset so the
/// owning function can be recovered from any interior bytecode pointer.
pub struct FunctionAsm {
    buf: Vec<u8>,
    literal_refs: Vec<LiteralRef>,
    catch_ranges: Vec<CatchRange>,
    literal_slots: usize,
}

impl FunctionAsm {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            literal_refs: Vec::new(),
            catch_ranges: Vec::new(),
            literal_slots: 0,
        }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn literal_refs(&self) -> &[LiteralRef] {
        &self.literal_refs
    }

    pub fn catch_ranges(&self) -> &[CatchRange] {
        &self.catch_ranges
    }

    /// Number of literal slots the function needs.
    pub fn literal_slots(&self) -> usize {
        self.literal_slots
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_op(&mut self, op: Opcode) -> usize {
        let pos = self.buf.len();
        self.buf.push(op as u8);
        pos
    }

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_literal_ref(&mut self, literal: u16) {
        self.literal_refs.push(LiteralRef {
            operand_pos: self.buf.len(),
            literal,
        });
        self.literal_slots = self.literal_slots.max(literal as usize + 1);
        self.emit_i32(0); // patched at materialization
    }

    // ── loads and stores ───────────────────────────────────────────

    /// `LoadLocal n`, using the short forms for `n < 3`.
    pub fn load_local(&mut self, n: u8) {
        match n {
            0 => {
                self.emit_op(Opcode::LoadLocal0);
            }
            1 => {
                self.emit_op(Opcode::LoadLocal1);
            }
            2 => {
                self.emit_op(Opcode::LoadLocal2);
            }
            _ => {
                self.emit_op(Opcode::LoadLocal);
                self.emit_u8(n);
            }
        }
    }

    pub fn store_local(&mut self, n: u8) {
        self.emit_op(Opcode::StoreLocal);
        self.emit_u8(n);
    }

    pub fn load_boxed(&mut self, n: u8) {
        self.emit_op(Opcode::LoadBoxed);
        self.emit_u8(n);
    }

    pub fn store_boxed(&mut self, n: u8) {
        self.emit_op(Opcode::StoreBoxed);
        self.emit_u8(n);
    }

    pub fn load_static(&mut self, index: i32) {
        self.emit_op(Opcode::LoadStatic);
        self.emit_i32(index);
    }

    pub fn load_static_init(&mut self, index: i32) {
        self.emit_op(Opcode::LoadStaticInit);
        self.emit_i32(index);
    }

    pub fn store_static(&mut self, index: i32) {
        self.emit_op(Opcode::StoreStatic);
        self.emit_i32(index);
    }

    pub fn load_field(&mut self, index: u8) {
        self.emit_op(Opcode::LoadField);
        self.emit_u8(index);
    }

    pub fn store_field(&mut self, index: u8) {
        self.emit_op(Opcode::StoreField);
        self.emit_u8(index);
    }

    pub fn load_const(&mut self, index: i32) {
        self.emit_op(Opcode::LoadConst);
        self.emit_i32(index);
    }

    pub fn load_const_unfold(&mut self, literal: u16) {
        self.emit_op(Opcode::LoadConstUnfold);
        self.emit_literal_ref(literal);
    }

    /// `LoadLiteral n`, using the dedicated forms where they exist.
    pub fn load_literal(&mut self, n: i32) {
        match n {
            0 => {
                self.emit_op(Opcode::LoadLiteral0);
            }
            1 => {
                self.emit_op(Opcode::LoadLiteral1);
            }
            2..=255 => {
                self.emit_op(Opcode::LoadLiteral);
                self.emit_u8(n as u8);
            }
            _ => {
                self.emit_op(Opcode::LoadLiteralWide);
                self.emit_i32(n);
            }
        }
    }

    pub fn load_literal_null(&mut self) {
        self.emit_op(Opcode::LoadLiteralNull);
    }

    pub fn load_literal_true(&mut self) {
        self.emit_op(Opcode::LoadLiteralTrue);
    }

    pub fn load_literal_false(&mut self) {
        self.emit_op(Opcode::LoadLiteralFalse);
    }

    // ── invocations ────────────────────────────────────────────────

    pub fn invoke_method(&mut self, selector: Selector) {
        self.invoke(Opcode::InvokeMethod, selector);
    }

    /// Emit an `InvokeMethod`-family opcode (the plain form or a builtin
    /// alias) with its selector operand.
    pub fn invoke(&mut self, op: Opcode, selector: Selector) {
        debug_assert!(op.is_invoke_normal() || op.is_invoke_vtable());
        self.emit_op(op);
        self.emit_i32(selector.raw() as i32);
    }

    /// Emit an `InvokeMethodFast`-family opcode with its dispatch-table
    /// index operand.
    pub fn invoke_fast(&mut self, op: Opcode, index: i32) {
        debug_assert!(op.is_invoke_fast());
        self.emit_op(op);
        self.emit_i32(index);
    }

    pub fn invoke_method_vtable(&mut self, selector: Selector) {
        self.invoke(Opcode::InvokeMethodVtable, selector);
    }

    pub fn invoke_static(&mut self, index: i32) {
        self.emit_op(Opcode::InvokeStatic);
        self.emit_i32(index);
    }

    pub fn invoke_static_unfold(&mut self, literal: u16) {
        self.emit_op(Opcode::InvokeStaticUnfold);
        self.emit_literal_ref(literal);
    }

    pub fn invoke_factory(&mut self, index: i32) {
        self.emit_op(Opcode::InvokeFactory);
        self.emit_i32(index);
    }

    pub fn invoke_factory_unfold(&mut self, literal: u16) {
        self.emit_op(Opcode::InvokeFactoryUnfold);
        self.emit_literal_ref(literal);
    }

    /// `InvokeNative arity native` — `arity` counts the receiver.
    pub fn invoke_native(&mut self, arity: u8, native: u8) {
        self.emit_op(Opcode::InvokeNative);
        self.emit_u8(arity);
        self.emit_u8(native);
    }

    pub fn invoke_native_yield(&mut self, arity: u8, native: u8) {
        self.emit_op(Opcode::InvokeNativeYield);
        self.emit_u8(arity);
        self.emit_u8(native);
    }

    pub fn invoke_test(&mut self, selector: Selector) {
        self.emit_op(Opcode::InvokeTest);
        self.emit_i32(selector.raw() as i32);
    }

    pub fn invoke_test_fast(&mut self, index: i32) {
        self.emit_op(Opcode::InvokeTestFast);
        self.emit_i32(index);
    }

    pub fn invoke_test_vtable(&mut self, selector: Selector) {
        self.emit_op(Opcode::InvokeTestVtable);
        self.emit_i32(selector.raw() as i32);
    }

    // ── control ────────────────────────────────────────────────────

    pub fn pop(&mut self) {
        self.emit_op(Opcode::Pop);
    }

    pub fn return_(&mut self, locals: u8, arguments: u8) {
        self.emit_op(Opcode::Return);
        self.emit_u8(locals);
        self.emit_u8(arguments);
    }

    pub fn throw(&mut self) {
        self.emit_op(Opcode::Throw);
    }

    /// Emit an unconditional forward branch; resolve with [`bind`](Self::bind).
    pub fn branch(&mut self) -> Label {
        self.emit_branch_placeholder(Opcode::BranchLong)
    }

    pub fn branch_if_true(&mut self) -> Label {
        self.emit_branch_placeholder(Opcode::BranchIfTrueLong)
    }

    pub fn branch_if_false(&mut self) -> Label {
        self.emit_branch_placeholder(Opcode::BranchIfFalseLong)
    }

    /// Emit a `PopAndBranchLong`; resolve with [`bind`](Self::bind).
    pub fn pop_and_branch(&mut self, pop_count: u8) -> Label {
        let op_pos = self.emit_op(Opcode::PopAndBranchLong);
        self.emit_u8(pop_count);
        let offset_pos = self.buf.len();
        self.emit_i32(0);
        Label { op_pos, offset_pos }
    }

    /// Bind a forward branch to the current position.
    pub fn bind(&mut self, label: Label) {
        let delta = (self.buf.len() - label.op_pos) as i32;
        self.buf[label.offset_pos..label.offset_pos + 4].copy_from_slice(&delta.to_le_bytes());
    }

    /// Branch backward to `target` (an offset from
    /// [`current_offset`](Self::current_offset)), picking the short form
    /// when the delta fits a byte. Back-branches double as safepoints.
    pub fn branch_back(&mut self, target: usize) {
        let op_pos = self.buf.len();
        let delta = op_pos - target;
        if delta <= u8::MAX as usize {
            self.emit_op(Opcode::BranchBack);
            self.emit_u8(delta as u8);
        } else {
            self.emit_op(Opcode::BranchBackLong);
            self.emit_i32(delta as i32);
        }
    }

    pub fn branch_back_if_true(&mut self, target: usize) {
        let op_pos = self.buf.len();
        let delta = op_pos - target;
        if delta <= u8::MAX as usize {
            self.emit_op(Opcode::BranchBackIfTrue);
            self.emit_u8(delta as u8);
        } else {
            self.emit_op(Opcode::BranchBackIfTrueLong);
            self.emit_i32(delta as i32);
        }
    }

    pub fn branch_back_if_false(&mut self, target: usize) {
        let op_pos = self.buf.len();
        let delta = op_pos - target;
        if delta <= u8::MAX as usize {
            self.emit_op(Opcode::BranchBackIfFalse);
            self.emit_u8(delta as u8);
        } else {
            self.emit_op(Opcode::BranchBackIfFalseLong);
            self.emit_i32(delta as i32);
        }
    }

    pub fn pop_and_branch_back(&mut self, pop_count: u8, target: usize) {
        let op_pos = self.buf.len();
        self.emit_op(Opcode::PopAndBranchBackLong);
        self.emit_u8(pop_count);
        self.emit_i32((op_pos - target) as i32);
    }

    /// `SubroutineCall`: jump-and-link into a finally block.
    pub fn subroutine_call(&mut self) -> SubroutineLabel {
        let op_pos = self.emit_op(Opcode::SubroutineCall);
        let delta_pos = self.buf.len();
        self.emit_i32(0);
        let return_delta_pos = self.buf.len();
        self.emit_i32(0);
        SubroutineLabel {
            op_pos,
            delta_pos,
            return_delta_pos,
        }
    }

    /// Bind the subroutine body entry to the current position.
    pub fn bind_subroutine(&mut self, label: &SubroutineLabel) {
        let delta = (self.buf.len() - label.op_pos) as i32;
        self.buf[label.delta_pos..label.delta_pos + 4].copy_from_slice(&delta.to_le_bytes());
    }

    /// Emit the `SubroutineReturn` ending the body and patch the return
    /// delta so control resumes after the call.
    pub fn subroutine_return(&mut self, label: SubroutineLabel) {
        let sr_pos = self.emit_op(Opcode::SubroutineReturn);
        let call_len = Opcode::SubroutineCall.length();
        let return_delta = (sr_pos - (label.op_pos + call_len)) as i32;
        self.buf[label.return_delta_pos..label.return_delta_pos + 4]
            .copy_from_slice(&return_delta.to_le_bytes());
    }

    // ── allocation ─────────────────────────────────────────────────

    pub fn allocate(&mut self, class_index: i32) {
        self.emit_op(Opcode::Allocate);
        self.emit_i32(class_index);
    }

    pub fn allocate_unfold(&mut self, literal: u16) {
        self.emit_op(Opcode::AllocateUnfold);
        self.emit_literal_ref(literal);
    }

    pub fn allocate_immutable(&mut self, class_index: i32) {
        self.emit_op(Opcode::AllocateImmutable);
        self.emit_i32(class_index);
    }

    pub fn allocate_immutable_unfold(&mut self, literal: u16) {
        self.emit_op(Opcode::AllocateImmutableUnfold);
        self.emit_literal_ref(literal);
    }

    pub fn allocate_boxed(&mut self) {
        self.emit_op(Opcode::AllocateBoxed);
    }

    // ── misc ───────────────────────────────────────────────────────

    pub fn negate(&mut self) {
        self.emit_op(Opcode::Negate);
    }

    pub fn identical(&mut self) {
        self.emit_op(Opcode::Identical);
    }

    pub fn identical_non_numeric(&mut self) {
        self.emit_op(Opcode::IdenticalNonNumeric);
    }

    pub fn stack_overflow_check(&mut self, size: i32) {
        self.emit_op(Opcode::StackOverflowCheck);
        self.emit_i32(size);
    }

    pub fn process_yield(&mut self) {
        self.emit_op(Opcode::ProcessYield);
    }

    pub fn coroutine_change(&mut self) {
        self.emit_op(Opcode::CoroutineChange);
    }

    pub fn enter_no_such_method(&mut self) {
        self.emit_op(Opcode::EnterNoSuchMethod);
    }

    pub fn exit_no_such_method(&mut self) {
        self.emit_op(Opcode::ExitNoSuchMethod);
    }

    /// `FrameSize n` prefix carrying the frame-slot metadata for the
    /// stack walker. Every stream starts with it.
    pub fn frame_size(&mut self, slots: u8) {
        self.emit_op(Opcode::FrameSize);
        self.emit_u8(slots);
    }

    /// Terminate the stream. The operand records the sentinel's own
    /// offset so an owning function can be recovered from any interior
    /// bytecode pointer.
    pub fn method_end(&mut self) {
        let pos = self.emit_op(Opcode::MethodEnd);
        self.emit_i32(pos as i32);
    }

    /// Record a protected range and its handler for the catch table.
    pub fn catch_range(&mut self, start: usize, end: usize, target: usize, height: usize) {
        self.catch_ranges.push(CatchRange {
            start,
            end,
            target,
            height,
        });
    }

    fn emit_branch_placeholder(&mut self, op: Opcode) -> Label {
        debug_assert_eq!(op.format(), Format::Int32);
        let op_pos = self.emit_op(op);
        let offset_pos = self.buf.len();
        self.emit_i32(0); // placeholder
        Label { op_pos, offset_pos }
    }
}

impl Default for FunctionAsm {
    fn default() -> Self {
        Self::new()
    }
}
