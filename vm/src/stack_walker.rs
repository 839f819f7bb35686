use bytecode::{Opcode, Selector, VAR_DIFF};
use object::{Array, Class, Function, Stack, Value};

use crate::program::Program;

/// Every selector-carrying invoke is 5 bytes; a return address minus
/// this lands on the call opcode.
const INVOKE_LENGTH: usize = 5;

/// One live frame, walked top-down.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub function: *const Function,
    /// Byte offset of the instruction the frame is suspended at: the
    /// saved bcp for the top frame, the call opcode for the others.
    pub offset: usize,
    /// Slot index of the frame's return address.
    pub ret_slot: usize,
    /// Live frame slots above the return address.
    pub height: usize,
}

/// Walks the frames of a suspended stack from the top down.
///
/// The stack must be in saved state: its top slot holds the saved bcp.
/// Frame boundaries are recovered structurally, by replaying the
/// declared stack deltas of each function's stream up to the suspension
/// offset; the bottom frame is marked by the zero sentinel the process
/// seeds below the entry arguments' return-address slot.
pub struct StackWalker<'a> {
    program: &'a Program,
    stack: &'a Stack,
    bcp: *const u8,
    frame_top: usize,
    first: bool,
    done: bool,
}

impl<'a> StackWalker<'a> {
    pub fn new(program: &'a Program, stack: &'a Stack) -> Self {
        let top = stack.top();
        let bcp = unsafe { stack.slot(top) }.raw() as *const u8;
        Self {
            program,
            stack,
            bcp,
            frame_top: top - 1,
            first: true,
            done: false,
        }
    }

    pub fn next_frame(&mut self) -> Option<FrameInfo> {
        if self.done {
            return None;
        }
        let function = unsafe { function_from_bcp(self.bcp) };
        let function_ref = unsafe { &*function };
        let stream_offset = self.bcp as usize - function_ref.bytecode_start() as usize;
        let offset = if self.first {
            stream_offset
        } else {
            stream_offset - INVOKE_LENGTH
        };
        let height = simulate_height(self.program, function_ref, offset);
        let ret_slot = self
            .frame_top
            .checked_sub(height)
            .unwrap_or_else(|| panic!("stack frame chain corrupted"));

        let info = FrameInfo {
            function,
            offset,
            ret_slot,
            height,
        };

        let ret = unsafe { self.stack.slot(ret_slot) };
        if ret.raw() == 0 {
            self.done = true;
        } else {
            self.bcp = ret.raw() as *const u8;
            self.frame_top = ret_slot - 1;
            self.first = false;
        }
        Some(info)
    }
}

/// Find the innermost catch block protecting the suspension point, in
/// the current coroutine only. Returns the handler bcp and the slot
/// delta from the saved-state top down to the handler's stack height
/// (exception included).
pub fn compute_catch_block(program: &Program, stack: &Stack) -> Option<(*const u8, usize)> {
    let top = stack.top();
    let mut walker = StackWalker::new(program, stack);
    while let Some(frame) = walker.next_frame() {
        let function = unsafe { &*frame.function };
        for entry in unsafe { function.catch_entries() } {
            let start = unsafe { entry.start.smi_value() } as usize;
            let end = unsafe { entry.end.smi_value() } as usize;
            if frame.offset < start || frame.offset >= end {
                continue;
            }
            let target = unsafe { entry.target.smi_value() } as usize;
            let height = unsafe { entry.height.smi_value() } as usize;
            let target_top = frame.ret_slot + height;
            let catch_bcp = function.bytecode_address_for(target);
            return Some((catch_bcp, top - target_top));
        }
    }
    None
}

/// Re-walk the whole frame chain and panic on any inconsistency. The
/// bottom frame's return slot must sit directly above the entry
/// function's arguments.
pub fn validate_stack(program: &Program, stack: &Stack) {
    let mut walker = StackWalker::new(program, stack);
    let mut last = None;
    while let Some(frame) = walker.next_frame() {
        if frame.ret_slot > stack.top() {
            panic!("stack frame chain corrupted");
        }
        last = Some(frame);
    }
    let bottom = last.expect("stack has no frames");
    let arity = unsafe { (*bottom.function).arity() };
    if bottom.ret_slot != arity {
        panic!(
            "wrong stack height: bottom frame return slot {} does not match entry arity {}",
            bottom.ret_slot, arity
        );
    }
}

/// Recover the function owning `bcp` by scanning forward to the
/// `MethodEnd` sentinel, whose operand is its own offset in the stream.
///
/// # Safety
///
/// `bcp` must point at an instruction boundary inside a live function's
/// bytecode.
pub unsafe fn function_from_bcp(bcp: *const u8) -> *const Function {
    let mut p = bcp;
    loop {
        let op = Opcode::try_from(*p)
            .unwrap_or_else(|byte| panic!("bad opcode 0x{byte:02x} while scanning for MethodEnd"));
        if op == Opcode::MethodEnd {
            let mut operand = [0u8; 4];
            core::ptr::copy_nonoverlapping(p.add(1), operand.as_mut_ptr(), 4);
            let offset = i32::from_le_bytes(operand) as usize;
            let stream_start = p.sub(offset);
            return stream_start.sub(size_of::<Function>()) as *const Function;
        }
        p = p.add(op.length());
    }
}

/// Operand-stack height of a frame suspended at `offset`, replayed from
/// the function entry by summing declared deltas. Variable-effect
/// opcodes resolve their delta from their operands. Exact at every
/// suspension offset as long as the emitter keeps merge points
/// height-consistent, which is the same cooperation the bytecode
/// compiler owes the walker.
pub fn simulate_height(program: &Program, function: &Function, offset: usize) -> usize {
    let bytes = unsafe { function.bytecode() };
    let mut pos = 0usize;
    let mut height = 0isize;
    while pos < offset {
        let op = Opcode::try_from(bytes[pos])
            .unwrap_or_else(|byte| panic!("bad opcode 0x{byte:02x} in stream"));
        let delta = match op.stack_delta() {
            VAR_DIFF => resolve_var_delta(program, function, bytes, pos, op),
            d => d as isize,
        };
        height += delta;
        pos += op.length();
    }
    debug_assert!(pos == offset, "offset {offset} is not an instruction boundary");
    debug_assert!(height >= 0, "negative simulated height");
    height.max(0) as usize
}

fn resolve_var_delta(
    program: &Program,
    function: &Function,
    bytes: &[u8],
    pos: usize,
    op: Opcode,
) -> isize {
    let read_i32 = |at: usize| i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
    if op.is_invoke_normal() || op.is_invoke_vtable() {
        let selector = Selector::from_raw(read_i32(pos + 1) as u32);
        return -(selector.arity() as isize);
    }
    if op.is_invoke_fast() {
        let index = read_i32(pos + 1) as usize;
        let table_value = program.dispatch_table();
        let table: &Array = unsafe { table_value.as_ref() };
        let selector = Selector::from_raw(unsafe { table.get(index + 1).smi_value() } as u32);
        return -(selector.arity() as isize);
    }
    match op {
        Opcode::InvokeStatic | Opcode::InvokeFactory => {
            let index = read_i32(pos + 1) as usize;
            let target_value = program.static_method_at(index);
            let target: &Function = unsafe { target_value.as_ref() };
            1 - target.arity() as isize
        }
        Opcode::InvokeStaticUnfold | Opcode::InvokeFactoryUnfold => {
            let bcp = function.bytecode_address_for(pos);
            let value = unsafe { *(bcp.offset(read_i32(pos + 1) as isize) as *const Value) };
            let target: &Function = unsafe { value.as_ref() };
            1 - target.arity() as isize
        }
        Opcode::Allocate | Opcode::AllocateImmutable => {
            let class_value = program.class_at(read_i32(pos + 1) as usize);
            let class: &Class = unsafe { class_value.as_ref() };
            1 - class.field_count() as isize
        }
        Opcode::AllocateUnfold | Opcode::AllocateImmutableUnfold => {
            let bcp = function.bytecode_address_for(pos);
            let value = unsafe { *(bcp.offset(read_i32(pos + 1) as isize) as *const Value) };
            let class: &Class = unsafe { value.as_ref() };
            1 - class.field_count() as isize
        }
        Opcode::PopAndBranchLong | Opcode::PopAndBranchBackLong => -(bytes[pos + 1] as isize),
        // Fall-through past a frame exit is unreachable; the opcodes
        // contribute nothing to later offsets.
        Opcode::Return | Opcode::ExitNoSuchMethod => 0,
        _ => unreachable!("{} has no variable delta", op.mnemonic()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Lit, ProgramBuilder};
    use bytecode::{well_known, FunctionAsm};

    fn empty_entry() -> FunctionAsm {
        let mut asm = FunctionAsm::new();
        asm.frame_size(0);
        asm.load_literal_true();
        asm.process_yield();
        asm.method_end();
        asm
    }

    #[test]
    fn function_recovery_from_interior_pointer() {
        let mut builder = ProgramBuilder::new();
        let mut asm = FunctionAsm::new();
        asm.frame_size(2);
        asm.load_literal(5);
        asm.load_literal(6);
        asm.invoke(bytecode::Opcode::InvokeAdd, well_known::ADD);
        asm.pop();
        asm.load_literal_true();
        asm.process_yield();
        asm.method_end();
        let f = builder.add_function(0, asm, Vec::new());
        builder.set_entry(f);
        let program = builder.build();

        let function: &Function = unsafe { program.entry().as_ref() };
        for offset in [0usize, 2, 4, 6, 11, 12] {
            let bcp = function.bytecode_address_for(offset);
            let recovered = unsafe { function_from_bcp(bcp) };
            assert_eq!(recovered as usize, function as *const Function as usize);
        }
    }

    #[test]
    fn simulated_heights_follow_declared_deltas() {
        let mut builder = ProgramBuilder::new();
        let mut asm = FunctionAsm::new();
        asm.frame_size(3); // 0..2, height 0
        asm.load_literal(1); // 2..4, height 1
        asm.load_literal(2); // 4..6, height 2
        asm.invoke(bytecode::Opcode::InvokeAdd, well_known::ADD); // 6..11, height 1
        asm.load_literal_null(); // 11..12, height 2
        asm.pop(); // 12..13, height 1
        asm.load_literal_true();
        asm.process_yield();
        asm.method_end();
        let f = builder.add_function(0, asm, Vec::new());
        builder.set_entry(f);
        let program = builder.build();

        let function: &Function = unsafe { program.entry().as_ref() };
        assert_eq!(simulate_height(&program, function, 2), 0);
        assert_eq!(simulate_height(&program, function, 6), 2);
        assert_eq!(simulate_height(&program, function, 11), 1);
        assert_eq!(simulate_height(&program, function, 12), 2);
        assert_eq!(simulate_height(&program, function, 13), 1);
    }

    #[test]
    fn static_invoke_delta_uses_callee_arity() {
        let mut builder = ProgramBuilder::new();
        let mut callee = FunctionAsm::new();
        callee.frame_size(0);
        callee.load_local(1);
        callee.return_(1, 2);
        callee.method_end();
        let callee = builder.add_function(2, callee, Vec::new());

        let mut asm = FunctionAsm::new();
        asm.frame_size(2); // 0..2, height 0
        asm.load_literal(1); // height 1
        asm.load_literal(2); // height 2
        asm.invoke_static(callee.0 as i32); // 6..11, height 1 after
        asm.pop();
        asm.load_literal_true();
        asm.process_yield();
        asm.method_end();
        let f = builder.add_function(0, asm, Vec::new());
        builder.set_entry(f);
        let program = builder.build();

        let function: &Function = unsafe { program.entry().as_ref() };
        assert_eq!(simulate_height(&program, function, 6), 2);
        assert_eq!(simulate_height(&program, function, 11), 1);
    }

    #[test]
    fn entry_is_sane() {
        // Guards the assembly assumptions the other tests rely on.
        let asm = empty_entry();
        assert_eq!(asm.bytes()[0], Opcode::FrameSize as u8);
    }
}
