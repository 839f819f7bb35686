use bytecode::{well_known, FunctionAsm, Opcode, Selector};
use object::{Array, Double, HeapObject, Layout, Stack, Value};

use crate::process::Process;
use crate::program::{FnId, ProgramBuilder};

/// Raw view of a native's arguments: a pointer at the receiver slot
/// (`Local(arity)`), arguments above it.
#[derive(Clone, Copy)]
pub struct Arguments(pub *mut Value);

impl Arguments {
    /// # Safety
    ///
    /// `index` must be below the invoking opcode's arity operand.
    #[inline(always)]
    pub unsafe fn get(self, index: usize) -> Value {
        *self.0.add(index)
    }
}

pub type NativeFn = fn(&mut Process, Arguments) -> Value;

/// The static native table index used by `InvokeNative`'s second
/// operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Native {
    SmiAdd = 0,
    SmiSub,
    SmiMul,
    SmiMod,
    SmiTruncDiv,
    SmiEqual,
    SmiLess,
    SmiLessEqual,
    SmiGreater,
    SmiGreaterEqual,
    SmiBitNot,
    SmiBitAnd,
    SmiBitOr,
    SmiBitXor,
    SmiBitShr,
    SmiBitShl,
    DoubleAdd,
    DoubleSub,
    DoubleMul,
    DoubleDiv,
    DoubleLess,
    DoubleEqual,
    ArrayNew,
    ArrayLength,
    ArrayIndexGet,
    ArrayIndexSet,
    CoroutineNewStack,
    PortSend,
}

impl Native {
    pub const COUNT: usize = Native::PortSend as usize + 1;
}

pub static NATIVE_TABLE: [NativeFn; Native::COUNT] = [
    native_smi_add,
    native_smi_sub,
    native_smi_mul,
    native_smi_mod,
    native_smi_trunc_div,
    native_smi_equal,
    native_smi_less,
    native_smi_less_equal,
    native_smi_greater,
    native_smi_greater_equal,
    native_smi_bit_not,
    native_smi_bit_and,
    native_smi_bit_or,
    native_smi_bit_xor,
    native_smi_bit_shr,
    native_smi_bit_shl,
    native_double_add,
    native_double_sub,
    native_double_mul,
    native_double_div,
    native_double_less,
    native_double_equal,
    native_array_new,
    native_array_length,
    native_array_index_get,
    native_array_index_set,
    native_coroutine_new_stack,
    native_port_send,
];

macro_rules! require_smi {
    ($args:expr, $index:expr) => {{
        let value = unsafe { $args.get($index) };
        if !value.is_smi() {
            return Value::WRONG_ARGUMENT_TYPE;
        }
        unsafe { value.smi_value() }
    }};
}

macro_rules! require_double {
    ($args:expr, $index:expr) => {{
        let value = unsafe { $args.get($index) };
        if !value.is_heap_object()
            || unsafe { value.as_ref::<HeapObject>().layout() } != Layout::Double
        {
            return Value::WRONG_ARGUMENT_TYPE;
        }
        unsafe { value.as_ref::<Double>().value() }
    }};
}

macro_rules! require_array {
    ($args:expr, $index:expr) => {{
        let value = unsafe { $args.get($index) };
        if !value.is_heap_object()
            || unsafe { value.as_ref::<HeapObject>().layout() } != Layout::Array
        {
            return Value::WRONG_ARGUMENT_TYPE;
        }
        value
    }};
}

// ── Smi arithmetic ─────────────────────────────────────────────────

fn native_smi_add(process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    // Two Smis always fit an i64 sum.
    process.to_integer(a + b)
}

fn native_smi_sub(process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    process.to_integer(a - b)
}

fn native_smi_mul(process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    match a.checked_mul(b) {
        Some(product) => process.to_integer(product),
        None => Value::ILLEGAL_STATE,
    }
}

fn native_smi_mod(_process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    if b == 0 {
        return Value::ILLEGAL_STATE;
    }
    Value::from_smi(a.rem_euclid(b))
}

fn native_smi_trunc_div(_process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    if b == 0 {
        return Value::ILLEGAL_STATE;
    }
    Value::from_smi(a / b)
}

fn native_smi_equal(process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    process.program().bool_object(a == b)
}

fn native_smi_less(process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    process.program().bool_object(a < b)
}

fn native_smi_less_equal(process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    process.program().bool_object(a <= b)
}

fn native_smi_greater(process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    process.program().bool_object(a > b)
}

fn native_smi_greater_equal(process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    process.program().bool_object(a >= b)
}

fn native_smi_bit_not(_process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    Value::from_smi(!a)
}

fn native_smi_bit_and(_process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    Value::from_smi(a & b)
}

fn native_smi_bit_or(_process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    Value::from_smi(a | b)
}

fn native_smi_bit_xor(_process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    Value::from_smi(a ^ b)
}

fn native_smi_bit_shr(_process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    if !(0..64).contains(&b) {
        return Value::ILLEGAL_STATE;
    }
    Value::from_smi(a >> b)
}

fn native_smi_bit_shl(process: &mut Process, args: Arguments) -> Value {
    let a = require_smi!(args, 0);
    let b = require_smi!(args, 1);
    if !(0..64).contains(&b) {
        return Value::ILLEGAL_STATE;
    }
    match a.checked_shl(b as u32) {
        Some(shifted) if (shifted >> b) == a => process.to_integer(shifted),
        _ => Value::ILLEGAL_STATE,
    }
}

// ── Double arithmetic ──────────────────────────────────────────────

fn native_double_add(process: &mut Process, args: Arguments) -> Value {
    let a = require_double!(args, 0);
    let b = require_double!(args, 1);
    process.new_double(a + b)
}

fn native_double_sub(process: &mut Process, args: Arguments) -> Value {
    let a = require_double!(args, 0);
    let b = require_double!(args, 1);
    process.new_double(a - b)
}

fn native_double_mul(process: &mut Process, args: Arguments) -> Value {
    let a = require_double!(args, 0);
    let b = require_double!(args, 1);
    process.new_double(a * b)
}

fn native_double_div(process: &mut Process, args: Arguments) -> Value {
    let a = require_double!(args, 0);
    let b = require_double!(args, 1);
    process.new_double(a / b)
}

fn native_double_less(process: &mut Process, args: Arguments) -> Value {
    let a = require_double!(args, 0);
    let b = require_double!(args, 1);
    process.program().bool_object(a < b)
}

fn native_double_equal(process: &mut Process, args: Arguments) -> Value {
    let a = require_double!(args, 0);
    let b = require_double!(args, 1);
    process.program().bool_object(a == b)
}

// ── Arrays ─────────────────────────────────────────────────────────

fn native_array_new(process: &mut Process, args: Arguments) -> Value {
    let length = require_smi!(args, 0);
    if length < 0 {
        return Value::INDEX_OUT_OF_BOUNDS;
    }
    let null = process.program().null_object();
    process.new_array(length as usize, null)
}

fn native_array_length(_process: &mut Process, args: Arguments) -> Value {
    let array = require_array!(args, 0);
    let array: &Array = unsafe { array.as_ref() };
    Value::from_smi(array.len() as i64)
}

fn native_array_index_get(_process: &mut Process, args: Arguments) -> Value {
    let array = require_array!(args, 0);
    let index = require_smi!(args, 1);
    let array: &Array = unsafe { array.as_ref() };
    if index < 0 || index as usize >= array.len() {
        return Value::INDEX_OUT_OF_BOUNDS;
    }
    unsafe { array.get(index as usize) }
}

fn native_array_index_set(_process: &mut Process, args: Arguments) -> Value {
    let array = require_array!(args, 0);
    let index = require_smi!(args, 1);
    let value = unsafe { args.get(2) };
    let array: &mut Array = unsafe { array.as_mut() };
    if index < 0 || index as usize >= array.len() {
        return Value::INDEX_OUT_OF_BOUNDS;
    }
    unsafe { array.set(index as usize, value) };
    value
}

// ── Coroutines and ports ───────────────────────────────────────────

/// Build a fresh coroutine around `entry` (any object answering `call`).
/// The new stack is seeded to look suspended inside the program's
/// coroutine-start stub, so the first `CoroutineChange` into it resumes
/// there and dispatches `call` with the handed-over argument.
fn native_coroutine_new_stack(process: &mut Process, args: Arguments) -> Value {
    let entry = unsafe { args.get(0) };

    let slots = process.settings().coroutine_stack_slots;
    let stack_value = process.new_stack(slots);
    if stack_value.is_failure() {
        return stack_value;
    }

    let start = process.program().coroutine_start();
    let start_fn: &object::Function = unsafe { start.as_ref() };
    let resume_offset = find_opcode_offset(start_fn, Opcode::CoroutineChange);
    let resume_bcp = start_fn.bytecode_address_for(resume_offset);

    let null = process.program().null_object();
    let stack: &mut Stack = unsafe { stack_value.as_mut() };
    unsafe {
        stack.set_slot(0, Value::from_raw(0)); // bottom sentinel
        stack.set_slot(1, entry);
        stack.set_slot(2, null);
        stack.set_slot(3, null);
        stack.set_slot(4, Value::from_raw(resume_bcp as u64));
    }
    stack.set_top(4);

    // A failure here reruns the whole native after the GC; the orphaned
    // stack above is unreachable and gets swept.
    process.new_coroutine(stack_value)
}

fn find_opcode_offset(function: &object::Function, wanted: Opcode) -> usize {
    let bytes = unsafe { function.bytecode() };
    let mut pos = 0;
    while pos < bytes.len() {
        let op = Opcode::try_from(bytes[pos]).expect("valid stream");
        if op == wanted {
            return pos;
        }
        pos += op.length();
    }
    panic!("{} not found in stream", wanted.mnemonic());
}

/// The `InvokeNativeYield` target: locks the port whose address the
/// argument carries (a Smi of the 8-aligned pointer shifted right by 3)
/// and hands it back so the dispatcher yields to it.
fn native_port_send(_process: &mut Process, args: Arguments) -> Value {
    let encoded = require_smi!(args, 0);
    if encoded <= 0 {
        return Value::WRONG_ARGUMENT_TYPE;
    }
    let address = (encoded as u64) << 3;
    let port = unsafe { &*(address as *const crate::port::Port) };
    port.lock();
    Value::from_raw(address)
}

/// Encode a port's address as the Smi `PortSend` expects.
pub fn encode_port_address(port: &crate::port::Port) -> Value {
    let address = port as *const crate::port::Port as u64;
    debug_assert!(address & 0b111 == 0);
    Value::from_smi((address >> 3) as i64)
}

// ── builder wiring ─────────────────────────────────────────────────

/// A method stub around one native: the native runs and returns for the
/// caller, or pushes its failure as an exception object which the stub
/// then throws.
pub fn native_method_stub(
    builder: &mut ProgramBuilder,
    selector: Selector,
    native: Native,
) -> FnId {
    let mut asm = FunctionAsm::new();
    asm.frame_size(1);
    asm.invoke_native(selector.arity() as u8 + 1, native as u8);
    asm.throw();
    asm.method_end();
    builder.add_function(selector.arity() + 1, asm, Vec::new())
}

/// A receiver-less stub for natives reached through `InvokeStatic`.
pub fn native_static_stub(builder: &mut ProgramBuilder, params: usize, native: Native) -> FnId {
    let mut asm = FunctionAsm::new();
    asm.frame_size(1);
    asm.invoke_native(params as u8, native as u8);
    asm.throw();
    asm.method_end();
    builder.add_function(params, asm, Vec::new())
}

/// Install the arithmetic and comparison builtins on the Smi and Double
/// classes, the way the core library wires its number hierarchy.
pub fn install_number_builtins(builder: &mut ProgramBuilder) {
    let smi = builder.smi_class();
    for (selector, native) in [
        (well_known::ADD, Native::SmiAdd),
        (well_known::SUB, Native::SmiSub),
        (well_known::MUL, Native::SmiMul),
        (well_known::MOD, Native::SmiMod),
        (well_known::TRUNC_DIV, Native::SmiTruncDiv),
        (well_known::EQ, Native::SmiEqual),
        (well_known::LT, Native::SmiLess),
        (well_known::LE, Native::SmiLessEqual),
        (well_known::GT, Native::SmiGreater),
        (well_known::GE, Native::SmiGreaterEqual),
        (well_known::BIT_NOT, Native::SmiBitNot),
        (well_known::BIT_AND, Native::SmiBitAnd),
        (well_known::BIT_OR, Native::SmiBitOr),
        (well_known::BIT_XOR, Native::SmiBitXor),
        (well_known::BIT_SHR, Native::SmiBitShr),
        (well_known::BIT_SHL, Native::SmiBitShl),
    ] {
        let stub = native_method_stub(builder, selector, native);
        builder.add_method(smi, selector, stub);
    }

    let double = builder.double_class();
    for (selector, native) in [
        (well_known::ADD, Native::DoubleAdd),
        (well_known::SUB, Native::DoubleSub),
        (well_known::MUL, Native::DoubleMul),
        (well_known::TRUNC_DIV, Native::DoubleDiv),
        (well_known::LT, Native::DoubleLess),
        (well_known::EQ, Native::DoubleEqual),
    ] {
        let stub = native_method_stub(builder, selector, native);
        builder.add_method(double, selector, stub);
    }
}
