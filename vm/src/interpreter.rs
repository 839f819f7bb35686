use std::ptr::NonNull;
use std::sync::Arc;

use bytecode::{Opcode, Selector};
use object::{
    Array, Boxed, Class, Coroutine, Double, HeapObject, Initializer, Instance, LargeInteger,
    Layout, Stack, Value,
};
use parking_lot::RwLock;
use tracing::{error, trace};

use crate::lookup::{Entry, LookupCache, TAG_ABSENT};
use crate::port::Port;
use crate::process::{stack_limit, Process};
use crate::program::Program;
use crate::stack_walker::{compute_catch_block, validate_stack};

/// Why the interpreter handed control back to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum InterruptKind {
    Ready = 0,
    BreakPoint,
    Terminate,
    Yield,
    TargetYield,
    Interrupt,
    UncaughtException,
}

impl InterruptKind {
    fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::BreakPoint,
            2 => Self::Terminate,
            3 => Self::Yield,
            4 => Self::TargetYield,
            5 => Self::Interrupt,
            6 => Self::UncaughtException,
            _ => panic!("bad interrupt kind {value}"),
        }
    }
}

/// An optional specialized engine consulted before the portable loop.
/// Returns a negative value to decline, or an [`InterruptKind`] as i32
/// when it ran the process to a suspension itself. Must be semantically
/// identical to the portable loop.
pub type FastEngineFn = fn(&mut Process, &mut Option<NonNull<Port>>) -> i32;

static FAST_ENGINE: RwLock<Option<FastEngineFn>> = RwLock::new(None);

pub fn set_fast_engine(engine: FastEngineFn) {
    *FAST_ENGINE.write() = Some(engine);
}

pub fn clear_fast_engine() {
    *FAST_ENGINE.write() = None;
}

/// The embedder-facing interpreter: bind a process, `run` it until one
/// of the suspension points, read the outcome.
pub struct Interpreter<'a> {
    process: &'a mut Process,
    interruption: InterruptKind,
    target: Option<NonNull<Port>>,
}

impl<'a> Interpreter<'a> {
    pub fn new(process: &'a mut Process) -> Self {
        Self {
            process,
            interruption: InterruptKind::Ready,
            target: None,
        }
    }

    pub fn interruption(&self) -> InterruptKind {
        self.interruption
    }

    /// The locked port of a `TargetYield`.
    pub fn target(&self) -> Option<NonNull<Port>> {
        self.target
    }

    pub fn run(&mut self) {
        assert_eq!(self.interruption, InterruptKind::Ready);
        self.process.restore_errno();
        let mut cache = self.process.take_lookup_cache();
        let mut target = None;

        let mut result = -1;
        if !self.process.is_debugging() {
            let fast = *FAST_ENGINE.read();
            if let Some(fast) = fast {
                result = fast(self.process, &mut target);
            }
        }
        self.interruption = if result < 0 {
            let mut engine = Engine::new(self.process, &mut cache);
            engine.interpret(&mut target)
        } else {
            InterruptKind::from_i32(result)
        };
        self.target = target;

        self.process.release_lookup_cache(cache);
        self.process.store_errno();
        debug_assert_ne!(self.interruption, InterruptKind::Ready);
    }
}

/// Re-run the wrapped allocation after a collection. Restarting the
/// current opcode is safe because no handler touches the operand stack
/// before its allocation succeeds.
macro_rules! gc_and_retry {
    ($engine:expr, $exp:expr) => {{
        let result = $exp;
        if result == Value::RETRY_AFTER_GC {
            $engine.collect_garbage();
            continue;
        }
        result
    }};
}

/// The portable dispatch loop: raw stack and bytecode pointers,
/// re-derived from the process around every operation a non-mutator
/// may observe.
struct Engine<'a> {
    process: &'a mut Process,
    program: Arc<Program>,
    cache: &'a mut LookupCache,
    sp: *mut Value,
    bcp: *const u8,
    limit: *mut Value,
    validate: bool,
}

impl<'a> Engine<'a> {
    fn new(process: &'a mut Process, cache: &'a mut LookupCache) -> Self {
        let program = process.program_arc();
        let validate = process.settings().validate_stack;
        let mut engine = Self {
            process,
            program,
            cache,
            sp: core::ptr::null_mut(),
            bcp: core::ptr::null(),
            limit: core::ptr::null_mut(),
            validate,
        };
        engine.restore_state();
        engine
    }

    // ── stack and bytecode primitives ──────────────────────────────

    #[inline(always)]
    fn read_byte(&self, offset: usize) -> u8 {
        unsafe { *self.bcp.add(offset) }
    }

    #[inline(always)]
    fn read_i32(&self, offset: usize) -> i32 {
        let mut bytes = [0u8; 4];
        unsafe { core::ptr::copy_nonoverlapping(self.bcp.add(offset), bytes.as_mut_ptr(), 4) };
        i32::from_le_bytes(bytes)
    }

    #[inline(always)]
    fn read_opcode(&self) -> Opcode {
        let byte = unsafe { *self.bcp };
        Opcode::try_from(byte)
            .unwrap_or_else(|bad| panic!("failed to interpret: bad opcode 0x{bad:02x}"))
    }

    /// The inline constant of an `*Unfold` opcode: the operand is a
    /// bcp-relative offset to a literal cell in the owning function.
    #[inline(always)]
    fn read_constant(&self) -> Value {
        let offset = self.read_i32(1) as isize;
        unsafe { *(self.bcp.offset(offset) as *const Value) }
    }

    #[inline(always)]
    fn goto(&mut self, bcp: *const u8) {
        debug_assert!(!bcp.is_null());
        self.bcp = bcp;
    }

    #[inline(always)]
    fn advance(&mut self, delta: isize) {
        self.bcp = unsafe { self.bcp.offset(delta) };
    }

    #[inline(always)]
    fn push(&mut self, value: Value) {
        unsafe {
            self.sp = self.sp.add(1);
            *self.sp = value;
        }
    }

    #[inline(always)]
    fn pop(&mut self) -> Value {
        unsafe {
            let value = *self.sp;
            self.sp = self.sp.sub(1);
            value
        }
    }

    #[inline(always)]
    fn drop_slots(&mut self, count: usize) {
        self.sp = unsafe { self.sp.sub(count) };
    }

    #[inline(always)]
    fn local(&self, n: usize) -> Value {
        unsafe { *self.sp.sub(n) }
    }

    #[inline(always)]
    fn set_local(&mut self, n: usize, value: Value) {
        unsafe { *self.sp.sub(n) = value };
    }

    #[inline(always)]
    fn local_ptr(&self, n: usize) -> *mut Value {
        unsafe { self.sp.sub(n) }
    }

    #[inline(always)]
    fn set_top(&mut self, value: Value) {
        unsafe { *self.sp = value };
    }

    #[inline(always)]
    fn has_stack_space_for(&self, slots: usize) -> bool {
        (unsafe { self.sp.add(slots) }) < self.limit
    }

    #[inline(always)]
    fn to_bool(&self, value: bool) -> Value {
        self.program.bool_object(value)
    }

    fn push_return_address(&mut self, opcode_length: usize) {
        let address = unsafe { self.bcp.add(opcode_length) };
        self.push(Value::from_raw(address as u64));
    }

    fn pop_return_address(&mut self) {
        let address = self.pop().raw() as *const u8;
        self.goto(address);
    }

    fn push_delta(&mut self, delta: i32) {
        self.push(Value::from_smi(delta as i64));
    }

    fn pop_delta(&mut self) -> i32 {
        unsafe { self.pop().smi_value() as i32 }
    }

    // ── state transfer (C8) ────────────────────────────────────────

    /// Park bcp on the stack and publish the stack top, making the
    /// frame chain walkable by the GC, the unwinder and the debugger.
    fn save_state(&mut self) {
        self.push(Value::from_raw(self.bcp as u64));
        let stack_value = self.process.stack();
        let stack: &mut Stack = unsafe { stack_value.as_mut() };
        let base = stack.slot_ptr(0) as usize;
        let top = (self.sp as usize - base) / size_of::<Value>();
        stack.set_top(top);
    }

    fn restore_state(&mut self) {
        let stack_value = self.process.stack();
        let stack: &mut Stack = unsafe { stack_value.as_mut() };
        self.limit = stack_limit(stack);
        self.sp = stack.slot_ptr(stack.top());
        self.bcp = self.pop().raw() as *const u8;
        debug_assert!(!self.bcp.is_null());
    }

    fn collect_garbage(&mut self) {
        self.save_state();
        self.process.collect_garbage();
        self.restore_state();
    }

    /// Grow the stack when `size` more slots do not fit. False means the
    /// scheduler must intervene; state is already saved.
    fn stack_overflow_check(&mut self, size: usize) -> bool {
        if self.has_stack_space_for(size) {
            return true;
        }
        self.save_state();
        if !self.process.handle_stack_overflow(size) {
            return false;
        }
        self.restore_state();
        true
    }

    // ── safepoints ─────────────────────────────────────────────────

    fn should_break(&mut self) -> bool {
        let bcp = self.bcp;
        let hit = self
            .process
            .debug_info()
            .is_some_and(|info| info.should_break(bcp));
        if hit {
            if let Some(info) = self.process.debug_info() {
                info.set_is_at_breakpoint(true);
            }
            self.save_state();
        }
        hit
    }

    fn is_at_breakpoint(&mut self) -> bool {
        self.process
            .debug_info()
            .is_some_and(|info| {
                let at = info.is_at_breakpoint();
                info.set_is_at_breakpoint(false);
                at
            })
    }

    // ── dispatch support ───────────────────────────────────────────

    fn class_of(&self, value: Value) -> Value {
        self.program.class_of(value)
    }

    fn lookup_entry(&mut self, receiver: Value, selector: Selector) -> Entry {
        let class = self.program.class_of(receiver);
        self.cache.lookup(&self.program, class, selector)
    }

    fn statics_array(&mut self) -> &mut Array {
        let ptr: *mut Array = unsafe { self.process.statics().as_mut() };
        unsafe { &mut *ptr }
    }

    fn layout_of(&self, value: Value) -> Option<Layout> {
        if value.is_heap_object() {
            Some(unsafe { value.as_ref::<HeapObject>().layout() })
        } else {
            None
        }
    }

    /// Pop the condition and take one of two bcp-relative deltas.
    fn branch(&mut self, true_offset: isize, false_offset: isize) {
        let offset = if self.pop() == self.program.true_object() {
            true_offset
        } else {
            false_offset
        };
        self.advance(offset);
    }

    /// Identity across the mixed numeric representations: NaN doubles
    /// are identical to each other, large integers compare by value,
    /// everything else by word.
    fn handle_identical(&self, left: Value, right: Value) -> Value {
        let identical = match (self.layout_of(left), self.layout_of(right)) {
            (Some(Layout::Double), Some(Layout::Double)) => {
                let l = unsafe { left.as_ref::<Double>().value() };
                let r = unsafe { right.as_ref::<Double>().value() };
                if l.is_nan() && r.is_nan() {
                    true
                } else {
                    l == r
                }
            }
            (Some(Layout::LargeInteger), Some(Layout::LargeInteger)) => {
                let l = unsafe { left.as_ref::<LargeInteger>().value() };
                let r = unsafe { right.as_ref::<LargeInteger>().value() };
                l == r
            }
            _ => left.raw() == right.raw(),
        };
        self.to_bool(identical)
    }

    /// Walk the catch tables of every live frame, unwinding dead
    /// coroutines along the caller chain. `None` means the exception is
    /// uncaught and a debug session should hear about it; without one
    /// the process takes the host down.
    fn handle_throw(&mut self, exception: Value) -> Option<(*const u8, usize)> {
        let null = self.program.null_object();
        loop {
            let stack_value = self.process.stack();
            let stack: &Stack = unsafe { stack_value.as_ref() };
            if let Some(hit) = compute_catch_block(&self.program, stack) {
                return Some(hit);
            }

            let co_value = self.process.coroutine();
            let co: &Coroutine = unsafe { co_value.as_ref() };
            let has_caller = co.caller != null && co.caller != co_value;
            if !has_caller {
                error!(target: "faden::interp", exception = ?exception, "uncaught exception");
                if self.process.is_debugging() {
                    return None;
                }
                std::process::exit(1);
            }

            let caller = co.caller;
            self.process.update_coroutine(caller);

            // The coroutine that failed to catch is done: drop its stack
            // so the memory can go, and mark it by self-linking.
            let dead: &mut Coroutine = unsafe { co_value.as_mut() };
            dead.stack = null;
            dead.caller = co_value;
            trace!(target: "faden::interp", "unwound coroutine without catch block");
        }
    }

    // ── the dispatch loop (C4) ─────────────────────────────────────

    fn interpret(&mut self, yield_target: &mut Option<NonNull<Port>>) -> InterruptKind {
        let mut skip_break_check = self.is_at_breakpoint();
        loop {
            if self.validate {
                self.save_state();
                let stack_value = self.process.stack();
                let stack: &Stack = unsafe { stack_value.as_ref() };
                validate_stack(&self.program, stack);
                self.restore_state();
            }
            if skip_break_check {
                skip_break_check = false;
            } else if self.should_break() {
                return InterruptKind::BreakPoint;
            }

            let op = self.read_opcode();
            match op {
                // ── loads ──────────────────────────────────────────
                Opcode::LoadLocal0 => {
                    let local = self.local(0);
                    self.push(local);
                    self.advance(1);
                }
                Opcode::LoadLocal1 => {
                    let local = self.local(1);
                    self.push(local);
                    self.advance(1);
                }
                Opcode::LoadLocal2 => {
                    let local = self.local(2);
                    self.push(local);
                    self.advance(1);
                }
                Opcode::LoadLocal => {
                    let local = self.local(self.read_byte(1) as usize);
                    self.push(local);
                    self.advance(2);
                }
                Opcode::LoadBoxed => {
                    let boxed = self.local(self.read_byte(1) as usize);
                    let value = unsafe { boxed.as_ref::<Boxed>() }.value;
                    self.push(value);
                    self.advance(2);
                }
                Opcode::LoadStatic => {
                    let index = self.read_i32(1) as usize;
                    let value = unsafe { self.statics_array().get(index) };
                    self.push(value);
                    self.advance(5);
                }
                Opcode::LoadStaticInit => {
                    let index = self.read_i32(1) as usize;
                    let value = unsafe { self.statics_array().get(index) };
                    if self.layout_of(value) == Some(Layout::Initializer) {
                        let function = unsafe { value.as_ref::<Initializer>() }.function;
                        let target: &object::Function = unsafe { function.as_ref() };
                        self.push_return_address(5);
                        self.goto(target.bytecode_start());
                        if !self.stack_overflow_check(0) {
                            return InterruptKind::Interrupt;
                        }
                    } else {
                        self.push(value);
                        self.advance(5);
                    }
                }
                Opcode::LoadField => {
                    let target = self.pop();
                    let instance: &Instance = unsafe { target.as_ref() };
                    let value = unsafe { instance.field(self.read_byte(1) as usize) };
                    self.push(value);
                    self.advance(2);
                }
                Opcode::LoadConst => {
                    let index = self.read_i32(1) as usize;
                    let constant = self.program.constant_at(index);
                    self.push(constant);
                    self.advance(5);
                }
                Opcode::LoadConstUnfold => {
                    let constant = self.read_constant();
                    self.push(constant);
                    self.advance(5);
                }
                Opcode::LoadLiteralNull => {
                    let null = self.program.null_object();
                    self.push(null);
                    self.advance(1);
                }
                Opcode::LoadLiteralTrue => {
                    let value = self.program.true_object();
                    self.push(value);
                    self.advance(1);
                }
                Opcode::LoadLiteralFalse => {
                    let value = self.program.false_object();
                    self.push(value);
                    self.advance(1);
                }
                Opcode::LoadLiteral0 => {
                    self.push(Value::from_smi(0));
                    self.advance(1);
                }
                Opcode::LoadLiteral1 => {
                    self.push(Value::from_smi(1));
                    self.advance(1);
                }
                Opcode::LoadLiteral => {
                    self.push(Value::from_smi(self.read_byte(1) as i64));
                    self.advance(2);
                }
                Opcode::LoadLiteralWide => {
                    self.push(Value::from_smi(self.read_i32(1) as i64));
                    self.advance(5);
                }

                // ── stores ─────────────────────────────────────────
                Opcode::StoreLocal => {
                    let value = self.local(0);
                    self.set_local(self.read_byte(1) as usize, value);
                    self.advance(2);
                }
                Opcode::StoreBoxed => {
                    let value = self.local(0);
                    let boxed = self.local(self.read_byte(1) as usize);
                    unsafe { boxed.as_mut::<Boxed>() }.value = value;
                    self.advance(2);
                }
                Opcode::StoreStatic => {
                    let index = self.read_i32(1) as usize;
                    let value = self.local(0);
                    unsafe { self.statics_array().set(index, value) };
                    self.advance(5);
                }
                Opcode::StoreField => {
                    let value = self.pop();
                    let target = self.pop();
                    let instance: &mut Instance = unsafe { target.as_mut() };
                    unsafe { instance.set_field(self.read_byte(1) as usize, value) };
                    self.push(value);
                    self.advance(2);
                }

                // ── invocations (C5) ───────────────────────────────
                op if op.is_invoke_normal() => {
                    let selector = Selector::from_raw(self.read_i32(1) as u32);
                    let receiver = self.local(selector.arity());
                    self.push_return_address(5);
                    let entry = self.lookup_entry(receiver, selector);
                    let target: &object::Function = unsafe { entry.target.as_ref() };
                    self.goto(target.bytecode_start());
                    if !self.stack_overflow_check(0) {
                        return InterruptKind::Interrupt;
                    }
                }
                op if op.is_invoke_fast() => {
                    let index = self.read_i32(1) as usize;
                    let table_value = self.program.dispatch_table();
                    let table: &Array = unsafe { table_value.as_ref() };
                    let selector =
                        Selector::from_raw(unsafe { table.get(index + 1).smi_value() } as u32);
                    let receiver = self.local(selector.arity());
                    self.push_return_address(5);

                    let class_value = self.class_of(receiver);
                    let class: &Class = unsafe { class_value.as_ref() };
                    let class_id = class.id();

                    // The terminating row's upper bound is the Smi max,
                    // so the scan always lands on a row.
                    let mut offset = 4;
                    let target = loop {
                        let lower = unsafe { table.get(index + offset).smi_value() };
                        if class_id < lower {
                            offset += 4;
                            continue;
                        }
                        let upper = unsafe { table.get(index + offset + 1).smi_value() };
                        if class_id >= upper {
                            offset += 4;
                            continue;
                        }
                        break unsafe { table.get(index + offset + 3) };
                    };

                    let target: &object::Function = unsafe { target.as_ref() };
                    self.goto(target.bytecode_start());
                    if !self.stack_overflow_check(0) {
                        return InterruptKind::Interrupt;
                    }
                }
                op if op.is_invoke_vtable() => {
                    let selector = Selector::from_raw(self.read_i32(1) as u32);
                    let offset = selector.id() as i64;
                    let receiver = self.local(selector.arity());
                    self.push_return_address(5);

                    let class_value = self.class_of(receiver);
                    let class: &Class = unsafe { class_value.as_ref() };
                    let vtable_value = self.program.vtable();
                    let vtable: &Array = unsafe { vtable_value.as_ref() };
                    let index = (class.id() + offset) as usize;
                    let mut entry_value = unsafe { vtable.get(index) };
                    let mut entry: &Array = unsafe { entry_value.as_ref() };
                    if unsafe { entry.get(0).smi_value() } != offset {
                        entry_value = unsafe { vtable.get(0) };
                        entry = unsafe { entry_value.as_ref() };
                    }
                    let entry_target_value = unsafe { entry.get(2) };
                    let target: &object::Function = unsafe { entry_target_value.as_ref() };
                    self.goto(target.bytecode_start());
                    if !self.stack_overflow_check(0) {
                        return InterruptKind::Interrupt;
                    }
                }
                Opcode::InvokeStatic | Opcode::InvokeFactory => {
                    let index = self.read_i32(1) as usize;
                    let static_method_value = self.program.static_method_at(index);
                    let target: &object::Function = unsafe { static_method_value.as_ref() };
                    self.push_return_address(5);
                    self.goto(target.bytecode_start());
                    if !self.stack_overflow_check(0) {
                        return InterruptKind::Interrupt;
                    }
                }
                Opcode::InvokeStaticUnfold | Opcode::InvokeFactoryUnfold => {
                    let function = self.read_constant();
                    let target: &object::Function = unsafe { function.as_ref() };
                    self.push_return_address(5);
                    self.goto(target.bytecode_start());
                    if !self.stack_overflow_check(0) {
                        return InterruptKind::Interrupt;
                    }
                }

                // ── natives (C7) ───────────────────────────────────
                Opcode::InvokeNative => {
                    let arity = self.read_byte(1) as usize;
                    let native = self.read_byte(2) as usize;
                    let arguments = crate::natives::Arguments(self.local_ptr(arity));
                    let result = gc_and_retry!(
                        self,
                        crate::natives::NATIVE_TABLE[native](self.process, arguments)
                    );
                    if result.is_failure() {
                        let kind = unsafe { result.failure_kind() };
                        let object = self.program.object_from_failure(kind);
                        self.push(object);
                        self.advance(3);
                    } else {
                        self.pop_return_address();
                        self.drop_slots(arity);
                        self.push(result);
                    }
                }
                Opcode::InvokeNativeYield => {
                    let arity = self.read_byte(1) as usize;
                    let native = self.read_byte(2) as usize;
                    let arguments = crate::natives::Arguments(self.local_ptr(arity));
                    let result = gc_and_retry!(
                        self,
                        crate::natives::NATIVE_TABLE[native](self.process, arguments)
                    );
                    if result.is_failure() {
                        let kind = unsafe { result.failure_kind() };
                        let object = self.program.object_from_failure(kind);
                        self.push(object);
                        self.advance(3);
                    } else {
                        self.pop_return_address();
                        self.drop_slots(arity);
                        let null = self.program.null_object();
                        self.push(null);
                        if result != null {
                            self.save_state();
                            let port = NonNull::new(result.raw() as *mut Port)
                                .expect("native yielded a null port");
                            debug_assert!(unsafe { port.as_ref() }.is_locked());
                            *yield_target = Some(port);
                            return InterruptKind::TargetYield;
                        }
                    }
                }

                // ── applicability tests ────────────────────────────
                Opcode::InvokeTest => {
                    let selector = Selector::from_raw(self.read_i32(1) as u32);
                    let receiver = self.local(0);
                    let entry = self.lookup_entry(receiver, selector);
                    let applicable = self.to_bool(entry.tag != TAG_ABSENT);
                    self.set_top(applicable);
                    self.advance(5);
                }
                Opcode::InvokeTestFast => {
                    let index = self.read_i32(1) as usize;
                    let table_value = self.program.dispatch_table();
                    let table: &Array = unsafe { table_value.as_ref() };
                    let receiver = self.local(0);
                    let class_value = self.class_of(receiver);
                    let class: &Class = unsafe { class_value.as_ref() };
                    let class_id = class.id();

                    let mut offset = 4;
                    let applicable = loop {
                        let lower = unsafe { table.get(index + offset).smi_value() };
                        if class_id < lower {
                            offset += 4;
                            continue;
                        }
                        let upper = unsafe { table.get(index + offset + 1).smi_value() };
                        if class_id >= upper {
                            offset += 4;
                            continue;
                        }
                        break upper != Value::SMI_MAX;
                    };
                    let applicable = self.to_bool(applicable);
                    self.set_top(applicable);
                    self.advance(5);
                }
                Opcode::InvokeTestVtable => {
                    let selector = Selector::from_raw(self.read_i32(1) as u32);
                    let offset = selector.id() as i64;
                    let receiver = self.local(0);
                    let class_value = self.class_of(receiver);
                    let class: &Class = unsafe { class_value.as_ref() };
                    let vtable_value = self.program.vtable();
                    let vtable: &Array = unsafe { vtable_value.as_ref() };
                    let index = (class.id() + offset) as usize;
                    let entry_value = unsafe { vtable.get(index) };
                    let entry: &Array = unsafe { entry_value.as_ref() };
                    let applicable = unsafe { entry.get(0).smi_value() } == offset;
                    let applicable = self.to_bool(applicable);
                    self.set_top(applicable);
                    self.advance(5);
                }

                // ── control (C6) ───────────────────────────────────
                Opcode::Pop => {
                    self.drop_slots(1);
                    self.advance(1);
                }
                Opcode::Return => {
                    let locals = self.read_byte(1) as usize;
                    let arguments = self.read_byte(2) as usize;
                    let result = self.local(0);
                    self.drop_slots(locals);
                    self.pop_return_address();
                    self.drop_slots(arguments);
                    self.push(result);
                }
                Opcode::BranchLong => {
                    let delta = self.read_i32(1) as isize;
                    self.advance(delta);
                }
                Opcode::BranchIfTrueLong => {
                    let delta = self.read_i32(1) as isize;
                    self.branch(delta, 5);
                }
                Opcode::BranchIfFalseLong => {
                    let delta = self.read_i32(1) as isize;
                    self.branch(5, delta);
                }
                Opcode::BranchBack => {
                    if !self.stack_overflow_check(0) {
                        return InterruptKind::Interrupt;
                    }
                    let delta = self.read_byte(1) as isize;
                    self.advance(-delta);
                }
                Opcode::BranchBackIfTrue => {
                    if !self.stack_overflow_check(0) {
                        return InterruptKind::Interrupt;
                    }
                    let delta = -(self.read_byte(1) as isize);
                    self.branch(delta, 2);
                }
                Opcode::BranchBackIfFalse => {
                    if !self.stack_overflow_check(0) {
                        return InterruptKind::Interrupt;
                    }
                    let delta = -(self.read_byte(1) as isize);
                    self.branch(2, delta);
                }
                Opcode::BranchBackLong => {
                    if !self.stack_overflow_check(0) {
                        return InterruptKind::Interrupt;
                    }
                    let delta = self.read_i32(1) as isize;
                    self.advance(-delta);
                }
                Opcode::BranchBackIfTrueLong => {
                    if !self.stack_overflow_check(0) {
                        return InterruptKind::Interrupt;
                    }
                    let delta = -(self.read_i32(1) as isize);
                    self.branch(delta, 5);
                }
                Opcode::BranchBackIfFalseLong => {
                    if !self.stack_overflow_check(0) {
                        return InterruptKind::Interrupt;
                    }
                    let delta = -(self.read_i32(1) as isize);
                    self.branch(5, delta);
                }
                Opcode::PopAndBranchLong => {
                    let pop_count = self.read_byte(1) as usize;
                    let delta = self.read_i32(2) as isize;
                    self.drop_slots(pop_count);
                    self.advance(delta);
                }
                Opcode::PopAndBranchBackLong => {
                    if !self.stack_overflow_check(0) {
                        return InterruptKind::Interrupt;
                    }
                    let pop_count = self.read_byte(1) as usize;
                    let delta = -(self.read_i32(2) as isize);
                    self.drop_slots(pop_count);
                    self.advance(delta);
                }
                Opcode::SubroutineCall => {
                    let delta = self.read_i32(1) as isize;
                    let return_delta = self.read_i32(5);
                    self.push_delta(return_delta);
                    self.advance(delta);
                }
                Opcode::SubroutineReturn => {
                    let delta = self.pop_delta() as isize;
                    self.advance(-delta);
                }
                Opcode::Throw => {
                    // The unwinder does not allocate, so holding the raw
                    // exception value across it is safe.
                    let exception = self.local(0);
                    self.save_state();
                    let Some((catch_bcp, stack_delta)) = self.handle_throw(exception) else {
                        return InterruptKind::UncaughtException;
                    };
                    self.restore_state();
                    self.goto(catch_bcp);
                    // The delta counts from the saved-bcp slot, which
                    // RestoreState already popped.
                    self.drop_slots(stack_delta - 1);
                    self.set_top(exception);
                }

                // ── allocation (C1 contract) ───────────────────────
                Opcode::Allocate | Opcode::AllocateUnfold => {
                    let class = if op == Opcode::Allocate {
                        self.program.class_at(self.read_i32(1) as usize)
                    } else {
                        self.read_constant()
                    };
                    let result = gc_and_retry!(self, self.process.new_instance(class, false));
                    let fields = unsafe { class.as_ref::<Class>() }.field_count();
                    let instance: &mut Instance = unsafe { result.as_mut() };
                    for i in (0..fields).rev() {
                        let value = self.pop();
                        unsafe { instance.set_field(i, value) };
                    }
                    self.push(result);
                    self.advance(5);
                }
                Opcode::AllocateImmutable | Opcode::AllocateImmutableUnfold => {
                    let class = if op == Opcode::AllocateImmutable {
                        self.program.class_at(self.read_i32(1) as usize)
                    } else {
                        self.read_constant()
                    };
                    let fields = unsafe { class.as_ref::<Class>() }.field_count();
                    let mut immutable = true;
                    for i in 0..fields {
                        if !self.process.is_immutable(self.local(i)) {
                            immutable = false;
                            break;
                        }
                    }
                    let result = gc_and_retry!(self, self.process.new_instance(class, immutable));
                    let instance: &mut Instance = unsafe { result.as_mut() };
                    for i in (0..fields).rev() {
                        let value = self.pop();
                        unsafe { instance.set_field(i, value) };
                    }
                    self.push(result);
                    self.advance(5);
                }
                Opcode::AllocateBoxed => {
                    let value = self.local(0);
                    let boxed = gc_and_retry!(self, self.process.new_boxed(value));
                    self.set_top(boxed);
                    self.advance(1);
                }

                // ── misc ───────────────────────────────────────────
                Opcode::Negate => {
                    let condition = self.local(0);
                    if condition == self.program.true_object() {
                        let value = self.program.false_object();
                        self.set_top(value);
                    } else if condition == self.program.false_object() {
                        let value = self.program.true_object();
                        self.set_top(value);
                    } else {
                        panic!("Negate on a non-boolean");
                    }
                    self.advance(1);
                }
                Opcode::StackOverflowCheck => {
                    let size = self.read_i32(1) as usize;
                    if !self.stack_overflow_check(size) {
                        return InterruptKind::Interrupt;
                    }
                    self.advance(5);
                }
                Opcode::Identical => {
                    let result = self.handle_identical(self.local(1), self.local(0));
                    self.drop_slots(1);
                    self.set_top(result);
                    self.advance(1);
                }
                Opcode::IdenticalNonNumeric => {
                    let identical = self.local(0).raw() == self.local(1).raw();
                    let result = self.to_bool(identical);
                    self.drop_slots(1);
                    self.set_top(result);
                    self.advance(1);
                }
                Opcode::ProcessYield => {
                    let value = self.local(0);
                    let null = self.program.null_object();
                    self.set_top(null);
                    self.advance(1);
                    self.save_state();
                    let terminated = value == self.program.true_object();
                    return if terminated {
                        InterruptKind::Terminate
                    } else {
                        InterruptKind::Yield
                    };
                }
                Opcode::CoroutineChange => {
                    let null = self.program.null_object();
                    let argument = self.local(0);
                    self.set_local(0, null);
                    let target = self.local(1);
                    self.set_local(1, null);
                    debug_assert_eq!(self.layout_of(target), Some(Layout::Coroutine));

                    // First activation records who to unwind to; going
                    // back to a coroutine that already has a caller (or
                    // to the root, whose link stays null) keeps the
                    // chain acyclic.
                    {
                        let coroutine: &mut Coroutine = unsafe { target.as_mut() };
                        if coroutine.caller == null {
                            coroutine.caller = self.process.coroutine();
                        }
                    }

                    self.save_state();
                    self.process.update_coroutine(target);
                    self.restore_state();
                    trace!(target: "faden::interp", "coroutine change");

                    self.advance(1);
                    self.drop_slots(1);
                    self.set_top(argument);
                }

                // ── noSuchMethod trampoline ────────────────────────
                Opcode::EnterNoSuchMethod => {
                    let return_address = self.local(0).raw() as *const u8;
                    let invoke = Opcode::try_from(unsafe { *return_address.sub(5) })
                        .expect("invoke opcode before return address");
                    let mut operand = [0u8; 4];
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            return_address.sub(4),
                            operand.as_mut_ptr(),
                            4,
                        )
                    };
                    let operand = i32::from_le_bytes(operand);

                    let selector_raw = if invoke.is_invoke_fast() {
                        let table_value = self.program.dispatch_table();
                        let table: &Array = unsafe { table_value.as_ref() };
                        (unsafe { table.get(operand as usize + 1).smi_value() }) as u32
                    } else {
                        // For the vtable form the id field holds the
                        // dispatch offset; the convention is preserved
                        // for compatibility with the emitting compiler.
                        operand as u32
                    };
                    let selector = Selector::from_raw(selector_raw);
                    let selector_smi = Value::from_smi(selector_raw as i64);
                    let receiver = self.local(selector.arity() + 1);

                    self.push(selector_smi);
                    self.push(receiver);
                    self.push(selector_smi);
                    self.advance(1);
                }
                Opcode::ExitNoSuchMethod => {
                    let mut result = self.pop();
                    let selector =
                        Selector::from_raw(unsafe { self.pop().smi_value() } as u32);
                    self.pop_return_address();

                    // Setters answer the assigned value even through
                    // noSuchMethod.
                    if selector.is_setter() {
                        result = self.local(0);
                    }
                    self.drop_slots(selector.arity() + 1);
                    self.push(result);
                }

                Opcode::FrameSize => {
                    self.advance(2);
                }
                Opcode::MethodEnd => {
                    panic!("cannot interpret 'method-end' bytecodes");
                }

                other => unreachable!("unhandled opcode {}", other.mnemonic()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytecode::{well_known, FunctionAsm, SelectorKind};
    use object::Instance;

    use crate::heap::HeapSettings;
    use crate::natives::{
        encode_port_address, install_number_builtins, native_static_stub, Native,
    };
    use crate::program::{FnId, Lit, ProgramBuilder};

    fn settings() -> HeapSettings {
        HeapSettings {
            chunk_size: 64 * 1024,
            initial_stack_slots: 256,
            coroutine_stack_slots: 64,
            ..Default::default()
        }
    }

    fn run_entry(
        configure: impl FnOnce(&mut ProgramBuilder) -> FnId,
        settings: HeapSettings,
    ) -> (crate::Process, InterruptKind) {
        let mut builder = ProgramBuilder::new();
        install_number_builtins(&mut builder);
        let entry = configure(&mut builder);
        builder.set_entry(entry);
        let program = Arc::new(builder.build());
        let mut process = crate::Process::spawn(program, settings, &[]);
        let kind = {
            let mut interpreter = Interpreter::new(&mut process);
            interpreter.run();
            interpreter.interruption()
        };
        (process, kind)
    }

    fn slot(process: &crate::Process, index: usize) -> Value {
        let stack: &Stack = unsafe { process.stack().as_ref() };
        unsafe { stack.slot(index) }
    }

    fn top_index(process: &crate::Process) -> usize {
        let stack: &Stack = unsafe { process.stack().as_ref() };
        stack.top()
    }

    /// The value below the saved bcp and the ProcessYield null.
    fn result_below_yield(process: &crate::Process) -> Value {
        slot(process, top_index(process) - 2)
    }

    fn yield_entry(asm: &mut FunctionAsm) {
        asm.load_literal_false();
        asm.process_yield();
        asm.method_end();
    }

    // ── scenario 1: arithmetic through InvokeAdd ───────────────────

    #[test]
    fn arithmetic_invoke_add() {
        let (process, kind) = run_entry(
            |builder| {
                let mut asm = FunctionAsm::new();
                asm.frame_size(4);
                asm.load_literal(1);
                asm.load_literal(40);
                asm.invoke(Opcode::InvokeAdd, well_known::ADD);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(41));
    }

    #[test]
    fn arithmetic_with_stack_validation() {
        let mut with_validation = settings();
        with_validation.validate_stack = true;
        let (process, kind) = run_entry(
            |builder| {
                let mut asm = FunctionAsm::new();
                asm.frame_size(4);
                asm.load_literal(20);
                asm.load_literal(22);
                asm.invoke(Opcode::InvokeAdd, well_known::ADD);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            with_validation,
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(42));
    }

    // ── scenario 2: allocation failure, GC, retry ──────────────────

    #[test]
    fn allocation_retries_after_gc() {
        let tight = HeapSettings {
            chunk_size: 8 * 1024,
            initial_stack_slots: 128,
            coroutine_stack_slots: 64,
            ..Default::default()
        };

        let mut builder = ProgramBuilder::new();
        install_number_builtins(&mut builder);
        let class = builder.add_class(None, 1);
        let mut asm = FunctionAsm::new();
        asm.frame_size(3);
        asm.load_literal(7);
        asm.allocate(class.0 as i32);
        yield_entry(&mut asm);
        let entry = builder.add_function(0, asm, Vec::new());
        builder.set_entry(entry);
        let program = Arc::new(builder.build());

        let mut process = crate::Process::spawn(program, tight, &[]);
        // Exhaust the heap with unreachable garbage so the Allocate
        // opcode fails once.
        let null = process.program().null_object();
        loop {
            let filler = process.new_array(32, null);
            if filler.is_failure() {
                break;
            }
        }
        assert_eq!(process.collections(), 0);

        let kind = {
            let mut interpreter = Interpreter::new(&mut process);
            interpreter.run();
            interpreter.interruption()
        };
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(process.collections(), 1);

        let result = result_below_yield(&process);
        let instance: &Instance = unsafe { result.as_ref() };
        assert_eq!(unsafe { instance.field(0) }, Value::from_smi(7));
    }

    // ── scenario 3: noSuchMethod through the vtable ────────────────

    fn returning_nsm_handler(builder: &mut ProgramBuilder) -> FnId {
        let mut asm = FunctionAsm::new();
        asm.frame_size(1);
        asm.load_literal(99);
        asm.return_(1, 2);
        asm.method_end();
        builder.add_function(2, asm, Vec::new())
    }

    #[test]
    fn vtable_miss_setter_returns_assigned_value() {
        let (process, kind) = run_entry(
            |builder| {
                let class = builder.add_class(None, 0);
                let handler = returning_nsm_handler(builder);
                builder.add_method(class, well_known::NO_SUCH_METHOD, handler);

                let setter = bytecode::Selector::encode(300, SelectorKind::Setter, 1);
                let vtable_setter = builder.vtable_selector(setter);

                let mut asm = FunctionAsm::new();
                asm.frame_size(4);
                asm.allocate(class.0 as i32);
                asm.load_literal(7);
                asm.invoke(Opcode::InvokeMethodVtable, vtable_setter);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        // The trampoline's handler answered 99, but setters must answer
        // the assigned value.
        assert_eq!(result_below_yield(&process), Value::from_smi(7));
    }

    #[test]
    fn vtable_miss_method_returns_handler_result() {
        let (process, kind) = run_entry(
            |builder| {
                let class = builder.add_class(None, 0);
                let handler = returning_nsm_handler(builder);
                builder.add_method(class, well_known::NO_SUCH_METHOD, handler);

                let selector = bytecode::Selector::encode(301, SelectorKind::Method, 1);
                let vtable_selector = builder.vtable_selector(selector);

                let mut asm = FunctionAsm::new();
                asm.frame_size(4);
                asm.allocate(class.0 as i32);
                asm.load_literal(7);
                asm.invoke(Opcode::InvokeMethodVtable, vtable_selector);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(99));
    }

    #[test]
    fn normal_invoke_miss_routes_to_no_such_method() {
        let (process, kind) = run_entry(
            |builder| {
                let class = builder.add_class(None, 0);
                let handler = returning_nsm_handler(builder);
                builder.add_method(class, well_known::NO_SUCH_METHOD, handler);

                let missing = bytecode::Selector::encode(302, SelectorKind::Method, 0);
                let mut asm = FunctionAsm::new();
                asm.frame_size(4);
                asm.allocate(class.0 as i32);
                asm.invoke_method(missing);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(99));
    }

    // ── scenario 4: exception unwinds across coroutines ────────────

    #[test]
    fn exception_unwinds_to_calling_coroutine() {
        let (process, kind) = run_entry(
            |builder| {
                // A callable whose body throws 13.
                let class = builder.add_class(None, 0);
                let mut call = FunctionAsm::new();
                call.frame_size(2);
                call.load_literal(13);
                call.throw();
                call.method_end();
                let call = builder.add_function(2, call, Vec::new());
                builder.add_method(class, well_known::CALL, call);

                let make_coroutine =
                    native_static_stub(builder, 1, Native::CoroutineNewStack);

                let mut asm = FunctionAsm::new();
                asm.frame_size(6);
                asm.allocate(class.0 as i32);
                asm.invoke_static(make_coroutine.0 as i32);
                asm.load_local(0); // keep the coroutine for inspection
                asm.load_literal(5);
                let change = asm.current_offset();
                asm.coroutine_change();
                let after_change = asm.current_offset();
                // Not taken: the coroutine throws instead of resuming us.
                asm.load_literal_true();
                asm.process_yield();
                let catch = asm.current_offset();
                yield_entry(&mut asm);
                asm.catch_range(change, after_change, catch, 2);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(13));

        // The coroutine that failed to catch is done: stack dropped,
        // caller self-linked.
        let coroutine_value = slot(&process, top_index(&process) - 3);
        let coroutine: &Coroutine = unsafe { coroutine_value.as_ref() };
        assert_eq!(coroutine.stack, process.program().null_object());
        assert!(coroutine.is_done());
    }

    #[test]
    fn coroutine_runs_to_termination() {
        let (_, kind) = run_entry(
            |builder| {
                // A callable that just answers its argument.
                let class = builder.add_class(None, 0);
                let mut call = FunctionAsm::new();
                call.frame_size(2);
                call.load_local(1);
                call.return_(1, 2);
                call.method_end();
                let call = builder.add_function(2, call, Vec::new());
                builder.add_method(class, well_known::CALL, call);

                let make_coroutine =
                    native_static_stub(builder, 1, Native::CoroutineNewStack);

                let mut asm = FunctionAsm::new();
                asm.frame_size(6);
                asm.allocate(class.0 as i32);
                asm.invoke_static(make_coroutine.0 as i32);
                asm.load_literal(5);
                asm.coroutine_change();
                // Never reached: the coroutine terminates the process.
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Terminate);
    }

    // ── scenario 5: stack growth on a back-branch ──────────────────

    #[test]
    fn stack_grows_on_back_branch() {
        let small = HeapSettings {
            chunk_size: 64 * 1024,
            initial_stack_slots: 64,
            coroutine_stack_slots: 64,
            ..Default::default()
        };
        let (process, kind) = run_entry(
            |builder| {
                let mut asm = FunctionAsm::new();
                asm.frame_size(60);
                let top = asm.current_offset();
                for i in 1..=50 {
                    asm.load_literal(i);
                }
                asm.load_literal_false();
                asm.branch_back_if_true(top);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            small,
        );
        assert_eq!(kind, InterruptKind::Yield);

        let stack: &Stack = unsafe { process.stack().as_ref() };
        assert!(stack.capacity() > 64, "stack did not grow");
        // Operand values survived the copy unchanged.
        for i in 1..=50 {
            assert_eq!(slot(&process, i), Value::from_smi(i as i64));
        }
    }

    // ── scenario 6: yield to a locked port ─────────────────────────

    #[test]
    fn native_yield_hands_over_locked_port() {
        let mut builder = ProgramBuilder::new();
        install_number_builtins(&mut builder);
        let cell = builder.add_static(Lit::Null);

        let mut send = FunctionAsm::new();
        send.frame_size(1);
        send.invoke_native_yield(1, Native::PortSend as u8);
        send.throw();
        send.method_end();
        let send = builder.add_function(1, send, Vec::new());

        let mut asm = FunctionAsm::new();
        asm.frame_size(3);
        asm.load_static(cell);
        asm.invoke_static(send.0 as i32);
        yield_entry(&mut asm);
        let entry = builder.add_function(0, asm, Vec::new());
        builder.set_entry(entry);
        let program = Arc::new(builder.build());

        let port = Box::new(Port::new());
        let mut process = crate::Process::spawn(program, settings(), &[]);
        process.set_static(cell as usize, encode_port_address(&port));

        let (kind, target) = {
            let mut interpreter = Interpreter::new(&mut process);
            interpreter.run();
            (interpreter.interruption(), interpreter.target())
        };
        assert_eq!(kind, InterruptKind::TargetYield);
        let target = target.expect("target port");
        assert_eq!(target.as_ptr() as *const Port, &*port as *const Port);
        assert!(port.is_locked());
        port.unlock();

        // The process state is fully saved: re-entering resumes after
        // the native call with its null result on the stack.
        let kind = {
            let mut interpreter = Interpreter::new(&mut process);
            interpreter.run();
            interpreter.interruption()
        };
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), process.program().null_object());
    }

    // ── breakpoints ────────────────────────────────────────────────

    #[test]
    fn breakpoint_suspends_then_resumes() {
        let mut builder = ProgramBuilder::new();
        install_number_builtins(&mut builder);
        let mut asm = FunctionAsm::new();
        asm.frame_size(4);
        asm.load_literal(1); // offset 2, one byte
        asm.load_literal(40); // offset 3, breakpoint here
        asm.invoke(Opcode::InvokeAdd, well_known::ADD);
        yield_entry(&mut asm);
        let entry = builder.add_function(0, asm, Vec::new());
        builder.set_entry(entry);
        let program = Arc::new(builder.build());

        let mut process = crate::Process::spawn(program, settings(), &[]);
        let entry_fn = process.program().entry();
        let mut debug_info = crate::DebugInfo::new();
        debug_info.set_breakpoint(entry_fn, 3);
        process.set_debug_info(debug_info);

        let kind = {
            let mut interpreter = Interpreter::new(&mut process);
            interpreter.run();
            interpreter.interruption()
        };
        assert_eq!(kind, InterruptKind::BreakPoint);

        let kind = {
            let mut interpreter = Interpreter::new(&mut process);
            interpreter.run();
            interpreter.interruption()
        };
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(41));
    }

    #[test]
    fn uncaught_exception_reaches_debug_session() {
        let mut builder = ProgramBuilder::new();
        install_number_builtins(&mut builder);
        let mut asm = FunctionAsm::new();
        asm.frame_size(2);
        asm.load_literal(13);
        asm.throw();
        asm.method_end();
        let entry = builder.add_function(0, asm, Vec::new());
        builder.set_entry(entry);
        let program = Arc::new(builder.build());

        let mut process = crate::Process::spawn(program, settings(), &[]);
        process.set_debug_info(crate::DebugInfo::new());
        let kind = {
            let mut interpreter = Interpreter::new(&mut process);
            interpreter.run();
            interpreter.interruption()
        };
        assert_eq!(kind, InterruptKind::UncaughtException);
    }

    // ── exceptions within one coroutine ────────────────────────────

    #[test]
    fn throw_caught_in_same_frame() {
        let (process, kind) = run_entry(
            |builder| {
                let mut asm = FunctionAsm::new();
                asm.frame_size(2);
                let start = asm.current_offset();
                asm.load_literal(13);
                asm.throw();
                let end = asm.current_offset();
                let catch = asm.current_offset();
                yield_entry(&mut asm);
                asm.catch_range(start, end, catch, 1);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(13));
    }

    #[test]
    fn throw_unwinds_callee_frame_into_caller_catch() {
        let (process, kind) = run_entry(
            |builder| {
                let mut thrower = FunctionAsm::new();
                thrower.frame_size(2);
                thrower.load_literal(21);
                thrower.throw();
                thrower.method_end();
                let thrower = builder.add_function(0, thrower, Vec::new());

                let mut asm = FunctionAsm::new();
                asm.frame_size(3);
                let start = asm.current_offset();
                asm.invoke_static(thrower.0 as i32);
                let end = asm.current_offset();
                asm.load_literal_true();
                asm.process_yield();
                let catch = asm.current_offset();
                yield_entry(&mut asm);
                asm.catch_range(start, end, catch, 1);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(21));
    }

    // ── natives surfacing failures as exceptions ───────────────────

    #[test]
    fn index_out_of_bounds_becomes_exception() {
        let (process, kind) = run_entry(
            |builder| {
                let array_new = native_static_stub(builder, 1, Native::ArrayNew);
                let array_get = native_static_stub(builder, 2, Native::ArrayIndexGet);

                let mut asm = FunctionAsm::new();
                asm.frame_size(4);
                asm.load_literal(2);
                asm.invoke_static(array_new.0 as i32);
                asm.load_literal(5); // out of bounds
                let start = asm.current_offset();
                asm.invoke_static(array_get.0 as i32);
                let end = asm.current_offset();
                asm.load_literal_true();
                asm.process_yield();
                let catch = asm.current_offset();
                yield_entry(&mut asm);
                asm.catch_range(start, end, catch, 1);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        let exception = result_below_yield(&process);
        assert_eq!(
            exception,
            process
                .program()
                .object_from_failure(object::FailureKind::IndexOutOfBounds)
        );
    }

    // ── boundaries ─────────────────────────────────────────────────

    #[test]
    fn smi_overflow_promotes_to_large_integer() {
        let (process, kind) = run_entry(
            |builder| {
                let max = builder.add_constant(Lit::Smi(Value::SMI_MAX));
                let mut asm = FunctionAsm::new();
                asm.frame_size(4);
                asm.load_const(max);
                asm.load_literal(1);
                asm.invoke(Opcode::InvokeAdd, well_known::ADD);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        let result = result_below_yield(&process);
        assert!(result.is_heap_object());
        let large: &LargeInteger = unsafe { result.as_ref() };
        assert_eq!(large.value(), Value::SMI_MAX + 1);
    }

    #[test]
    fn to_integer_boundaries() {
        let mut builder = ProgramBuilder::new();
        install_number_builtins(&mut builder);
        let mut asm = FunctionAsm::new();
        asm.frame_size(1);
        yield_entry(&mut asm);
        let entry = builder.add_function(0, asm, Vec::new());
        builder.set_entry(entry);
        let program = Arc::new(builder.build());
        let mut process = crate::Process::spawn(program, settings(), &[]);

        assert_eq!(process.to_integer(0), Value::from_smi(0));
        assert_eq!(process.to_integer(Value::SMI_MAX), Value::from_smi(Value::SMI_MAX));
        let promoted = process.to_integer(Value::SMI_MAX + 1);
        assert!(promoted.is_heap_object());
        let large: &LargeInteger = unsafe { promoted.as_ref() };
        assert_eq!(large.value(), Value::SMI_MAX + 1);
    }

    #[test]
    fn dispatch_table_catch_all_row_matches_any_class() {
        let (process, kind) = run_entry(
            |builder| {
                let implementing = builder.add_class(None, 0);
                let other = builder.add_class(None, 0);
                let handler = returning_nsm_handler(builder);
                builder.add_method(other, well_known::NO_SUCH_METHOD, handler);

                let selector = bytecode::Selector::encode(310, SelectorKind::Method, 0);
                let mut target = FunctionAsm::new();
                target.frame_size(1);
                target.load_literal(55);
                target.return_(1, 1);
                target.method_end();
                let target = builder.add_function(1, target, Vec::new());
                builder.add_method(implementing, selector, target);

                let id = implementing.0 as i64;
                let segment = builder.add_dispatch_segment(selector, &[(id, id + 1, target)]);

                let mut asm = FunctionAsm::new();
                asm.frame_size(4);
                asm.allocate(other.0 as i32);
                asm.invoke_fast(Opcode::InvokeMethodFast, segment);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        // Outside every explicit range, the terminator row routed the
        // call to noSuchMethod.
        assert_eq!(result_below_yield(&process), Value::from_smi(99));
    }

    #[test]
    fn three_dispatch_paths_resolve_same_target() {
        let (process, kind) = run_entry(
            |builder| {
                let class = builder.add_class(None, 0);
                let selector = bytecode::Selector::encode(311, SelectorKind::Method, 0);

                let mut target = FunctionAsm::new();
                target.frame_size(1);
                target.load_literal(77);
                target.return_(1, 1);
                target.method_end();
                let target = builder.add_function(1, target, Vec::new());
                builder.add_method(class, selector, target);

                let id = class.0 as i64;
                let segment = builder.add_dispatch_segment(selector, &[(id, id + 1, target)]);
                let vtable_selector = builder.vtable_selector(selector);

                let mut asm = FunctionAsm::new();
                asm.frame_size(6);
                asm.allocate(class.0 as i32);
                asm.invoke_method(selector);
                asm.allocate(class.0 as i32);
                asm.invoke_fast(Opcode::InvokeMethodFast, segment);
                asm.allocate(class.0 as i32);
                asm.invoke(Opcode::InvokeMethodVtable, vtable_selector);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        let top = top_index(&process);
        assert_eq!(slot(&process, top - 2), Value::from_smi(77));
        assert_eq!(slot(&process, top - 3), Value::from_smi(77));
        assert_eq!(slot(&process, top - 4), Value::from_smi(77));
    }

    #[test]
    fn invoke_test_variants_report_applicability() {
        let (process, kind) = run_entry(
            |builder| {
                let class = builder.add_class(None, 0);
                let other = builder.add_class(None, 0);
                let selector = bytecode::Selector::encode(312, SelectorKind::Method, 0);

                let mut target = FunctionAsm::new();
                target.frame_size(1);
                target.load_literal(1);
                target.return_(1, 1);
                target.method_end();
                let target = builder.add_function(1, target, Vec::new());
                builder.add_method(class, selector, target);

                let id = class.0 as i64;
                let segment = builder.add_dispatch_segment(selector, &[(id, id + 1, target)]);
                let vtable_selector = builder.vtable_selector(selector);

                let mut asm = FunctionAsm::new();
                asm.frame_size(8);
                asm.allocate(class.0 as i32);
                asm.invoke_test(selector);
                asm.allocate(other.0 as i32);
                asm.invoke_test(selector);
                asm.allocate(class.0 as i32);
                asm.invoke_test_fast(segment);
                asm.allocate(other.0 as i32);
                asm.invoke_test_fast(segment);
                asm.allocate(class.0 as i32);
                asm.invoke_test_vtable(vtable_selector);
                asm.allocate(other.0 as i32);
                asm.invoke_test_vtable(vtable_selector);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        let program = process.program();
        let top = top_index(&process);
        let expected = [true, false, true, false, true, false];
        for (i, &want) in expected.iter().rev().enumerate() {
            assert_eq!(
                slot(&process, top - 2 - i),
                program.bool_object(want),
                "test variant {i}"
            );
        }
    }

    // ── identity ───────────────────────────────────────────────────

    #[test]
    fn identical_treats_nan_doubles_as_equal() {
        let (process, kind) = run_entry(
            |builder| {
                let nan_a = builder.add_constant(Lit::Double(f64::NAN));
                let nan_b = builder.add_constant(Lit::Double(f64::NAN));
                let mut asm = FunctionAsm::new();
                asm.frame_size(4);
                asm.load_const(nan_a);
                asm.load_const(nan_b);
                asm.identical();
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), process.program().true_object());
    }

    #[test]
    fn identical_compares_doubles_and_large_integers_by_value() {
        let (process, kind) = run_entry(
            |builder| {
                let a = builder.add_constant(Lit::Double(1.5));
                let b = builder.add_constant(Lit::Double(1.5));
                let c = builder.add_constant(Lit::Double(2.5));
                let max = builder.add_constant(Lit::Smi(Value::SMI_MAX));
                let mut asm = FunctionAsm::new();
                asm.frame_size(8);
                // Distinct Double objects, same bits.
                asm.load_const(a);
                asm.load_const(b);
                asm.identical();
                // Different bits.
                asm.load_const(a);
                asm.load_const(c);
                asm.identical();
                // Two freshly promoted LargeIntegers with equal value.
                asm.load_const(max);
                asm.load_literal(1);
                asm.invoke(Opcode::InvokeAdd, well_known::ADD);
                asm.load_const(max);
                asm.load_literal(1);
                asm.invoke(Opcode::InvokeAdd, well_known::ADD);
                asm.identical();
                // The non-numeric form sees two distinct objects.
                asm.load_const(a);
                asm.load_const(b);
                asm.identical_non_numeric();
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        let program = process.program();
        let top = top_index(&process);
        assert_eq!(slot(&process, top - 2), program.bool_object(false));
        assert_eq!(slot(&process, top - 3), program.bool_object(true));
        assert_eq!(slot(&process, top - 4), program.bool_object(false));
        assert_eq!(slot(&process, top - 5), program.bool_object(true));
    }

    // ── statics, boxes, fields ─────────────────────────────────────

    #[test]
    fn statics_load_store_round_trip() {
        let (process, kind) = run_entry(
            |builder| {
                let cell = builder.add_static(Lit::Smi(0));
                let mut asm = FunctionAsm::new();
                asm.frame_size(3);
                asm.load_literal(7);
                asm.store_static(cell);
                asm.pop();
                asm.load_static(cell);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(7));
    }

    #[test]
    fn lazy_static_initializer_runs_once() {
        let (process, kind) = run_entry(
            |builder| {
                let cell = builder.next_static_index();
                let mut init = FunctionAsm::new();
                init.frame_size(2);
                init.load_literal(42);
                init.store_static(cell);
                init.return_(1, 0);
                init.method_end();
                let init = builder.add_function(0, init, Vec::new());
                assert_eq!(builder.add_lazy_static(init), cell);

                let mut asm = FunctionAsm::new();
                asm.frame_size(4);
                asm.load_static_init(cell);
                asm.load_static_init(cell);
                asm.invoke(Opcode::InvokeAdd, well_known::ADD);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(84));
    }

    #[test]
    fn boxed_cells_load_and_store() {
        let (process, kind) = run_entry(
            |builder| {
                let mut asm = FunctionAsm::new();
                asm.frame_size(4);
                asm.load_literal(7);
                asm.allocate_boxed();
                asm.load_literal(9);
                asm.store_boxed(1);
                asm.pop();
                asm.load_boxed(0);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(9));
    }

    #[test]
    fn field_load_and_store() {
        let (process, kind) = run_entry(
            |builder| {
                let class = builder.add_class(None, 2);
                let mut asm = FunctionAsm::new();
                asm.frame_size(6);
                asm.load_literal(1);
                asm.load_literal(2);
                asm.allocate(class.0 as i32); // p{1, 2}
                asm.load_local(0);
                asm.load_field(1); // 2
                asm.load_local(1);
                asm.load_literal(9);
                asm.store_field(0); // p.f0 = 9, pushes 9
                asm.load_local(2);
                asm.load_field(0); // 9
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        let top = top_index(&process);
        assert_eq!(slot(&process, top - 2), Value::from_smi(9));
        assert_eq!(slot(&process, top - 3), Value::from_smi(9));
        assert_eq!(slot(&process, top - 4), Value::from_smi(2));
    }

    #[test]
    fn immutable_allocation_tracks_field_immutability() {
        let (process, kind) = run_entry(
            |builder| {
                let class = builder.add_class(None, 1);
                let mut asm = FunctionAsm::new();
                asm.frame_size(6);
                asm.load_literal(5);
                asm.allocate_immutable(class.0 as i32); // immutable: smi field
                asm.load_literal(6);
                asm.allocate(class.0 as i32); // plain allocation
                asm.load_local(0);
                asm.allocate_immutable(class.0 as i32); // mutable field inside
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        let top = top_index(&process);
        assert!(process.is_immutable(slot(&process, top - 4)));
        assert!(!process.is_immutable(slot(&process, top - 3)));
        assert!(!process.is_immutable(slot(&process, top - 2)));
    }

    // ── subroutines (finally blocks) ───────────────────────────────

    #[test]
    fn subroutine_call_runs_body_and_returns() {
        let (process, kind) = run_entry(
            |builder| {
                let cell = builder.add_static(Lit::Smi(0));
                let mut asm = FunctionAsm::new();
                asm.frame_size(3);
                let sub = asm.subroutine_call();
                asm.load_static(cell); // after the body ran
                asm.load_literal_false();
                asm.process_yield();
                asm.method_end();
                asm.bind_subroutine(&sub);
                asm.load_literal(7);
                asm.store_static(cell);
                asm.pop();
                asm.subroutine_return(sub);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(7));
    }

    // ── doubles through the dispatch path ──────────────────────────

    #[test]
    fn double_arithmetic_allocates_result() {
        let (process, kind) = run_entry(
            |builder| {
                let a = builder.add_constant(Lit::Double(1.5));
                let b = builder.add_constant(Lit::Double(2.75));
                let mut asm = FunctionAsm::new();
                asm.frame_size(4);
                asm.load_const(a);
                asm.load_const(b);
                asm.invoke(Opcode::InvokeAdd, well_known::ADD);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        let result = result_below_yield(&process);
        let double: &Double = unsafe { result.as_ref() };
        assert_eq!(double.value(), 4.25);
    }

    // ── negate and fatal conditions ────────────────────────────────

    #[test]
    fn negate_flips_booleans() {
        let (process, kind) = run_entry(
            |builder| {
                let mut asm = FunctionAsm::new();
                asm.frame_size(3);
                asm.load_literal_true();
                asm.negate();
                asm.load_literal_false();
                asm.negate();
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        let program = process.program();
        let top = top_index(&process);
        assert_eq!(slot(&process, top - 2), program.true_object());
        assert_eq!(slot(&process, top - 3), program.false_object());
    }

    #[test]
    #[should_panic(expected = "Negate on a non-boolean")]
    fn negate_on_non_boolean_is_fatal() {
        run_entry(
            |builder| {
                let mut asm = FunctionAsm::new();
                asm.frame_size(2);
                asm.load_literal(3);
                asm.negate();
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
    }

    // ── process yield and the fast-engine hook ─────────────────────

    #[test]
    fn process_yield_true_terminates() {
        let (_, kind) = run_entry(
            |builder| {
                let mut asm = FunctionAsm::new();
                asm.frame_size(2);
                asm.load_literal_true();
                asm.process_yield();
                asm.method_end();
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Terminate);
    }

    #[test]
    fn fast_engine_is_consulted_and_may_decline() {
        static CONSULTED: AtomicUsize = AtomicUsize::new(0);
        fn declining_engine(_: &mut crate::Process, _: &mut Option<NonNull<Port>>) -> i32 {
            CONSULTED.fetch_add(1, Ordering::SeqCst);
            -1
        }
        set_fast_engine(declining_engine);
        let (process, kind) = run_entry(
            |builder| {
                let mut asm = FunctionAsm::new();
                asm.frame_size(4);
                asm.load_literal(2);
                asm.load_literal(3);
                asm.invoke(Opcode::InvokeMul, well_known::MUL);
                yield_entry(&mut asm);
                builder.add_function(0, asm, Vec::new())
            },
            settings(),
        );
        clear_fast_engine();
        assert!(CONSULTED.load(Ordering::SeqCst) >= 1);
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(6));
    }

    // ── save/restore round trip ────────────────────────────────────

    #[test]
    fn save_restore_is_identity() {
        let mut builder = ProgramBuilder::new();
        install_number_builtins(&mut builder);
        let mut asm = FunctionAsm::new();
        asm.frame_size(1);
        yield_entry(&mut asm);
        let entry = builder.add_function(0, asm, Vec::new());
        builder.set_entry(entry);
        let program = Arc::new(builder.build());
        let mut process = crate::Process::spawn(program, settings(), &[]);

        let mut cache = process.take_lookup_cache();
        let mut engine = Engine::new(&mut process, &mut cache);
        let (sp, bcp) = (engine.sp, engine.bcp);
        engine.save_state();
        engine.restore_state();
        assert_eq!(engine.sp, sp);
        assert_eq!(engine.bcp, bcp);

        // Leave the engine's state saved again for a clean drop.
        engine.save_state();
    }

    #[test]
    fn unfold_constant_reads_inline_literal() {
        let (process, kind) = run_entry(
            |builder| {
                let mut asm = FunctionAsm::new();
                asm.frame_size(2);
                asm.load_const_unfold(0);
                yield_entry(&mut asm);
                builder.add_function(0, asm, vec![Lit::Smi(123)])
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(123));
    }

    #[test]
    fn invoke_static_unfold_calls_through_literal() {
        let (process, kind) = run_entry(
            |builder| {
                let mut callee = FunctionAsm::new();
                callee.frame_size(1);
                callee.load_literal(64);
                callee.return_(1, 0);
                callee.method_end();
                let callee = builder.add_function(0, callee, Vec::new());

                let mut asm = FunctionAsm::new();
                asm.frame_size(3);
                asm.invoke_static_unfold(0);
                yield_entry(&mut asm);
                builder.add_function(0, asm, vec![Lit::Function(callee)])
            },
            settings(),
        );
        assert_eq!(kind, InterruptKind::Yield);
        assert_eq!(result_below_yield(&process), Value::from_smi(64));
    }
}
