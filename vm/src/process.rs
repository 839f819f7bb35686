use std::sync::Arc;

use object::{
    array_allocation_size, init_array, init_double, init_instance, init_large_integer, init_stack,
    instance_allocation_size, stack_allocation_size, Array, Boxed, Class, Coroutine, Instance,
    Layout, Stack, Value,
};
use tracing::debug;

use crate::debug::DebugInfo;
use crate::heap::{FinalizeFn, Heap, HeapSettings};
use crate::lookup::LookupCache;
use crate::program::Program;

/// Extra slots kept free below the physical stack end so handlers can
/// push a few values between overflow checks.
const STACK_HEADROOM: usize = 16;

/// One lightweight process: a heap, a chain of coroutine stacks, the
/// statics array and the caches the interpreter leases while running.
/// Single-threaded by construction; the interpreter is its only mutator.
pub struct Process {
    program: Arc<Program>,
    settings: HeapSettings,
    heap: Heap,
    stack: Value,
    coroutine: Value,
    statics: Value,
    lookup_cache: Option<Box<LookupCache>>,
    debug_info: Option<DebugInfo>,
    errno: i32,
}

impl Process {
    /// Create a process whose stack is set up to enter `program`'s entry
    /// function with `args` once handed to the interpreter.
    pub fn spawn(program: Arc<Program>, settings: HeapSettings, args: &[Value]) -> Self {
        let mut heap = Heap::new(&settings);

        let statics_template = program.statics_template();
        let statics = alloc_array_in(&mut heap, &program, statics_template)
            .expect("fresh heap fits the statics array");

        let slots = settings.initial_stack_slots;
        assert!(slots > args.len() + 2 + STACK_HEADROOM);
        let stack = alloc_stack_in(&mut heap, &program, slots).expect("fresh heap fits the stack");

        let coroutine =
            alloc_coroutine_in(&mut heap, &program, stack).expect("fresh heap fits the coroutine");

        let mut process = Self {
            program,
            settings,
            heap,
            stack,
            coroutine,
            statics,
            lookup_cache: None,
            debug_info: None,
            errno: 0,
        };

        // Seed the entry frame: arguments, the zero sentinel standing in
        // for a return address, and the saved bcp the first RestoreState
        // pops.
        let entry_value = process.program.entry();
        let entry: &object::Function = unsafe { entry_value.as_ref() };
        debug_assert_eq!(entry.arity(), args.len());
        let bcp = entry.bytecode_start();
        let stack_ref: &mut Stack = unsafe { process.stack.as_mut() };
        for (i, &arg) in args.iter().enumerate() {
            unsafe { stack_ref.set_slot(i, arg) };
        }
        unsafe {
            stack_ref.set_slot(args.len(), Value::from_raw(0));
            stack_ref.set_slot(args.len() + 1, Value::from_raw(bcp as u64));
        }
        stack_ref.set_top(args.len() + 1);

        process
    }

    #[inline(always)]
    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn program_arc(&self) -> Arc<Program> {
        Arc::clone(&self.program)
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline(always)]
    pub fn stack(&self) -> Value {
        self.stack
    }

    #[inline(always)]
    pub fn coroutine(&self) -> Value {
        self.coroutine
    }

    #[inline(always)]
    pub fn statics(&self) -> Value {
        self.statics
    }

    /// Overwrite a static cell from the host side.
    pub fn set_static(&mut self, index: usize, value: Value) {
        let statics: &mut Array = unsafe { self.statics.as_mut() };
        unsafe { statics.set(index, value) };
    }

    pub fn collections(&self) -> u64 {
        self.heap.collections()
    }

    // ── allocation (all may fail with retry_after_gc) ──────────────

    pub fn new_instance(&mut self, class: Value, immutable: bool) -> Value {
        let class_ref: &Class = unsafe { class.as_ref() };
        let size = instance_allocation_size(class_ref.field_count());
        let Some(ptr) = self.heap.allocate(size) else {
            return Value::RETRY_AFTER_GC;
        };
        let null = self.program.null_object();
        unsafe { init_instance(ptr as *mut Instance, class, class_ref.field_count(), null) };
        let value = Value::from_ptr(ptr);
        if immutable {
            self.heap.mark_immutable(value);
        }
        value
    }

    pub fn new_boxed(&mut self, contents: Value) -> Value {
        let Some(ptr) = self.heap.allocate(size_of::<Boxed>()) else {
            return Value::RETRY_AFTER_GC;
        };
        unsafe {
            (ptr as *mut Boxed).write(Boxed {
                class: self.program.boxed_class(),
                value: contents,
            });
        }
        Value::from_ptr(ptr)
    }

    pub fn new_double(&mut self, value: f64) -> Value {
        let Some(ptr) = self.heap.allocate(size_of::<object::Double>()) else {
            return Value::RETRY_AFTER_GC;
        };
        unsafe { init_double(ptr as *mut object::Double, self.program.double_class(), value) };
        Value::from_ptr(ptr)
    }

    pub fn new_large_integer(&mut self, value: i64) -> Value {
        let Some(ptr) = self.heap.allocate(size_of::<object::LargeInteger>()) else {
            return Value::RETRY_AFTER_GC;
        };
        unsafe {
            init_large_integer(
                ptr as *mut object::LargeInteger,
                self.program.large_integer_class(),
                value,
            )
        };
        Value::from_ptr(ptr)
    }

    /// Box `value` as a Smi when representable, as a LargeInteger
    /// otherwise.
    pub fn to_integer(&mut self, value: i64) -> Value {
        if Value::fits_smi(value) {
            Value::from_smi(value)
        } else {
            self.new_large_integer(value)
        }
    }

    pub fn new_array(&mut self, length: usize, fill: Value) -> Value {
        let Some(ptr) = self.heap.allocate(array_allocation_size(length)) else {
            return Value::RETRY_AFTER_GC;
        };
        unsafe { init_array(ptr as *mut Array, self.program.array_class(), length, fill) };
        Value::from_ptr(ptr)
    }

    pub fn new_stack(&mut self, slots: usize) -> Value {
        match alloc_stack_in(&mut self.heap, &self.program, slots) {
            Some(value) => value,
            None => Value::RETRY_AFTER_GC,
        }
    }

    pub fn new_coroutine(&mut self, stack: Value) -> Value {
        match alloc_coroutine_in(&mut self.heap, &self.program, stack) {
            Some(value) => value,
            None => Value::RETRY_AFTER_GC,
        }
    }

    // ── GC, stack growth, coroutines ───────────────────────────────

    /// Collect the heap. The interpreter state must be saved so the
    /// stack's live region is bounded by its `top`.
    pub fn collect_garbage(&mut self) {
        let roots = [self.stack, self.coroutine, self.statics];
        self.heap.collect(&roots);
    }

    /// Grow the value stack so at least `extra` more slots fit, copying
    /// the live slots into a fresh Stack object. Returns false when the
    /// heap refuses to grow; the scheduler then sees `Interrupt`.
    pub fn handle_stack_overflow(&mut self, extra: usize) -> bool {
        let old_stack: &Stack = unsafe { self.stack.as_ref() };
        let old_capacity = old_stack.capacity();
        let new_capacity = (old_capacity * 2).max(old_capacity + extra + STACK_HEADROOM * 2);

        let mut new_value = self.new_stack(new_capacity);
        if new_value == Value::RETRY_AFTER_GC {
            self.collect_garbage();
            new_value = self.new_stack(new_capacity);
        }
        if new_value == Value::RETRY_AFTER_GC {
            return false;
        }

        let old_stack: &Stack = unsafe { self.stack.as_ref() };
        let new_stack: &mut Stack = unsafe { new_value.as_mut() };
        let top = old_stack.top();
        for i in 0..=top {
            unsafe { new_stack.set_slot(i, old_stack.slot(i)) };
        }
        new_stack.set_top(top);

        debug!(
            target: "faden::stack",
            old = old_capacity,
            new = new_capacity,
            "stack grown"
        );

        let coroutine: &mut Coroutine = unsafe { self.coroutine.as_mut() };
        coroutine.stack = new_value;
        self.stack = new_value;
        true
    }

    /// Switch the active coroutine: park the current stack in the
    /// outgoing coroutine and adopt the target's.
    pub fn update_coroutine(&mut self, target: Value) {
        debug_assert!(unsafe { target.as_ref::<object::HeapObject>().layout() } == Layout::Coroutine);
        let outgoing: &mut Coroutine = unsafe { self.coroutine.as_mut() };
        outgoing.stack = self.stack;
        let incoming: &Coroutine = unsafe { target.as_ref() };
        debug_assert!(incoming.stack.is_heap_object());
        self.stack = incoming.stack;
        self.coroutine = target;
    }

    // ── leased caches, debugging, errno ────────────────────────────

    pub fn take_lookup_cache(&mut self) -> Box<LookupCache> {
        self.lookup_cache
            .take()
            .unwrap_or_else(|| Box::new(LookupCache::new()))
    }

    pub fn release_lookup_cache(&mut self, cache: Box<LookupCache>) {
        self.lookup_cache = Some(cache);
    }

    pub fn is_debugging(&self) -> bool {
        self.debug_info.is_some()
    }

    pub fn debug_info(&mut self) -> Option<&mut DebugInfo> {
        self.debug_info.as_mut()
    }

    pub fn set_debug_info(&mut self, debug_info: DebugInfo) {
        self.debug_info = Some(debug_info);
    }

    /// Mirror the host errno into the process so it survives a
    /// reschedule onto another host thread.
    pub fn store_errno(&mut self) {
        self.errno = unsafe { *errno_location() };
    }

    pub fn restore_errno(&mut self) {
        unsafe { *errno_location() = self.errno };
    }

    // ── object services ────────────────────────────────────────────

    pub fn register_finalizer(&mut self, value: Value, finalize: FinalizeFn) {
        self.heap.register_finalizer(value, finalize);
    }

    /// Deep immutability as the allocator tracks it: numbers, strings
    /// and the singletons are immutable; instances only when allocated
    /// immutable.
    pub fn is_immutable(&self, value: Value) -> bool {
        if value.is_smi() {
            return true;
        }
        if !value.is_heap_object() {
            return false;
        }
        let program = &self.program;
        if value == program.null_object()
            || value == program.true_object()
            || value == program.false_object()
        {
            return true;
        }
        match unsafe { value.as_ref::<object::HeapObject>().layout() } {
            Layout::Double | Layout::LargeInteger | Layout::Str => true,
            Layout::Instance => self.heap.is_immutable(value),
            _ => false,
        }
    }
}

#[cfg(target_os = "macos")]
unsafe fn errno_location() -> *mut i32 {
    libc::__error()
}

#[cfg(not(target_os = "macos"))]
unsafe fn errno_location() -> *mut i32 {
    libc::__errno_location()
}

fn alloc_array_in(heap: &mut Heap, program: &Program, values: &[Value]) -> Option<Value> {
    let ptr = heap.allocate(array_allocation_size(values.len()))?;
    unsafe {
        init_array(
            ptr as *mut Array,
            program.array_class(),
            values.len(),
            Value::from_smi(0),
        );
        let array = &mut *(ptr as *mut Array);
        for (i, &value) in values.iter().enumerate() {
            array.set(i, value);
        }
    }
    Some(Value::from_ptr(ptr))
}

fn alloc_stack_in(heap: &mut Heap, program: &Program, slots: usize) -> Option<Value> {
    let ptr = heap.allocate(stack_allocation_size(slots))?;
    unsafe { init_stack(ptr as *mut Stack, program.stack_class(), slots) };
    Some(Value::from_ptr(ptr))
}

fn alloc_coroutine_in(heap: &mut Heap, program: &Program, stack: Value) -> Option<Value> {
    let ptr = heap.allocate(size_of::<Coroutine>())?;
    unsafe {
        (ptr as *mut Coroutine).write(Coroutine {
            class: program.coroutine_class(),
            stack,
            caller: program.null_object(),
        });
    }
    Some(Value::from_ptr(ptr))
}

/// The slot-pointer limit push-heavy handlers check against: the stack
/// end minus headroom.
pub fn stack_limit(stack: &Stack) -> *mut Value {
    let end = stack.slot_ptr(0);
    unsafe { end.add(stack.capacity() - STACK_HEADROOM) }
}
