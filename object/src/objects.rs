use crate::Value;

/// Layout discriminant stored (as a Smi) on every [`Class`].
///
/// The first word of every heap object is its class reference; the class
/// carries the layout so the collector and debug printers can walk any
/// object without per-object type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Layout {
    Instance = 0,
    Array,
    Boxed,
    Function,
    Class,
    Initializer,
    Double,
    LargeInteger,
    Str,
    Coroutine,
    Stack,
}

impl Layout {
    pub const COUNT: usize = Self::Stack as usize + 1;

    /// # Safety
    ///
    /// `raw` must be a valid layout value (`< Layout::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(raw: u8) -> Self {
        debug_assert!((raw as usize) < Self::COUNT);
        core::mem::transmute::<u8, Layout>(raw)
    }
}

/// Common prefix of every heap object: the class reference.
#[repr(C)]
pub struct HeapObject {
    pub class: Value,
}

const _: () = assert!(size_of::<HeapObject>() == 8);

impl HeapObject {
    /// The layout of this object, read through its class.
    ///
    /// # Safety
    ///
    /// `class` must reference a valid, live [`Class`].
    #[inline(always)]
    pub unsafe fn layout(&self) -> Layout {
        let class: &Class = self.class.as_ref();
        class.layout()
    }
}

// ── Instance ───────────────────────────────────────────────────────

/// A plain object: class reference followed by the class's field count
/// worth of inline value slots.
///
/// ```text
/// [class 8B] [field_0 8B] [field_1 8B] ...
/// ```
#[repr(C)]
pub struct Instance {
    pub class: Value,
}

const _: () = assert!(size_of::<Instance>() == 8);

impl Instance {
    #[inline(always)]
    fn fields_ptr(&self) -> *mut Value {
        unsafe { (self as *const Instance).add(1) as *mut Value }
    }

    /// # Safety
    ///
    /// `index` must be below the class's field count.
    #[inline(always)]
    pub unsafe fn field(&self, index: usize) -> Value {
        *self.fields_ptr().add(index)
    }

    /// # Safety
    ///
    /// `index` must be below the class's field count.
    #[inline(always)]
    pub unsafe fn set_field(&mut self, index: usize, value: Value) {
        *self.fields_ptr().add(index) = value;
    }
}

pub const fn instance_allocation_size(field_count: usize) -> usize {
    size_of::<Instance>() + field_count * size_of::<Value>()
}

/// # Safety
///
/// `ptr` must point to at least `instance_allocation_size(field_count)`
/// bytes of writable memory.
pub unsafe fn init_instance(ptr: *mut Instance, class: Value, field_count: usize, fill: Value) {
    ptr.write(Instance { class });
    let fields = ptr.add(1) as *mut Value;
    for i in 0..field_count {
        *fields.add(i) = fill;
    }
}

// ── Array ──────────────────────────────────────────────────────────

/// A fixed-length array of tagged values.
///
/// ```text
/// [class 8B] [length: Smi 8B] [elem_0 8B] ...
/// ```
#[repr(C)]
pub struct Array {
    pub class: Value,
    length: Value,
}

const _: () = assert!(size_of::<Array>() == 16);

impl Array {
    #[inline(always)]
    pub fn len(&self) -> usize {
        unsafe { self.length.smi_value() as usize }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    fn elements_ptr(&self) -> *mut Value {
        unsafe { (self as *const Array).add(1) as *mut Value }
    }

    /// # Safety
    ///
    /// `index < len()` and the inline memory must be valid.
    #[inline(always)]
    pub unsafe fn get(&self, index: usize) -> Value {
        debug_assert!(index < self.len());
        *self.elements_ptr().add(index)
    }

    /// # Safety
    ///
    /// `index < len()` and the inline memory must be valid.
    #[inline(always)]
    pub unsafe fn set(&mut self, index: usize, value: Value) {
        debug_assert!(index < self.len());
        *self.elements_ptr().add(index) = value;
    }

    /// # Safety
    ///
    /// The inline memory must contain `len()` valid elements.
    #[inline(always)]
    pub unsafe fn elements(&self) -> &[Value] {
        core::slice::from_raw_parts(self.elements_ptr(), self.len())
    }
}

pub const fn array_allocation_size(length: usize) -> usize {
    size_of::<Array>() + length * size_of::<Value>()
}

/// # Safety
///
/// `ptr` must point to at least `array_allocation_size(length)` bytes of
/// writable memory.
pub unsafe fn init_array(ptr: *mut Array, class: Value, length: usize, fill: Value) {
    ptr.write(Array {
        class,
        length: Value::from_smi(length as i64),
    });
    let elems = ptr.add(1) as *mut Value;
    for i in 0..length {
        *elems.add(i) = fill;
    }
}

// ── Boxed ──────────────────────────────────────────────────────────

/// A single mutable heap cell, used for captured variables.
#[repr(C)]
pub struct Boxed {
    pub class: Value,
    pub value: Value,
}

const _: () = assert!(size_of::<Boxed>() == 16);

// ── Function ───────────────────────────────────────────────────────

/// An exception-handler range in a function's catch table.
///
/// Offsets are byte offsets into the bytecode stream; `height` is the
/// number of live frame slots (locals plus operands, including the
/// pushed exception) at `target`. All four are stored as Smis.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CatchEntry {
    pub start: Value,
    pub end: Value,
    pub target: Value,
    pub height: Value,
}

const _: () = assert!(size_of::<CatchEntry>() == 32);

/// A compiled function: metadata followed inline by the bytecode stream
/// (padded to 8 bytes), the literal values referenced by `*Unfold`
/// opcodes, and the catch table.
///
/// ```text
/// [class 8B] [arity: Smi] [bytecode size: Smi] [literal count: Smi]
/// [catch count: Smi] [bytecode ... pad8] [literal values ...] [catch entries ...]
/// ```
#[repr(C)]
pub struct Function {
    pub class: Value,
    arity: Value,
    bytecode_size: Value,
    literal_count: Value,
    catch_count: Value,
}

const _: () = assert!(size_of::<Function>() == 40);

impl Function {
    #[inline(always)]
    pub fn arity(&self) -> usize {
        unsafe { self.arity.smi_value() as usize }
    }

    #[inline(always)]
    pub fn bytecode_size(&self) -> usize {
        unsafe { self.bytecode_size.smi_value() as usize }
    }

    #[inline(always)]
    pub fn literal_count(&self) -> usize {
        unsafe { self.literal_count.smi_value() as usize }
    }

    #[inline(always)]
    pub fn catch_count(&self) -> usize {
        unsafe { self.catch_count.smi_value() as usize }
    }

    /// Address of the first bytecode.
    #[inline(always)]
    pub fn bytecode_start(&self) -> *const u8 {
        unsafe { (self as *const Function).add(1) as *const u8 }
    }

    /// Absolute bytecode address for a byte `offset` into the stream.
    #[inline(always)]
    pub fn bytecode_address_for(&self, offset: usize) -> *const u8 {
        debug_assert!(offset < self.bytecode_size());
        unsafe { self.bytecode_start().add(offset) }
    }

    /// # Safety
    ///
    /// The inline memory must contain the full bytecode stream.
    #[inline(always)]
    pub unsafe fn bytecode(&self) -> &[u8] {
        core::slice::from_raw_parts(self.bytecode_start(), self.bytecode_size())
    }

    #[inline(always)]
    fn literals_ptr(&self) -> *mut Value {
        let off = size_of::<Function>() + pad8(self.bytecode_size());
        unsafe { (self as *const Function as *const u8).add(off) as *mut Value }
    }

    /// # Safety
    ///
    /// The inline memory must contain `literal_count()` valid values.
    #[inline(always)]
    pub unsafe fn literals(&self) -> &[Value] {
        core::slice::from_raw_parts(self.literals_ptr(), self.literal_count())
    }

    /// # Safety
    ///
    /// `index < literal_count()` and the inline memory must be valid.
    #[inline(always)]
    pub unsafe fn set_literal(&mut self, index: usize, value: Value) {
        debug_assert!(index < self.literal_count());
        *self.literals_ptr().add(index) = value;
    }

    /// Address of literal `index`, used to patch bcp-relative operands.
    #[inline(always)]
    pub fn literal_address(&self, index: usize) -> *const Value {
        debug_assert!(index < self.literal_count());
        unsafe { self.literals_ptr().add(index) as *const Value }
    }

    /// # Safety
    ///
    /// The inline memory must contain `catch_count()` valid entries.
    #[inline(always)]
    pub unsafe fn catch_entries(&self) -> &[CatchEntry] {
        let ptr = self.literals_ptr().add(self.literal_count()) as *const CatchEntry;
        core::slice::from_raw_parts(ptr, self.catch_count())
    }

    /// # Safety
    ///
    /// `index < catch_count()` and the inline memory must be valid.
    #[inline(always)]
    pub unsafe fn set_catch_entry(&mut self, index: usize, entry: CatchEntry) {
        debug_assert!(index < self.catch_count());
        let ptr = self.literals_ptr().add(self.literal_count()) as *mut CatchEntry;
        *ptr.add(index) = entry;
    }
}

const fn pad8(n: usize) -> usize {
    (n + 7) & !7
}

pub const fn function_allocation_size(
    bytecode_size: usize,
    literal_count: usize,
    catch_count: usize,
) -> usize {
    size_of::<Function>()
        + pad8(bytecode_size)
        + literal_count * size_of::<Value>()
        + catch_count * size_of::<CatchEntry>()
}

/// # Safety
///
/// `ptr` must point to at least
/// `function_allocation_size(bytecode.len(), literal_count, catch_count)`
/// bytes of writable memory. Literals and catch entries are left
/// uninitialized; the caller must fill them before the function becomes
/// reachable.
pub unsafe fn init_function(
    ptr: *mut Function,
    class: Value,
    arity: usize,
    bytecode: &[u8],
    literal_count: usize,
    catch_count: usize,
) {
    ptr.write(Function {
        class,
        arity: Value::from_smi(arity as i64),
        bytecode_size: Value::from_smi(bytecode.len() as i64),
        literal_count: Value::from_smi(literal_count as i64),
        catch_count: Value::from_smi(catch_count as i64),
    });
    let dst = ptr.add(1) as *mut u8;
    core::ptr::copy_nonoverlapping(bytecode.as_ptr(), dst, bytecode.len());
    // Zero the padding so the stream has deterministic content.
    for i in bytecode.len()..pad8(bytecode.len()) {
        *dst.add(i) = 0;
    }
}

// ── Class ──────────────────────────────────────────────────────────

/// A class: identity, superclass link, instance shape and method table.
///
/// ```text
/// [class 8B] [id: Smi] [superclass] [field count: Smi] [layout: Smi]
/// [methods: Array of [selector, function] pairs]
/// ```
#[repr(C)]
pub struct Class {
    pub class: Value,
    id: Value,
    pub superclass: Value,
    field_count: Value,
    layout: Value,
    pub methods: Value,
}

const _: () = assert!(size_of::<Class>() == 48);

impl Class {
    #[inline(always)]
    pub fn id(&self) -> i64 {
        unsafe { self.id.smi_value() }
    }

    #[inline(always)]
    pub fn field_count(&self) -> usize {
        unsafe { self.field_count.smi_value() as usize }
    }

    #[inline(always)]
    pub fn layout(&self) -> Layout {
        unsafe { Layout::from_u8_unchecked(self.layout.smi_value() as u8) }
    }

    #[inline(always)]
    pub fn has_superclass(&self) -> bool {
        self.superclass.is_heap_object()
    }
}

/// # Safety
///
/// `ptr` must point to at least `size_of::<Class>()` bytes of writable
/// memory.
pub unsafe fn init_class(
    ptr: *mut Class,
    meta: Value,
    id: i64,
    superclass: Value,
    field_count: usize,
    layout: Layout,
    methods: Value,
) {
    ptr.write(Class {
        class: meta,
        id: Value::from_smi(id),
        superclass,
        field_count: Value::from_smi(field_count as i64),
        layout: Value::from_smi(layout as i64),
        methods,
    });
}

// ── Initializer ────────────────────────────────────────────────────

/// Wraps the function that computes a lazy static; consumed by
/// `LoadStaticInit`.
#[repr(C)]
pub struct Initializer {
    pub class: Value,
    pub function: Value,
}

const _: () = assert!(size_of::<Initializer>() == 16);

// ── Numbers and strings ────────────────────────────────────────────

#[repr(C)]
pub struct Double {
    pub class: Value,
    value: f64,
}

const _: () = assert!(size_of::<Double>() == 16);

impl Double {
    #[inline(always)]
    pub fn value(&self) -> f64 {
        self.value
    }
}

/// # Safety
///
/// `ptr` must point to at least `size_of::<Double>()` writable bytes.
pub unsafe fn init_double(ptr: *mut Double, class: Value, value: f64) {
    ptr.write(Double { class, value });
}

/// A signed 64-bit integer that does not fit in a Smi.
#[repr(C)]
pub struct LargeInteger {
    pub class: Value,
    value: i64,
}

const _: () = assert!(size_of::<LargeInteger>() == 16);

impl LargeInteger {
    #[inline(always)]
    pub fn value(&self) -> i64 {
        self.value
    }
}

/// # Safety
///
/// `ptr` must point to at least `size_of::<LargeInteger>()` writable bytes.
pub unsafe fn init_large_integer(ptr: *mut LargeInteger, class: Value, value: i64) {
    ptr.write(LargeInteger { class, value });
}

/// A heap string: class + byte length (Smi) + UTF-8 bytes inline.
#[repr(C)]
pub struct Str {
    pub class: Value,
    length: Value,
}

const _: () = assert!(size_of::<Str>() == 16);

impl Str {
    #[inline(always)]
    pub fn len(&self) -> usize {
        unsafe { self.length.smi_value() as usize }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    ///
    /// The inline memory must contain `len()` valid UTF-8 bytes.
    #[inline(always)]
    pub unsafe fn as_str(&self) -> &str {
        let ptr = (self as *const Str).add(1) as *const u8;
        core::str::from_utf8_unchecked(core::slice::from_raw_parts(ptr, self.len()))
    }
}

pub const fn str_allocation_size(byte_len: usize) -> usize {
    size_of::<Str>() + pad8(byte_len)
}

/// # Safety
///
/// `ptr` must point to at least `str_allocation_size(bytes.len())`
/// writable bytes.
pub unsafe fn init_str(ptr: *mut Str, class: Value, bytes: &[u8]) {
    ptr.write(Str {
        class,
        length: Value::from_smi(bytes.len() as i64),
    });
    let dst = ptr.add(1) as *mut u8;
    core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
    for i in bytes.len()..pad8(bytes.len()) {
        *dst.add(i) = 0;
    }
}

// ── Coroutine ──────────────────────────────────────────────────────

/// A first-class execution stack with a caller link.
///
/// A terminated coroutine has its `stack` cleared to the null object and
/// its `caller` pointing at itself.
#[repr(C)]
pub struct Coroutine {
    pub class: Value,
    pub stack: Value,
    pub caller: Value,
}

const _: () = assert!(size_of::<Coroutine>() == 24);

impl Coroutine {
    /// A terminated coroutine points its caller link at itself.
    #[inline(always)]
    pub fn is_done(&self) -> bool {
        self.caller.raw() == Value::from_ptr(self).raw()
    }
}

// ── Stack ──────────────────────────────────────────────────────────

/// The value stack of one coroutine.
///
/// ```text
/// [class 8B] [capacity: Smi] [top: Smi] [slot_0 8B] ... [slot_cap-1 8B]
/// ```
///
/// `top` is the slot index of the last pushed value; slots above it are
/// dead. Replaced wholesale when the stack grows.
#[repr(C)]
pub struct Stack {
    pub class: Value,
    capacity: Value,
    top: Value,
}

const _: () = assert!(size_of::<Stack>() == 24);

impl Stack {
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        unsafe { self.capacity.smi_value() as usize }
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        unsafe { self.top.smi_value() as usize }
    }

    #[inline(always)]
    pub fn set_top(&mut self, top: usize) {
        debug_assert!(top < self.capacity());
        self.top = Value::from_smi(top as i64);
    }

    /// Pointer to slot `index`.
    #[inline(always)]
    pub fn slot_ptr(&self, index: usize) -> *mut Value {
        debug_assert!(index < self.capacity());
        unsafe { ((self as *const Stack).add(1) as *mut Value).add(index) }
    }

    /// # Safety
    ///
    /// `index` must be a live slot (`<= top()`).
    #[inline(always)]
    pub unsafe fn slot(&self, index: usize) -> Value {
        *self.slot_ptr(index)
    }

    /// # Safety
    ///
    /// `index < capacity()`.
    #[inline(always)]
    pub unsafe fn set_slot(&mut self, index: usize, value: Value) {
        *self.slot_ptr(index) = value;
    }
}

pub const fn stack_allocation_size(capacity: usize) -> usize {
    size_of::<Stack>() + capacity * size_of::<Value>()
}

/// # Safety
///
/// `ptr` must point to at least `stack_allocation_size(capacity)` bytes of
/// writable memory.
pub unsafe fn init_stack(ptr: *mut Stack, class: Value, capacity: usize) {
    ptr.write(Stack {
        class,
        capacity: Value::from_smi(capacity as i64),
        top: Value::from_smi(0),
    });
}
