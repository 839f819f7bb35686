use std::collections::HashMap;

use bytecode::{well_known, FunctionAsm, Selector};
use object::{
    array_allocation_size, function_allocation_size, init_array, init_class, init_double,
    init_function, init_instance, init_str, instance_allocation_size, str_allocation_size, Array,
    CatchEntry, Class, FailureKind, Function, Initializer, Instance, Layout, Value,
};

use crate::heap::ProgramSpace;

/// Handle to a class registered with a [`ProgramBuilder`]. The wrapped
/// index doubles as the class id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassId(pub usize);

/// Handle to a function registered with a [`ProgramBuilder`]. The
/// wrapped index doubles as the static-method index used by
/// `InvokeStatic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FnId(pub usize);

/// A literal value resolvable at program-build time; used for function
/// literal areas, the constant pool and static cells.
#[derive(Debug, Clone)]
pub enum Lit {
    Null,
    True,
    False,
    Smi(i64),
    Double(f64),
    Str(String),
    Function(FnId),
    Class(ClassId),
}

struct ClassSpec {
    superclass: Option<ClassId>,
    field_count: usize,
    layout: Layout,
    methods: Vec<(Selector, FnId)>,
}

struct FnSpec {
    arity: usize,
    asm: FunctionAsm,
    literals: Vec<Lit>,
}

enum StaticSpec {
    Eager(Lit),
    Lazy(FnId),
}

struct DispatchSegment {
    index: usize,
    selector: Selector,
    rows: Vec<(i64, i64, FnId)>,
}

/// Room reserved per vtable selector; class ids must stay below it so
/// `class_id + offset` never collides across selectors.
const VTABLE_CLASS_SPAN: usize = 256;

/// The read-only program a process executes: classes, functions,
/// constants, dispatch tables and the special objects. Built once by a
/// [`ProgramBuilder`] (standing in for the snapshot loader) and shared
/// across processes.
pub struct Program {
    // Keeps every program object alive; never collected.
    #[allow(dead_code)]
    space: ProgramSpace,

    null_object: Value,
    true_object: Value,
    false_object: Value,

    classes: Vec<Value>,
    functions: Vec<Value>,
    constants: Vec<Value>,
    statics_template: Vec<Value>,

    dispatch_table: Value,
    vtable: Value,

    nsm_trampoline: Value,
    coroutine_start: Value,
    entry: Value,

    failure_objects: [Value; FailureKind::COUNT],
    vtable_offsets: HashMap<u32, usize>,

    smi_class: Value,
    double_class: Value,
    large_integer_class: Value,
    str_class: Value,
    boxed_class: Value,
    array_class: Value,
    initializer_class: Value,
    coroutine_class: Value,
    stack_class: Value,
}

// The program is read-only after build; every interior pointer targets
// the owned, never-moving program space.
unsafe impl Send for Program {}
unsafe impl Sync for Program {}

impl Program {
    #[inline(always)]
    pub fn null_object(&self) -> Value {
        self.null_object
    }

    #[inline(always)]
    pub fn true_object(&self) -> Value {
        self.true_object
    }

    #[inline(always)]
    pub fn false_object(&self) -> Value {
        self.false_object
    }

    #[inline(always)]
    pub fn bool_object(&self, value: bool) -> Value {
        if value {
            self.true_object
        } else {
            self.false_object
        }
    }

    #[inline(always)]
    pub fn smi_class(&self) -> Value {
        self.smi_class
    }

    #[inline(always)]
    pub fn class_at(&self, id: usize) -> Value {
        self.classes[id]
    }

    #[inline(always)]
    pub fn static_method_at(&self, index: usize) -> Value {
        self.functions[index]
    }

    #[inline(always)]
    pub fn constant_at(&self, index: usize) -> Value {
        self.constants[index]
    }

    #[inline(always)]
    pub fn dispatch_table(&self) -> Value {
        self.dispatch_table
    }

    #[inline(always)]
    pub fn vtable(&self) -> Value {
        self.vtable
    }

    #[inline(always)]
    pub fn statics_template(&self) -> &[Value] {
        &self.statics_template
    }

    #[inline(always)]
    pub fn nsm_trampoline(&self) -> Value {
        self.nsm_trampoline
    }

    #[inline(always)]
    pub fn coroutine_start(&self) -> Value {
        self.coroutine_start
    }

    #[inline(always)]
    pub fn entry(&self) -> Value {
        self.entry
    }

    pub fn double_class(&self) -> Value {
        self.double_class
    }

    pub fn large_integer_class(&self) -> Value {
        self.large_integer_class
    }

    pub fn str_class(&self) -> Value {
        self.str_class
    }

    pub fn boxed_class(&self) -> Value {
        self.boxed_class
    }

    pub fn array_class(&self) -> Value {
        self.array_class
    }

    pub fn initializer_class(&self) -> Value {
        self.initializer_class
    }

    pub fn coroutine_class(&self) -> Value {
        self.coroutine_class
    }

    pub fn stack_class(&self) -> Value {
        self.stack_class
    }

    /// The class of `value`, with Smis routed to the Smi class.
    #[inline(always)]
    pub fn class_of(&self, value: Value) -> Value {
        if value.is_smi() {
            self.smi_class
        } else {
            unsafe { value.as_ref::<object::HeapObject>().class }
        }
    }

    /// The exception object a failure sentinel surfaces as.
    pub fn object_from_failure(&self, kind: FailureKind) -> Value {
        self.failure_objects[kind as usize]
    }

    /// The vtable dispatch offset assigned to `selector`, if any method
    /// uses it.
    pub fn vtable_offset(&self, selector: Selector) -> Option<usize> {
        self.vtable_offsets.get(&selector.raw()).copied()
    }
}

/// Builds a [`Program`]. Stands in for the snapshot loader: embedders
/// and tests describe classes, methods and functions and the builder
/// materializes them into program space, deriving the dispatch table and
/// the vtable from the same method tables so all three dispatch paths
/// agree.
pub struct ProgramBuilder {
    classes: Vec<ClassSpec>,
    functions: Vec<FnSpec>,
    constants: Vec<Lit>,
    statics: Vec<StaticSpec>,
    segments: Vec<DispatchSegment>,
    dispatch_len: usize,
    vtable_offsets: Vec<Selector>,
    entry: Option<FnId>,
}

const META_CLASS: ClassId = ClassId(0);
const SMI_CLASS: ClassId = ClassId(1);
const NULL_CLASS: ClassId = ClassId(2);
const BOOL_CLASS: ClassId = ClassId(3);
const ARRAY_CLASS: ClassId = ClassId(4);
const BOXED_CLASS: ClassId = ClassId(5);
const DOUBLE_CLASS: ClassId = ClassId(6);
const LARGE_INTEGER_CLASS: ClassId = ClassId(7);
const STR_CLASS: ClassId = ClassId(8);
const FUNCTION_CLASS: ClassId = ClassId(9);
const INITIALIZER_CLASS: ClassId = ClassId(10);
const COROUTINE_CLASS: ClassId = ClassId(11);
const STACK_CLASS: ClassId = ClassId(12);
const ERROR_CLASS: ClassId = ClassId(13);

impl ProgramBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            classes: Vec::new(),
            functions: Vec::new(),
            constants: Vec::new(),
            statics: Vec::new(),
            segments: Vec::new(),
            dispatch_len: 0,
            vtable_offsets: Vec::new(),
            entry: None,
        };
        let base = [
            Layout::Class,        // meta
            Layout::Instance,     // smi receivers
            Layout::Instance,     // null
            Layout::Instance,     // bool
            Layout::Array,
            Layout::Boxed,
            Layout::Double,
            Layout::LargeInteger,
            Layout::Str,
            Layout::Function,
            Layout::Initializer,
            Layout::Coroutine,
            Layout::Stack,
        ];
        for layout in base {
            builder.classes.push(ClassSpec {
                superclass: None,
                field_count: 0,
                layout,
                methods: Vec::new(),
            });
        }
        // Error instances carry their message in field 0.
        builder.classes.push(ClassSpec {
            superclass: None,
            field_count: 1,
            layout: Layout::Instance,
            methods: Vec::new(),
        });
        builder
    }

    pub fn smi_class(&self) -> ClassId {
        SMI_CLASS
    }

    pub fn double_class(&self) -> ClassId {
        DOUBLE_CLASS
    }

    pub fn array_class(&self) -> ClassId {
        ARRAY_CLASS
    }

    pub fn coroutine_class(&self) -> ClassId {
        COROUTINE_CLASS
    }

    pub fn error_class(&self) -> ClassId {
        ERROR_CLASS
    }

    /// Register an instance class with `field_count` value slots.
    pub fn add_class(&mut self, superclass: Option<ClassId>, field_count: usize) -> ClassId {
        let id = ClassId(self.classes.len());
        assert!(id.0 < VTABLE_CLASS_SPAN, "class id space exhausted");
        self.classes.push(ClassSpec {
            superclass,
            field_count,
            layout: Layout::Instance,
            methods: Vec::new(),
        });
        id
    }

    /// The id the next [`add_function`](Self::add_function) call will
    /// return; lets recursive functions reference themselves.
    pub fn next_function_id(&self) -> FnId {
        FnId(self.functions.len())
    }

    /// Register a function. The returned id is also the static-method
    /// index `InvokeStatic` uses.
    pub fn add_function(&mut self, arity: usize, asm: FunctionAsm, literals: Vec<Lit>) -> FnId {
        assert!(literals.len() >= asm.literal_slots(), "missing literals");
        let id = FnId(self.functions.len());
        self.functions.push(FnSpec {
            arity,
            asm,
            literals,
        });
        id
    }

    /// Install `function` as the method for `selector` on `class`.
    pub fn add_method(&mut self, class: ClassId, selector: Selector, function: FnId) {
        self.register_vtable_selector(selector);
        self.classes[class.0].methods.push((selector, function));
    }

    pub fn add_constant(&mut self, lit: Lit) -> i32 {
        self.constants.push(lit);
        (self.constants.len() - 1) as i32
    }

    /// The index the next static registration will get.
    pub fn next_static_index(&self) -> i32 {
        self.statics.len() as i32
    }

    pub fn add_static(&mut self, lit: Lit) -> i32 {
        self.statics.push(StaticSpec::Eager(lit));
        (self.statics.len() - 1) as i32
    }

    /// A lazily initialized static: `LoadStaticInit` runs `function`
    /// the first time the cell is read.
    pub fn add_lazy_static(&mut self, function: FnId) -> i32 {
        self.statics.push(StaticSpec::Lazy(function));
        (self.statics.len() - 1) as i32
    }

    pub fn set_entry(&mut self, function: FnId) {
        self.entry = Some(function);
    }

    /// Register a dispatch-table segment for a call site of `selector`.
    /// Rows are `[class_id_lo, class_id_hi)` ranges; a catch-all row
    /// routing to the noSuchMethod trampoline is appended automatically.
    /// Returns the table index the call site encodes.
    pub fn add_dispatch_segment(
        &mut self,
        selector: Selector,
        rows: &[(i64, i64, FnId)],
    ) -> i32 {
        let index = self.dispatch_len;
        // Header plus one row of four slots each, plus the terminator.
        self.dispatch_len += 4 + 4 * (rows.len() + 1);
        self.segments.push(DispatchSegment {
            index,
            selector,
            rows: rows.to_vec(),
        });
        index as i32
    }

    /// The vtable dispatch offset for `selector`, assigning one if new.
    pub fn vtable_offset(&mut self, selector: Selector) -> usize {
        self.register_vtable_selector(selector)
    }

    /// The selector a vtable call site encodes: same arity and kind, but
    /// the id field carries the dispatch offset.
    pub fn vtable_selector(&mut self, selector: Selector) -> Selector {
        let offset = self.vtable_offset(selector);
        Selector::encode(offset as u32, selector.kind(), selector.arity() as u8)
    }

    fn register_vtable_selector(&mut self, selector: Selector) -> usize {
        if let Some(k) = self
            .vtable_offsets
            .iter()
            .position(|s| s.raw() == selector.raw())
        {
            return 1 + k * VTABLE_CLASS_SPAN;
        }
        self.vtable_offsets.push(selector);
        1 + (self.vtable_offsets.len() - 1) * VTABLE_CLASS_SPAN
    }

    // ── materialization ────────────────────────────────────────────

    pub fn build(mut self) -> Program {
        let mut space = ProgramSpace::new();

        // Internal functions. The default noSuchMethod handler throws
        // the selector it was handed; the trampoline reshapes the stack
        // around a dispatch to the handler; the coroutine-start stub is
        // where a fresh coroutine's seeded frame resumes.
        let default_nsm = {
            let mut asm = FunctionAsm::new();
            asm.frame_size(1);
            asm.load_local(1);
            asm.throw();
            asm.method_end();
            self.add_function(2, asm, Vec::new())
        };
        let nsm_trampoline = {
            let mut asm = FunctionAsm::new();
            asm.frame_size(3);
            asm.enter_no_such_method();
            asm.invoke_method(well_known::NO_SUCH_METHOD);
            asm.exit_no_such_method();
            asm.method_end();
            self.add_function(0, asm, Vec::new())
        };
        let coroutine_start = {
            let mut asm = FunctionAsm::new();
            asm.frame_size(3);
            asm.load_literal_null();
            asm.load_literal_null();
            asm.load_literal_null();
            asm.coroutine_change();
            asm.invoke_method(well_known::CALL);
            asm.load_literal_true();
            asm.process_yield();
            asm.method_end();
            self.add_function(0, asm, Vec::new())
        };

        // Root classes answer noSuchMethod with the default handler
        // unless they define their own.
        self.register_vtable_selector(well_known::NO_SUCH_METHOD);
        for spec in self.classes.iter_mut() {
            if spec.superclass.is_none()
                && !spec
                    .methods
                    .iter()
                    .any(|(s, _)| s.raw() == well_known::NO_SUCH_METHOD.raw())
            {
                spec.methods.push((well_known::NO_SUCH_METHOD, default_nsm));
            }
        }

        // Pass 1: class objects (superclass and methods patched later).
        let placeholder = Value::from_smi(0);
        let class_values: Vec<Value> = self
            .classes
            .iter()
            .enumerate()
            .map(|(id, spec)| {
                let ptr = space.allocate(size_of::<Class>()) as *mut Class;
                unsafe {
                    init_class(
                        ptr,
                        placeholder,
                        id as i64,
                        placeholder,
                        spec.field_count,
                        spec.layout,
                        placeholder,
                    );
                }
                Value::from_ptr(ptr)
            })
            .collect();
        let meta = class_values[META_CLASS.0];
        for (id, spec) in self.classes.iter().enumerate() {
            let class: &mut Class = unsafe { class_values[id].as_mut() };
            class.class = meta;
            class.superclass = match spec.superclass {
                Some(superclass) => class_values[superclass.0],
                None => placeholder,
            };
        }

        // Special instances.
        let null_object = alloc_instance(&mut space, class_values[NULL_CLASS.0], &[]);
        let true_object = alloc_instance(&mut space, class_values[BOOL_CLASS.0], &[]);
        let false_object = alloc_instance(&mut space, class_values[BOOL_CLASS.0], &[]);

        // Pass 2: function objects with bytecode copied in.
        let function_class = class_values[FUNCTION_CLASS.0];
        let function_values: Vec<Value> = self
            .functions
            .iter()
            .map(|spec| {
                let bytes = spec.asm.bytes();
                let size = function_allocation_size(
                    bytes.len(),
                    spec.literals.len(),
                    spec.asm.catch_ranges().len(),
                );
                let ptr = space.allocate(size) as *mut Function;
                unsafe {
                    init_function(
                        ptr,
                        function_class,
                        spec.arity,
                        bytes,
                        spec.literals.len(),
                        spec.asm.catch_ranges().len(),
                    );
                }
                Value::from_ptr(ptr)
            })
            .collect();

        // Pass 3: literal areas, operand patches and catch tables.
        for (spec, &value) in self.functions.iter().zip(&function_values) {
            let function: &mut Function = unsafe { value.as_mut() };
            for (i, lit) in spec.literals.iter().enumerate() {
                let resolved = resolve_lit(
                    lit,
                    &mut space,
                    &class_values,
                    &function_values,
                    null_object,
                    true_object,
                    false_object,
                );
                unsafe { function.set_literal(i, resolved) };
            }
            for lit_ref in spec.asm.literal_refs() {
                let opcode_addr = function.bytecode_address_for(lit_ref.operand_pos - 1) as i64;
                let literal_addr = function.literal_address(lit_ref.literal as usize) as i64;
                let offset = (literal_addr - opcode_addr) as i32;
                unsafe {
                    let operand =
                        function.bytecode_start().add(lit_ref.operand_pos) as *mut u8;
                    core::ptr::copy_nonoverlapping(
                        offset.to_le_bytes().as_ptr(),
                        operand,
                        4,
                    );
                }
            }
            for (i, range) in spec.asm.catch_ranges().iter().enumerate() {
                unsafe {
                    function.set_catch_entry(
                        i,
                        CatchEntry {
                            start: Value::from_smi(range.start as i64),
                            end: Value::from_smi(range.end as i64),
                            target: Value::from_smi(range.target as i64),
                            height: Value::from_smi(range.height as i64),
                        },
                    );
                }
            }
        }

        // Pass 4: method tables.
        let array_class = class_values[ARRAY_CLASS.0];
        for (id, spec) in self.classes.iter().enumerate() {
            let mut pairs = Vec::with_capacity(spec.methods.len() * 2);
            for (selector, function) in &spec.methods {
                pairs.push(Value::from_smi(selector.raw() as i64));
                pairs.push(function_values[function.0]);
            }
            let methods = alloc_array(&mut space, array_class, &pairs);
            let class: &mut Class = unsafe { class_values[id].as_mut() };
            class.methods = methods;
        }

        let trampoline = function_values[nsm_trampoline.0];

        // Pass 5: dispatch table, derived from the registered segments.
        let mut dispatch = vec![null_object; self.dispatch_len];
        for segment in &self.segments {
            let base = segment.index;
            dispatch[base + 1] = Value::from_smi(segment.selector.raw() as i64);
            let mut rows = segment.rows.clone();
            rows.sort_by_key(|&(lo, _, _)| lo);
            for (i, &(lo, hi, target)) in rows.iter().enumerate() {
                let row = base + 4 + i * 4;
                dispatch[row] = Value::from_smi(lo);
                dispatch[row + 1] = Value::from_smi(hi);
                dispatch[row + 3] = function_values[target.0];
            }
            // Terminator: matches every class id and routes to the
            // trampoline. Its hi is the Smi max sentinel the scan and
            // InvokeTestFast rely on.
            let last = base + 4 + rows.len() * 4;
            dispatch[last] = Value::from_smi(0);
            dispatch[last + 1] = Value::from_smi(Value::SMI_MAX);
            dispatch[last + 3] = trampoline;
        }
        let dispatch_table = alloc_array(&mut space, array_class, &dispatch);

        // Pass 6: vtable, derived from the same method tables. Row 0 is
        // the absent row; every class id plus selector offset indexes
        // either a matching row or a hole filled with the absent row.
        let absent_row = alloc_array(
            &mut space,
            array_class,
            &[Value::from_smi(-1), Value::from_smi(0), trampoline],
        );
        let max_index = 1 + self.vtable_offsets.len() * VTABLE_CLASS_SPAN;
        let mut vtable = vec![absent_row; max_index];
        for (k, &selector) in self.vtable_offsets.iter().enumerate() {
            let offset = 1 + k * VTABLE_CLASS_SPAN;
            for class_id in 0..self.classes.len() {
                if let Some(function) = self.resolve_method(class_id, selector) {
                    let row = alloc_array(
                        &mut space,
                        array_class,
                        &[
                            Value::from_smi(offset as i64),
                            Value::from_smi(selector.raw() as i64),
                            function_values[function.0],
                        ],
                    );
                    vtable[class_id + offset] = row;
                }
            }
        }
        let vtable = alloc_array(&mut space, array_class, &vtable);

        // Pass 7: constants, statics, failure objects.
        let constants: Vec<Value> = self
            .constants
            .iter()
            .map(|lit| {
                resolve_lit(
                    lit,
                    &mut space,
                    &class_values,
                    &function_values,
                    null_object,
                    true_object,
                    false_object,
                )
            })
            .collect();

        let initializer_class = class_values[INITIALIZER_CLASS.0];
        let statics_template: Vec<Value> = self
            .statics
            .iter()
            .map(|spec| match spec {
                StaticSpec::Eager(lit) => resolve_lit(
                    lit,
                    &mut space,
                    &class_values,
                    &function_values,
                    null_object,
                    true_object,
                    false_object,
                ),
                StaticSpec::Lazy(function) => {
                    let ptr = space.allocate(size_of::<Initializer>()) as *mut Initializer;
                    unsafe {
                        ptr.write(Initializer {
                            class: initializer_class,
                            function: function_values[function.0],
                        });
                    }
                    Value::from_ptr(ptr)
                }
            })
            .collect();

        let error_class = class_values[ERROR_CLASS.0];
        let str_class = class_values[STR_CLASS.0];
        let failure_objects = [
            "retry after gc",
            "wrong argument type",
            "index out of bounds",
            "illegal state",
        ]
        .map(|message| {
            let text = alloc_str(&mut space, str_class, message);
            alloc_instance(&mut space, error_class, &[text])
        });

        let entry = function_values[self.entry.expect("program entry not set").0];

        let vtable_offsets = self
            .vtable_offsets
            .iter()
            .enumerate()
            .map(|(k, s)| (s.raw(), 1 + k * VTABLE_CLASS_SPAN))
            .collect();

        let coroutine_start_value = function_values[coroutine_start.0];

        Program {
            space,
            null_object,
            true_object,
            false_object,
            classes: class_values.clone(),
            functions: function_values,
            constants,
            statics_template,
            dispatch_table,
            vtable,
            nsm_trampoline: trampoline,
            coroutine_start: coroutine_start_value,
            entry,
            failure_objects,
            vtable_offsets,
            smi_class: class_values[SMI_CLASS.0],
            double_class: class_values[DOUBLE_CLASS.0],
            large_integer_class: class_values[LARGE_INTEGER_CLASS.0],
            str_class,
            boxed_class: class_values[BOXED_CLASS.0],
            array_class,
            initializer_class,
            coroutine_class: class_values[COROUTINE_CLASS.0],
            stack_class: class_values[STACK_CLASS.0],
        }
    }

    /// First match for `selector` along `class_id`'s superclass chain.
    fn resolve_method(&self, class_id: usize, selector: Selector) -> Option<FnId> {
        let mut current = Some(class_id);
        while let Some(id) = current {
            let spec = &self.classes[id];
            if let Some(&(_, function)) = spec
                .methods
                .iter()
                .find(|(s, _)| s.raw() == selector.raw())
            {
                return Some(function);
            }
            current = spec.superclass.map(|c| c.0);
        }
        None
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn alloc_instance(space: &mut ProgramSpace, class: Value, fields: &[Value]) -> Value {
    let class_ref: &Class = unsafe { class.as_ref() };
    debug_assert_eq!(class_ref.field_count(), fields.len());
    let ptr = space.allocate(instance_allocation_size(fields.len())) as *mut Instance;
    unsafe {
        init_instance(ptr, class, fields.len(), Value::from_smi(0));
        let instance = &mut *ptr;
        for (i, &field) in fields.iter().enumerate() {
            instance.set_field(i, field);
        }
    }
    Value::from_ptr(ptr)
}

fn alloc_array(space: &mut ProgramSpace, class: Value, values: &[Value]) -> Value {
    let ptr = space.allocate(array_allocation_size(values.len())) as *mut Array;
    unsafe {
        init_array(ptr, class, values.len(), Value::from_smi(0));
        let array = &mut *ptr;
        for (i, &value) in values.iter().enumerate() {
            array.set(i, value);
        }
    }
    Value::from_ptr(ptr)
}

fn alloc_str(space: &mut ProgramSpace, class: Value, text: &str) -> Value {
    let ptr = space.allocate(str_allocation_size(text.len())) as *mut object::Str;
    unsafe { init_str(ptr, class, text.as_bytes()) };
    Value::from_ptr(ptr)
}

fn resolve_lit(
    lit: &Lit,
    space: &mut ProgramSpace,
    classes: &[Value],
    functions: &[Value],
    null_object: Value,
    true_object: Value,
    false_object: Value,
) -> Value {
    match lit {
        Lit::Null => null_object,
        Lit::True => true_object,
        Lit::False => false_object,
        Lit::Smi(n) => Value::from_smi(*n),
        Lit::Double(d) => {
            let ptr = space.allocate(size_of::<object::Double>()) as *mut object::Double;
            unsafe { init_double(ptr, classes[DOUBLE_CLASS.0], *d) };
            Value::from_ptr(ptr)
        }
        Lit::Str(s) => alloc_str(space, classes[STR_CLASS.0], s),
        Lit::Function(id) => functions[id.0],
        Lit::Class(id) => classes[id.0],
    }
}
