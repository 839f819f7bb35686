use std::collections::HashSet;

use object::{
    array_allocation_size, function_allocation_size, instance_allocation_size,
    stack_allocation_size, str_allocation_size, Array, Boxed, Class, Coroutine, Function,
    HeapObject, Instance, Layout, Stack, Str, Value,
};
use tracing::debug;

/// Sizing knobs for a process heap and its stacks.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Bytes per heap chunk.
    pub chunk_size: usize,
    /// Hard cap on the number of chunks; reaching it makes collection
    /// stop growing the heap and allocation failures permanent.
    pub max_chunks: usize,
    /// Slot count of the stack a process is born with.
    pub initial_stack_slots: usize,
    /// Slot count of a freshly created coroutine stack.
    pub coroutine_stack_slots: usize,
    /// Re-walk the frame chain before every dispatch.
    pub validate_stack: bool,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            max_chunks: 1024,
            initial_stack_slots: 2048,
            coroutine_stack_slots: 256,
            validate_stack: false,
        }
    }
}

/// Host callback run when a registered object dies.
pub type FinalizeFn = fn(*mut u8);

struct Chunk {
    data: Box<[u64]>,
    bump: usize, // byte offset of the next free byte
}

impl Chunk {
    fn new(size_bytes: usize) -> Self {
        Self {
            data: vec![0u64; size_bytes / 8].into_boxed_slice(),
            bump: 0,
        }
    }

    fn base(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    fn len(&self) -> usize {
        self.data.len() * 8
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.base() && addr < self.base() + self.len() as u64
    }
}

/// A per-process heap: chunked bump allocation with a first-fit free
/// list, collected by non-moving mark–sweep. Allocators never collect on
/// their own; they fail and the dispatcher runs the GC-and-retry
/// protocol with the operand stack untouched.
pub struct Heap {
    chunks: Vec<Chunk>,
    free_list: Vec<(u64, usize)>,
    allocations: Vec<u64>,
    marked: HashSet<u64>,
    immutable: HashSet<u64>,
    finalizers: Vec<(u64, FinalizeFn)>,
    chunk_size: usize,
    max_chunks: usize,
    collections: u64,
    /// Size of the most recent failed request; collection grows the heap
    /// until it fits.
    wanted: usize,
}

impl Heap {
    pub fn new(settings: &HeapSettings) -> Self {
        Self {
            chunks: vec![Chunk::new(settings.chunk_size)],
            free_list: Vec::new(),
            allocations: Vec::new(),
            marked: HashSet::new(),
            immutable: HashSet::new(),
            finalizers: Vec::new(),
            chunk_size: settings.chunk_size,
            max_chunks: settings.max_chunks,
            collections: 0,
            wanted: 0,
        }
    }

    /// Number of collections run so far.
    pub fn collections(&self) -> u64 {
        self.collections
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.chunks.iter().any(|c| c.contains(addr))
    }

    /// Carve `size` bytes (8-aligned) or report exhaustion with `None`.
    pub fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        debug_assert!(size % 8 == 0 && size > 0);
        let chunk = self.chunks.last_mut().expect("heap has a chunk");
        if chunk.bump + size <= chunk.len() {
            let addr = chunk.base() + chunk.bump as u64;
            chunk.bump += size;
            self.allocations.push(addr);
            return Some(addr as *mut u8);
        }
        if let Some(pos) = self.free_list.iter().position(|&(_, s)| s >= size) {
            let (addr, block) = self.free_list.swap_remove(pos);
            if block > size {
                self.free_list.push((addr + size as u64, block - size));
            }
            self.allocations.push(addr);
            return Some(addr as *mut u8);
        }
        self.wanted = self.wanted.max(size);
        None
    }

    // ── immutability and finalization ──────────────────────────────

    pub fn mark_immutable(&mut self, value: Value) {
        self.immutable.insert(value.address());
    }

    pub fn is_immutable(&self, value: Value) -> bool {
        self.immutable.contains(&value.address())
    }

    pub fn register_finalizer(&mut self, value: Value, finalize: FinalizeFn) {
        debug_assert!(self.contains(value.address()));
        self.finalizers.push((value.address(), finalize));
    }

    // ── collection ─────────────────────────────────────────────────

    /// Mark from `roots` and sweep everything unreached, then grow the
    /// heap if the request that triggered the collection still does not
    /// fit. Objects never move.
    pub fn collect(&mut self, roots: &[Value]) {
        self.collections += 1;
        self.marked.clear();

        let mut worklist: Vec<u64> = Vec::new();
        for &root in roots {
            self.mark_value(root, &mut worklist);
        }
        while let Some(addr) = worklist.pop() {
            // SAFETY: addr was admitted by mark_value, so it is a live
            // object inside this heap.
            unsafe { self.trace_object(addr, &mut worklist) };
        }

        let before = self.allocations.len();
        let mut freed_bytes = 0usize;
        let marked = std::mem::take(&mut self.marked);
        let mut dead: Vec<u64> = Vec::new();
        self.allocations.retain(|&addr| {
            if marked.contains(&addr) {
                true
            } else {
                dead.push(addr);
                false
            }
        });
        for &addr in &dead {
            // SAFETY: dead objects keep their class word until swept.
            let size = unsafe { object_size(addr) };
            freed_bytes += size;
            self.free_list.push((addr, size));
            self.immutable.remove(&addr);
        }
        let dead_set: HashSet<u64> = dead.into_iter().collect();
        self.finalizers.retain(|&(addr, finalize)| {
            if dead_set.contains(&addr) {
                finalize(addr as *mut u8);
                false
            } else {
                true
            }
        });
        self.marked = marked;

        let can_grow = self.chunks.len() < self.max_chunks;
        if self.wanted > 0 && !self.fits(self.wanted) && can_grow {
            let size = self.chunk_size.max(self.wanted);
            self.chunks.push(Chunk::new(size));
        }
        self.wanted = 0;

        debug!(
            target: "faden::gc",
            swept = before - self.allocations.len(),
            freed_bytes,
            live = self.allocations.len(),
            chunks = self.chunks.len(),
            "collected"
        );
    }

    fn fits(&self, size: usize) -> bool {
        let chunk = self.chunks.last().expect("heap has a chunk");
        chunk.bump + size <= chunk.len() || self.free_list.iter().any(|&(_, s)| s >= size)
    }

    fn mark_value(&mut self, value: Value, worklist: &mut Vec<u64>) {
        // Smis, failure sentinels, raw return addresses and references
        // into the read-only program space all fail one of these tests.
        if !value.is_heap_object() {
            return;
        }
        let addr = value.address();
        if !self.contains(addr) {
            return;
        }
        if self.marked.insert(addr) {
            worklist.push(addr);
        }
    }

    /// # Safety
    ///
    /// `addr` must be a live object in this heap.
    unsafe fn trace_object(&mut self, addr: u64, worklist: &mut Vec<u64>) {
        let object = &*(addr as *const HeapObject);
        match object.layout() {
            Layout::Instance => {
                let instance = &*(addr as *const Instance);
                let class: &Class = instance.class.as_ref();
                for i in 0..class.field_count() {
                    self.mark_value(instance.field(i), worklist);
                }
            }
            Layout::Array => {
                let array = &*(addr as *const Array);
                for &element in array.elements() {
                    self.mark_value(element, worklist);
                }
            }
            Layout::Boxed => {
                let boxed = &*(addr as *const Boxed);
                self.mark_value(boxed.value, worklist);
            }
            Layout::Coroutine => {
                let coroutine = &*(addr as *const Coroutine);
                self.mark_value(coroutine.stack, worklist);
                self.mark_value(coroutine.caller, worklist);
            }
            Layout::Stack => {
                // Slots above top are dead; return addresses among the
                // live slots point into program space and are filtered
                // out by mark_value.
                let stack = &*(addr as *const Stack);
                for i in 0..=stack.top() {
                    self.mark_value(stack.slot(i), worklist);
                }
            }
            // Leaf payloads.
            Layout::Double | Layout::LargeInteger | Layout::Str => {}
            // Program-space layouts; process heaps never host them, and
            // their references stay within program space anyway.
            Layout::Function | Layout::Class | Layout::Initializer => {}
        }
    }
}

/// Total byte size of the object at `addr`, derived from its class.
///
/// # Safety
///
/// `addr` must point to an object whose class word is intact.
pub unsafe fn object_size(addr: u64) -> usize {
    let object = &*(addr as *const HeapObject);
    match object.layout() {
        Layout::Instance => {
            let class: &Class = object.class.as_ref();
            instance_allocation_size(class.field_count())
        }
        Layout::Array => array_allocation_size((*(addr as *const Array)).len()),
        Layout::Boxed => size_of::<Boxed>(),
        Layout::Function => {
            let function = &*(addr as *const Function);
            function_allocation_size(
                function.bytecode_size(),
                function.literal_count(),
                function.catch_count(),
            )
        }
        Layout::Class => size_of::<Class>(),
        Layout::Initializer => size_of::<object::Initializer>(),
        Layout::Double => size_of::<object::Double>(),
        Layout::LargeInteger => size_of::<object::LargeInteger>(),
        Layout::Str => str_allocation_size((*(addr as *const Str)).len()),
        Layout::Coroutine => size_of::<Coroutine>(),
        Layout::Stack => stack_allocation_size((*(addr as *const Stack)).capacity()),
    }
}

/// The never-collected arena hosting the program's classes, functions,
/// constants and tables. Addresses are stable for the program's life.
pub struct ProgramSpace {
    chunks: Vec<Chunk>,
    chunk_size: usize,
}

impl ProgramSpace {
    pub fn new() -> Self {
        let chunk_size = 256 * 1024;
        Self {
            chunks: vec![Chunk::new(chunk_size)],
            chunk_size,
        }
    }

    /// Bump-allocate `size` bytes; grows by whole chunks and never fails.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        debug_assert!(size % 8 == 0 && size > 0);
        let need_new = {
            let chunk = self.chunks.last().expect("program space has a chunk");
            chunk.bump + size > chunk.len()
        };
        if need_new {
            self.chunks.push(Chunk::new(self.chunk_size.max(size)));
        }
        let chunk = self.chunks.last_mut().expect("program space has a chunk");
        let addr = chunk.base() + chunk.bump as u64;
        chunk.bump += size;
        addr as *mut u8
    }
}

impl Default for ProgramSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::init_instance;

    fn test_class(space: &mut ProgramSpace, layout: Layout, field_count: usize) -> Value {
        let ptr = space.allocate(size_of::<Class>()) as *mut Class;
        unsafe {
            object::init_class(
                ptr,
                Value::from_smi(0),
                0,
                Value::from_smi(0),
                field_count,
                layout,
                Value::from_smi(0),
            );
        }
        Value::from_ptr(ptr)
    }

    #[test]
    fn bump_allocation_and_exhaustion() {
        let settings = HeapSettings {
            chunk_size: 256,
            ..Default::default()
        };
        let mut heap = Heap::new(&settings);
        assert!(heap.allocate(128).is_some());
        assert!(heap.allocate(120).is_some());
        assert!(heap.allocate(64).is_none());
    }

    #[test]
    fn collect_frees_unreachable_and_grows_for_request() {
        let settings = HeapSettings {
            chunk_size: 512,
            ..Default::default()
        };
        let mut space = ProgramSpace::new();
        let class = test_class(&mut space, Layout::Instance, 2);

        let mut heap = Heap::new(&settings);
        let size = instance_allocation_size(2);
        let live = heap.allocate(size).unwrap() as *mut Instance;
        unsafe { init_instance(live, class, 2, Value::from_smi(0)) };
        let live = Value::from_ptr(live);

        // Fill the rest of the chunk with garbage instances.
        let mut filled = 0;
        while let Some(ptr) = heap.allocate(size) {
            unsafe { init_instance(ptr as *mut Instance, class, 2, Value::from_smi(0)) };
            filled += 1;
        }
        assert!(filled > 0);
        assert!(heap.allocate(size).is_none());

        heap.collect(&[live]);
        assert_eq!(heap.collections(), 1);
        // The live object survived, the garbage was swept, and the
        // request now fits.
        assert!(heap.contains(live.address()));
        assert!(heap.allocate(size).is_some());
    }

    #[test]
    fn trace_follows_instance_fields() {
        let settings = HeapSettings {
            chunk_size: 4096,
            ..Default::default()
        };
        let mut space = ProgramSpace::new();
        let class = test_class(&mut space, Layout::Instance, 1);

        let mut heap = Heap::new(&settings);
        let size = instance_allocation_size(1);
        let inner_ptr = heap.allocate(size).unwrap() as *mut Instance;
        unsafe { init_instance(inner_ptr, class, 1, Value::from_smi(7)) };
        let inner = Value::from_ptr(inner_ptr);

        let outer_ptr = heap.allocate(size).unwrap() as *mut Instance;
        unsafe { init_instance(outer_ptr, class, 1, inner) };
        let outer = Value::from_ptr(outer_ptr);

        heap.collect(&[outer]);
        // Both survive through the field edge.
        assert!(heap.contains(inner.address()));
        let slots_alive = heap.allocations.len();
        assert_eq!(slots_alive, 2);
    }

    #[test]
    fn finalizers_run_on_death() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DEAD: AtomicUsize = AtomicUsize::new(0);
        fn on_death(_ptr: *mut u8) {
            DEAD.fetch_add(1, Ordering::SeqCst);
        }

        let settings = HeapSettings {
            chunk_size: 4096,
            ..Default::default()
        };
        let mut space = ProgramSpace::new();
        let class = test_class(&mut space, Layout::Instance, 0);

        let mut heap = Heap::new(&settings);
        let ptr = heap.allocate(instance_allocation_size(0)).unwrap() as *mut Instance;
        unsafe { init_instance(ptr, class, 0, Value::from_smi(0)) };
        let doomed = Value::from_ptr(ptr);
        heap.register_finalizer(doomed, on_death);

        heap.collect(&[doomed]);
        assert_eq!(DEAD.load(Ordering::SeqCst), 0);
        heap.collect(&[]);
        assert_eq!(DEAD.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn immutable_set_follows_lifetime() {
        let settings = HeapSettings {
            chunk_size: 4096,
            ..Default::default()
        };
        let mut space = ProgramSpace::new();
        let class = test_class(&mut space, Layout::Instance, 0);

        let mut heap = Heap::new(&settings);
        let ptr = heap.allocate(instance_allocation_size(0)).unwrap() as *mut Instance;
        unsafe { init_instance(ptr, class, 0, Value::from_smi(0)) };
        let value = Value::from_ptr(ptr);
        heap.mark_immutable(value);
        assert!(heap.is_immutable(value));

        heap.collect(&[]);
        assert!(!heap.is_immutable(value));
    }
}
