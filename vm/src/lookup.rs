use bytecode::Selector;
use object::{Array, Class, Value};
use tracing::trace;

use crate::program::Program;

const PRIMARY_SIZE: usize = 1024;
const SECONDARY_SIZE: usize = 64;

/// Tag values on a cache entry.
pub const TAG_ABSENT: u8 = 0;
pub const TAG_METHOD: u8 = 1;

/// One cached resolution of `(class, selector)`.
///
/// `tag` 0 means the selector is not applicable to the class and
/// `target` is the noSuchMethod trampoline.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub class: Value,
    pub selector: u32,
    pub target: Value,
    pub tag: u8,
}

impl Entry {
    const EMPTY: Entry = Entry {
        class: Value::from_raw(0),
        selector: u32::MAX,
        target: Value::from_raw(0),
        tag: TAG_ABSENT,
    };
}

/// The per-process method-lookup cache: a primary table backed by a
/// small victim table. Taken by the interpreter for the duration of a
/// run so nothing else observes it mid-mutation.
pub struct LookupCache {
    primary: Box<[Entry]>,
    secondary: Box<[Entry]>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self {
            primary: vec![Entry::EMPTY; PRIMARY_SIZE].into_boxed_slice(),
            secondary: vec![Entry::EMPTY; SECONDARY_SIZE].into_boxed_slice(),
        }
    }

    pub fn clear(&mut self) {
        self.primary.fill(Entry::EMPTY);
        self.secondary.fill(Entry::EMPTY);
    }

    #[inline(always)]
    fn primary_index(class: Value, selector: u32) -> usize {
        let hash = (class.raw() >> 3) as u32 ^ selector;
        hash as usize & (PRIMARY_SIZE - 1)
    }

    #[inline(always)]
    fn secondary_index(class: Value, selector: u32) -> usize {
        let hash = (class.raw() >> 3) as u32 ^ selector.rotate_left(7);
        hash as usize & (SECONDARY_SIZE - 1)
    }

    /// Look `(class, selector)` up, filling from the slow path on miss.
    pub fn lookup(&mut self, program: &Program, class: Value, selector: Selector) -> Entry {
        let raw = selector.raw();
        let primary = Self::primary_index(class, raw);
        let entry = self.primary[primary];
        if entry.class == class && entry.selector == raw {
            return entry;
        }

        let secondary = Self::secondary_index(class, raw);
        let victim = self.secondary[secondary];
        if victim.class == class && victim.selector == raw {
            // Promote to primary, demoting the current occupant.
            self.secondary[secondary] = self.primary[primary];
            self.primary[primary] = victim;
            return victim;
        }

        let filled = lookup_method_slow(program, class, selector);
        self.secondary[secondary] = self.primary[primary];
        self.primary[primary] = filled;
        filled
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk the class chain for a method matching `selector`. A miss
/// resolves to the noSuchMethod trampoline with [`TAG_ABSENT`].
pub fn lookup_method_slow(program: &Program, class: Value, selector: Selector) -> Entry {
    let raw = selector.raw();
    let mut current = class;
    while current.is_heap_object() {
        let clazz: &Class = unsafe { current.as_ref() };
        if clazz.methods.is_heap_object() {
            let methods: &Array = unsafe { clazz.methods.as_ref() };
            let mut i = 0;
            while i + 1 < methods.len() {
                let candidate = unsafe { methods.get(i) };
                if unsafe { candidate.smi_value() } as u32 == raw {
                    return Entry {
                        class,
                        selector: raw,
                        target: unsafe { methods.get(i + 1) },
                        tag: TAG_METHOD,
                    };
                }
                i += 2;
            }
        }
        current = clazz.superclass;
    }
    trace!(target: "faden::lookup", selector = raw, "miss, routing to noSuchMethod");
    Entry {
        class,
        selector: raw,
        target: program.nsm_trampoline(),
        tag: TAG_ABSENT,
    }
}
