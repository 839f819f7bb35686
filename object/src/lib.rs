mod value;
mod objects;

pub use value::{FailureKind, Value};
pub use objects::{
    array_allocation_size, function_allocation_size, init_array, init_class, init_double,
    init_function, init_instance, init_large_integer, init_stack, init_str,
    instance_allocation_size, stack_allocation_size, str_allocation_size, Array, Boxed,
    CatchEntry, Class, Coroutine, Double, Function, HeapObject, Initializer, Instance,
    LargeInteger, Layout, Stack, Str,
};

#[cfg(test)]
mod tests {
    use super::*;

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn smi_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, Value::SMI_MAX, Value::SMI_MIN] {
            let v = Value::from_smi(n);
            assert!(v.is_smi());
            assert!(!v.is_heap_object());
            assert!(!v.is_failure());
            assert_eq!(unsafe { v.smi_value() }, n);
        }
    }

    #[test]
    fn smi_zero_is_zero_bits() {
        assert_eq!(Value::from_smi(0).raw(), 0);
    }

    #[test]
    fn smi_range() {
        assert!(Value::fits_smi(Value::SMI_MAX));
        assert!(Value::fits_smi(Value::SMI_MIN));
        assert!(!Value::fits_smi(Value::SMI_MAX + 1));
        assert!(!Value::fits_smi(Value::SMI_MIN - 1));
    }

    #[test]
    fn ref_tagging() {
        let dummy: u64 = 0;
        let ptr = &dummy as *const u64;
        let v = Value::from_ptr(ptr);
        assert!(v.is_heap_object());
        assert!(!v.is_smi());
        assert!(!v.is_failure());
        assert_eq!(v.address(), ptr as u64);
    }

    #[test]
    fn failure_sentinels() {
        for (value, kind) in [
            (Value::RETRY_AFTER_GC, FailureKind::RetryAfterGc),
            (Value::WRONG_ARGUMENT_TYPE, FailureKind::WrongArgumentType),
            (Value::INDEX_OUT_OF_BOUNDS, FailureKind::IndexOutOfBounds),
            (Value::ILLEGAL_STATE, FailureKind::IllegalState),
        ] {
            assert!(value.is_failure());
            assert!(!value.is_smi());
            assert!(!value.is_heap_object());
            assert_eq!(unsafe { value.failure_kind() }, kind);
        }
    }

    // ── Allocation sizes ───────────────────────────────────────────

    #[test]
    fn instance_sizes() {
        assert_eq!(instance_allocation_size(0), 8);
        assert_eq!(instance_allocation_size(3), 8 + 3 * 8);
    }

    #[test]
    fn array_sizes() {
        assert_eq!(array_allocation_size(0), 16);
        assert_eq!(array_allocation_size(4), 16 + 4 * 8);
    }

    #[test]
    fn function_sizes_pad_bytecode() {
        // 5 bytes of bytecode pad to 8.
        assert_eq!(function_allocation_size(5, 0, 0), 40 + 8);
        assert_eq!(function_allocation_size(8, 2, 1), 40 + 8 + 16 + 32);
    }

    #[test]
    fn stack_sizes() {
        assert_eq!(stack_allocation_size(16), 24 + 16 * 8);
    }

    // ── Raw object init ────────────────────────────────────────────

    #[test]
    fn stack_slots() {
        let mut buf = vec![0u64; stack_allocation_size(8) / 8];
        let ptr = buf.as_mut_ptr() as *mut Stack;
        unsafe {
            init_stack(ptr, Value::from_smi(0), 8);
            let stack = &mut *ptr;
            assert_eq!(stack.capacity(), 8);
            assert_eq!(stack.top(), 0);
            stack.set_slot(3, Value::from_smi(99));
            stack.set_top(3);
            assert_eq!(stack.top(), 3);
            assert_eq!(stack.slot(3).raw(), Value::from_smi(99).raw());
        }
    }

    #[test]
    fn function_layout() {
        let bytecode = [1u8, 2, 3, 4, 5];
        let size = function_allocation_size(bytecode.len(), 2, 1);
        let mut buf = vec![0u64; size / 8];
        let ptr = buf.as_mut_ptr() as *mut Function;
        unsafe {
            init_function(ptr, Value::from_smi(0), 2, &bytecode, 2, 1);
            let f = &mut *ptr;
            assert_eq!(f.arity(), 2);
            assert_eq!(f.bytecode(), &bytecode);
            f.set_literal(0, Value::from_smi(7));
            f.set_literal(1, Value::from_smi(8));
            assert_eq!(f.literals().len(), 2);
            assert_eq!(f.literals()[1].raw(), Value::from_smi(8).raw());
            f.set_catch_entry(
                0,
                CatchEntry {
                    start: Value::from_smi(0),
                    end: Value::from_smi(4),
                    target: Value::from_smi(4),
                    height: Value::from_smi(1),
                },
            );
            assert_eq!(f.catch_entries().len(), 1);
            assert_eq!(f.catch_entries()[0].end.smi_value(), 4);
        }
    }

    #[test]
    fn array_get_set() {
        let mut buf = vec![0u64; array_allocation_size(3) / 8];
        let ptr = buf.as_mut_ptr() as *mut Array;
        unsafe {
            init_array(ptr, Value::from_smi(0), 3, Value::from_smi(0));
            let arr = &mut *ptr;
            assert_eq!(arr.len(), 3);
            arr.set(1, Value::from_smi(-5));
            assert_eq!(arr.get(1).smi_value(), -5);
            assert_eq!(arr.elements().len(), 3);
        }
    }
}
