mod op;
mod selector;
mod builder;

pub use op::{disassemble_at, Format, Opcode, VAR_DIFF};
pub use selector::{well_known, Selector, SelectorKind};
pub use builder::{CatchRange, FunctionAsm, Label, LiteralRef, SubroutineLabel};

#[cfg(test)]
mod tests {
    use super::*;

    fn disassemble_all(bytes: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (text, next) = disassemble_at(bytes, pos);
            out.push(text);
            pos = next;
        }
        out
    }

    // ── opcode table ───────────────────────────────────────────────

    #[test]
    fn opcode_bytes_round_trip() {
        for byte in 0..Opcode::COUNT as u8 {
            let op = Opcode::try_from(byte).unwrap();
            assert_eq!(op as u8, byte);
            assert_eq!(op.length(), op.format().length());
        }
        assert!(Opcode::try_from(Opcode::COUNT as u8).is_err());
        assert!(Opcode::try_from(0xFF).is_err());
    }

    #[test]
    fn invoke_families() {
        assert!(Opcode::InvokeMethod.is_invoke_normal());
        assert!(Opcode::InvokeAdd.is_invoke_normal());
        assert!(Opcode::InvokeBitShl.is_invoke_normal());
        assert!(Opcode::InvokeMethodFast.is_invoke_fast());
        assert!(Opcode::InvokeAddFast.is_invoke_fast());
        assert!(Opcode::InvokeMethodVtable.is_invoke_vtable());
        assert!(Opcode::InvokeGeVtable.is_invoke_vtable());
        assert!(!Opcode::InvokeStatic.is_invoke_normal());
        assert!(!Opcode::InvokeTest.is_invoke_normal());
        assert!(!Opcode::LoadLocal0.is_invoke_normal());
    }

    #[test]
    fn invoke_forms_are_five_bytes() {
        // EnterNoSuchMethod reads the operand at return_address - 4 and
        // the opcode at return_address - 5; every selector-carrying
        // invoke must therefore be exactly 5 bytes.
        for byte in 0..Opcode::COUNT as u8 {
            let op = Opcode::try_from(byte).unwrap();
            if op.is_invoke_normal() || op.is_invoke_fast() || op.is_invoke_vtable() {
                assert_eq!(op.length(), 5, "{}", op.mnemonic());
            }
        }
        assert_eq!(Opcode::InvokeStatic.length(), 5);
        assert_eq!(Opcode::LoadStaticInit.length(), 5);
    }

    #[test]
    fn branch_deltas_declared() {
        assert_eq!(Opcode::BranchLong.stack_delta(), 0);
        assert_eq!(Opcode::BranchIfTrueLong.stack_delta(), -1);
        assert_eq!(Opcode::PopAndBranchLong.stack_delta(), VAR_DIFF);
        assert!(Opcode::BranchBack.is_branching());
        assert!(!Opcode::Pop.is_branching());
    }

    // ── selector packing ───────────────────────────────────────────

    #[test]
    fn selector_round_trip() {
        let s = Selector::encode(1234, SelectorKind::Setter, 2);
        assert_eq!(s.id(), 1234);
        assert_eq!(s.kind(), SelectorKind::Setter);
        assert_eq!(s.arity(), 2);
        assert!(s.is_setter());

        let m = Selector::encode(Selector::MAX_ID, SelectorKind::Method, 255);
        assert_eq!(m.id(), Selector::MAX_ID);
        assert_eq!(m.arity(), 255);
        assert!(!m.is_setter());
    }

    #[test]
    fn well_known_selectors() {
        assert_eq!(well_known::ADD.arity(), 1);
        assert_eq!(well_known::BIT_NOT.arity(), 0);
        assert_eq!(well_known::NO_SUCH_METHOD.id(), 0);
        assert_ne!(well_known::ADD.raw(), well_known::SUB.raw());
    }

    // ── assembler ──────────────────────────────────────────────────

    #[test]
    fn assemble_loads() {
        let mut asm = FunctionAsm::new();
        asm.load_local(0);
        asm.load_local(1);
        asm.load_local(2);
        asm.load_local(9);
        asm.load_literal(0);
        asm.load_literal(40);
        asm.load_literal(100_000);
        asm.method_end();

        assert_eq!(
            disassemble_all(asm.bytes()),
            vec![
                "LoadLocal0",
                "LoadLocal1",
                "LoadLocal2",
                "LoadLocal 9",
                "LoadLiteral0",
                "LoadLiteral 40",
                "LoadLiteralWide 100000",
                "MethodEnd 13",
            ]
        );
    }

    #[test]
    fn forward_branch_delta_is_relative_to_opcode() {
        let mut asm = FunctionAsm::new();
        asm.load_literal_true();
        let label = asm.branch_if_false();
        asm.load_literal(7);
        asm.bind(label);
        asm.method_end();

        // branch at offset 1, bound at offset 1 + 5 + 2 = 8 → delta 7.
        let bytes = asm.bytes();
        assert_eq!(bytes[1], Opcode::BranchIfFalseLong as u8);
        assert_eq!(i32::from_le_bytes(bytes[2..6].try_into().unwrap()), 7);
    }

    #[test]
    fn backward_branch_picks_short_form() {
        let mut asm = FunctionAsm::new();
        let top = asm.current_offset();
        asm.load_local(0);
        asm.branch_back(top);
        let bytes = asm.bytes();
        assert_eq!(bytes[1], Opcode::BranchBack as u8);
        assert_eq!(bytes[2], 1); // delta from opcode back to offset 0
    }

    #[test]
    fn backward_branch_long_form() {
        let mut asm = FunctionAsm::new();
        let top = asm.current_offset();
        for _ in 0..150 {
            asm.load_local(3); // 2 bytes each
        }
        asm.branch_back(top);
        let bytes = asm.bytes();
        assert_eq!(bytes[300], Opcode::BranchBackLong as u8);
        assert_eq!(i32::from_le_bytes(bytes[301..305].try_into().unwrap()), 300);
    }

    #[test]
    fn subroutine_pair_deltas() {
        let mut asm = FunctionAsm::new();
        let call = asm.subroutine_call(); // offset 0, 9 bytes
        asm.load_literal_null(); // offset 9
        let body = asm.current_offset(); // 10
        asm.bind_subroutine(&call);
        asm.pop(); // 10
        asm.subroutine_return(call); // at 11

        let bytes = asm.bytes();
        let delta = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
        let return_delta = i32::from_le_bytes(bytes[5..9].try_into().unwrap());
        assert_eq!(delta as usize, body);
        // SubroutineReturn at 11 jumps back by 11 - 9 = 2.
        assert_eq!(return_delta, 2);
    }

    #[test]
    fn unfold_literals_are_recorded() {
        let mut asm = FunctionAsm::new();
        asm.load_const_unfold(0);
        asm.allocate_unfold(1);
        asm.invoke_static_unfold(0);
        asm.method_end();

        assert_eq!(asm.literal_slots(), 2);
        let refs = asm.literal_refs();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].operand_pos, 1);
        assert_eq!(refs[0].literal, 0);
        assert_eq!(refs[1].literal, 1);
    }

    #[test]
    fn method_end_records_own_offset() {
        let mut asm = FunctionAsm::new();
        asm.frame_size(0);
        asm.load_literal_null();
        asm.method_end();
        let bytes = asm.bytes();
        let pos = bytes.len() - 5;
        assert_eq!(bytes[pos], Opcode::MethodEnd as u8);
        assert_eq!(
            i32::from_le_bytes(bytes[pos + 1..pos + 5].try_into().unwrap()),
            pos as i32
        );
    }

    #[test]
    fn catch_ranges_recorded() {
        let mut asm = FunctionAsm::new();
        asm.frame_size(1);
        let start = asm.current_offset();
        asm.load_literal(3);
        asm.throw();
        let end = asm.current_offset();
        let target = asm.current_offset();
        asm.pop();
        asm.method_end();
        asm.catch_range(start, end, target, 1);

        let ranges = asm.catch_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, start);
        assert_eq!(ranges[0].target, target);
        assert_eq!(ranges[0].height, 1);
    }
}
