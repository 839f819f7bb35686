use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bytecode::{well_known, FunctionAsm, Opcode};
use vm::natives::install_number_builtins;
use vm::{HeapSettings, Interpreter, Process, ProgramBuilder};

/// A counting loop exercising the dispatch fast paths: local loads,
/// builtin-alias invokes through the lookup cache, and back-branches.
fn counting_loop(iterations: i32) -> vm::Program {
    let mut builder = ProgramBuilder::new();
    install_number_builtins(&mut builder);

    let mut asm = FunctionAsm::new();
    asm.frame_size(4);
    asm.load_literal(0); // i
    let top = asm.current_offset();
    asm.load_local(0);
    asm.load_literal(1);
    asm.invoke(Opcode::InvokeAdd, well_known::ADD);
    asm.store_local(1);
    asm.pop();
    asm.load_local(0);
    asm.load_literal(iterations);
    asm.invoke(Opcode::InvokeLt, well_known::LT);
    asm.branch_back_if_true(top);
    asm.load_literal_true();
    asm.process_yield();
    asm.method_end();

    let entry = builder.add_function(0, asm, Vec::new());
    builder.set_entry(entry);
    builder.build()
}

fn bench_dispatch(c: &mut Criterion) {
    let program = Arc::new(counting_loop(10_000));

    c.bench_function("counting_loop_10k", |b| {
        b.iter(|| {
            let mut process =
                Process::spawn(Arc::clone(&program), HeapSettings::default(), &[]);
            let mut interpreter = Interpreter::new(&mut process);
            interpreter.run();
            black_box(interpreter.interruption())
        })
    });
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
