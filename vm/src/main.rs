use std::sync::Arc;

use clap::Parser;

use bytecode::{well_known, FunctionAsm, Opcode};
use object::Value;
use vm::natives::install_number_builtins;
use vm::{HeapSettings, Interpreter, Process, ProgramBuilder};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a demo program on the faden interpreter", long_about = None)]
struct Cli {
    /// Demo to run: "sum" or "fib"
    #[arg(default_value = "sum")]
    demo: String,

    /// Input for the demo (iterations for sum, n for fib)
    #[arg(short, long, default_value_t = 20)]
    n: i64,

    /// Re-walk the frame chain before every dispatch
    #[arg(long)]
    validate_stack: bool,

    /// Heap chunk size in bytes
    #[arg(long, default_value_t = 256 * 1024)]
    heap_chunk: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let program = match cli.demo.as_str() {
        "sum" => build_sum(cli.n),
        "fib" => build_fib(cli.n),
        other => {
            eprintln!("unknown demo '{other}' (expected: sum, fib)");
            std::process::exit(2);
        }
    };

    let settings = HeapSettings {
        chunk_size: cli.heap_chunk,
        validate_stack: cli.validate_stack,
        ..Default::default()
    };
    let mut process = Process::spawn(Arc::new(program), settings, &[]);
    let mut interpreter = Interpreter::new(&mut process);
    interpreter.run();
    let interruption = interpreter.interruption();

    let result = top_of_stack(&process);
    println!("{:?} → {:?}", interruption, result);
}

/// The value below the saved bcp and the yield result.
fn top_of_stack(process: &Process) -> Value {
    let stack: &object::Stack = unsafe { process.stack().as_ref() };
    unsafe { stack.slot(stack.top() - 2) }
}

/// Sums 1..=n with a counting loop driven by `InvokeAdd`/`InvokeGt`.
fn build_sum(n: i64) -> vm::Program {
    let mut builder = ProgramBuilder::new();
    install_number_builtins(&mut builder);

    // Frame: [sum, i]; loop while i <= n.
    let mut asm = FunctionAsm::new();
    asm.frame_size(6);
    asm.load_literal(0); // sum
    asm.load_literal(1); // i
    let top = asm.current_offset();
    // sum = sum + i
    asm.load_local(1);
    asm.load_local(1);
    asm.invoke(Opcode::InvokeAdd, well_known::ADD);
    asm.store_local(2);
    asm.pop();
    // i = i + 1
    asm.load_local(0);
    asm.load_literal(1);
    asm.invoke(Opcode::InvokeAdd, well_known::ADD);
    asm.store_local(1);
    asm.pop();
    // continue while i <= n
    asm.load_local(0);
    asm.load_literal(i32::try_from(n).expect("demo input fits i32"));
    asm.invoke(Opcode::InvokeLe, well_known::LE);
    asm.branch_back_if_true(top);
    // leave the sum on top and yield
    asm.pop();
    asm.load_literal_false();
    asm.process_yield();
    asm.method_end();

    let entry = builder.add_function(0, asm, Vec::new());
    builder.set_entry(entry);
    builder.build()
}

/// Naive recursive fibonacci over `InvokeStatic`.
fn build_fib(n: i64) -> vm::Program {
    let mut builder = ProgramBuilder::new();
    install_number_builtins(&mut builder);

    let fib_id = builder.next_function_id();

    let mut fib = FunctionAsm::new();
    fib.frame_size(4);
    fib.load_local(1); // n
    fib.load_literal(2);
    fib.invoke(Opcode::InvokeLt, well_known::LT);
    let base_case = fib.branch_if_true();
    // fib(n - 1) + fib(n - 2); the call-bearing arm falls through so
    // the walker's replayed heights stay exact at the call sites.
    fib.load_local(1);
    fib.load_literal(1);
    fib.invoke(Opcode::InvokeSub, well_known::SUB);
    fib.invoke_static(fib_id.0 as i32);
    fib.load_local(2);
    fib.load_literal(2);
    fib.invoke(Opcode::InvokeSub, well_known::SUB);
    fib.invoke_static(fib_id.0 as i32);
    fib.invoke(Opcode::InvokeAdd, well_known::ADD);
    fib.return_(1, 1);
    fib.bind(base_case);
    fib.load_local(1);
    fib.return_(1, 1);
    fib.method_end();
    assert_eq!(builder.add_function(1, fib, Vec::new()), fib_id);

    let mut entry = FunctionAsm::new();
    entry.frame_size(3);
    entry.load_literal(i32::try_from(n).expect("demo input fits i32"));
    entry.invoke_static(fib_id.0 as i32);
    entry.load_literal_false();
    entry.process_yield();
    entry.method_end();
    let entry_id = builder.add_function(0, entry, Vec::new());
    builder.set_entry(entry_id);
    builder.build()
}
