pub mod debug;
pub mod ffi;
pub mod heap;
pub mod interpreter;
pub mod lookup;
pub mod natives;
pub mod port;
pub mod process;
pub mod program;
pub mod stack_walker;

pub use debug::DebugInfo;
pub use heap::HeapSettings;
pub use interpreter::{clear_fast_engine, set_fast_engine, InterruptKind, Interpreter};
pub use port::Port;
pub use process::Process;
pub use program::{ClassId, FnId, Lit, Program, ProgramBuilder};
