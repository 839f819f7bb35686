use std::collections::HashSet;

use object::{Function, Value};

/// Breakpoint state for a process under a debug session.
///
/// Only the hooks the dispatcher needs: a breakpoint set consulted at
/// every safepoint, and a latch that suppresses the re-break when the
/// interpreter resumes at the breakpoint it just reported.
#[derive(Debug, Default)]
pub struct DebugInfo {
    breakpoints: HashSet<usize>,
    is_at_breakpoint: bool,
}

impl DebugInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breakpoint at a byte offset into `function`'s stream.
    pub fn set_breakpoint(&mut self, function: Value, offset: usize) {
        let function: &Function = unsafe { function.as_ref() };
        self.breakpoints
            .insert(function.bytecode_address_for(offset) as usize);
    }

    pub fn clear_breakpoint(&mut self, function: Value, offset: usize) {
        let function: &Function = unsafe { function.as_ref() };
        self.breakpoints
            .remove(&(function.bytecode_address_for(offset) as usize));
    }

    #[inline]
    pub fn should_break(&self, bcp: *const u8) -> bool {
        !self.breakpoints.is_empty() && self.breakpoints.contains(&(bcp as usize))
    }

    #[inline]
    pub fn is_at_breakpoint(&self) -> bool {
        self.is_at_breakpoint
    }

    #[inline]
    pub fn set_is_at_breakpoint(&mut self, value: bool) {
        self.is_at_breakpoint = value;
    }
}
