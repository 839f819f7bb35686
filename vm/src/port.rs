use std::sync::atomic::{AtomicBool, Ordering};

/// An addressable mailbox for cross-process handoff.
///
/// The core only knows the locked-state convention: a port returned from
/// an `InvokeNativeYield` native is locked, and the embedder must unlock
/// it after consuming the `TargetYield`. The address doubles as the
/// handoff token, so ports keep word alignment.
#[derive(Debug, Default)]
#[repr(align(8))]
pub struct Port {
    locked: AtomicBool,
}

impl Port {
    pub fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}
