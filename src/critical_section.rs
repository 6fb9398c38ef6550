//! Critical-section guarded statics (spec.md section 5/9).
//!
//! Four process-wide statics are unavoidable because ISRs must reach
//! them: the system-tick counter, the modem session, the GPS session, and
//! the storage engine. Spec.md section 5 describes the discipline: "before
//! any RMW of storage-clock alignment data or reading the 32 kHz-
//! incremented calendar, the main context disables the timer-capture-
//! interrupt bit, reads/writes, and restores." [`Shared`] wraps a value in
//! exactly that discipline, using the `critical-section` crate's global
//! critical-section implementation (which on the real target masks the
//! timer-capture interrupt; on host builds it's a no-op mutex) instead of
//! hand-rolling interrupt-enable save/restore.

use core::cell::RefCell;
use critical_section::Mutex;

/// A value reachable from both the ISR and the main exec context. Every
/// access goes through [`Shared::with`], which opens exactly one
/// critical section for the duration of the closure — mirroring the
/// "disable, read/write, restore" pattern spec.md requires rather than
/// leaving interrupts masked for longer than necessary.
pub struct Shared<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> Shared<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// Runs `f` with exclusive access to the wrapped value. Safe to call
    /// from either the main context or an ISR; nesting two `with` calls
    /// from the same context would deadlock on a real target, so callers
    /// must not call `with` recursively.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|cs| {
            let cell = self.inner.borrow(cs);
            let mut value = cell.borrow_mut();
            f(&mut value)
        })
    }
}
