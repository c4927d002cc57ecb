//! Interrupt-masking spinlock guarding process-global kernel state.
//!
//! The scheduler queues, the paging configuration and the frame-pool maps
//! all sit behind one of these. On this uniprocessor core the protection
//! that matters is the interrupt mask: with IF cleared nothing can preempt
//! the critical section, so the atomic flag is only load-bearing if the
//! image ever runs on more than one CPU. The guard records the interrupt
//! state found at entry and restores exactly that on release, so a lock
//! taken from an interrupts-off context never turns them back on.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::machine;

pub struct SpinLock<T> {
    held: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY:
// - `held` serializes all access to `value`, and the interrupt mask keeps a
//   handler on the same CPU from re-entering the critical section.
// - Handing the lock to another thread moves `T` with it, hence `T: Send`.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Masks interrupts, acquires the lock and returns the access guard.
    ///
    /// Contention spins on a plain load and only attempts the atomic swap
    /// once the flag reads free. Dropping the guard releases the lock and
    /// puts the interrupt flag back the way this call found it.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let restore_interrupts = machine::interrupts_enabled();
        machine::disable_interrupts();

        loop {
            if !self.held.load(Ordering::Relaxed) && !self.held.swap(true, Ordering::Acquire) {
                break;
            }
            hint::spin_loop();
        }

        SpinGuard {
            lock: self,
            restore_interrupts,
        }
    }
}

/// Exclusive view of the locked value; releases on drop.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
    restore_interrupts: bool,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard exists only between a successful acquire and the
        // release in `drop`, so no other view of `value` is live.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: same exclusivity argument as `deref`.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
        // Only the outermost guard saw interrupts enabled, so nesting keeps
        // them masked until the whole critical section unwinds.
        if self.restore_interrupts {
            machine::enable_interrupts();
        }
    }
}
