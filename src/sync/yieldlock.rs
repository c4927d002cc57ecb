//! Spin-with-yield lock for disk hardware and queue access.
//!
//! On a uniprocessor, disabling interrupts makes the flag test-and-set
//! atomic; the flag itself only prevents nested entry from another thread.
//! A contended acquire re-enables interrupts and yields the CPU instead of
//! spinning, so the holder can run and release. The lock must never be held
//! across a context switch performed by the holding thread, and interrupt
//! handlers must not take it.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::machine;
use crate::scheduler;

pub struct YieldLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

impl<T> YieldLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> YieldLockGuard<'_, T> {
        loop {
            if machine::interrupts_enabled() {
                machine::disable_interrupts();
            }

            if self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                machine::enable_interrupts();
                return YieldLockGuard { lock: self };
            }

            // Could not acquire: let the holder run and try again.
            machine::enable_interrupts();
            scheduler::yield_now(false);
        }
    }
}

pub struct YieldLockGuard<'a, T> {
    lock: &'a YieldLock<T>,
}

impl<T> Deref for YieldLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY:
        // - The lock guarantees exclusive access while the guard lives.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for YieldLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY:
        // - The lock guarantees exclusive access while the guard lives.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for YieldLockGuard<'_, T> {
    fn drop(&mut self) {
        if machine::interrupts_enabled() {
            machine::disable_interrupts();
        }
        // Only the holder reaches this point, so releasing is plain.
        self.lock.locked.store(false, Ordering::Release);
        machine::enable_interrupts();
    }
}

// SAFETY:
// - Access to `data` is synchronized via the lock flag.
// - `T: Send` ensures it is safe to transfer ownership across threads.
unsafe impl<T: Send> Sync for YieldLock<T> {}
unsafe impl<T: Send> Send for YieldLock<T> {}
