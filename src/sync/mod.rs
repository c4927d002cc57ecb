//! Synchronization primitives.
//!
//! [`spinlock::SpinLock`] masks interrupts and busy-waits; it guards the
//! short critical sections of process-global kernel state. The disk driver
//! uses [`yieldlock::YieldLock`], which yields the CPU on contention instead
//! of spinning.

pub mod spinlock;
pub mod yieldlock;
