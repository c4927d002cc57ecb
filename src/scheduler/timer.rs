//! End-of-quantum timer state.
//!
//! An external timer ISR calls [`on_tick`] once per hardware tick. When the
//! tick count reaches the quantum the round-robin scheduler preempts the
//! running thread; [`reset_ticks`] restarts the quantum and is invoked by
//! every round-robin yield so voluntary switches grant the next thread a
//! full quantum.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::scheduler::roundrobin;

/// Default quantum length in timer ticks.
pub const DEFAULT_QUANTUM: u32 = 10;

static TICKS: AtomicU32 = AtomicU32::new(0);
static QUANTUM: AtomicU32 = AtomicU32::new(DEFAULT_QUANTUM);

/// Ticks elapsed in the current quantum.
pub fn ticks() -> u32 {
    TICKS.load(Ordering::Acquire)
}

/// Restarts the current quantum.
pub fn reset_ticks() {
    TICKS.store(0, Ordering::Release);
}

/// Sets the quantum length in ticks and restarts the counter.
pub fn set_quantum(ticks: u32) {
    assert!(ticks > 0, "quantum must be at least one tick");
    QUANTUM.store(ticks, Ordering::Release);
    reset_ticks();
}

/// Timer-ISR entry: counts one tick and preempts on quantum expiry.
///
/// The expiry yield is a plain round-robin yield; the interrupt flag passed
/// to the scheduler signals *disk* completion, which a timer tick is not.
pub fn on_tick() {
    let elapsed = TICKS.fetch_add(1, Ordering::AcqRel) + 1;
    if elapsed >= QUANTUM.load(Ordering::Acquire) {
        roundrobin::yield_now(false);
    }
}
