//! Round-robin extension of the base scheduler.
//!
//! Identical dispatch policy; the only difference is that every yield
//! restarts the end-of-quantum timer, so a thread that gives up the CPU
//! voluntarily hands its successor a full quantum.

use crate::scheduler::{self, timer};

/// Round-robin yield: restart the quantum, then dispatch like the base
/// scheduler.
pub fn yield_now(from_interrupt: bool) {
    timer::reset_ticks();
    scheduler::yield_now(from_interrupt);
}
