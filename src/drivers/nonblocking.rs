//! Non-blocking block I/O coupled to the scheduler.
//!
//! A thread issuing I/O first enqueues itself on the waiter queue, performs
//! the raw transfer with a *yielding* busy-wait, then re-enters the ready
//! queue and yields. The completion interrupt re-enters the scheduler with
//! the interrupt flag set, which makes dispatch prefer the waiter-queue head
//! over ready threads (see the scheduler's yield).
//!
//! Two locks serialize the driver: `hw_lock` covers the controller
//! registers, the waiter queue has its own lock. Both yield on contention
//! and are never held across a context switch by the holding thread.

use alloc::vec::Vec;

use crate::arch::machine::{self, ExceptionFrame};
use crate::drivers::blockdev::SimpleDisk;
use crate::logging;
use crate::scheduler::{self, thread, thread::ThreadId};
use crate::sync::yieldlock::YieldLock;

/// Non-blocking disk driver.
pub struct NonBlockingDisk {
    base: SimpleDisk,
    /// FIFO of threads whose most recent action was a disk request.
    waiters: YieldLock<Vec<ThreadId>>,
    /// Serializes access to the controller registers.
    hw_lock: YieldLock<()>,
}

impl NonBlockingDisk {
    /// Driver for a disk of `size` bytes.
    pub fn new(size: u32) -> Self {
        Self {
            base: SimpleDisk::new(size),
            waiters: YieldLock::new(Vec::new()),
            hw_lock: YieldLock::new(()),
        }
    }

    /// Whether the controller currently reports busy.
    pub fn is_busy(&self) -> bool {
        self.base.is_busy()
    }

    /// Yielding busy-wait: gives up the CPU while the hardware is busy.
    fn wait_while_busy(disk: &SimpleDisk) {
        while disk.is_busy() {
            scheduler::yield_now(false);
        }
    }

    fn enqueue_current(&self) -> ThreadId {
        let current = thread::current().expect("disk I/O with no current thread");
        self.waiters.lock().push(current);
        current
    }

    /// Reads block `block_no` into the front of `buf` (≥ 512 bytes).
    pub fn read(&self, block_no: u32, buf: &mut [u8]) {
        let current = self.enqueue_current();

        {
            let _hw = self.hw_lock.lock();
            self.base.read_with(block_no, buf, Self::wait_while_busy);
        }

        logging::logln("disk", format_args!("read issued for block {}", block_no));

        // Back of the ready queue; the completion IRQ will pick this thread
        // from the waiter queue when the device signals.
        scheduler::resume(current);
        scheduler::yield_now(false);
    }

    /// Writes block `block_no` from the front of `buf` (≥ 512 bytes).
    pub fn write(&self, block_no: u32, buf: &[u8]) {
        let current = self.enqueue_current();

        {
            let _hw = self.hw_lock.lock();
            self.base.write_with(block_no, buf, Self::wait_while_busy);
        }

        logging::logln("disk", format_args!("write issued for block {}", block_no));

        scheduler::resume(current);
        scheduler::yield_now(false);
    }

    /// Completion-IRQ entry point.
    ///
    /// Acknowledges the interrupt controller, puts the interrupted thread
    /// back on the ready tail and yields with the interrupt flag set, so the
    /// scheduler treats the device as ready and dispatches an I/O waiter.
    pub fn handle_interrupt(&self, _frame: &ExceptionFrame) {
        machine::end_of_interrupt();
        logging::logln("disk", format_args!("completion interrupt"));

        let current = thread::current().expect("disk interrupt with no current thread");
        scheduler::resume(current);
        scheduler::yield_now(true);
    }

    /// Whether no thread is waiting for disk completion.
    pub fn waiters_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Number of threads on the waiter queue.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Dequeues the head of the waiter queue.
    pub fn pop_waiter(&self) -> Option<ThreadId> {
        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            None
        } else {
            Some(waiters.remove(0))
        }
    }
}
