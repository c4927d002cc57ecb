//! FIFO ready-queue scheduler with disk-aware dispatch.
//!
//! Threads leave the CPU only through [`yield_now`]. When a non-blocking
//! disk is installed, dispatch prefers the head of its I/O-waiter queue
//! whenever the device is ready (or the yield was triggered by the
//! completion interrupt) and a waiter exists; otherwise the head of the
//! ready queue runs. Termination parks the thread in a single zombie slot so
//! a thread never frees the stack it is still executing on; the next
//! termination performs the deferred teardown.

use alloc::vec::Vec;

use crate::arch::machine;
use crate::drivers::nonblocking::NonBlockingDisk;
use crate::logging;
use crate::scheduler::thread::{self, ThreadId};
use crate::sync::spinlock::SpinLock;

struct SchedulerState {
    /// FIFO of runnable threads; head at index 0.
    ready: Vec<ThreadId>,
    /// Most recently terminated thread, pending stack teardown.
    zombie: Option<ThreadId>,
    /// Disk whose waiter queue participates in dispatch, once installed.
    disk: Option<&'static NonBlockingDisk>,
}

impl SchedulerState {
    const fn new() -> Self {
        Self {
            ready: Vec::new(),
            zombie: None,
            disk: None,
        }
    }
}

static SCHED: SpinLock<SchedulerState> = SpinLock::new(SchedulerState::new());

/// Resets the scheduler: empty ready queue, no zombie, no disk.
pub fn init() {
    let mut sched = SCHED.lock();
    *sched = SchedulerState::new();
}

/// Couples `disk`'s I/O-waiter queue into dispatch decisions.
pub fn install_disk(disk: &'static NonBlockingDisk) {
    SCHED.lock().disk = Some(disk);
}

/// Appends `thread` to the tail of the ready queue.
pub fn resume(thread: ThreadId) {
    SCHED.lock().ready.push(thread);
}

/// Makes `thread` runnable for the first time. Identical to [`resume`].
pub fn add(thread: ThreadId) {
    resume(thread);
}

/// Number of threads currently on the ready queue.
pub fn ready_count() -> usize {
    SCHED.lock().ready.len()
}

/// The thread currently parked in the zombie slot, if any.
pub fn zombie_thread() -> Option<ThreadId> {
    SCHED.lock().zombie
}

fn pop_ready() -> Option<ThreadId> {
    let mut sched = SCHED.lock();
    if sched.ready.is_empty() {
        None
    } else {
        Some(sched.ready.remove(0))
    }
}

fn dispatch(next: ThreadId) {
    // The queue locks are released; re-enable interrupts before the switch
    // so the dispatched thread does not run with them masked.
    if !machine::interrupts_enabled() {
        machine::enable_interrupts();
    }
    thread::dispatch_to(next);
}

/// Gives up the CPU.
///
/// `from_interrupt` marks a yield triggered by the disk completion IRQ: the
/// device is then treated as ready regardless of what its status register
/// reads, which lets the completion prefer an I/O waiter.
///
/// With no runnable thread the call returns and the current thread keeps
/// running. Panics when no thread is on the CPU at all.
pub fn yield_now(from_interrupt: bool) {
    assert!(
        thread::current().is_some(),
        "yield with no current thread"
    );

    let disk = SCHED.lock().disk;

    let disk_busy = if from_interrupt {
        false
    } else {
        disk.map(|d| d.is_busy()).unwrap_or(false)
    };
    let waiters_empty = disk.map(|d| d.waiters_empty()).unwrap_or(true);

    if disk_busy || waiters_empty {
        if let Some(next) = pop_ready() {
            dispatch(next);
        }
    } else if let Some(next) = disk.and_then(|d| d.pop_waiter()) {
        dispatch(next);
    }
}

/// Terminates `thread`.
///
/// The previous zombie's stack is torn down, then `thread` takes its place
/// in the zombie slot. When the caller terminates itself the call yields and
/// the thread is never dispatched again.
pub fn terminate(thread: ThreadId) {
    let previous = SCHED.lock().zombie.replace(thread);
    if let Some(zombie) = previous {
        thread::destroy(zombie);
    }
    logging::logln("sched", format_args!("terminated thread {}", thread.0));

    if thread::current() == Some(thread) {
        yield_now(false);
    }
}
