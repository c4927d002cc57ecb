//! Thread handles and the context-switch contract.
//!
//! The scheduler never switches contexts itself: stack setup, the switch and
//! stack teardown are the embedder's primitives, reached through the
//! callback set below. Tests install a recording backend.

use core::cell::UnsafeCell;

/// Opaque handle to a thread control block owned by the embedder.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ThreadId(pub usize);

/// Context-switch primitives imported by the scheduler.
#[derive(Clone, Copy)]
pub struct ThreadOps {
    /// The thread presently executing on the CPU, if any.
    pub current: fn() -> Option<ThreadId>,
    /// Saves the current context and resumes `ThreadId`.
    pub dispatch_to: fn(ThreadId),
    /// Tears down a terminated thread's stack. Called only for zombies, so
    /// the target is guaranteed not to be running.
    pub destroy: fn(ThreadId),
}

fn missing_current() -> Option<ThreadId> {
    panic!("thread backend not installed: current");
}

fn missing_dispatch_to(_thread: ThreadId) {
    panic!("thread backend not installed: dispatch_to");
}

fn missing_destroy(_thread: ThreadId) {
    panic!("thread backend not installed: destroy");
}

impl ThreadOps {
    const fn missing() -> Self {
        Self {
            current: missing_current,
            dispatch_to: missing_dispatch_to,
            destroy: missing_destroy,
        }
    }
}

struct GlobalThreadOps {
    ops: UnsafeCell<ThreadOps>,
}

// SAFETY:
// - The backend is installed once during bring-up (or under the test guard)
//   before concurrent use; afterwards the struct is only copied out.
unsafe impl Sync for GlobalThreadOps {}

static THREADS: GlobalThreadOps = GlobalThreadOps {
    ops: UnsafeCell::new(ThreadOps::missing()),
};

/// Installs the context-switch backend.
pub fn install(ops: ThreadOps) {
    // SAFETY: see `GlobalThreadOps` — single writer during bring-up.
    unsafe {
        *THREADS.ops.get() = ops;
    }
}

#[inline]
fn ops() -> ThreadOps {
    // SAFETY: copies the plain-data callback struct; see `GlobalThreadOps`.
    unsafe { *THREADS.ops.get() }
}

/// The thread presently executing on the CPU.
#[inline]
pub fn current() -> Option<ThreadId> {
    (ops().current)()
}

/// Context-switches to `thread`.
#[inline]
pub fn dispatch_to(thread: ThreadId) {
    (ops().dispatch_to)(thread)
}

/// Destroys `thread`'s stack and control block.
#[inline]
pub fn destroy(thread: ThreadId) {
    (ops().destroy)(thread)
}
