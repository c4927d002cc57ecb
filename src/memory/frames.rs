//! Physical frame pool: contiguous runs of 4 KiB frames.
//!
//! Each pool manages one frame range with a packed two-bit state map:
//! a frame is free, the head of an allocated sequence, or a continuation of
//! the sequence started at the nearest head below it. Recording the head lets
//! [`FramePool::release_frames`] recover the run length from the first frame
//! number alone.

use alloc::vec;
use alloc::vec::Vec;

use crate::sync::spinlock::SpinLock;

/// Bytes per physical page frame.
pub const FRAME_SIZE: u32 = 4096;

/// Frame number returned by [`FramePool::get_frames`] on exhaustion.
///
/// Frame 0 backs the real-mode IVT/BIOS area and is never handed out, so it
/// doubles as the failure sentinel.
pub const INVALID_FRAME: u32 = 0;

const BITS_PER_FRAME: u32 = 2;
const FRAMES_PER_WORD: u32 = 64 / BITS_PER_FRAME;
const STATE_MASK: u64 = 0b11;

const STATE_FREE: u64 = 0b00;
const STATE_HEAD: u64 = 0b01;
const STATE_CONT: u64 = 0b10;

struct FramePoolState {
    base_frame: u32,
    frame_count: u32,
    free_frames: u32,
    map: Vec<u64>,
}

impl FramePoolState {
    fn state(&self, index: u32) -> u64 {
        let word = (index / FRAMES_PER_WORD) as usize;
        let shift = (index % FRAMES_PER_WORD) * BITS_PER_FRAME;
        (self.map[word] >> shift) & STATE_MASK
    }

    fn set_state(&mut self, index: u32, state: u64) {
        let word = (index / FRAMES_PER_WORD) as usize;
        let shift = (index % FRAMES_PER_WORD) * BITS_PER_FRAME;
        self.map[word] = (self.map[word] & !(STATE_MASK << shift)) | (state << shift);
    }

    /// First-fit scan for `count` contiguous free frames.
    fn find_free_run(&self, count: u32) -> Option<u32> {
        let mut run_start = 0u32;
        let mut run_len = 0u32;

        for index in 0..self.frame_count {
            if self.state(index) == STATE_FREE {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }

        None
    }
}

/// Allocator of contiguous physical frame runs.
pub struct FramePool {
    inner: SpinLock<FramePoolState>,
}

impl FramePool {
    /// Creates a pool managing frames `[base_frame, base_frame + frame_count)`.
    ///
    /// All frames start free. `base_frame` must be non-zero so the failure
    /// sentinel stays unambiguous.
    pub fn new(base_frame: u32, frame_count: u32) -> Self {
        assert!(base_frame != 0, "frame 0 is reserved as the failure sentinel");
        assert!(frame_count > 0, "frame pool must manage at least one frame");

        let words = frame_count.div_ceil(FRAMES_PER_WORD) as usize;
        Self {
            inner: SpinLock::new(FramePoolState {
                base_frame,
                frame_count,
                free_frames: frame_count,
                map: vec![0; words],
            }),
        }
    }

    /// Allocates `count` contiguous frames and returns the first frame number,
    /// or [`INVALID_FRAME`] when no run of that length is free.
    pub fn get_frames(&self, count: u32) -> u32 {
        assert!(count > 0, "cannot allocate an empty frame run");
        let mut state = self.inner.lock();

        let Some(start) = state.find_free_run(count) else {
            return INVALID_FRAME;
        };

        state.set_state(start, STATE_HEAD);
        for index in start + 1..start + count {
            state.set_state(index, STATE_CONT);
        }
        state.free_frames -= count;

        state.base_frame + start
    }

    /// Releases the run whose head is `first`, as returned by
    /// [`Self::get_frames`].
    ///
    /// Returns `false` when `first` is outside the pool or is not the head of
    /// an allocated sequence.
    pub fn release_frames(&self, first: u32) -> bool {
        let mut state = self.inner.lock();

        if first < state.base_frame || first >= state.base_frame + state.frame_count {
            return false;
        }

        let head = first - state.base_frame;
        if state.state(head) != STATE_HEAD {
            return false;
        }

        state.set_state(head, STATE_FREE);
        state.free_frames += 1;

        let mut index = head + 1;
        while index < state.frame_count && state.state(index) == STATE_CONT {
            state.set_state(index, STATE_FREE);
            state.free_frames += 1;
            index += 1;
        }

        true
    }

    /// Number of frames currently free in this pool.
    pub fn free_frame_count(&self) -> u32 {
        self.inner.lock().free_frames
    }

    /// Total number of frames managed by this pool.
    pub fn frame_count(&self) -> u32 {
        self.inner.lock().frame_count
    }

    /// First frame number managed by this pool.
    pub fn base_frame(&self) -> u32 {
        self.inner.lock().base_frame
    }
}
