//! Frame pool integration tests.

use mikros_kernel::memory::frames::{FramePool, INVALID_FRAME};

const POOL_BASE: u32 = 512;
const POOL_FRAMES: u32 = 16;

fn fresh_pool() -> FramePool {
    FramePool::new(POOL_BASE, POOL_FRAMES)
}

/// Contract: allocations are contiguous and first-fit from the pool base.
/// Given: A fresh pool of 16 frames starting at frame 512.
/// When: Two runs of 4 frames are allocated.
/// Then: The runs start at 512 and 516 and the free count drops by 8.
#[test]
fn test_get_frames_returns_contiguous_runs_from_base() {
    let pool = fresh_pool();

    let first = pool.get_frames(4);
    let second = pool.get_frames(4);

    assert_eq!(first, POOL_BASE, "first run must start at the pool base");
    assert_eq!(second, POOL_BASE + 4, "second run must follow the first");
    assert_eq!(
        pool.free_frame_count(),
        POOL_FRAMES - 8,
        "free count must reflect both allocations"
    );
}

/// Contract: exhaustion yields the invalid-frame sentinel.
/// Given: A fresh pool of 16 frames.
/// When: A run larger than the pool is requested, then the whole pool, then
///       one more frame.
/// Then: The oversized request and the post-exhaustion request return 0.
#[test]
fn test_get_frames_exhaustion_returns_invalid_sentinel() {
    let pool = fresh_pool();

    assert_eq!(
        pool.get_frames(POOL_FRAMES + 1),
        INVALID_FRAME,
        "oversized request must fail with the sentinel"
    );

    assert_eq!(pool.get_frames(POOL_FRAMES), POOL_BASE);
    assert_eq!(
        pool.get_frames(1),
        INVALID_FRAME,
        "exhausted pool must fail with the sentinel"
    );
}

/// Contract: release recovers the run length from the head frame alone.
/// Given: A run of 5 frames allocated from a fresh pool.
/// When: The run is released by its first frame number.
/// Then: All 5 frames return to the pool and can be re-allocated.
#[test]
fn test_release_frames_frees_whole_sequence_by_head() {
    let pool = fresh_pool();

    let run = pool.get_frames(5);
    assert_eq!(pool.free_frame_count(), POOL_FRAMES - 5);

    assert!(pool.release_frames(run), "releasing the head must succeed");
    assert_eq!(
        pool.free_frame_count(),
        POOL_FRAMES,
        "all frames of the run must be free again"
    );

    assert_eq!(
        pool.get_frames(POOL_FRAMES),
        POOL_BASE,
        "the full pool must be allocatable after the release"
    );
}

/// Contract: only sequence heads are releasable.
/// Given: A run of 3 frames.
/// When: Release is attempted on a continuation frame, a free frame, and an
///       out-of-range frame number.
/// Then: Every attempt is rejected and the free count is unchanged.
#[test]
fn test_release_frames_rejects_non_heads() {
    let pool = fresh_pool();

    let run = pool.get_frames(3);

    assert!(
        !pool.release_frames(run + 1),
        "continuation frame must not be releasable"
    );
    assert!(
        !pool.release_frames(run + 3),
        "free frame must not be releasable"
    );
    assert!(
        !pool.release_frames(POOL_BASE + POOL_FRAMES),
        "frame outside the pool must not be releasable"
    );
    assert_eq!(pool.free_frame_count(), POOL_FRAMES - 3);
}

/// Contract: first-fit skips holes that are too small.
/// Given: Three 2-frame runs with the middle one released.
/// When: A 3-frame run is requested.
/// Then: The request fails until a large-enough hole exists, then allocates
///       from the lowest fitting position.
#[test]
fn test_get_frames_first_fit_skips_small_holes() {
    let pool = FramePool::new(POOL_BASE, 8);

    let a = pool.get_frames(2);
    let b = pool.get_frames(2);
    let _c = pool.get_frames(2);

    assert!(pool.release_frames(b));
    assert_eq!(
        pool.get_frames(3),
        INVALID_FRAME,
        "two separate 2-frame holes must not satisfy a 3-frame request"
    );

    assert!(pool.release_frames(a));
    assert_eq!(
        pool.get_frames(3),
        POOL_BASE,
        "merged 4-frame hole must satisfy the request at its lowest frame"
    );
}
