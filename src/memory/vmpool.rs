//! Per-address-space virtual memory pools.
//!
//! A pool hands out page-aligned regions from one contiguous virtual segment.
//! Its bookkeeping lives inside the segment itself: the first page holds the
//! allocated-region list, the second the free-region list, both as arrays of
//! `(start, length)` pairs terminated by `(0, 0)`. The constructor writes to
//! those pages before any frame backs them; the resulting faults are served
//! by the demand allocator, which is why a pool registers with its page
//! table *before* the first metadata touch and why [`VMPool::is_legitimate`]
//! answers for the metadata range without reading memory.

use alloc::boxed::Box;

use crate::arch::machine;
use crate::logging;
use crate::memory::frames::FramePool;
use crate::memory::paging::{PageTable, ENTRIES_PER_TABLE, PAGE_SIZE};

/// Maximum live `(start, length)` pairs per metadata list; one pair slot is
/// always left for the terminator.
pub const MAX_REGIONS: u32 = ENTRIES_PER_TABLE / 2 - 1;

/// Pairs stored in one metadata page, terminator slot included.
const PAIRS_PER_PAGE: u32 = ENTRIES_PER_TABLE / 2;

#[inline]
fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Virtual memory region manager for one segment of an address space.
pub struct VMPool {
    base: u32,
    size: u32,
    /// Pool backing this segment's pages. Demand faults draw from the
    /// process-wide pool configured in `paging::init`; the reference is
    /// recorded for the segment's ownership contract.
    #[allow(dead_code)]
    frame_pool: &'static FramePool,
    page_table: &'static PageTable,
}

impl VMPool {
    /// Creates a pool governing `[base, base + size)` and registers it with
    /// `page_table`.
    ///
    /// `size` is rounded up to a page multiple. The returned reference is
    /// leaked: pools live for the lifetime of their address space, and the
    /// page table keeps referring to them from the fault path.
    pub fn new(
        base: u32,
        size: u32,
        frame_pool: &'static FramePool,
        page_table: &'static PageTable,
    ) -> &'static VMPool {
        assert!(base % PAGE_SIZE == 0, "pool base must be page-aligned");
        let size = align_up(size, PAGE_SIZE);
        assert!(
            size > 2 * PAGE_SIZE,
            "pool must be larger than its two metadata pages"
        );

        let pool = Box::leak(Box::new(VMPool {
            base,
            size,
            frame_pool,
            page_table,
        }));

        // Registration must precede the metadata writes below: the writes
        // fault, and in strict mode the fault handler consults the
        // registered pools to validate the address.
        page_table.register_pool(pool);

        // The allocated list starts with the two metadata pages themselves.
        pool.write_pair(pool.alloc_list(), 0, base, PAGE_SIZE);
        pool.write_pair(pool.alloc_list(), 1, base + PAGE_SIZE, PAGE_SIZE);
        for index in 2..PAIRS_PER_PAGE {
            pool.write_pair(pool.alloc_list(), index, 0, 0);
        }

        // The free list starts with one span covering the rest of the pool.
        pool.write_pair(pool.free_list(), 0, base + 2 * PAGE_SIZE, size - 2 * PAGE_SIZE);
        for index in 1..PAIRS_PER_PAGE {
            pool.write_pair(pool.free_list(), index, 0, 0);
        }

        logging::logln(
            "vmpool",
            format_args!("constructed VM pool [{:#010x}, {:#010x})", base, base + size),
        );

        pool
    }

    /// First byte of the segment this pool governs.
    pub fn base_address(&self) -> u32 {
        self.base
    }

    /// Size of the segment in bytes (page multiple).
    pub fn size(&self) -> u32 {
        self.size
    }

    fn alloc_list(&self) -> u32 {
        self.base
    }

    fn free_list(&self) -> u32 {
        self.base + PAGE_SIZE
    }

    fn read_pair(&self, list: u32, index: u32) -> (u32, u32) {
        let addr = list + index * 8;
        (machine::read_mem(addr), machine::read_mem(addr + 4))
    }

    fn write_pair(&self, list: u32, index: u32, start: u32, length: u32) {
        let addr = list + index * 8;
        machine::write_mem(addr, start);
        machine::write_mem(addr + 4, length);
    }

    /// Removes pair `index` and shifts the following pairs down one slot,
    /// keeping live entries contiguous from slot 0.
    fn remove_pair(&self, list: u32, index: u32) {
        for i in index..MAX_REGIONS - 1 {
            let (start, length) = self.read_pair(list, i + 1);
            self.write_pair(list, i, start, length);
        }
        self.write_pair(list, MAX_REGIONS - 1, 0, 0);
    }

    /// Appends `(start, length)` to the first empty slot of `list`.
    fn append_pair(&self, list: u32, start: u32, length: u32, what: &str) {
        for index in 0..MAX_REGIONS {
            let (_, slot_length) = self.read_pair(list, index);
            if slot_length == 0 {
                self.write_pair(list, index, start, length);
                return;
            }
        }
        panic!("{} list of pool at {:#010x} is full", what, self.base);
    }

    /// Allocates a page-aligned region of at least `size` bytes and returns
    /// its start address.
    ///
    /// First-fit over the free list; an exactly-matching span is consumed
    /// whole, a larger one is shrunk from the front. Panics when no span is
    /// large enough or the allocated list is full.
    pub fn allocate(&self, size: u32) -> u32 {
        assert!(size > 0, "cannot allocate an empty region");
        let size = align_up(size, PAGE_SIZE);

        let mut found = None;
        for index in 0..MAX_REGIONS {
            let (start, length) = self.read_pair(self.free_list(), index);
            if length == 0 {
                break;
            }
            if length >= size {
                found = Some((index, start, length));
                break;
            }
        }
        let Some((index, start, length)) = found else {
            panic!(
                "pool at {:#010x} has no free span of {:#x} bytes",
                self.base, size
            );
        };

        if length > size {
            self.write_pair(self.free_list(), index, start + size, length - size);
        } else {
            self.remove_pair(self.free_list(), index);
        }

        self.append_pair(self.alloc_list(), start, size, "allocated-region");

        logging::logln(
            "vmpool",
            format_args!("allocated region [{:#010x}, {:#010x})", start, start + size),
        );

        start
    }

    /// Releases the region previously returned by [`Self::allocate`] at
    /// `start`.
    ///
    /// Frees the backing frame of every page in the region via
    /// [`PageTable::free_page`], then moves the span from the allocated list
    /// to the free list. Adjacent free spans are not merged.
    pub fn release(&self, start: u32) {
        let mut found = None;
        for index in 0..MAX_REGIONS {
            let (slot_start, slot_length) = self.read_pair(self.alloc_list(), index);
            if slot_length == 0 {
                break;
            }
            if slot_start == start {
                found = Some((index, slot_length));
                break;
            }
        }
        let Some((index, length)) = found else {
            panic!(
                "release of {:#010x} which pool at {:#010x} never allocated",
                start, self.base
            );
        };

        assert!(
            start % PAGE_SIZE == 0 && length % PAGE_SIZE == 0,
            "allocated list entry is not page-aligned"
        );

        // The entry stays on the allocated list while the pages are freed:
        // free_page revalidates each address against the registered pools.
        for page_no in start / PAGE_SIZE..(start + length) / PAGE_SIZE {
            self.page_table.free_page(page_no);
        }

        self.remove_pair(self.alloc_list(), index);
        self.append_pair(self.free_list(), start, length, "free-region");

        logging::logln(
            "vmpool",
            format_args!("released region [{:#010x}, {:#010x})", start, start + length),
        );
    }

    /// Whether `addr` lies in the metadata pages or any allocated region.
    ///
    /// The metadata answer is pure range arithmetic: this function is called
    /// from the fault handler while the metadata pages themselves may still
    /// be unmapped, and must not fault.
    pub fn is_legitimate(&self, addr: u32) -> bool {
        if addr >= self.base && addr - self.base < 2 * PAGE_SIZE {
            return true;
        }

        for index in 0..MAX_REGIONS {
            let (start, length) = self.read_pair(self.alloc_list(), index);
            if length == 0 {
                break;
            }
            if addr >= start && addr - start < length {
                return true;
            }
        }
        false
    }
}
