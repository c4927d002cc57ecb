//! Two-level x86 paging with recursive self-mapping and demand allocation.
//!
//! Every page directory keeps its last entry pointing at itself. With that in
//! place the MMU exposes the directory at [`PD_WINDOW`] and every page table
//! at [`PT_WINDOW`], so the fault handler can edit translation structures
//! while paging is enabled. The constructor is the only code that touches
//! tables through their physical addresses (paging is still off, identity
//! mapping covers them); everything after construction goes through the
//! recursive windows.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::arch::machine::{self, ExceptionFrame};
use crate::logging;
use crate::memory::frames::{FramePool, INVALID_FRAME};
use crate::memory::vmpool::VMPool;
use crate::sync::spinlock::SpinLock;

/// Bytes per page; identical to the physical frame size.
pub const PAGE_SIZE: u32 = 4096;

/// Entries per page directory or page table.
pub const ENTRIES_PER_TABLE: u32 = 1024;

/// Virtual window onto the current page directory (PDE `i` at `| i << 2`).
pub const PD_WINDOW: u32 = 0xFFFF_F000;

/// Virtual window onto all page tables (PTE `k` of table `j` at
/// `| j << 12 | k << 2`).
pub const PT_WINDOW: u32 = 0xFFC0_0000;

const CR0_PROTECTION_ENABLE: u32 = 1 << 0;
const CR0_PAGING_ENABLE: u32 = 1 << 31;

/// Page-fault error-code bit 0: the fault hit a present mapping.
pub const ERR_PRESENT: u32 = 1 << 0;

bitflags! {
    /// Status bits of a page directory or page table entry.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct EntryFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

/// Entry value mapping `frame` with the given status bits.
#[inline]
fn entry(frame: u32, flags: EntryFlags) -> u32 {
    frame * PAGE_SIZE | flags.bits()
}

#[inline]
fn directory_index(va: u32) -> u32 {
    va >> 22
}

/// Virtual address of the PDE covering `va`, through the recursive window.
#[inline]
fn pde_address(va: u32) -> u32 {
    PD_WINDOW | (directory_index(va) << 2)
}

/// Virtual address of the PTE covering `va`, through the recursive window.
#[inline]
fn pte_address(va: u32) -> u32 {
    PT_WINDOW | ((va >> 12) << 2)
}

/// Virtual address of the page table covering `va`, through the window.
#[inline]
fn table_address(va: u32) -> u32 {
    PT_WINDOW | (directory_index(va) << 12)
}

struct PagingState {
    kernel_pool: Option<&'static FramePool>,
    process_pool: Option<&'static FramePool>,
    shared_size: u32,
    current: Option<&'static PageTable>,
    paging_enabled: bool,
    strict_fault_check: bool,
}

struct GlobalPaging {
    inner: core::cell::UnsafeCell<PagingState>,
}

// Safety: Kernel is effectively single-threaded (no SMP) and the fault
// handler runs with interrupts disabled; hosted tests serialize on the
// simulator guard.
unsafe impl Sync for GlobalPaging {}

static PAGING: GlobalPaging = GlobalPaging {
    inner: core::cell::UnsafeCell::new(PagingState {
        kernel_pool: None,
        process_pool: None,
        shared_size: 0,
        current: None,
        paging_enabled: false,
        strict_fault_check: false,
    }),
};

#[inline]
fn with_paging<R>(f: impl FnOnce(&mut PagingState) -> R) -> R {
    unsafe { f(&mut *PAGING.inner.get()) }
}

/// Sets the process-wide frame pools and the directly-mapped low-memory size.
///
/// Must be called before the first [`PageTable::new`]. Also resets the
/// current-table, paging-enabled and strict-check state, so tests can
/// re-initialize the subsystem.
pub fn init(kernel_pool: &'static FramePool, process_pool: &'static FramePool, shared_size: u32) {
    assert!(
        shared_size % PAGE_SIZE == 0 && shared_size <= ENTRIES_PER_TABLE * PAGE_SIZE,
        "shared memory must be page-aligned and covered by one page table"
    );
    with_paging(|state| {
        state.kernel_pool = Some(kernel_pool);
        state.process_pool = Some(process_pool);
        state.shared_size = shared_size;
        state.current = None;
        state.paging_enabled = false;
        state.strict_fault_check = false;
    });
    logging::logln("paging", format_args!("paging system initialized"));
}

fn process_pool() -> &'static FramePool {
    with_paging(|state| state.process_pool).expect("paging::init must be called first")
}

/// Kernel frame pool configured via [`init`].
pub fn kernel_pool() -> &'static FramePool {
    with_paging(|state| state.kernel_pool).expect("paging::init must be called first")
}

/// Directly-mapped low-memory size configured via [`init`].
pub fn shared_size() -> u32 {
    with_paging(|state| state.shared_size)
}

/// Whether [`enable_paging`] has been called.
pub fn paging_enabled() -> bool {
    with_paging(|state| state.paging_enabled)
}

/// The page table most recently installed via [`PageTable::load`].
pub fn current_page_table() -> Option<&'static PageTable> {
    with_paging(|state| state.current)
}

/// Enables or disables the strict fault-address check and returns the
/// previous setting.
///
/// In strict mode a fault on an address that no registered VM pool claims is
/// fatal; in permissive mode every non-present fault is backed on demand.
pub fn set_strict_fault_check(enabled: bool) -> bool {
    with_paging(|state| {
        let old = state.strict_fault_check;
        state.strict_fault_check = enabled;
        old
    })
}

/// Sets the paging and protection-enable bits of CR0.
pub fn enable_paging() {
    machine::write_cr0(machine::read_cr0() | CR0_PAGING_ENABLE | CR0_PROTECTION_ENABLE);
    with_paging(|state| state.paging_enabled = true);
    logging::logln("paging", format_args!("paging enabled"));
}

/// One per-address-space page directory plus the page tables it lazily
/// creates, with the list of VM pools registered against it.
pub struct PageTable {
    directory_frame: u32,
    pools: SpinLock<Vec<&'static VMPool>>,
}

impl PageTable {
    /// Allocates and initializes a page directory and the identity-mapping
    /// first page table.
    ///
    /// Layout after construction:
    /// - PDE\[0\] maps the first 4 MiB one-to-one, present and writable;
    /// - PDE\[1..=1022\] are invalid but writable;
    /// - PDE\[1023\] references the directory itself (recursive mapping).
    ///
    /// Both frames come from the *process* pool: once VM pools start drawing
    /// demand-allocated frames, only the recursive window reaches the
    /// directory, and that requires it to live in the process address space.
    pub fn new() -> Self {
        let pool = process_pool();

        let directory_frame = pool.get_frames(1);
        assert!(directory_frame != INVALID_FRAME, "out of frames for page directory");
        let table_frame = pool.get_frames(1);
        assert!(table_frame != INVALID_FRAME, "out of frames for first page table");

        // The constructor edits both frames through their physical addresses,
        // which is only valid while they are identity-mapped.
        if paging_enabled() {
            assert!(
                directory_frame < ENTRIES_PER_TABLE && table_frame < ENTRIES_PER_TABLE,
                "page table constructed after enable_paging needs identity-mapped frames"
            );
        }

        let directory = directory_frame * PAGE_SIZE;
        let table = table_frame * PAGE_SIZE;

        machine::write_mem(
            directory,
            entry(table_frame, EntryFlags::PRESENT | EntryFlags::WRITABLE),
        );

        for pno in 0..ENTRIES_PER_TABLE {
            machine::write_mem(
                table + pno * 4,
                entry(pno, EntryFlags::PRESENT | EntryFlags::WRITABLE),
            );
        }

        for pdno in 1..ENTRIES_PER_TABLE - 1 {
            machine::write_mem(directory + pdno * 4, EntryFlags::WRITABLE.bits());
        }

        // Recursive mapping: the last PDE references the directory itself.
        machine::write_mem(
            directory + (ENTRIES_PER_TABLE - 1) * 4,
            entry(directory_frame, EntryFlags::PRESENT | EntryFlags::WRITABLE),
        );

        logging::logln(
            "paging",
            format_args!("constructed page table, directory at {:#010x}", directory),
        );

        Self {
            directory_frame,
            pools: SpinLock::new(Vec::new()),
        }
    }

    /// Physical address of this table's page directory.
    pub fn directory_address(&self) -> u32 {
        self.directory_frame * PAGE_SIZE
    }

    /// Writes the directory address into the MMU root register and makes this
    /// instance the current page table.
    pub fn load(&'static self) {
        machine::write_cr3(self.directory_address());
        with_paging(|state| state.current = Some(self));
        logging::logln("paging", format_args!("loaded page table"));
    }

    /// Adds `pool` to the set of VM pools whose addresses this table
    /// recognizes as legitimate.
    pub fn register_pool(&self, pool: &'static VMPool) {
        self.pools.lock().push(pool);
        logging::logln("paging", format_args!("registered VM pool"));
    }

    /// Whether any registered VM pool claims `addr`.
    pub fn address_is_legitimate(&self, addr: u32) -> bool {
        self.pools.lock().iter().any(|pool| pool.is_legitimate(addr))
    }

    /// Invalidates the mapping of page `page_no` and returns its backing
    /// frame to the process pool.
    ///
    /// A page whose present bit is already clear is left untouched, with no
    /// TLB flush. Otherwise the MMU root register is rewritten to flush the
    /// stale translation.
    pub fn free_page(&self, page_no: u32) {
        let va = page_no * PAGE_SIZE;
        assert!(
            self.address_is_legitimate(va),
            "free_page on address {:#010x} outside every registered pool",
            va
        );

        // Without a covering page table the page cannot be present, and the
        // PTE window itself would fault.
        let pde = machine::read_mem(pde_address(va));
        if !EntryFlags::from_bits_truncate(pde).contains(EntryFlags::PRESENT) {
            return;
        }

        let pte_va = pte_address(va);
        let pte = machine::read_mem(pte_va);
        if EntryFlags::from_bits_truncate(pte).contains(EntryFlags::PRESENT) {
            let frame = pte / PAGE_SIZE;
            process_pool().release_frames(frame);
            machine::write_mem(pte_va, pte & !EntryFlags::PRESENT.bits());
            machine::write_cr3(self.directory_address());
            logging::logln("paging", format_args!("freed page {:#010x}", va));
        }
    }
}

/// Page-fault entry point, called from the fault ISR.
///
/// Backs the faulting address with a demand-allocated frame, creating the
/// covering page table first when necessary. All table edits go through the
/// recursive windows, so this runs correctly with paging enabled.
///
/// Panics on protection faults (present bit set in the error code), on frame
/// exhaustion, and — in strict mode — on addresses outside every registered
/// VM pool.
pub fn handle_fault(frame: &ExceptionFrame) {
    assert!(
        frame.err_code & ERR_PRESENT == 0,
        "protection fault (err={:#x}) is not handled",
        frame.err_code
    );

    let fault_va = machine::read_cr2();
    let table = current_page_table().expect("page fault with no page table loaded");

    if with_paging(|state| state.strict_fault_check) {
        assert!(
            table.address_is_legitimate(fault_va),
            "fault at {:#010x} outside every registered VM pool",
            fault_va
        );
    }

    let pool = process_pool();

    let pde_va = pde_address(fault_va);
    let pde = machine::read_mem(pde_va);
    if !EntryFlags::from_bits_truncate(pde).contains(EntryFlags::PRESENT) {
        // The page table covering this 4 MiB region does not exist yet.
        let table_frame = pool.get_frames(1);
        assert!(table_frame != INVALID_FRAME, "out of frames for page table");

        machine::write_mem(
            pde_va,
            entry(
                table_frame,
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
            ),
        );

        // The new table is reachable through the window now that its PDE is
        // present. Entries start invalid but writable and user-accessible;
        // the last one keeps the recursive pattern at the table level.
        let table_va = table_address(fault_va);
        for index in 0..ENTRIES_PER_TABLE - 1 {
            machine::write_mem(
                table_va + index * 4,
                (EntryFlags::WRITABLE | EntryFlags::USER).bits(),
            );
        }
        machine::write_mem(
            table_va + (ENTRIES_PER_TABLE - 1) * 4,
            entry(
                table_frame,
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
            ),
        );
    }

    let page_frame = pool.get_frames(1);
    assert!(page_frame != INVALID_FRAME, "out of frames for faulted page");
    machine::write_mem(
        pte_address(fault_va),
        entry(
            page_frame,
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
        ),
    );

    logging::logln(
        "paging",
        format_args!("handled page fault at {:#010x}", fault_va),
    );
}
