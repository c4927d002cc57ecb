//! Paging integration tests against the simulated machine.

use mikros_kernel::arch::machine::{self, ExceptionFrame};
use mikros_kernel::memory::frames::FramePool;
use mikros_kernel::memory::paging::{self, PageTable, ENTRIES_PER_TABLE, PAGE_SIZE};
use mikros_kernel::sim::{self, SimConfig};

const KERNEL_POOL_BASE: u32 = 512; // 2 MiB
const KERNEL_POOL_FRAMES: u32 = 512;
const PROCESS_POOL_BASE: u32 = 1024; // 4 MiB
const PROCESS_POOL_FRAMES: u32 = 2048;
const SHARED_SIZE: u32 = ENTRIES_PER_TABLE * PAGE_SIZE; // 4 MiB

const CR0_PAGING_ENABLE: u32 = 1 << 31;
const CR0_PROTECTION_ENABLE: u32 = 1 << 0;

/// Boots a fresh simulated machine and paging configuration.
fn setup() -> (&'static FramePool, &'static FramePool) {
    sim::install(SimConfig::default());
    let kernel_pool: &'static FramePool =
        Box::leak(Box::new(FramePool::new(KERNEL_POOL_BASE, KERNEL_POOL_FRAMES)));
    let process_pool: &'static FramePool =
        Box::leak(Box::new(FramePool::new(PROCESS_POOL_BASE, PROCESS_POOL_FRAMES)));
    paging::init(kernel_pool, process_pool, SHARED_SIZE);
    (kernel_pool, process_pool)
}

fn loaded_table() -> &'static PageTable {
    let table: &'static PageTable = Box::leak(Box::new(PageTable::new()));
    table.load();
    table
}

/// Contract: the last PDE references the directory itself.
/// Given: A freshly constructed page table.
/// When: PDE 1023 is read from the directory frame.
/// Then: It holds the directory's own physical address with P|W set.
#[test]
fn test_recursive_mapping_invariant() {
    let _guard = sim::exclusive();
    setup();

    let table = PageTable::new();
    let directory = table.directory_address();

    let recursive = sim::read_phys(directory + (ENTRIES_PER_TABLE - 1) * 4);
    assert_eq!(
        recursive,
        directory | 3,
        "PDE[1023] must self-reference the directory with P|W"
    );
}

/// Contract: the first page table identity-maps low memory.
/// Given: A freshly constructed page table.
/// When: Every entry of the first page table is read.
/// Then: Entry i equals i * PAGE_SIZE | 3.
#[test]
fn test_low_memory_identity_map() {
    let _guard = sim::exclusive();
    setup();

    let table = PageTable::new();
    let directory = table.directory_address();

    let pde0 = sim::read_phys(directory);
    assert_eq!(pde0 & 3, 3, "PDE[0] must be present and writable");

    let first_table = pde0 & 0xFFFF_F000;
    for i in 0..ENTRIES_PER_TABLE {
        let entry = sim::read_phys(first_table + i * 4);
        assert_eq!(
            entry,
            i * PAGE_SIZE | 3,
            "first page table entry {} must identity-map its page",
            i
        );
    }
}

/// Contract: unmapped directory slots stay invalid but writable.
/// Given: A freshly constructed page table.
/// When: PDEs 1 through 1022 are read.
/// Then: Each holds exactly the writable bit.
#[test]
fn test_unused_directory_entries_invalid_but_writable() {
    let _guard = sim::exclusive();
    setup();

    let table = PageTable::new();
    let directory = table.directory_address();

    for i in 1..ENTRIES_PER_TABLE - 1 {
        let entry = sim::read_phys(directory + i * 4);
        assert_eq!(entry, 2, "PDE[{}] must be invalid but writable", i);
    }
}

/// Contract: load installs the directory into the MMU root register.
/// Given: A constructed page table.
/// When: load is called.
/// Then: CR3 holds the directory's physical address.
#[test]
fn test_load_writes_directory_into_cr3() {
    let _guard = sim::exclusive();
    setup();

    let table = loaded_table();
    assert_eq!(
        sim::cr3(),
        table.directory_address(),
        "CR3 must hold the loaded directory address"
    );
}

/// Contract: enable_paging sets the paging and protection bits.
/// Given: A loaded page table.
/// When: enable_paging is called.
/// Then: CR0 has bits 31 and 0 set and the paging-enabled flag is recorded.
#[test]
fn test_enable_paging_sets_cr0_bits() {
    let _guard = sim::exclusive();
    setup();

    loaded_table();
    paging::enable_paging();

    let cr0 = machine::read_cr0();
    assert_eq!(
        cr0 & (CR0_PAGING_ENABLE | CR0_PROTECTION_ENABLE),
        CR0_PAGING_ENABLE | CR0_PROTECTION_ENABLE,
        "CR0 must carry the paging and protection-enable bits"
    );
    assert!(paging::paging_enabled());
}

/// Contract: the recursive window exposes the directory as virtual memory.
/// Given: Paging enabled on a loaded table.
/// When: PDEs are read through the window at 0xFFFFF000.
/// Then: The values match the physical directory contents.
#[test]
fn test_recursive_window_reads_directory_entries() {
    let _guard = sim::exclusive();
    setup();

    let table = loaded_table();
    paging::enable_paging();

    let directory = table.directory_address();
    for i in [0u32, 1, 512, 1022, 1023] {
        let through_window = machine::read_mem(0xFFFF_F000 | (i << 2));
        let physical = sim::read_phys(directory + i * 4);
        assert_eq!(
            through_window, physical,
            "window read of PDE[{}] must match the directory frame",
            i
        );
    }
}

/// Contract: a non-present fault demand-allocates the table and the page.
/// Given: Paging enabled and an address above the identity-mapped 4 MiB.
/// When: The address is written and read back.
/// Then: The access succeeds after one fault chain and exactly two process
///       frames were consumed (new page table + backing page).
#[test]
fn test_fault_allocates_page_table_and_page_on_demand() {
    let _guard = sim::exclusive();
    let (_, process_pool) = setup();

    loaded_table();
    paging::enable_paging();

    let free_before = process_pool.free_frame_count();

    const TEST_VA: u32 = 0x0080_0000; // 8 MiB, outside the identity map
    machine::write_mem(TEST_VA, 0xDEAD_BEEF);
    assert_eq!(
        machine::read_mem(TEST_VA),
        0xDEAD_BEEF,
        "demand-mapped page must be readable after the faulting write"
    );

    assert_eq!(
        free_before - process_pool.free_frame_count(),
        2,
        "first fault in a 4 MiB region must consume a table frame and a page frame"
    );

    // Second page in the same region: the table already exists.
    machine::write_mem(TEST_VA + PAGE_SIZE, 0x1234_5678);
    assert_eq!(
        free_before - process_pool.free_frame_count(),
        3,
        "second fault in the region must consume only a page frame"
    );
}

/// Contract: a demand-created page table keeps the recursive pattern at the
/// table level.
/// Given: A demand fault created a new page table.
/// When: The table's last entry is read through the window.
/// Then: It references the table's own frame with P|W|U.
#[test]
fn test_demand_created_table_self_references_last_entry() {
    let _guard = sim::exclusive();
    setup();

    let table = loaded_table();
    paging::enable_paging();

    const TEST_VA: u32 = 0x0080_0000;
    machine::write_mem(TEST_VA, 1);

    let directory_index = TEST_VA >> 22;
    let pde = sim::read_phys(table.directory_address() + directory_index * 4);
    assert_eq!(pde & 7, 7, "new PDE must be present, writable and user");

    let table_phys = pde & 0xFFFF_F000;
    let last_entry = sim::read_phys(table_phys + (ENTRIES_PER_TABLE - 1) * 4);
    assert_eq!(
        last_entry,
        table_phys | 7,
        "last entry of a demand-created table must self-reference"
    );
}

/// Contract: protection faults are fatal.
/// Given: A loaded table with paging enabled.
/// When: The fault handler is entered with the present bit set in the error
///       code.
/// Then: The kernel aborts.
#[test]
#[should_panic(expected = "protection fault")]
fn test_protection_fault_aborts() {
    let _guard = sim::exclusive();
    setup();

    loaded_table();
    paging::enable_paging();

    paging::handle_fault(&ExceptionFrame {
        err_code: 1,
        ..ExceptionFrame::default()
    });
}

/// Contract: strict mode rejects faults outside every registered pool.
/// Given: Strict fault checking enabled and no registered VM pools.
/// When: An unmapped address is touched.
/// Then: The kernel aborts.
#[test]
#[should_panic(expected = "outside every registered VM pool")]
fn test_strict_mode_rejects_unregistered_fault_address() {
    let _guard = sim::exclusive();
    setup();

    loaded_table();
    paging::enable_paging();
    paging::set_strict_fault_check(true);

    machine::write_mem(0x0080_0000, 1);
}

/// Contract: permissive mode handles the same fault strict mode rejects.
/// Given: Strict fault checking disabled (the default after init).
/// When: An unmapped, unregistered address is touched.
/// Then: The access is backed on demand and succeeds.
#[test]
fn test_permissive_mode_handles_unregistered_fault_address() {
    let _guard = sim::exclusive();
    setup();

    loaded_table();
    paging::enable_paging();

    machine::write_mem(0x0080_0000, 0xAB);
    assert_eq!(machine::read_mem(0x0080_0000), 0xAB);
}

/// Contract: free_page refuses addresses no pool owns.
/// Given: A demand-mapped page outside every registered VM pool.
/// When: free_page is called for it.
/// Then: The kernel aborts.
#[test]
#[should_panic(expected = "outside every registered pool")]
fn test_free_page_rejects_unregistered_address() {
    let _guard = sim::exclusive();
    setup();

    let table = loaded_table();
    paging::enable_paging();

    const TEST_VA: u32 = 0x0080_0000;
    machine::write_mem(TEST_VA, 1);
    table.free_page(TEST_VA / PAGE_SIZE);
}
