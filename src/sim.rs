//! Machine simulator backing the hosted test suite.
//!
//! Installs simulated backends for the [`machine`](crate::arch::machine) and
//! [`thread`](crate::scheduler::thread) contracts: a flat 32-bit physical
//! memory with a real two-level page walk (non-present entries set CR2 and
//! deliver the fault to [`paging::handle_fault`], then the access retries —
//! the MMU contract), an ATA-style disk controller behind the port
//! functions, and a thread backend that records dispatch and teardown
//! instead of switching stacks.
//!
//! All kernel state is process-global, so tests serialize on
//! [`exclusive`]; each integration-test binary is its own process.

use std::sync::{Mutex, MutexGuard};
use std::vec::Vec;

use crate::arch::machine::{self, ExceptionFrame, MachineOps};
use crate::drivers::blockdev::{BLOCK_SIZE, DiskOperation};
use crate::memory::paging;
use crate::scheduler::thread::{self, ThreadId, ThreadOps};

const CR0_PAGING_ENABLE: u32 = 1 << 31;
const ERR_WRITE: u32 = 1 << 1;

/// Simulated machine configuration.
#[derive(Clone, Copy)]
pub struct SimConfig {
    /// Flat physical memory size in bytes.
    pub memory_bytes: usize,
    /// Disk capacity in 512-byte blocks.
    pub disk_blocks: usize,
    /// Status polls the disk stays busy after a command is issued.
    pub disk_busy_polls: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 16 * 1024 * 1024,
            disk_blocks: 64,
            disk_busy_polls: 0,
        }
    }
}

struct SimDisk {
    data: Vec<u8>,
    sector_count: u8,
    lba_low: u8,
    lba_mid: u8,
    lba_high: u8,
    drive_head: u8,
    busy_polls: u32,
    post_transfer_busy_polls: u32,
    busy_remaining: u32,
    active: Option<DiskOperation>,
    buffer: [u8; BLOCK_SIZE],
    buffer_pos: usize,
    irq_pending: bool,
}

impl SimDisk {
    fn new(blocks: usize, busy_polls: u32) -> Self {
        Self {
            data: vec![0; blocks * BLOCK_SIZE],
            sector_count: 0,
            lba_low: 0,
            lba_mid: 0,
            lba_high: 0,
            drive_head: 0,
            busy_polls,
            post_transfer_busy_polls: 0,
            busy_remaining: 0,
            active: None,
            buffer: [0; BLOCK_SIZE],
            buffer_pos: 0,
            irq_pending: false,
        }
    }

    fn selected_block(&self) -> usize {
        (self.lba_low as usize)
            | (self.lba_mid as usize) << 8
            | (self.lba_high as usize) << 16
            | ((self.drive_head & 0x0F) as usize) << 24
    }

    fn issue(&mut self, operation: DiskOperation) {
        let block = self.selected_block();
        assert!(
            block * BLOCK_SIZE < self.data.len(),
            "simulated disk command for block {} beyond capacity",
            block
        );
        assert_eq!(self.sector_count, 1, "simulator only models single-block transfers");

        if operation == DiskOperation::Read {
            let offset = block * BLOCK_SIZE;
            self.buffer.copy_from_slice(&self.data[offset..offset + BLOCK_SIZE]);
        }
        self.buffer_pos = 0;
        self.active = Some(operation);
        self.busy_remaining = self.busy_polls;
    }

    /// Status register read; each poll while busy brings completion closer.
    fn status(&mut self) -> u8 {
        const BSY: u8 = 0x80;
        const DRQ: u8 = 0x08;

        if self.busy_remaining > 0 {
            self.busy_remaining -= 1;
            return BSY;
        }
        if self.active.is_some() {
            DRQ
        } else {
            0
        }
    }

    fn read_data_word(&mut self) -> u16 {
        assert_eq!(
            self.active,
            Some(DiskOperation::Read),
            "data port read without an active read command"
        );
        assert!(self.busy_remaining == 0, "data port read while device busy");

        let word = (self.buffer[self.buffer_pos] as u16)
            | ((self.buffer[self.buffer_pos + 1] as u16) << 8);
        self.buffer_pos += 2;
        if self.buffer_pos == BLOCK_SIZE {
            self.complete();
        }
        word
    }

    /// Transfer finished: queue the completion interrupt and keep the device
    /// busy for the configured drain window.
    fn complete(&mut self) {
        self.active = None;
        self.busy_remaining = self.post_transfer_busy_polls;
        self.irq_pending = true;
    }

    fn write_data_word(&mut self, word: u16) {
        assert_eq!(
            self.active,
            Some(DiskOperation::Write),
            "data port write without an active write command"
        );
        assert!(self.busy_remaining == 0, "data port write while device busy");

        self.buffer[self.buffer_pos] = word as u8;
        self.buffer[self.buffer_pos + 1] = (word >> 8) as u8;
        self.buffer_pos += 2;
        if self.buffer_pos == BLOCK_SIZE {
            let offset = self.selected_block() * BLOCK_SIZE;
            self.data[offset..offset + BLOCK_SIZE].copy_from_slice(&self.buffer);
            self.complete();
        }
    }
}

struct SimThreads {
    current: Option<ThreadId>,
    dispatched: Vec<ThreadId>,
    destroyed: Vec<ThreadId>,
}

struct SimMachine {
    mem: Vec<u8>,
    cr0: u32,
    cr2: u32,
    cr3: u32,
    cr3_writes: u32,
    eoi_count: u32,
    disk: SimDisk,
    threads: SimThreads,
}

impl SimMachine {
    fn new(config: SimConfig) -> Self {
        Self {
            mem: vec![0; config.memory_bytes],
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr3_writes: 0,
            eoi_count: 0,
            disk: SimDisk::new(config.disk_blocks, config.disk_busy_polls),
            threads: SimThreads {
                current: None,
                dispatched: Vec::new(),
                destroyed: Vec::new(),
            },
        }
    }

    fn read_phys(&self, pa: u32) -> u32 {
        let pa = pa as usize;
        assert!(
            pa + 4 <= self.mem.len(),
            "physical read at {:#010x} beyond simulated memory",
            pa
        );
        u32::from_le_bytes(self.mem[pa..pa + 4].try_into().unwrap())
    }

    fn write_phys(&mut self, pa: u32, val: u32) {
        let pa = pa as usize;
        assert!(
            pa + 4 <= self.mem.len(),
            "physical write at {:#010x} beyond simulated memory",
            pa
        );
        self.mem[pa..pa + 4].copy_from_slice(&val.to_le_bytes());
    }

    /// Two-level page walk. `Err` carries the architectural error code of
    /// the page fault (present bit clear).
    fn translate(&self, va: u32, write: bool) -> Result<u32, u32> {
        if self.cr0 & CR0_PAGING_ENABLE == 0 {
            return Ok(va);
        }

        let err = if write { ERR_WRITE } else { 0 };

        let pde = self.read_phys(self.cr3 + (va >> 22) * 4);
        if pde & 1 == 0 {
            return Err(err);
        }

        let pte = self.read_phys((pde & 0xFFFF_F000) + ((va >> 12) & 0x3FF) * 4);
        if pte & 1 == 0 {
            return Err(err);
        }

        Ok((pte & 0xFFFF_F000) | (va & 0xFFF))
    }
}

static MACHINE: Mutex<Option<SimMachine>> = Mutex::new(None);
static TEST_GUARD: Mutex<()> = Mutex::new(());

/// Serializes tests that touch the process-global kernel state.
///
/// Poisoning is tolerated so `#[should_panic]` tests do not wedge the rest
/// of the binary.
pub fn exclusive() -> MutexGuard<'static, ()> {
    TEST_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn with_machine<R>(f: impl FnOnce(&mut SimMachine) -> R) -> R {
    let mut guard = MACHINE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(guard.as_mut().expect("simulator not installed"))
}

/// Creates a fresh simulated machine and installs its backends.
pub fn install(config: SimConfig) {
    {
        let mut guard = MACHINE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(SimMachine::new(config));
    }
    machine::install(sim_machine_ops());
    thread::install(sim_thread_ops());
}

fn sim_read_cr0() -> u32 {
    with_machine(|m| m.cr0)
}

fn sim_write_cr0(val: u32) {
    with_machine(|m| m.cr0 = val);
}

fn sim_read_cr2() -> u32 {
    with_machine(|m| m.cr2)
}

fn sim_write_cr3(val: u32) {
    with_machine(|m| {
        m.cr3 = val;
        m.cr3_writes += 1;
    });
}

/// Virtual access with the MMU's fault-and-retry behavior.
///
/// The machine mutex is *not* held while the fault handler runs; the handler
/// performs further simulated accesses of its own.
fn access_mem(va: u32, write: Option<u32>) -> u32 {
    for _attempt in 0..2 {
        match with_machine(|m| m.translate(va, write.is_some())) {
            Ok(pa) => {
                return with_machine(|m| match write {
                    Some(val) => {
                        m.write_phys(pa, val);
                        val
                    }
                    None => m.read_phys(pa),
                });
            }
            Err(err_code) => {
                with_machine(|m| m.cr2 = va);

                // Faults are delivered with interrupts masked.
                let were_enabled = machine::interrupts_enabled();
                machine::disable_interrupts();
                paging::handle_fault(&ExceptionFrame {
                    err_code,
                    ..ExceptionFrame::default()
                });
                if were_enabled {
                    machine::enable_interrupts();
                }
            }
        }
    }
    panic!("page fault at {:#010x} not resolved by the fault handler", va);
}

fn sim_read_mem(va: u32) -> u32 {
    access_mem(va, None)
}

fn sim_write_mem(va: u32, val: u32) {
    access_mem(va, Some(val));
}

const DISK_BASE: u16 = 0x1F0;

fn sim_inb(port: u16) -> u8 {
    with_machine(|m| match port - DISK_BASE {
        7 => m.disk.status(),
        offset => panic!("simulated inb from unmodeled port offset {}", offset),
    })
}

fn sim_outb(port: u16, val: u8) {
    with_machine(|m| match port - DISK_BASE {
        2 => m.disk.sector_count = val,
        3 => m.disk.lba_low = val,
        4 => m.disk.lba_mid = val,
        5 => m.disk.lba_high = val,
        6 => m.disk.drive_head = val,
        7 => match val {
            0x20 => m.disk.issue(DiskOperation::Read),
            0x30 => m.disk.issue(DiskOperation::Write),
            other => panic!("simulated disk got unknown command {:#04x}", other),
        },
        offset => panic!("simulated outb to unmodeled port offset {}", offset),
    });
}

fn sim_inw(port: u16) -> u16 {
    with_machine(|m| match port - DISK_BASE {
        0 => m.disk.read_data_word(),
        offset => panic!("simulated inw from unmodeled port offset {}", offset),
    })
}

fn sim_outw(port: u16, val: u16) {
    with_machine(|m| match port - DISK_BASE {
        0 => m.disk.write_data_word(val),
        offset => panic!("simulated outw to unmodeled port offset {}", offset),
    });
}

fn sim_end_of_interrupt() {
    with_machine(|m| m.eoi_count += 1);
}

fn sim_machine_ops() -> MachineOps {
    MachineOps {
        read_cr0: sim_read_cr0,
        write_cr0: sim_write_cr0,
        read_cr2: sim_read_cr2,
        write_cr3: sim_write_cr3,
        read_mem: sim_read_mem,
        write_mem: sim_write_mem,
        inb: sim_inb,
        outb: sim_outb,
        inw: sim_inw,
        outw: sim_outw,
        end_of_interrupt: sim_end_of_interrupt,
        // Interrupt-flag handling stays on the hosted process-local flag.
        ..MachineOps::hosted_stub()
    }
}

fn sim_current() -> Option<ThreadId> {
    with_machine(|m| m.threads.current)
}

fn sim_dispatch_to(target: ThreadId) {
    with_machine(|m| {
        m.threads.dispatched.push(target);
        m.threads.current = Some(target);
    });
}

fn sim_destroy(target: ThreadId) {
    with_machine(|m| m.threads.destroyed.push(target));
}

fn sim_thread_ops() -> ThreadOps {
    ThreadOps {
        current: sim_current,
        dispatch_to: sim_dispatch_to,
        destroy: sim_destroy,
    }
}

/// Puts `thread` on the simulated CPU without recording a dispatch.
pub fn set_current_thread(thread: Option<ThreadId>) {
    with_machine(|m| m.threads.current = thread);
}

/// The thread currently on the simulated CPU.
pub fn current_thread() -> Option<ThreadId> {
    with_machine(|m| m.threads.current)
}

/// Threads dispatched so far, in order.
pub fn dispatch_log() -> Vec<ThreadId> {
    with_machine(|m| m.threads.dispatched.clone())
}

/// Clears the dispatch log.
pub fn clear_dispatch_log() {
    with_machine(|m| m.threads.dispatched.clear());
}

/// Threads whose stacks were torn down so far, in order.
pub fn destroyed_threads() -> Vec<ThreadId> {
    with_machine(|m| m.threads.destroyed.clone())
}

/// Number of writes to the MMU root register since install.
pub fn cr3_write_count() -> u32 {
    with_machine(|m| m.cr3_writes)
}

/// Number of EOI acknowledgements since install.
pub fn eoi_count() -> u32 {
    with_machine(|m| m.eoi_count)
}

/// Whether the disk has raised a completion interrupt not yet taken.
pub fn disk_irq_pending() -> bool {
    with_machine(|m| m.disk.irq_pending)
}

/// Takes (and clears) the pending disk completion interrupt.
pub fn take_disk_irq() -> bool {
    with_machine(|m| core::mem::take(&mut m.disk.irq_pending))
}

/// Sets how many status polls the disk stays busy after a command.
pub fn set_disk_busy_polls(polls: u32) {
    with_machine(|m| m.disk.busy_polls = polls);
}

/// Sets how many status polls the disk stays busy after a completed
/// transfer, before the completion interrupt would normally be serviced.
pub fn set_disk_post_transfer_busy_polls(polls: u32) {
    with_machine(|m| m.disk.post_transfer_busy_polls = polls);
}

/// Current MMU root register value.
pub fn cr3() -> u32 {
    with_machine(|m| m.cr3)
}

/// Copies one block out of the simulated disk's backing store.
pub fn disk_block(block: u32) -> Vec<u8> {
    with_machine(|m| {
        let offset = block as usize * BLOCK_SIZE;
        m.disk.data[offset..offset + BLOCK_SIZE].to_vec()
    })
}

/// Overwrites one block of the simulated disk's backing store.
pub fn set_disk_block(block: u32, contents: &[u8]) {
    assert_eq!(contents.len(), BLOCK_SIZE);
    with_machine(|m| {
        let offset = block as usize * BLOCK_SIZE;
        m.disk.data[offset..offset + BLOCK_SIZE].copy_from_slice(contents);
    });
}

/// Reads a 32-bit word from simulated physical memory, bypassing the MMU.
pub fn read_phys(pa: u32) -> u32 {
    with_machine(|m| m.read_phys(pa))
}

/// Writes a 32-bit word to simulated physical memory, bypassing the MMU.
pub fn write_phys(pa: u32, val: u32) {
    with_machine(|m| m.write_phys(pa, val));
}
