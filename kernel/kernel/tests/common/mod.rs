//! A simulated machine with DRAM and one NVDIMM region that survives power loss only as far as it was flushed
#![allow(dead_code)]

use amd64::cache::RecordingFlusher;
use amd64::context::TrapFrame;
use amd64::cpu::Interrupts;
use kernel::commands::{execute_line, Session};
use kernel::config::{BootFile, BootInfo, KernelConfig, MemoryRegion};
use kernel::kernel::{CONSOLE_OWNER, TRAP_OWNER};
use kernel::pmem::{SpaRange, BYTE_ADDRESSABLE_PERSISTENT_MEMORY};
use kernel::{Kernel, KernelError, KernelHandle, KernelLock};
use ksync::ProcessLock;
use memory::arena::PageArena;
use memory::{pages_to_bytes, PAddr, PhysMapper, VAddr, PAGE_SIZE};

pub const DRAM_BASE: PAddr = 0x400_0000;
pub const DRAM_PAGES: u64 = 320;
/// Pages at the start of DRAM that hold the boot page tables
const RESERVED_PAGES: u64 = 8;
pub const PMEM_BASE: PAddr = DRAM_BASE + DRAM_PAGES * PAGE_SIZE;
pub const PMEM_PAGES: u64 = 1024;

pub const ENTRY: VAddr = 0x40_0000;
pub const COUNTER: VAddr = 0x60_0000;
const CODE: [u8; 9] = [0x48, 0xFF, 0x05, 0xF9, 0xFF, 0x1F, 0x00, 0xEB, 0xF7];

/// `counter`: increments a word in its data segment forever
#[repr(C, align(8))]
pub struct Image([u8; 256]);

fn image() -> &'static Image {
    let mut bytes = [0u8; 256];
    {
        let mut put = |offset: usize, value: &[u8]| bytes[offset..offset + value.len()].copy_from_slice(value);
        put(0, b"\x7FELF\x02\x01\x01");
        put(16, &2u16.to_le_bytes());
        put(18, &0x3Eu16.to_le_bytes());
        put(20, &1u32.to_le_bytes());
        put(24, &ENTRY.to_le_bytes());
        put(32, &64u64.to_le_bytes());
        put(52, &[64, 0, 56, 0, 2, 0, 64, 0]);
        let segments = [(0b101u32, 192u64, ENTRY, CODE.len() as u64), (0b110, 208, COUNTER, 8)];
        for (index, (flags, offset, vaddr, size)) in segments.into_iter().enumerate() {
            let header = 64 + index * 56;
            put(header, &1u32.to_le_bytes());
            put(header + 4, &flags.to_le_bytes());
            put(header + 8, &offset.to_le_bytes());
            put(header + 16, &vaddr.to_le_bytes());
            put(header + 24, &vaddr.to_le_bytes());
            put(header + 32, &size.to_le_bytes());
            put(header + 40, &size.to_le_bytes());
            put(header + 48, &PAGE_SIZE.to_le_bytes());
        }
        put(192, &CODE);
    }
    Box::leak(Box::new(Image(bytes)))
}

pub struct Machine {
    pub memory: PageArena,
    pub flusher: &'static RecordingFlusher,
    files: &'static [BootFile; 1],
    boots: u64,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            memory: PageArena::new(DRAM_BASE, (DRAM_PAGES + PMEM_PAGES) as usize),
            flusher: Box::leak(Box::new(RecordingFlusher::new())),
            files: Box::leak(Box::new([BootFile {
                name: "counter",
                content: &image().0,
            }])),
            boots: 0,
        }
    }

    /// Start a fresh kernel as the boot loader would
    pub fn boot(&mut self) -> KernelLock {
        assert!(self.boots < RESERVED_PAGES, "out of boot page tables");
        let page_table_root = DRAM_BASE + self.boots * PAGE_SIZE;
        self.boots += 1;
        self.memory.bytes_mut(page_table_root, PAGE_SIZE as usize).fill(0);

        let boot = BootInfo {
            memory_map: Box::leak(Box::new([MemoryRegion {
                base: DRAM_BASE + pages_to_bytes(RESERVED_PAGES),
                page_count: DRAM_PAGES - RESERVED_PAGES,
            }])),
            straight_map_offset: self.memory.mapper().offset(),
            page_table_root,
            spa_ranges: Box::leak(Box::new([SpaRange {
                index: 1,
                proximity_domain: 1,
                type_guid: BYTE_ADDRESSABLE_PERSISTENT_MEMORY,
                base: PMEM_BASE,
                length: pages_to_bytes(PMEM_PAGES),
            }])),
            hpet_base: 0,
            local_apic_base: 0,
            tss_rsp0: core::ptr::null_mut(),
            files: self.files,
        };
        let kernel = Kernel::new(&boot, KernelConfig::default(), self.flusher).unwrap();
        ProcessLock::new(Some(kernel))
    }

    /// Cut the power: DRAM is lost and persistent memory keeps exactly what was flushed
    pub fn power_loss(&mut self) {
        let len = pages_to_bytes(PMEM_PAGES) as usize;
        let mapped = self.memory.mapper().phys_to_mapped(PMEM_BASE) as *const u8;
        let durable = self.flusher.durable_bytes(mapped, len);
        self.memory.bytes_mut(PMEM_BASE, len).copy_from_slice(&durable);
        self.memory
            .bytes_mut(DRAM_BASE, pages_to_bytes(DRAM_PAGES) as usize)
            .fill(0xCC);
        // what survived is durable for the next boot as well
        let flusher = Box::leak(Box::new(RecordingFlusher::new()));
        flusher.persist(mapped, len);
        self.flusher = flusher;
    }

    /// Run a console line and return its output
    pub fn run(&self, lock: &KernelLock, line: &str) -> Result<String, KernelError> {
        let mut out = String::new();
        let mut session = Session {
            kernel: KernelHandle::<Interrupts>::new(lock, CONSOLE_OWNER),
            out: &mut out,
            executables: self.files,
            idle: &mut || panic!("the console must not block"),
        };
        execute_line(&mut session, line)?;
        Ok(out)
    }
}

/// Deliver a timer interrupt that arrives while `frame` is the state of the CPU
pub fn tick(lock: &KernelLock, frame: &mut TrapFrame, now_fs: u64) {
    let mut guard = lock.lock(TRAP_OWNER).unwrap();
    guard.as_mut().unwrap().on_timer_tick(frame, now_fs);
}

/// Physical address behind `vaddr` in the address space of the running process
pub fn current_paddr(lock: &KernelLock, vaddr: VAddr) -> PAddr {
    let guard = lock.lock(TRAP_OWNER).unwrap();
    let kernel = guard.as_ref().unwrap();
    let ctx = kernel.scheduler().current().unwrap().execution_context();
    kernel.paging().translate(ctx.root(kernel.paging()), vaddr)
}

/// Emulate the MMU setting the dirty bit for a store of the running process
pub fn mark_dirty(lock: &KernelLock, vaddr: VAddr) {
    let guard = lock.lock(TRAP_OWNER).unwrap();
    let kernel = guard.as_ref().unwrap();
    let ctx = kernel.scheduler().current().unwrap().execution_context();
    kernel.paging().mark_dirty(ctx.root(kernel.paging()), vaddr, PAGE_SIZE);
}
