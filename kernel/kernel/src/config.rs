//! Compile-time configuration and the information handed over by the boot loader

use crate::pmem::SpaRange;
use memory::{PAddr, VAddr};

/// Number of process slots in the scheduler
pub const SCHEDULER_CAPACITY: usize = 16;

/// Size of the kernel stack every process gets for entering the kernel
pub const KERNEL_STACK_PAGES: u64 = 2;

pub const USER_STACK_PAGES: u64 = 32;
pub const USER_STACK_BASE: VAddr = 0x1_0000_0000;

pub const USER_HEAP_PAGES: u64 = 64;
pub const USER_HEAP_BASE: VAddr = 0x2_0000_0000;

/// The virtual window from which kernel stacks and other kernel-only allocations are served
pub const KERNEL_HEAP_BASE: VAddr = 0xFFFF_FFFF_9000_0000;
pub const KERNEL_HEAP_SIZE: u64 = 1 << 30;

/// At most this many NVDIMM regions are managed
pub const MAX_PMEM_REGIONS: usize = 4;

/// Arguments of a console command line including the command itself
pub const MAX_COMMAND_ARGS: usize = 8;

#[derive(Debug, Copy, Clone)]
pub struct KernelConfig {
    /// Interval of the scheduling timer
    pub tick_interval_us: u64,
    pub log_level: log::Level,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tick_interval_us: 100,
            log_level: log::Level::Info,
        }
    }
}

/// A region of usable DRAM from the firmware memory map
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct MemoryRegion {
    pub base: PAddr,
    pub page_count: u64,
}

/// An executable image made available by the boot loader
#[derive(Debug, Copy, Clone)]
pub struct BootFile {
    pub name: &'static str,
    pub content: &'static [u8],
}

/// Everything the kernel learns about the machine from the boot loader.
///
/// The loader has already set up a straight mapping of all physical memory at `straight_map_offset` and loads the
/// kernel with its own page tables active.
#[derive(Debug, Copy, Clone)]
pub struct BootInfo {
    pub memory_map: &'static [MemoryRegion],
    pub straight_map_offset: u64,
    /// Root of the page tables the kernel runs on, whose upper half every process shares
    pub page_table_root: PAddr,
    pub spa_ranges: &'static [SpaRange],
    pub hpet_base: PAddr,
    pub local_apic_base: PAddr,
    /// Kernel-mapped address of the `rsp0` field of the task state segment
    pub tss_rsp0: *mut u64,
    pub files: &'static [BootFile],
}
