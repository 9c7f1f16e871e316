//! The kernel context, owning every piece of global state
//!
//! A [`Kernel`] is constructed once at entry from the [`BootInfo`] and then lives behind a [`ProcessLock`] that the
//! console and the timer interrupt lock on behalf of different owners.

use crate::config::{BootInfo, KernelConfig, MAX_PMEM_REGIONS};
use crate::heap::KernelHeap;
use crate::loader;
use crate::pmem::{persistent_memory_ranges, PersistentMemoryManager, PersistentProcessInfo, PmemError, SpaRange};
use crate::process::{Process, ProcessController, ProcessId, ProcessStatus};
use crate::sched::{Scheduler, SchedulerHandle};
use crate::KernelError;
use allocators::{AllocInit, FreeListAllocator};
use amd64::apic::LocalApic;
use amd64::cache::CacheFlush;
use amd64::context::TrapFrame;
use amd64::cpu::Interrupts;
use amd64::hpet::Hpet;
use amd64::mem::{Paging, PhysAddrMask};
use ksync::{InterruptMask, ProcessLock};
use memory::{OffsetMapper, PAddr, PhysMapper};

/// The kernel as shared between the console and the timer interrupt
pub type KernelLock = ProcessLock<Option<Kernel>, Interrupts>;

/// Lock owner used by the timer interrupt
pub const TRAP_OWNER: u64 = u64::MAX;

/// Lock owner used by the console
pub const CONSOLE_OWNER: u64 = 1;

pub struct Kernel {
    config: KernelConfig,
    dram: FreeListAllocator<OffsetMapper>,
    paging: Paging<OffsetMapper>,
    kernel_root: PAddr,
    heap: KernelHeap,
    scheduler: Scheduler,
    controller: ProcessController,
    spa_ranges: &'static [SpaRange],
    /// Base addresses of the persistent memory regions, each holding a [`PersistentMemoryManager`]
    pmem_regions: heapless::Vec<PAddr, MAX_PMEM_REGIONS>,
    hpet: Option<Hpet>,
    apic: Option<LocalApic>,
    tss_rsp0: *mut u64,
    flusher: &'static dyn CacheFlush,
    last_tick_fs: u64,
}

// The kernel is only ever reached through the kernel lock of the single core it runs on. The raw pointers it holds
// refer to device registers and the TSS which are not shared with anything else.
unsafe impl Send for Kernel {}

/// Read the clock in femtoseconds, which stands still without an HPET
fn clock_fs(hpet: &Option<Hpet>, fallback: u64) -> u64 {
    match hpet {
        Some(hpet) => hpet.ticks_to_femtoseconds(hpet.main_counter()),
        None => fallback,
    }
}

impl Kernel {
    pub fn new(boot: &BootInfo, config: KernelConfig, flusher: &'static dyn CacheFlush) -> Result<Self, KernelError> {
        let mapper = OffsetMapper::new(boot.straight_map_offset);
        let mut dram = FreeListAllocator::new(mapper);
        for region in boot.memory_map.iter().filter(|region| region.page_count > 0) {
            unsafe { dram.free_pages(region.base, region.page_count, 0) };
        }
        log::info!("{} pages of DRAM available", dram.free_page_count());

        let paging = Paging::new(mapper, PhysAddrMask::from_cpu());
        let kernel_root = boot.page_table_root & paging.mask().frame_mask(amd64::mem::Level::Pt);

        let mut pmem_regions = heapless::Vec::new();
        for range in persistent_memory_ranges(boot.spa_ranges) {
            if pmem_regions.push(range.base).is_err() {
                log::warn!("ignoring {range}, at most {MAX_PMEM_REGIONS} regions are supported");
                continue;
            }
            log::info!("persistent memory region {}: {range}", pmem_regions.len() - 1);
        }

        let hpet = (boot.hpet_base != 0).then(|| {
            let mut hpet = unsafe { Hpet::new(mapper.phys_to_mapped_mut(boot.hpet_base)) };
            hpet.enable();
            hpet.set_periodic_timer(0, config.tick_interval_us);
            hpet
        });
        let apic = (boot.local_apic_base != 0)
            .then(|| unsafe { LocalApic::new(mapper.phys_to_mapped_mut(boot.local_apic_base)) });

        let mut controller = ProcessController::new();
        let scheduler = Scheduler::new(controller.create_root_process(kernel_root));
        Ok(Self {
            config,
            dram,
            paging,
            kernel_root,
            heap: KernelHeap::new(),
            scheduler,
            controller,
            spa_ranges: boot.spa_ranges,
            pmem_regions,
            hpet,
            apic,
            tss_rsp0: boot.tss_rsp0,
            flusher,
            last_tick_fs: 0,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn paging(&self) -> &Paging<OffsetMapper> {
        &self.paging
    }

    pub fn kernel_root(&self) -> PAddr {
        self.kernel_root
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn free_dram_pages(&self) -> u64 {
        self.dram.free_page_count()
    }

    pub fn dram(&self) -> &FreeListAllocator<OffsetMapper> {
        &self.dram
    }

    pub fn hpet(&self) -> Option<&Hpet> {
        self.hpet.as_ref()
    }

    /// Current time in femtoseconds as far as the kernel can tell
    pub fn now_fs(&self) -> u64 {
        clock_fs(&self.hpet, self.last_tick_fs)
    }

    /// Change the length of a time slice
    pub fn set_tick_interval(&mut self, interval_us: u64) {
        self.config.tick_interval_us = interval_us;
        if let Some(hpet) = &mut self.hpet {
            hpet.set_periodic_timer(0, interval_us);
        }
        log::info!("time slice set to {interval_us}us");
    }

    /// Handle the scheduling timer.
    ///
    /// `frame` holds the registers of the interrupted process and is replaced by those of the next one. A process
    /// that is switched away from is checkpointed if it is persistent.
    pub fn on_timer_tick(&mut self, frame: &mut TrapFrame, now_fs: u64) {
        if let Some(apic) = &mut self.apic {
            apic.end_of_interrupt();
        }
        let elapsed = now_fs.saturating_sub(self.last_tick_fs);
        self.last_tick_fs = now_fs;

        let previous = self.scheduler.current_index();
        if let Some(current) = self.scheduler.current_mut() {
            if frame.frame.cs & 3 == 0 {
                current.add_sys_time_fs(elapsed);
            } else {
                current.add_proc_time_fs(elapsed);
            }
        }

        let Some(next) = self.scheduler.switch_process().and_then(|next| next.scheduler_index()) else {
            return;
        };

        if let Some(previous) = self.scheduler.process_at_mut(previous) {
            if previous.status() != ProcessStatus::Killed {
                let start = clock_fs(&self.hpet, now_fs);
                previous.execution_context_mut().cpu.save_from(frame);
                previous.notify_context_saving(&self.paging, self.flusher);
                previous.add_context_saving_time_fs(clock_fs(&self.hpet, now_fs).saturating_sub(start));
            }
        }

        let Some(next) = self.scheduler.process_at_mut(next) else {
            return;
        };
        let ctx = next.execution_context();
        ctx.cpu.restore_into(frame);
        // the root process runs on the boot stack in kernel mode and has no kernel stack of its own
        if ctx.kernel_rsp != 0 && !self.tss_rsp0.is_null() {
            unsafe { self.tss_rsp0.write_volatile(ctx.kernel_rsp) };
        }
        unsafe { self.paging.activate(ctx.cpu.cr3) };
    }

    /// Load `image` into a new process named after `args[0]`.
    ///
    /// With `pmem_region` set, the process is persistent and placed in that persistent memory region.
    pub fn create_process(
        &mut self,
        image: &[u8],
        args: &[&str],
        pmem_region: Option<usize>,
    ) -> Result<Process, KernelError> {
        let name = args.first().copied().unwrap_or("unnamed");
        let mut process = match pmem_region {
            None => {
                let ctx = loader::build_context(&self.paging, &mut self.dram, self.kernel_root, 0, image, args)?;
                self.controller.create_ephemeral_process(name, ctx)
            }
            Some(region) => {
                let manager = Self::manager(&self.pmem_regions, &self.paging, region)?;
                let info = loader::build_persistent_process_info(
                    &self.paging,
                    manager,
                    self.flusher,
                    self.kernel_root,
                    image,
                    args,
                )?;
                self.controller.create_persistent_process(name, info)
            }
        };
        // only once the image is loaded, so that a broken one costs no kernel stack
        let kernel_rsp = self.heap.alloc_kernel_stack(&mut self.dram, &self.paging, self.kernel_root)?;
        process.set_kernel_stack(kernel_rsp);
        Ok(process)
    }

    pub fn register_process(&mut self, process: Process) -> Result<ProcessId, KernelError> {
        self.scheduler.register_process(process)
    }

    fn manager<'a>(
        regions: &[PAddr],
        paging: &Paging<OffsetMapper>,
        region: usize,
    ) -> Result<&'a mut PersistentMemoryManager, PmemError> {
        let base = *regions.get(region).ok_or(PmemError::NoSuchRegion(region))?;
        Ok(unsafe { PersistentMemoryManager::open(paging.mapper(), base) })
    }

    pub fn pmem_region_count(&self) -> usize {
        self.pmem_regions.len()
    }

    /// The manager of persistent memory region `region`, which may not be initialized
    pub fn pmem_manager(&mut self, region: usize) -> Result<&mut PersistentMemoryManager, PmemError> {
        Self::manager(&self.pmem_regions, &self.paging, region)
    }

    /// Start over with an empty catalogue in persistent memory region `region`
    pub fn init_pmem(&mut self, region: usize) -> Result<(), PmemError> {
        let manager = Self::manager(&self.pmem_regions, &self.paging, region)?;
        manager.init(self.spa_ranges, *self.paging.mapper(), self.flusher);
        Ok(())
    }

    /// Allocate `pages` zeroed pages in persistent memory region `region`
    pub fn alloc_pmem(&mut self, region: usize, pages: u64) -> Result<PAddr, PmemError> {
        let manager = Self::manager(&self.pmem_regions, &self.paging, region)?;
        manager.alloc_pages(pages, AllocInit::Zeroed, *self.paging.mapper(), self.flusher)
    }

    /// Bring back the most recently created persistent process of region `region`
    pub fn restore_persistent_process(&mut self, region: usize) -> Result<Process, KernelError> {
        let manager = Self::manager(&self.pmem_regions, &self.paging, region)?;
        if !manager.is_valid() {
            return Err(PmemError::NotInitialized {
                base: self.pmem_regions[region],
            }
            .into());
        }
        let info = manager
            .last_persistent_process_info()
            .ok_or(PmemError::NoProcessInfo { base: manager.base() })?;
        let mapped = self.paging.mapper().phys_to_mapped(info) as *const PersistentProcessInfo;
        if let Some(running) = self
            .scheduler
            .processes()
            .find(|process| process.status() != ProcessStatus::Killed && process.uses_persistent_info(mapped))
        {
            return Err(KernelError::AlreadyRestored(running.id()));
        }
        self.controller.restore_from_persistent_process_info(
            info,
            &self.paging,
            &mut self.dram,
            &mut self.heap,
            self.kernel_root,
        )
    }
}

/// Access to the kernel behind its lock on behalf of one owner
pub struct KernelHandle<'a, I: InterruptMask> {
    lock: &'a ProcessLock<Option<Kernel>, I>,
    owner: u64,
}

impl<'a, I: InterruptMask> KernelHandle<'a, I> {
    pub fn new(lock: &'a ProcessLock<Option<Kernel>, I>, owner: u64) -> Self {
        Self { lock, owner }
    }

    /// Run `f` with the kernel locked
    pub fn with<R>(&self, f: impl FnOnce(&mut Kernel) -> R) -> Result<R, KernelError> {
        let mut guard = self.lock.lock(self.owner)?;
        let kernel = guard.as_mut().ok_or(KernelError::Uninitialized)?;
        Ok(f(kernel))
    }
}

impl<I: InterruptMask> SchedulerHandle for KernelHandle<'_, I> {
    fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> Result<R, KernelError> {
        self.with(|kernel| f(&mut kernel.scheduler))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    extern crate std;

    use super::*;
    use crate::config::{MemoryRegion, KERNEL_HEAP_BASE, KERNEL_STACK_PAGES};
    use crate::loader::tests::{machine, pmem_range, test_image, Machine, TestImage, DRAM_BASE, DRAM_PAGES, ENTRY};
    use crate::process::ProcessKind;
    use amd64::cache::RecordingFlusher;
    use amd64::context::selectors;
    use std::boxed::Box;
    use ksync::NoInterruptMask;
    use memory::pages_to_bytes;

    /// Boot a kernel on the memory of `machine`.
    ///
    /// Every boot gets fresh kernel page tables from the top of DRAM. The kernel manages the pages below them.
    pub fn boot(machine: &mut Machine, flusher: &'static RecordingFlusher) -> Kernel {
        let memory_map = Box::leak(Box::new([MemoryRegion {
            base: DRAM_BASE + 16 * memory::PAGE_SIZE,
            page_count: DRAM_PAGES - 64,
        }]));
        let spa_ranges = Box::leak(Box::new([pmem_range()]));
        let boot = BootInfo {
            memory_map,
            straight_map_offset: machine.memory.mapper().offset(),
            page_table_root: machine.paging.create_root(&mut machine.frames).unwrap(),
            spa_ranges,
            hpet_base: 0,
            local_apic_base: 0,
            tss_rsp0: core::ptr::null_mut(),
            files: &[],
        };
        Kernel::new(&boot, KernelConfig::default(), flusher).unwrap()
    }

    pub fn flusher() -> &'static RecordingFlusher {
        Box::leak(Box::new(RecordingFlusher::new()))
    }

    fn kernel_frame() -> TrapFrame {
        let mut frame = TrapFrame::default();
        frame.frame.cs = selectors::KERNEL_CS;
        frame.frame.rip = 0xFFFF_FFFF_8000_1234;
        frame.rax = 42;
        frame
    }

    #[test]
    fn tick_without_other_processes_keeps_frame() {
        let mut m = machine();
        let mut kernel = boot(&mut m, flusher());
        let mut frame = kernel_frame();
        kernel.on_timer_tick(&mut frame, 1000);
        assert_eq!(frame, kernel_frame());
        assert_eq!(kernel.scheduler().current().unwrap().statistics().sys_time_fs, 1000);
    }

    #[test]
    fn ticks_alternate_between_root_and_program() {
        let mut m = machine();
        let mut kernel = boot(&mut m, flusher());
        let image = test_image();
        let process = kernel.create_process(&image.0, &["prog"], None).unwrap();
        let pid = kernel.register_process(process).unwrap();

        let mut frame = kernel_frame();
        kernel.on_timer_tick(&mut frame, 10);
        assert_eq!(frame.frame.rip, ENTRY);
        assert_eq!(frame.frame.cs, selectors::USER_CS);
        assert_eq!(frame.rdi, 1);
        assert_eq!(kernel.scheduler().current().unwrap().id(), pid);

        // the program runs for a while and is then preempted
        frame.rax = 7;
        kernel.on_timer_tick(&mut frame, 30);
        assert_eq!(frame, kernel_frame());
        let program = kernel.scheduler().process(pid).unwrap();
        assert_eq!(program.status(), ProcessStatus::Sleeping);
        assert_eq!(program.execution_context().cpu.rax, 7);
        assert_eq!(program.statistics().proc_time_fs, 20);
        assert_eq!(program.statistics().context_switches, 1);

        kernel.on_timer_tick(&mut frame, 40);
        assert_eq!(frame.rax, 7);
    }

    #[test]
    fn killed_program_is_not_resumed() {
        let mut m = machine();
        let mut kernel = boot(&mut m, flusher());
        let image = test_image();
        let process = kernel.create_process(&image.0, &["prog"], None).unwrap();
        let pid = kernel.register_process(process).unwrap();
        let mut frame = kernel_frame();
        kernel.on_timer_tick(&mut frame, 10);

        kernel.scheduler_mut().kill(pid).unwrap();
        frame.rax = 99;
        kernel.on_timer_tick(&mut frame, 20);
        assert_eq!(frame, kernel_frame());
        assert_eq!(kernel.scheduler().process(pid).unwrap().execution_context().cpu.rax, 0);
        kernel.on_timer_tick(&mut frame, 30);
        assert_eq!(frame, kernel_frame());
    }

    #[test]
    fn persistent_process_is_checkpointed_when_preempted() {
        let mut m = machine();
        let flusher = flusher();
        let mut kernel = boot(&mut m, flusher);
        kernel.init_pmem(0).unwrap();
        let image = test_image();
        let process = kernel.create_process(&image.0, &["persist"], Some(0)).unwrap();
        let ProcessKind::Persistent(info) = process.kind() else {
            panic!("process is not persistent");
        };
        let info = *info;
        let pid = kernel.register_process(process).unwrap();
        let valid_before = unsafe { info.as_ref() }.valid_index();

        let mut frame = kernel_frame();
        kernel.on_timer_tick(&mut frame, 10);
        frame.rbx = 0x1234;
        kernel.on_timer_tick(&mut frame, 20);

        let info = unsafe { info.as_ref() };
        assert_ne!(info.valid_index(), valid_before);
        assert_eq!(info.valid_context().cpu.rbx, 0x1234);
        let durable: crate::pmem::PersistentProcessInfo = unsafe { flusher.durable_copy(info as *const _) };
        assert_eq!(durable.valid_context().cpu.rbx, 0x1234);
        let stats = kernel.scheduler().process(pid).unwrap().statistics();
        assert!(stats.checkpoint.flushed_lines > 0);
        assert!(stats.checkpoint.copied_bytes > 0);
    }

    #[test]
    fn persistent_process_survives_a_reboot() {
        let mut m = machine();
        let flusher = flusher();
        {
            let mut kernel = boot(&mut m, flusher);
            kernel.init_pmem(0).unwrap();
            let image = test_image();
            let process = kernel.create_process(&image.0, &["persist"], Some(0)).unwrap();
            kernel.register_process(process).unwrap();
            let mut frame = kernel_frame();
            kernel.on_timer_tick(&mut frame, 10);
            frame.r12 = 0xCAFE;
            kernel.on_timer_tick(&mut frame, 20);
        }

        let mut kernel = boot(&mut m, flusher);
        let restored = kernel.restore_persistent_process(0).unwrap();
        assert!(restored.is_persistent());
        assert_eq!(restored.name(), "restored");
        let ctx = restored.execution_context();
        assert_eq!(ctx.cpu.r12, 0xCAFE);
        assert_ne!(ctx.kernel_rsp, 0);
        let pid = kernel.register_process(restored).unwrap();

        let mut frame = kernel_frame();
        kernel.on_timer_tick(&mut frame, 30);
        assert_eq!(kernel.scheduler().current().unwrap().id(), pid);
        assert_eq!(frame.r12, 0xCAFE);
    }

    #[test]
    fn restore_is_refused_while_the_process_is_alive() {
        let mut m = machine();
        let mut kernel = boot(&mut m, flusher());
        kernel.init_pmem(0).unwrap();
        let image = test_image();
        let process = kernel.create_process(&image.0, &["persist"], Some(0)).unwrap();
        let pid = kernel.register_process(process).unwrap();
        let mut frame = kernel_frame();
        kernel.on_timer_tick(&mut frame, 10);
        kernel.on_timer_tick(&mut frame, 20);

        assert_eq!(kernel.restore_persistent_process(0).err(), Some(KernelError::AlreadyRestored(pid)));
        assert_eq!(kernel.scheduler().len(), 2);

        kernel.scheduler_mut().kill(pid).unwrap();
        let restored = kernel.restore_persistent_process(0).unwrap();
        assert!(restored.uses_persistent_info(match kernel.scheduler().process(pid).unwrap().kind() {
            ProcessKind::Persistent(info) => info.as_ptr(),
            ProcessKind::Ephemeral(_) => panic!("process is not persistent"),
        }));
    }

    #[test]
    fn failed_creation_costs_no_kernel_stack() {
        let mut m = machine();
        let mut kernel = boot(&mut m, flusher());
        let free = kernel.free_dram_pages();
        let window = kernel.heap.remaining();

        let garbage = TestImage([0x55; 192]);
        assert!(matches!(
            kernel.create_process(&garbage.0, &["bad"], None),
            Err(KernelError::Elf(_))
        ));
        let image = test_image();
        // the region is not initialized yet
        assert!(kernel.create_process(&image.0, &["persist"], Some(0)).is_err());
        assert_eq!(kernel.free_dram_pages(), free);
        assert_eq!(kernel.heap.remaining(), window);

        let process = kernel.create_process(&image.0, &["prog"], None).unwrap();
        assert_eq!(process.execution_context().kernel_rsp, KERNEL_HEAP_BASE + pages_to_bytes(KERNEL_STACK_PAGES));
        assert!(kernel.heap.remaining() < window);
    }

    #[test]
    fn pmem_errors_are_reported() {
        let mut m = machine();
        let mut kernel = boot(&mut m, flusher());
        assert_eq!(kernel.alloc_pmem(3, 1), Err(PmemError::NoSuchRegion(3)));
        assert!(matches!(
            kernel.restore_persistent_process(0),
            Err(KernelError::Pmem(PmemError::NotInitialized { .. }))
        ));
        kernel.init_pmem(0).unwrap();
        assert!(matches!(
            kernel.restore_persistent_process(0),
            Err(KernelError::Pmem(PmemError::NoProcessInfo { .. }))
        ));
        assert!(kernel.alloc_pmem(0, 2).is_ok());
    }

    #[test]
    fn handle_reports_missing_kernel() {
        let lock = ProcessLock::<Option<Kernel>, NoInterruptMask>::new(None);
        let handle = KernelHandle::new(&lock, CONSOLE_OWNER);
        assert_eq!(handle.with(|_| ()), Err(KernelError::Uninitialized));
    }
}
