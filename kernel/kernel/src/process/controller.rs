use super::{ExecutionContext, Process, ProcessId, ProcessKind, ProcessMappingInfo};
use crate::heap::KernelHeap;
use crate::pmem::{PersistentProcessInfo, PmemError};
use crate::KernelError;
use allocators::PageAllocator;
use amd64::context::{selectors, CpuContext, InterruptFrame, RFLAGS_RESERVED};
use amd64::mem::Paging;
use core::ptr::NonNull;
use memory::{PAddr, PhysMapper};

/// Hands out process ids and assembles [`Process`]es
#[derive(Debug)]
pub struct ProcessController {
    next_id: u64,
}

impl Default for ProcessController {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessController {
    pub const fn new() -> Self {
        Self { next_id: 1 }
    }

    fn next_id(&mut self) -> ProcessId {
        let id = ProcessId(self.next_id);
        self.next_id += 1;
        id
    }

    /// The process that represents the boot flow itself, which goes on to run the console.
    ///
    /// It runs in kernel mode on the kernel's address space. Its registers are filled in the first time the timer
    /// switches away from it.
    pub fn create_root_process(&mut self, kernel_root: PAddr) -> Process {
        let cpu = CpuContext {
            frame: InterruptFrame {
                cs: selectors::KERNEL_CS,
                ss: selectors::KERNEL_DS,
                rflags: RFLAGS_RESERVED,
                ..Default::default()
            },
            cr3: kernel_root,
            ..Default::default()
        };
        let ctx = ExecutionContext::new(cpu, 0, ProcessMappingInfo::default());
        self.create_ephemeral_process("root", ctx)
    }

    pub fn create_ephemeral_process(&mut self, name: &str, ctx: ExecutionContext) -> Process {
        let id = self.next_id();
        log::debug!("created ephemeral process {id} ({name})");
        Process::new(id, name, ProcessKind::Ephemeral(ctx))
    }

    /// Wrap an initialized info, reached through the kernel's mapping of persistent memory
    pub fn create_persistent_process(&mut self, name: &str, info: NonNull<PersistentProcessInfo>) -> Process {
        let id = self.next_id();
        log::debug!("created persistent process {id} ({name}) with info at {:p}", info);
        Process::new(id, name, ProcessKind::Persistent(info))
    }

    /// Resume a persistent process that was checkpointed before the last restart.
    ///
    /// The working context is rebuilt from the valid one. The kernel half of the address space and the kernel stack
    /// of the previous boot are gone, so both slots get the current kernel half and one fresh kernel stack.
    pub fn restore_from_persistent_process_info<M: PhysMapper>(
        &mut self,
        info: PAddr,
        paging: &Paging<M>,
        frames: &mut impl PageAllocator,
        heap: &mut KernelHeap,
        kernel_root: PAddr,
    ) -> Result<Process, KernelError> {
        let mut ptr = NonNull::new(unsafe { paging.mapper().phys_to_mapped_mut::<PersistentProcessInfo>(info) })
            .ok_or(PmemError::NoProcessInfo { base: info })?;
        let info_ref = unsafe { ptr.as_mut() };
        if !info_ref.is_valid() {
            return Err(PmemError::NoProcessInfo { base: info }.into());
        }

        let copied = info_ref.refresh_working_context(paging);
        let kernel_rsp = heap.alloc_kernel_stack(frames, paging, kernel_root)?;
        for ctx in info_ref.contexts_mut() {
            paging.share_kernel_half(ctx.root(paging), kernel_root);
            ctx.kernel_rsp = kernel_rsp;
        }
        log::info!("restored persistent process info at {info:#x}, {copied} bytes copied into the working context");
        Ok(self.create_persistent_process("restored", ptr))
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::process::ProcessStatus;
    use allocators::FreeListAllocator;
    use amd64::mem::PhysAddrMask;
    use memory::arena::PageArena;
    use memory::OffsetMapper;

    #[test]
    fn ids_start_at_one_and_increase() {
        let mut controller = ProcessController::new();
        let root = controller.create_root_process(0x1000);
        let next = controller.create_ephemeral_process("next", ExecutionContext::default());
        assert_eq!(root.id(), ProcessId(1));
        assert_eq!(next.id(), ProcessId(2));
        assert_eq!(next.status(), ProcessStatus::NotScheduled);
    }

    #[test]
    fn root_process_runs_in_kernel_mode() {
        let mut controller = ProcessController::new();
        let root = controller.create_root_process(0x7000);
        let ctx = root.execution_context();
        assert_eq!(ctx.cpu.cr3, 0x7000);
        assert_eq!(ctx.cpu.frame.cs & 3, 0);
        assert_eq!(root.name(), "root");
        assert!(!root.is_persistent());
    }

    #[test]
    fn restoring_garbage_is_refused() {
        let base = 0x20_0000;
        let arena = PageArena::new(base, 16);
        let mut frames = FreeListAllocator::new(arena.mapper());
        unsafe { frames.free_pages(base, 16, 0) };
        let paging = Paging::new(arena.mapper(), PhysAddrMask::new(40));
        let info = frames.alloc_pages(2).unwrap();
        unsafe {
            arena
                .mapper()
                .phys_to_mapped_mut::<u8>(info)
                .write_bytes(0xAB, 2 * memory::PAGE_SIZE as usize)
        };

        let mut heap = KernelHeap::with_window(0xFFFF_FFFF_9000_0000, 0x10_0000);
        let kernel_root = paging.create_root(&mut frames).unwrap();
        let result = ProcessController::new().restore_from_persistent_process_info::<OffsetMapper>(
            info,
            &paging,
            &mut frames,
            &mut heap,
            kernel_root,
        );
        assert!(matches!(
            result,
            Err(KernelError::Pmem(PmemError::NoProcessInfo { base })) if base == info
        ));
    }
}
