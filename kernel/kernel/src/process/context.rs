use super::mapping::ProcessMappingInfo;
use amd64::cache::{flush_object, CacheFlush};
use amd64::context::CpuContext;
use amd64::mem::{Level, Paging};
use memory::{PAddr, PhysMapper, VAddr};

/// Everything needed to resume a process: its registers, the kernel stack it enters the kernel on and where its
/// segments live.
///
/// The layout is fixed because two of these make up a [`PersistentProcessInfo`](crate::pmem::PersistentProcessInfo)
/// in persistent memory.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct ExecutionContext {
    pub cpu: CpuContext,
    /// Top of the kernel stack, loaded into the TSS when the context is resumed
    pub kernel_rsp: VAddr,
    pub map_info: ProcessMappingInfo,
}

impl ExecutionContext {
    pub fn new(cpu: CpuContext, kernel_rsp: VAddr, map_info: ProcessMappingInfo) -> Self {
        Self {
            cpu,
            kernel_rsp,
            map_info,
        }
    }

    /// The root of this context's page table hierarchy
    pub fn root<M: PhysMapper>(&self, paging: &Paging<M>) -> PAddr {
        self.cpu.cr3 & paging.mask().frame_mask(Level::Pt)
    }

    /// Make this context durable: its dirty segment pages and the context structure itself.
    ///
    /// Returns the number of cache lines flushed.
    pub fn flush<M: PhysMapper, F: CacheFlush + ?Sized>(&self, paging: &Paging<M>, flusher: &F) -> u64 {
        let pages = self.map_info.flush(paging, self.root(paging), flusher);
        pages + flush_object(flusher, self as *const Self)
    }

    /// Turn this context into a copy of `other` while keeping its own page tables and kernel stack.
    ///
    /// Registers, the heap break and the content of the writable segments are copied. Because the copy is done
    /// through the kernel's mapping, the copied pages are marked dirty in this context's tables so that the next
    /// [`flush`](ExecutionContext::flush) makes them durable.
    ///
    /// Returns the number of bytes copied.
    pub fn copy_from<M: PhysMapper>(&mut self, other: &ExecutionContext, paging: &Paging<M>) -> u64 {
        self.cpu.copy_registers_from(&other.cpu);
        self.map_info.heap_used = other.map_info.heap_used;

        let root = self.root(paging);
        let own = self.map_info.writable_segments();
        let theirs = other.map_info.writable_segments();
        let mut copied = 0;
        for (dst, src) in own.into_iter().zip(theirs) {
            copied += dst.copy_data_from(src, paging.mapper());
            if dst.is_backed() {
                paging.mark_dirty(root, dst.vaddr, dst.map_size);
            }
        }
        copied
    }
}
