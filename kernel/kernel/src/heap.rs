use crate::config::{KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE, KERNEL_STACK_PAGES};
use allocators::{AllocError, AllocInit, PageAllocator};
use amd64::mem::{EntryFlags, MapError, Paging};
use memory::{pages_to_bytes, PAddr, PhysMapper, VAddr};

/// A bump allocator over a window of kernel virtual memory.
///
/// Every request is backed by freshly allocated physical pages which get mapped into the kernel root. The marker is
/// bumped one page further than requested so that each allocation is followed by an unmapped guard page, which turns
/// a kernel stack overflow into a page fault instead of silent corruption of the neighbour.
///
/// ```text
///   KERNEL_HEAP_BASE
///   │
/// [ alloc 0 | guard | alloc 1 ........ | guard | ... free window ... ]
///                                               ^
///                                               └── next
/// ```
///
/// Allocations are never returned.
#[derive(Debug)]
pub struct KernelHeap {
    next: VAddr,
    end: VAddr,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self::with_window(KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE)
    }

    pub const fn with_window(base: VAddr, size: u64) -> Self {
        Self {
            next: base,
            end: base + size,
        }
    }

    /// Bytes of virtual window that are still unused
    pub fn remaining(&self) -> u64 {
        self.end - self.next
    }

    /// Allocate `count` zeroed pages mapped writable into `kernel_root` and return their virtual address
    pub fn alloc_pages<M: PhysMapper>(
        &mut self,
        count: u64,
        frames: &mut impl PageAllocator,
        paging: &Paging<M>,
        kernel_root: PAddr,
    ) -> Result<VAddr, MapError> {
        let reserved = pages_to_bytes(count + 1);
        if reserved > self.remaining() {
            log::warn!("kernel heap window exhausted by a request of {count} pages");
            return Err(AllocError::InsufficientMemory { requested: count }.into());
        }

        let paddr = frames.alloc_pages_init(count, AllocInit::Zeroed)?;
        let vaddr = self.next;
        paging.map_range(
            frames,
            kernel_root,
            vaddr,
            paddr,
            pages_to_bytes(count),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
        )?;
        self.next += reserved;
        log::trace!("kernel heap allocated {count} pages at {vaddr:#x}");
        Ok(vaddr)
    }

    /// Allocate a kernel stack and return its top, which is where the stack pointer starts
    pub fn alloc_kernel_stack<M: PhysMapper>(
        &mut self,
        frames: &mut impl PageAllocator,
        paging: &Paging<M>,
        kernel_root: PAddr,
    ) -> Result<VAddr, MapError> {
        let base = self.alloc_pages(KERNEL_STACK_PAGES, frames, paging, kernel_root)?;
        Ok(base + pages_to_bytes(KERNEL_STACK_PAGES))
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}
