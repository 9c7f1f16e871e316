use crate::{AllocError, AllocInit, PageAllocator};
use core::fmt::{Display, Formatter};
use memory::{is_page_aligned, PAddr, PhysMapper, PAGE_SIZE};

/// Marks the end of the free list
const END_OF_LIST: PAddr = 0;

/// A run of free pages, stored inside the first of those pages.
///
/// ```text
///   ┌──────────── page_count pages ────────────┐
///   │                                          │
/// [ FreeBlock | ... | ... | ... | ... | ... | ... ]
///      │
///      └── next ──> [ FreeBlock | ... ]
/// ```
#[derive(Debug, Copy, Clone)]
#[repr(C)]
struct FreeBlock {
    page_count: u64,
    next: PAddr,
    proximity_domain: u32,
    _reserved: u32,
}

/// An intrusive free list allocator over physical pages.
///
/// The bookkeeping of this allocator lives in the free memory itself.
/// Every free run of pages starts with a [`FreeBlock`] header and the allocator only remembers the physical address
/// of the first one. Allocations are carved off the *tail* of a block so that the header itself never moves.
///
/// Adjacent free blocks are never merged.
/// Once memory is fragmented, requests larger than every single block fail even if enough pages are free in total.
pub struct FreeListAllocator<M: PhysMapper> {
    mapper: M,
    head: PAddr,
}

/// A free run of pages as seen from outside the allocator
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FreeRegion {
    pub paddr: PAddr,
    pub page_count: u64,
    pub proximity_domain: u32,
}

impl<M: PhysMapper> FreeListAllocator<M> {
    /// Create an allocator that doesn't yet manage any memory
    pub const fn new(mapper: M) -> Self {
        Self {
            mapper,
            head: END_OF_LIST,
        }
    }

    /// Reopen a free list whose first block lives at `head`.
    ///
    /// # Safety
    /// `head` must either be 0 or point to a well-formed free list that is not managed by anyone else.
    pub unsafe fn from_head(mapper: M, head: PAddr) -> Self {
        Self { mapper, head }
    }

    /// The physical address of the first free block or 0 if no memory is free
    pub fn head(&self) -> PAddr {
        self.head
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Add the pages `[paddr, paddr + count * PAGE_SIZE)` to the free list.
    ///
    /// # Safety
    /// The pages must be unused and not already tracked by this (or any other) allocator.
    /// No check for overlapping regions is performed.
    pub unsafe fn free_pages(&mut self, paddr: PAddr, count: u64, proximity_domain: u32) {
        assert!(count > 0, "cannot free an empty range of pages");
        assert!(
            is_page_aligned(paddr),
            "cannot free pages at unaligned address {paddr:#x}"
        );
        assert_ne!(paddr, END_OF_LIST, "physical page 0 cannot be tracked");
        log::trace!(
            "freeing {count} pages at {paddr:#x}..{:#x} (domain {proximity_domain})",
            paddr + count * PAGE_SIZE
        );

        self.block_ptr(paddr).write(FreeBlock {
            page_count: count,
            next: self.head,
            proximity_domain,
            _reserved: 0,
        });
        self.head = paddr;
    }

    /// Allocate pages from the first block that is tagged with `proximity_domain`
    pub fn alloc_pages_in_domain(
        &mut self,
        count: u64,
        proximity_domain: u32,
    ) -> Result<PAddr, AllocError> {
        self.alloc_matching(count, |block| block.proximity_domain == proximity_domain)
            .ok_or(AllocError::InsufficientMemoryInDomain {
                requested: count,
                domain: proximity_domain,
            })
    }

    /// Iterate over all free blocks in list order
    pub fn regions(&self) -> FreeRegions<'_, M> {
        FreeRegions {
            allocator: self,
            cursor: self.head,
        }
    }

    pub fn free_page_count(&self) -> u64 {
        self.regions().map(|region| region.page_count).sum()
    }

    fn alloc_matching(&mut self, count: u64, accept: impl Fn(&FreeBlock) -> bool) -> Option<PAddr> {
        assert!(count > 0, "cannot allocate 0 pages");

        let mut cursor = self.head;
        while cursor != END_OF_LIST {
            // Safety: every address in the list was handed to free_pages() whose contract guarantees exclusive use
            let block = unsafe { &mut *self.block_ptr(cursor) };
            if accept(block) && block.page_count > count {
                block.page_count -= count;
                let paddr = cursor + block.page_count * PAGE_SIZE;
                log::trace!("allocated {count} pages at {paddr:#x} from block {cursor:#x}");
                return Some(paddr);
            }
            cursor = block.next;
        }
        None
    }

    fn block_ptr(&self, paddr: PAddr) -> *mut FreeBlock {
        unsafe { self.mapper.phys_to_mapped_mut(paddr) }
    }
}

impl<M: PhysMapper> PageAllocator for FreeListAllocator<M> {
    /// Allocate `count` pages from the first block that is strictly larger than the request.
    ///
    /// The returned pages are taken from the end of that block.
    fn alloc_pages(&mut self, count: u64) -> Result<PAddr, AllocError> {
        self.alloc_matching(count, |_| true)
            .ok_or(AllocError::InsufficientMemory { requested: count })
    }

    fn alloc_pages_init(&mut self, count: u64, init: AllocInit) -> Result<PAddr, AllocError> {
        let paddr = self.alloc_pages(count)?;
        if init == AllocInit::Zeroed {
            unsafe {
                self.mapper
                    .phys_to_mapped_mut::<u8>(paddr)
                    .write_bytes(0, (count * PAGE_SIZE) as usize);
            }
        }
        Ok(paddr)
    }
}

impl<M: PhysMapper> Display for FreeListAllocator<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        for region in self.regions() {
            writeln!(
                f,
                "{:#018x} - {:#018x} {:>10} pages (domain {})",
                region.paddr,
                region.paddr + region.page_count * PAGE_SIZE,
                region.page_count,
                region.proximity_domain
            )?;
        }
        write!(f, "{} pages free", self.free_page_count())
    }
}

pub struct FreeRegions<'a, M: PhysMapper> {
    allocator: &'a FreeListAllocator<M>,
    cursor: PAddr,
}

impl<M: PhysMapper> Iterator for FreeRegions<'_, M> {
    type Item = FreeRegion;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == END_OF_LIST {
            return None;
        }
        let paddr = self.cursor;
        let block = unsafe { self.allocator.block_ptr(paddr).read() };
        self.cursor = block.next;
        Some(FreeRegion {
            paddr,
            page_count: block.page_count,
            proximity_domain: block.proximity_domain,
        })
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use memory::arena::PageArena;
    use memory::OffsetMapper;

    const BASE: PAddr = 0x10_0000;

    fn allocator(arena: &PageArena) -> FreeListAllocator<OffsetMapper> {
        FreeListAllocator::new(arena.mapper())
    }

    #[test]
    fn allocation_is_taken_from_block_tail() {
        let arena = PageArena::new(BASE, 8);
        let mut alloc = allocator(&arena);
        unsafe { alloc.free_pages(BASE, 8, 0) };

        assert_eq!(alloc.alloc_pages(2), Ok(BASE + 6 * PAGE_SIZE));
        assert_eq!(alloc.alloc_pages(1), Ok(BASE + 5 * PAGE_SIZE));
        assert_eq!(alloc.free_page_count(), 5);
        assert_eq!(alloc.head(), BASE);
    }

    #[test]
    fn block_must_be_strictly_larger_than_request() {
        let arena = PageArena::new(BASE, 4);
        let mut alloc = allocator(&arena);
        unsafe { alloc.free_pages(BASE, 4, 0) };

        assert_eq!(
            alloc.alloc_pages(4),
            Err(AllocError::InsufficientMemory { requested: 4 })
        );
        assert!(alloc.alloc_pages(3).is_ok());
        assert_eq!(alloc.free_page_count(), 1);
        assert!(alloc.alloc_pages(1).is_err());
    }

    #[test]
    fn adjacent_blocks_are_not_merged() {
        let arena = PageArena::new(BASE, 6);
        let mut alloc = allocator(&arena);
        unsafe {
            alloc.free_pages(BASE, 3, 0);
            alloc.free_pages(BASE + 3 * PAGE_SIZE, 3, 0);
        }

        assert_eq!(alloc.free_page_count(), 6);
        assert!(alloc.alloc_pages(4).is_err());
        assert_eq!(alloc.regions().count(), 2);
    }

    #[test]
    fn newest_block_is_scanned_first() {
        let arena = PageArena::new(BASE, 8);
        let mut alloc = allocator(&arena);
        unsafe {
            alloc.free_pages(BASE, 4, 0);
            alloc.free_pages(BASE + 4 * PAGE_SIZE, 4, 0);
        }
        assert_eq!(alloc.alloc_pages(1), Ok(BASE + 7 * PAGE_SIZE));
    }

    #[test]
    fn domain_restricted_allocation() {
        let arena = PageArena::new(BASE, 8);
        let mut alloc = allocator(&arena);
        unsafe {
            alloc.free_pages(BASE, 4, 1);
            alloc.free_pages(BASE + 4 * PAGE_SIZE, 4, 0);
        }

        assert_eq!(alloc.alloc_pages_in_domain(2, 1), Ok(BASE + 2 * PAGE_SIZE));
        assert_eq!(
            alloc.alloc_pages_in_domain(1, 7),
            Err(AllocError::InsufficientMemoryInDomain {
                requested: 1,
                domain: 7
            })
        );
    }

    #[test]
    fn zeroed_allocation_clears_old_content() {
        let mut arena = PageArena::new(BASE, 4);
        arena.bytes_mut(BASE + 3 * PAGE_SIZE, 16).fill(0xAA);
        let mut alloc = allocator(&arena);
        unsafe { alloc.free_pages(BASE, 4, 0) };

        let page = alloc.alloc_zeroed_page().unwrap();
        assert_eq!(page, BASE + 3 * PAGE_SIZE);
        assert!(arena.bytes(page, PAGE_SIZE as usize).iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic]
    fn freeing_zero_pages_panics() {
        let arena = PageArena::new(BASE, 1);
        let mut alloc = allocator(&arena);
        unsafe { alloc.free_pages(BASE, 0, 0) };
    }

    #[test]
    #[should_panic]
    fn freeing_unaligned_pages_panics() {
        let arena = PageArena::new(BASE, 2);
        let mut alloc = allocator(&arena);
        unsafe { alloc.free_pages(BASE + 8, 1, 0) };
    }
}
