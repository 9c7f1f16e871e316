//! Host backed physical memory for exercising kernel code outside of the kernel.
//!
//! A [`PageArena`] owns a block of real, page aligned memory and pretends that it is located at a chosen physical
//! base address. Code under test only ever sees [`PAddr`]s and reaches the bytes through [`PageArena::mapper`], just
//! like it would reach real physical memory through the kernel's straight mapping.

use crate::{MemoryPage, OffsetMapper, PAddr, PhysMapper, PAGE_SIZE};
use std::boxed::Box;
use std::vec;

pub struct PageArena {
    pages: Box<[MemoryPage]>,
    phys_base: PAddr,
}

impl PageArena {
    /// Allocate `page_count` zeroed pages that appear at physical address `phys_base`
    pub fn new(phys_base: PAddr, page_count: usize) -> Self {
        assert!(crate::is_page_aligned(phys_base));
        Self {
            pages: vec![MemoryPage::default(); page_count].into_boxed_slice(),
            phys_base,
        }
    }

    pub fn phys_base(&self) -> PAddr {
        self.phys_base
    }

    pub fn page_count(&self) -> u64 {
        self.pages.len() as u64
    }

    pub fn byte_size(&self) -> u64 {
        self.page_count() * PAGE_SIZE
    }

    /// Physical address of the page at `index` inside the arena
    pub fn page_addr(&self, index: u64) -> PAddr {
        assert!(index < self.page_count());
        self.phys_base + index * PAGE_SIZE
    }

    pub fn contains(&self, paddr: PAddr) -> bool {
        paddr >= self.phys_base && paddr < self.phys_base + self.byte_size()
    }

    /// A mapper under which the arena's physical addresses resolve to its backing memory
    pub fn mapper(&self) -> OffsetMapper {
        OffsetMapper::new((self.pages.as_ptr() as u64).wrapping_sub(self.phys_base))
    }

    /// The bytes located at physical address `paddr`
    pub fn bytes(&self, paddr: PAddr, len: usize) -> &[u8] {
        assert!(self.contains(paddr) && paddr + len as u64 <= self.phys_base + self.byte_size());
        unsafe { core::slice::from_raw_parts(self.mapper().phys_to_mapped_const(paddr), len) }
    }

    pub fn bytes_mut(&mut self, paddr: PAddr, len: usize) -> &mut [u8] {
        assert!(self.contains(paddr) && paddr + len as u64 <= self.phys_base + self.byte_size());
        let offset = (paddr - self.phys_base) as usize;
        unsafe { core::slice::from_raw_parts_mut(self.pages.as_mut_ptr().cast::<u8>().add(offset), len) }
    }
}
