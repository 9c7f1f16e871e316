use crate::cpu;
use crate::mem::{
    Entry, EntryFlags, Level, PageTable, PageTableEntry, PhysAddrMask, ADDR_CANNOT_TRANSLATE,
    KERNEL_HALF,
};
use allocators::{AllocError, PageAllocator};
use core::ops::Range;
use memory::{is_page_aligned, PAddr, PhysMapper, VAddr, PAGE_SIZE};
use thiserror_no_std::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum MapError {
    #[error("cannot map {size:#x} bytes from {vaddr:#x} to {paddr:#x} because they are not page aligned")]
    Unaligned { vaddr: VAddr, paddr: PAddr, size: u64 },
    #[error("{vaddr:#x} is already covered by a huge page on the {level:?} level")]
    HugePageConflict { vaddr: VAddr, level: Level },
    #[error("{vaddr:#x} already points to a page table on the {level:?} level")]
    TableConflict { vaddr: VAddr, level: Level },
    #[error("could not allocate a page table")]
    Alloc(#[from] AllocError),
}

/// Builds and walks 4-level page table hierarchies.
///
/// All tables are referenced by physical address and accessed through the [`PhysMapper`] `M`, so the same code
/// manipulates the active address space, a process's address space that is being built, or tables in host memory
/// during tests.
pub struct Paging<M: PhysMapper> {
    mapper: M,
    mask: PhysAddrMask,
}

impl<M: PhysMapper> Paging<M> {
    pub const fn new(mapper: M, mask: PhysAddrMask) -> Self {
        Self { mapper, mask }
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    pub fn mask(&self) -> PhysAddrMask {
        self.mask
    }

    /// Allocate an empty PML4
    pub fn create_root(&self, alloc: &mut impl PageAllocator) -> Result<PAddr, MapError> {
        let root = alloc.alloc_zeroed_page()?;
        log::trace!("created page table root at {root:#x}");
        Ok(root)
    }

    /// Access the table located at physical address `table`.
    ///
    /// # Safety
    /// `table` must point to a page table that is not accessed through any other reference for the returned lifetime.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn table_mut(&self, table: PAddr) -> &mut PageTable {
        &mut *self.mapper.phys_to_mapped_mut::<PageTable>(table)
    }

    /// # Safety
    /// `table` must point to a page table.
    pub unsafe fn table(&self, table: PAddr) -> &PageTable {
        &*self.mapper.phys_to_mapped_const::<PageTable>(table)
    }

    /// Map `size` bytes at `vaddr` to `paddr` using 4 KiB pages.
    ///
    /// Missing tables are allocated from `alloc` and zeroed. `attrs` is ORed into every entry that the walk passes
    /// through because the effective permissions are the intersection of all levels.
    /// Passing `attrs` without [`PRESENT`](EntryFlags::PRESENT) removes existing mappings instead; no tables are
    /// allocated for that.
    pub fn map_range(
        &self,
        alloc: &mut impl PageAllocator,
        root: PAddr,
        vaddr: VAddr,
        paddr: PAddr,
        size: u64,
        attrs: EntryFlags,
    ) -> Result<(), MapError> {
        log::debug!(
            "[map_range] root: {root:#x} vaddr: {vaddr:#x} paddr: {paddr:#x} size: {size:#x} attrs: {attrs:?}"
        );
        if !is_page_aligned(vaddr) || !is_page_aligned(paddr) || !is_page_aligned(size) {
            return Err(MapError::Unaligned { vaddr, paddr, size });
        }

        for offset in (0..size).step_by(PAGE_SIZE as usize) {
            if let Some(entry) = self.walk_to(alloc, root, vaddr + offset, Level::Pt, attrs)? {
                unsafe { entry.set_page(Level::Pt, paddr + offset, attrs, self.mask) };
                self.invalidate(root, vaddr + offset);
            }
        }
        Ok(())
    }

    /// Map a single 2 MiB (`Level::Pd`) or 1 GiB (`Level::Pdpt`) page
    pub fn map_huge_page(
        &self,
        alloc: &mut impl PageAllocator,
        root: PAddr,
        level: Level,
        vaddr: VAddr,
        paddr: PAddr,
        attrs: EntryFlags,
    ) -> Result<(), MapError> {
        assert!(
            matches!(level, Level::Pd | Level::Pdpt),
            "{level:?} cannot hold a huge page"
        );
        log::debug!("[map_huge_page] root: {root:#x} level: {level:?} vaddr: {vaddr:#x} paddr: {paddr:#x}");
        let page_mask = level.page_size() - 1;
        if vaddr & page_mask != 0 || paddr & page_mask != 0 {
            return Err(MapError::Unaligned {
                vaddr,
                paddr,
                size: level.page_size(),
            });
        }

        if let Some(entry) = self.walk_to(alloc, root, vaddr, level, attrs)? {
            if let Entry::Table(_) = entry.decode(level, self.mask) {
                return Err(MapError::TableConflict { vaddr, level });
            }
            unsafe { entry.set_page(level, paddr, attrs, self.mask) };
            self.invalidate(root, vaddr);
        }
        Ok(())
    }

    /// Walk down to the entry responsible for `vaddr` on `target`, creating tables on the way.
    ///
    /// Returns `None` if a table is missing and `attrs` doesn't request a present mapping.
    fn walk_to(
        &self,
        alloc: &mut impl PageAllocator,
        root: PAddr,
        vaddr: VAddr,
        target: Level,
        attrs: EntryFlags,
    ) -> Result<Option<&mut PageTableEntry>, MapError> {
        let mut table = root;
        for level in Level::WALK {
            let entry = unsafe { &mut self.table_mut(table).entries[level.index(vaddr)] };
            if level == target {
                return Ok(Some(entry));
            }
            table = match entry.decode(level, self.mask) {
                Entry::Table(next) => {
                    entry.add_attrs(attrs);
                    next
                }
                Entry::Page(_) => return Err(MapError::HugePageConflict { vaddr, level }),
                Entry::Absent if !attrs.contains(EntryFlags::PRESENT) => return Ok(None),
                Entry::Absent => {
                    let next = alloc.alloc_zeroed_page()?;
                    unsafe { entry.set_table(next, attrs, self.mask) };
                    next
                }
            };
        }
        unreachable!("every walk ends on the PT level")
    }

    /// Translate `vaddr` to the physical address it is mapped to.
    ///
    /// Returns [`ADDR_CANNOT_TRANSLATE`] if any level on the way is absent.
    pub fn translate(&self, root: PAddr, vaddr: VAddr) -> PAddr {
        self.lookup(root, vaddr).unwrap_or(ADDR_CANNOT_TRANSLATE)
    }

    /// Like [`translate`](Paging::translate) but with `None` instead of a sentinel
    pub fn lookup(&self, root: PAddr, vaddr: VAddr) -> Option<PAddr> {
        self.leaf(root, vaddr)
            .map(|(level, paddr)| paddr | (vaddr & (level.page_size() - 1)))
    }

    fn leaf(&self, root: PAddr, vaddr: VAddr) -> Option<(Level, PAddr)> {
        let mut table = root;
        for level in Level::WALK {
            let entry = unsafe { &self.table(table).entries[level.index(vaddr)] };
            match entry.decode(level, self.mask) {
                Entry::Absent => return None,
                Entry::Page(paddr) => return Some((level, paddr)),
                Entry::Table(next) => table = next,
            }
        }
        None
    }

    fn leaf_entry_mut(&self, root: PAddr, vaddr: VAddr) -> Option<(Level, &mut PageTableEntry)> {
        let mut table = root;
        for level in Level::WALK {
            let entry = unsafe { &mut self.table_mut(table).entries[level.index(vaddr)] };
            match entry.decode(level, self.mask) {
                Entry::Absent => return None,
                Entry::Page(_) => return Some((level, entry)),
                Entry::Table(next) => table = next,
            }
        }
        None
    }

    /// Call `f` for every page in `[vaddr, vaddr + size)` that was written to since the last call and reset the
    /// dirty state of 4 KiB pages.
    ///
    /// Returns the number of dirty pages found.
    pub fn take_dirty_pages(
        &self,
        root: PAddr,
        vaddr: VAddr,
        size: u64,
        mut f: impl FnMut(VAddr, PAddr),
    ) -> u64 {
        let mut dirty = 0;
        for offset in (0..size).step_by(PAGE_SIZE as usize) {
            let page = vaddr + offset;
            let Some((level, entry)) = self.leaf_entry_mut(root, page) else {
                continue;
            };
            if !entry.flags().contains(EntryFlags::DIRTY) {
                continue;
            }
            let frame = match entry.decode(level, self.mask) {
                Entry::Page(frame) => frame,
                _ => continue,
            };
            if level == Level::Pt {
                entry.remove_flags(EntryFlags::DIRTY);
                self.invalidate(root, page);
            }
            f(page, frame | (page & (level.page_size() - 1)));
            dirty += 1;
        }
        dirty
    }

    /// Mark every mapped page in `[vaddr, vaddr + size)` dirty.
    ///
    /// Used after the kernel wrote to the backing frames through another mapping, which the CPU doesn't track in
    /// these tables.
    pub fn mark_dirty(&self, root: PAddr, vaddr: VAddr, size: u64) {
        for offset in (0..size).step_by(PAGE_SIZE as usize) {
            if let Some((_, entry)) = self.leaf_entry_mut(root, vaddr + offset) {
                entry.entry |= EntryFlags::DIRTY.bits();
            }
        }
    }

    /// Make `dst_root` map the kernel half of the address space exactly like `src_root`
    pub fn share_kernel_half(&self, dst_root: PAddr, src_root: PAddr) {
        let (dst, src) = unsafe { (self.table_mut(dst_root), self.table(src_root)) };
        dst.entries[KERNEL_HALF].copy_from_slice(&src.entries[KERNEL_HALF]);
    }

    /// Visit the physical address of `root` and of every table reachable through the PML4 entries in `pml4_entries`
    pub fn for_each_table(&self, root: PAddr, pml4_entries: Range<usize>, mut f: impl FnMut(PAddr)) {
        f(root);
        let pml4 = unsafe { self.table(root) };
        for entry in &pml4.entries[pml4_entries] {
            if let Entry::Table(next) = entry.decode(Level::Pml4, self.mask) {
                self.visit_tables(next, Level::Pdpt, &mut f);
            }
        }
    }

    fn visit_tables(&self, table: PAddr, level: Level, f: &mut impl FnMut(PAddr)) {
        f(table);
        // entries of a PT only ever map pages
        let Some(lower) = level.lower() else { return };
        for (_, entry) in unsafe { self.table(table) }.present_entries() {
            if let Entry::Table(next) = entry.decode(level, self.mask) {
                self.visit_tables(next, lower, f);
            }
        }
    }

    /// Make `root` the active address space
    ///
    /// # Safety
    /// The hierarchy must map the executing kernel code and stack.
    pub unsafe fn activate(&self, root: PAddr) {
        cpu::write_cr3(root);
    }

    fn invalidate(&self, root: PAddr, vaddr: VAddr) {
        if cpu::read_cr3() & self.mask.frame_mask(Level::Pt) == root {
            cpu::invalidate_page(vaddr);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use allocators::FreeListAllocator;
    use memory::arena::PageArena;
    use memory::OffsetMapper;

    const BASE: PAddr = 0x100_0000;
    const RW: EntryFlags = EntryFlags::PRESENT.union(EntryFlags::WRITABLE);

    fn setup(pages: usize) -> (PageArena, FreeListAllocator<OffsetMapper>, Paging<OffsetMapper>) {
        let arena = PageArena::new(BASE, pages);
        let mut alloc = FreeListAllocator::new(arena.mapper());
        unsafe { alloc.free_pages(BASE, pages as u64, 0) };
        let paging = Paging::new(arena.mapper(), PhysAddrMask::new(39));
        (arena, alloc, paging)
    }

    #[test]
    fn small_pages_round_trip() {
        let (_arena, mut alloc, paging) = setup(16);
        let root = paging.create_root(&mut alloc).unwrap();
        paging
            .map_range(&mut alloc, root, 0x40_0000, 0x8000_0000, 3 * PAGE_SIZE, RW)
            .unwrap();

        assert_eq!(paging.translate(root, 0x40_0000), 0x8000_0000);
        assert_eq!(paging.translate(root, 0x40_2abc), 0x8000_2abc);
        assert_eq!(paging.translate(root, 0x40_3000), ADDR_CANNOT_TRANSLATE);
        // root + pdpt + pd + pt
        assert_eq!(alloc.free_page_count(), 16 - 4);
    }

    #[test]
    fn two_mib_page_round_trip() {
        let (_arena, mut alloc, paging) = setup(8);
        let root = paging.create_root(&mut alloc).unwrap();
        paging
            .map_huge_page(&mut alloc, root, Level::Pd, 0x4020_0000, 0x20_0000, RW)
            .unwrap();
        assert_eq!(paging.translate(root, 0x4020_0000), 0x20_0000);
        assert_eq!(paging.translate(root, 0x4021_2345), 0x21_2345);

        paging
            .map_huge_page(&mut alloc, root, Level::Pd, 0x4020_0000, 0x20_0000, EntryFlags::WRITABLE)
            .unwrap();
        assert_eq!(paging.translate(root, 0x4020_0000), ADDR_CANNOT_TRANSLATE);
    }

    #[test]
    fn one_gib_page_round_trip() {
        let (_arena, mut alloc, paging) = setup(8);
        let root = paging.create_root(&mut alloc).unwrap();
        paging
            .map_huge_page(&mut alloc, root, Level::Pdpt, 0x80_0000_0000, 0x4000_0000, RW)
            .unwrap();
        assert_eq!(paging.translate(root, 0x80_1234_5678), 0x5234_5678);
    }

    #[test]
    fn clearing_a_mapping_makes_it_untranslatable() {
        let (_arena, mut alloc, paging) = setup(8);
        let root = paging.create_root(&mut alloc).unwrap();
        paging.map_range(&mut alloc, root, 0x1000, 0x9000, PAGE_SIZE, RW).unwrap();
        let free_before = alloc.free_page_count();

        paging
            .map_range(&mut alloc, root, 0x1000, 0x9000, PAGE_SIZE, EntryFlags::WRITABLE)
            .unwrap();
        assert_eq!(paging.translate(root, 0x1000), ADDR_CANNOT_TRANSLATE);

        // clearing where no tables exist allocates nothing
        paging
            .map_range(&mut alloc, root, 0x7F00_0000_0000, 0, PAGE_SIZE, EntryFlags::empty())
            .unwrap();
        assert_eq!(alloc.free_page_count(), free_before);
    }

    #[test]
    fn mapping_below_huge_page_is_rejected() {
        let (_arena, mut alloc, paging) = setup(8);
        let root = paging.create_root(&mut alloc).unwrap();
        paging
            .map_huge_page(&mut alloc, root, Level::Pd, 0x20_0000, 0x20_0000, RW)
            .unwrap();
        assert_eq!(
            paging.map_range(&mut alloc, root, 0x20_1000, 0x5000, PAGE_SIZE, RW),
            Err(MapError::HugePageConflict {
                vaddr: 0x20_1000,
                level: Level::Pd
            })
        );
        assert_eq!(
            paging.map_huge_page(&mut alloc, root, Level::Pd, 0x60_0000, 0x30_0000, RW),
            Err(MapError::Unaligned {
                vaddr: 0x60_0000,
                paddr: 0x30_0000,
                size: Level::Pd.page_size()
            })
        );
    }

    #[test]
    fn attributes_are_ored_into_walk_entries() {
        let (_arena, mut alloc, paging) = setup(16);
        let root = paging.create_root(&mut alloc).unwrap();
        paging
            .map_range(&mut alloc, root, 0x1000, 0x9000, PAGE_SIZE, EntryFlags::PRESENT)
            .unwrap();
        paging
            .map_range(&mut alloc, root, 0x2000, 0xA000, PAGE_SIZE, RW | EntryFlags::USER)
            .unwrap();

        let pml4e = unsafe { paging.table(root) }.entries[0];
        assert!(pml4e.flags().contains(RW | EntryFlags::USER));
        let leaf = paging.leaf_entry_mut(root, 0x1000).unwrap().1;
        assert!(!leaf.flags().contains(EntryFlags::WRITABLE));
    }

    #[test]
    fn unaligned_ranges_are_rejected() {
        let (_arena, mut alloc, paging) = setup(4);
        let root = paging.create_root(&mut alloc).unwrap();
        assert!(matches!(
            paging.map_range(&mut alloc, root, 0x1000, 0x2000, 100, RW),
            Err(MapError::Unaligned { .. })
        ));
    }

    #[test]
    fn running_out_of_table_pages_is_reported() {
        let (_arena, mut alloc, paging) = setup(3);
        let root = paging.create_root(&mut alloc).unwrap();
        assert!(matches!(
            paging.map_range(&mut alloc, root, 0x1000, 0x2000, PAGE_SIZE, RW),
            Err(MapError::Alloc(_))
        ));
    }

    #[test]
    fn dirty_pages_are_reported_once() {
        let (_arena, mut alloc, paging) = setup(16);
        let root = paging.create_root(&mut alloc).unwrap();
        paging
            .map_range(&mut alloc, root, 0x10_0000, 0x50_0000, 4 * PAGE_SIZE, RW)
            .unwrap();
        // pretend the cpu wrote to the second page
        paging.leaf_entry_mut(root, 0x10_1000).unwrap().1.entry |= EntryFlags::DIRTY.bits();

        let mut seen = std::vec::Vec::new();
        let count = paging.take_dirty_pages(root, 0x10_0000, 4 * PAGE_SIZE, |v, p| seen.push((v, p)));
        assert_eq!(count, 1);
        assert_eq!(seen, [(0x10_1000, 0x50_1000)]);
        assert_eq!(paging.take_dirty_pages(root, 0x10_0000, 4 * PAGE_SIZE, |_, _| {}), 0);

        paging.mark_dirty(root, 0x10_0000, 2 * PAGE_SIZE);
        assert_eq!(paging.take_dirty_pages(root, 0x10_0000, 4 * PAGE_SIZE, |_, _| {}), 2);
    }

    #[test]
    fn kernel_half_is_shared_and_tables_are_enumerated() {
        let (_arena, mut alloc, paging) = setup(32);
        let kernel = paging.create_root(&mut alloc).unwrap();
        paging
            .map_range(&mut alloc, kernel, 0xFFFF_8000_0000_0000, 0, PAGE_SIZE, RW)
            .unwrap();
        let process = paging.create_root(&mut alloc).unwrap();
        paging.map_range(&mut alloc, process, 0x40_0000, 0x3000, PAGE_SIZE, RW).unwrap();
        paging.share_kernel_half(process, kernel);

        assert_eq!(paging.translate(process, 0xFFFF_8000_0000_0000), 0);
        assert_eq!(paging.translate(process, 0x40_0000), 0x3000);

        let mut user_tables = 0;
        paging.for_each_table(process, crate::mem::USER_HALF, |_| user_tables += 1);
        assert_eq!(user_tables, 4);
        let mut all_tables = 0;
        paging.for_each_table(process, 0..512, |_| all_tables += 1);
        assert_eq!(all_tables, 7);
    }
}
