use amd64::cache::{flush_range, CacheFlush};
use amd64::mem::Paging;
use core::fmt::{Display, Formatter};
use memory::{is_page_aligned, PAddr, PhysMapper, VAddr, PAGE_SIZE};
use thiserror_no_std::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum HeapError {
    #[error("growing the heap by {delta} bytes exceeds its {capacity} byte segment")]
    Exhausted { delta: i64, capacity: u64 },
    #[error("shrinking the heap by {delta} bytes would move its end below its start")]
    Underflow { delta: i64 },
}

/// One contiguous piece of a process's address space, backed by physically contiguous memory.
///
/// A segment whose `paddr` is 0 has not been backed yet.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct SegmentMapping {
    pub vaddr: VAddr,
    pub paddr: PAddr,
    pub map_size: u64,
}

impl SegmentMapping {
    pub fn new(vaddr: VAddr, paddr: PAddr, map_size: u64) -> Self {
        assert!(
            is_page_aligned(vaddr) && is_page_aligned(map_size),
            "segment {vaddr:#x}+{map_size:#x} is not page aligned"
        );
        Self {
            vaddr,
            paddr,
            map_size,
        }
    }

    pub fn is_backed(&self) -> bool {
        self.paddr != 0
    }

    pub fn end(&self) -> VAddr {
        self.vaddr + self.map_size
    }

    pub fn contains(&self, vaddr: VAddr) -> bool {
        (self.vaddr..self.end()).contains(&vaddr)
    }

    /// Flush the cache lines of every page of this segment that is dirty in `root`
    pub fn flush<M: PhysMapper, F: CacheFlush + ?Sized>(
        &self,
        paging: &Paging<M>,
        root: PAddr,
        flusher: &F,
    ) -> u64 {
        if !self.is_backed() {
            return 0;
        }
        let mut flushes = 0;
        paging.take_dirty_pages(root, self.vaddr, self.map_size, |_, paddr| {
            let page = paging.mapper().phys_to_mapped(paddr) as *const u8;
            flushes += flush_range(flusher, page, PAGE_SIZE as usize);
        });
        flushes
    }

    /// Flush every line of the segment regardless of its dirty state
    pub fn flush_all<M: PhysMapper, F: CacheFlush + ?Sized>(&self, mapper: &M, flusher: &F) -> u64 {
        if !self.is_backed() {
            return 0;
        }
        let start = mapper.phys_to_mapped(self.paddr) as *const u8;
        flush_range(flusher, start, self.map_size as usize)
    }

    /// Overwrite the backing memory of this segment with the content of `other`'s and return the bytes copied
    pub fn copy_data_from<M: PhysMapper>(&self, other: &SegmentMapping, mapper: &M) -> u64 {
        if !self.is_backed() || !other.is_backed() {
            return 0;
        }
        assert_eq!(
            self.map_size, other.map_size,
            "cannot copy between segments of different size"
        );
        unsafe {
            let src = mapper.phys_to_mapped_const::<u8>(other.paddr);
            let dst = mapper.phys_to_mapped_mut::<u8>(self.paddr);
            core::ptr::copy_nonoverlapping(src, dst, self.map_size as usize);
        }
        self.map_size
    }
}

impl Display for SegmentMapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:#014x}-{:#014x} -> {:#014x}",
            self.vaddr,
            self.end(),
            self.paddr
        )
    }
}

/// The four segments a process consists of plus how much of the heap segment is in use
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct ProcessMappingInfo {
    pub code: SegmentMapping,
    pub data: SegmentMapping,
    pub stack: SegmentMapping,
    pub heap: SegmentMapping,
    pub heap_used: u64,
}

impl ProcessMappingInfo {
    /// Move the end of the used heap by `delta` bytes and return the previous end.
    ///
    /// The used size must stay within `[0, heap.map_size]`.
    pub fn expand_heap(&mut self, delta: i64) -> Result<VAddr, HeapError> {
        let previous_end = self.heap.vaddr + self.heap_used;
        let used = self
            .heap_used
            .checked_add_signed(delta)
            .ok_or(HeapError::Underflow { delta })?;
        if used > self.heap.map_size {
            return Err(HeapError::Exhausted {
                delta,
                capacity: self.heap.map_size,
            });
        }
        self.heap_used = used;
        Ok(previous_end)
    }

    pub fn segments(&self) -> [&SegmentMapping; 4] {
        [&self.code, &self.data, &self.stack, &self.heap]
    }

    /// The segments a process can write to, which differ between the two checkpoint slots
    pub fn writable_segments(&self) -> [&SegmentMapping; 3] {
        [&self.data, &self.stack, &self.heap]
    }

    /// Flush the dirty pages of all segments as mapped by `root` and return the number of flushes
    pub fn flush<M: PhysMapper, F: CacheFlush + ?Sized>(
        &self,
        paging: &Paging<M>,
        root: PAddr,
        flusher: &F,
    ) -> u64 {
        self.segments()
            .iter()
            .map(|segment| segment.flush(paging, root, flusher))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use allocators::{FreeListAllocator, PageAllocator};
    use amd64::cache::RecordingFlusher;
    use amd64::mem::{EntryFlags, PhysAddrMask};
    use memory::arena::PageArena;

    fn with_heap(pages: u64) -> ProcessMappingInfo {
        ProcessMappingInfo {
            heap: SegmentMapping::new(0x2_0000_0000, 0x9000, pages * PAGE_SIZE),
            ..Default::default()
        }
    }

    #[test]
    fn heap_grows_up_to_its_segment() {
        let mut info = with_heap(2);
        assert_eq!(info.expand_heap(8192), Ok(0x2_0000_0000));
        assert_eq!(
            info.expand_heap(1),
            Err(HeapError::Exhausted {
                delta: 1,
                capacity: 8192
            })
        );
        assert_eq!(info.heap_used, 8192);
    }

    #[test]
    fn heap_cannot_shrink_below_zero() {
        let mut info = with_heap(1);
        info.expand_heap(100).unwrap();
        assert_eq!(info.expand_heap(-100), Ok(0x2_0000_0000 + 100));
        assert_eq!(info.expand_heap(-1), Err(HeapError::Underflow { delta: -1 }));
        assert_eq!(info.expand_heap(0), Ok(0x2_0000_0000));
    }

    #[test]
    fn only_dirty_pages_are_flushed() {
        const BASE: PAddr = 0x10_0000;
        let arena = PageArena::new(BASE, 16);
        let mut frames = FreeListAllocator::new(arena.mapper());
        unsafe { frames.free_pages(BASE, 16, 0) };
        let paging = Paging::new(arena.mapper(), PhysAddrMask::new(40));
        let root = paging.create_root(&mut frames).unwrap();
        let backing = frames.alloc_pages(3).unwrap();
        let stack = SegmentMapping::new(0x1_0000_0000, backing, 3 * PAGE_SIZE);
        paging
            .map_range(
                &mut frames,
                root,
                stack.vaddr,
                stack.paddr,
                stack.map_size,
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
            )
            .unwrap();
        paging.mark_dirty(root, stack.vaddr + PAGE_SIZE, PAGE_SIZE);

        let flusher = RecordingFlusher::new();
        let info = ProcessMappingInfo {
            stack,
            ..Default::default()
        };
        assert_eq!(info.flush(&paging, root, &flusher), PAGE_SIZE / 64);
        // the dirty state was consumed
        assert_eq!(info.flush(&paging, root, &flusher), 0);
        assert_eq!(stack.flush_all(paging.mapper(), &flusher), 3 * PAGE_SIZE / 64);
    }

    #[test]
    fn copying_transfers_whole_segment() {
        let mut arena = PageArena::new(0x10_0000, 4);
        let mapper = arena.mapper();
        arena.bytes_mut(0x10_0000, 8).copy_from_slice(b"segment!");
        let src = SegmentMapping::new(0x60_0000, 0x10_0000, 2 * PAGE_SIZE);
        let dst = SegmentMapping::new(0x60_0000, 0x10_2000, 2 * PAGE_SIZE);

        assert_eq!(dst.copy_data_from(&src, &mapper), 2 * PAGE_SIZE);
        assert_eq!(arena.bytes(0x10_2000, 8), b"segment!");
        assert_eq!(dst.copy_data_from(&SegmentMapping::default(), &mapper), 0);
    }
}
