use crate::mem::PageTableEntry;
use core::ops::Range;
use memory::MemoryPage;
use static_assertions::{assert_eq_align, assert_eq_size};

pub const ENTRIES_PER_TABLE: usize = 512;

/// The PML4 entries that map the shared kernel half of every address space
pub const KERNEL_HALF: Range<usize> = 256..ENTRIES_PER_TABLE;

/// The PML4 entries that map process specific memory
pub const USER_HALF: Range<usize> = 0..256;

/// A table of any paging level.
///
/// It exactly fills 4096 bytes which is also the size of mapped pages.
/// An all-zero page is a valid, empty table.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

assert_eq_size!(PageTable, MemoryPage);
assert_eq_align!(PageTable, MemoryPage);

impl PageTable {
    pub fn clear(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }

    pub fn present_entries(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_present())
    }
}
