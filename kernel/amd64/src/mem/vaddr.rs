use memory::VAddr;

/// Returned by [`translate`](crate::mem::Paging::translate) when an address is not mapped.
///
/// This value is non-canonical and thus can never be the result of a successful translation.
pub const ADDR_CANNOT_TRANSLATE: u64 = 0x8000_0000_0000_0000;

const INDEX_BITS: u64 = 9;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

/// The levels of the page table hierarchy, named after the table that lives on them
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Pt,
    Pd,
    Pdpt,
    Pml4,
}

impl Level {
    /// The order in which a translation visits the levels
    pub const WALK: [Level; 4] = [Level::Pml4, Level::Pdpt, Level::Pd, Level::Pt];

    pub const fn shift(self) -> u64 {
        match self {
            Level::Pt => 12,
            Level::Pd => 21,
            Level::Pdpt => 30,
            Level::Pml4 => 39,
        }
    }

    /// How much memory a single entry on this level covers
    pub const fn page_size(self) -> u64 {
        1 << self.shift()
    }

    /// The index into a table of this level that `vaddr` selects
    pub const fn index(self, vaddr: VAddr) -> usize {
        ((vaddr >> self.shift()) & INDEX_MASK) as usize
    }

    pub const fn lower(self) -> Option<Level> {
        match self {
            Level::Pml4 => Some(Level::Pdpt),
            Level::Pdpt => Some(Level::Pd),
            Level::Pd => Some(Level::Pt),
            Level::Pt => None,
        }
    }

    /// Whether an entry on this level is able to map a page instead of pointing to another table
    pub const fn can_map_page(self) -> bool {
        !matches!(self, Level::Pml4)
    }
}

/// Whether bits 63–48 of `vaddr` are a sign extension of bit 47
pub const fn is_canonical(vaddr: VAddr) -> bool {
    let upper = vaddr >> 47;
    upper == 0 || upper == 0x1ffff
}
