use crate::mem::{Level, PhysAddrMask};
use bitflags::bitflags;
use core::fmt::{Binary, Debug, Formatter, LowerHex, Write};
use memory::{PAddr, PAGE_SIZE};

/// An entry of a [`PageTable`](crate::mem::PageTable) on any of the four levels.
///
/// # Format
/// - Bits 4–0 are the attribute bits described by [`EntryFlags::ATTR_MASK`].
/// - Bit 7 marks a 1 GiB page on the PDPT level and a 2 MiB page on the PD level.
/// - Bits `MAXPHYADDR-1`–12 hold the physical address of the next table or of the mapped page.
/// - Bit 63 disables instruction fetches.
///
/// ```text
///  63  62     MAXPHYADDR  MAXPHYADDR-1     12 11   9  8   7   6   5   4   3   2   1   0
/// ┌────┬────────────────┬──────────────────┬──────┬───┬───┬───┬───┬───┬───┬───┬───┬───┐
/// │ XD │    ignored     │     address      │ ign. │ G │ PS│ D │ A │PCD│PWT│ U │ W │ P │
/// └────┴────────────────┴──────────────────┴──────┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
/// ```
#[derive(Copy, Clone, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct PageTableEntry {
    pub(crate) entry: u64,
}

/// What an entry means once its level is known.
///
/// Decoding through this type makes "points to a table" and "maps a page" mutually exclusive.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Entry {
    Absent,
    Table(PAddr),
    Page(PAddr),
}

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self { entry: 0 }
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    /// Return the flags which are encoded in this entry
    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.entry)
    }

    pub fn raw(&self) -> u64 {
        self.entry
    }

    /// Interpret this entry as one located in a table on `level`
    pub fn decode(&self, level: Level, mask: PhysAddrMask) -> Entry {
        if !self.is_present() {
            return Entry::Absent;
        }
        match level {
            Level::Pt => Entry::Page(self.entry & mask.frame_mask(Level::Pt)),
            Level::Pd | Level::Pdpt if self.flags().contains(EntryFlags::HUGE_PAGE) => {
                Entry::Page(self.entry & mask.frame_mask(level))
            }
            _ => Entry::Table(self.entry & mask.frame_mask(Level::Pt)),
        }
    }

    /// Point this entry to the next level table at `table`
    ///
    /// # Safety
    /// Changing the entry of a PageTable inherently changes virtual address mappings.
    /// This can make other, completely unrelated, references and pointers invalid and must always be done with
    /// care.
    pub unsafe fn set_table(&mut self, table: PAddr, attrs: EntryFlags, mask: PhysAddrMask) {
        assert_eq!(
            table & !mask.frame_mask(Level::Pt),
            0,
            "page table address {table:#x} is unaligned or beyond the physical address width"
        );
        self.log_change(table, attrs);
        self.entry = table | (attrs & EntryFlags::ATTR_MASK).bits();
    }

    /// Map a page of `level`'s size at `paddr` through this entry
    ///
    /// # Safety
    /// See [`set_table`](PageTableEntry::set_table).
    pub unsafe fn set_page(
        &mut self,
        level: Level,
        paddr: PAddr,
        attrs: EntryFlags,
        mask: PhysAddrMask,
    ) {
        assert!(level.can_map_page(), "cannot map a page from a PML4 entry");
        assert_eq!(
            paddr & (level.page_size() - 1),
            0,
            "{paddr:#x} is not aligned to a {level:?} page"
        );
        self.log_change(paddr, attrs);
        let huge = match level {
            Level::Pt => EntryFlags::empty(),
            _ => EntryFlags::HUGE_PAGE,
        };
        self.entry = (paddr & mask.frame_mask(level)) | ((attrs & EntryFlags::ATTR_MASK) | huge).bits();
    }

    /// OR additional attribute bits into this entry
    pub fn add_attrs(&mut self, attrs: EntryFlags) {
        self.entry |= (attrs & EntryFlags::ATTR_MASK).bits();
    }

    pub fn remove_flags(&mut self, flags: EntryFlags) {
        self.entry &= !flags.bits();
    }

    /// Clear the content of this entry, setting it to 0x0 and removing all flags.
    ///
    /// # Safety
    /// See [`set_table`](PageTableEntry::set_table).
    pub unsafe fn clear(&mut self) {
        log::trace!("clearing page table entry {:?}", self.location());
        self.entry = 0;
    }

    /// The table page containing this entry and its index in it
    fn location(&self) -> (u64, u64) {
        let addr = self as *const Self as u64;
        (addr & !(PAGE_SIZE - 1), (addr & (PAGE_SIZE - 1)) / 8)
    }

    fn log_change(&self, target: PAddr, attrs: EntryFlags) {
        let (table, index) = self.location();
        log::trace!("setting page table entry {table:#x}:{index} to {target:#x} with flags {attrs:?}");
    }
}

impl Debug for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let (table, index) = self.location();
        if self.is_present() {
            f.write_fmt(format_args!(
                "PageTableEntry {:#x}:{:03} {{ raw: {:#018x}, flags: {:?} }}",
                table, index, self.entry, self.flags()
            ))
        } else {
            f.write_fmt(format_args!("PageTableEntry {table:#x}:{index:03} (absent)"))
        }
    }
}

impl Binary for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Binary::fmt(&self.entry, f)
    }
}

impl LowerHex for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        LowerHex::fmt(&self.entry, f)
    }
}

bitflags! {
    /// The flags that can be set on a [`PageTableEntry`]
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct EntryFlags: u64 {
        /// The entry is used for translation
        const PRESENT = 1 << 0;
        /// Allows writing to the mapped memory
        const WRITABLE = 1 << 1;
        /// Allows access **from user mode**
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        /// Set by the CPU when the entry was used for a translation
        const ACCESSED = 1 << 5;
        /// Set by the CPU when the mapped page was written to (leaf entries only)
        const DIRTY = 1 << 6;
        /// The entry maps a 2 MiB or 1 GiB page instead of pointing to a table
        const HUGE_PAGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;

        /// The attribute bits that a mapping request may carry
        const ATTR_MASK = Self::PRESENT.bits()
            | Self::WRITABLE.bits()
            | Self::USER.bits()
            | Self::WRITE_THROUGH.bits()
            | Self::CACHE_DISABLE.bits();
    }
}

impl Debug for EntryFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let bits = [
            (EntryFlags::NO_EXECUTE, 'X'),
            (EntryFlags::GLOBAL, 'G'),
            (EntryFlags::HUGE_PAGE, 'H'),
            (EntryFlags::DIRTY, 'D'),
            (EntryFlags::ACCESSED, 'A'),
            (EntryFlags::CACHE_DISABLE, 'C'),
            (EntryFlags::WRITE_THROUGH, 'T'),
            (EntryFlags::USER, 'U'),
            (EntryFlags::WRITABLE, 'W'),
            (EntryFlags::PRESENT, 'P'),
        ];
        for (bit, c) in bits {
            f.write_char(if self.contains(bit) { c } else { ' ' })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MASK: PhysAddrMask = PhysAddrMask::new(39);

    #[test]
    fn address_bits_beyond_width_are_ignored() {
        let entry = PageTableEntry {
            entry: 0xFFF0_0000_0020_0003,
        };
        assert_eq!(entry.decode(Level::Pt, MASK), Entry::Page(0x20_0000));
        assert_eq!(entry.decode(Level::Pd, MASK), Entry::Table(0x20_0000));
    }

    #[test]
    fn huge_bit_selects_page_on_upper_levels_only() {
        let mut entry = PageTableEntry::empty();
        unsafe { entry.set_page(Level::Pd, 0x4020_0000, EntryFlags::PRESENT, MASK) };
        assert_eq!(entry.decode(Level::Pd, MASK), Entry::Page(0x4020_0000));
        // on the PML4 level the bit is reserved and never makes a page
        assert_eq!(entry.decode(Level::Pml4, MASK), Entry::Table(0x4020_0000));
    }

    #[test]
    fn absent_without_present_bit() {
        let mut entry = PageTableEntry::empty();
        unsafe { entry.set_page(Level::Pt, 0x5000, EntryFlags::WRITABLE, MASK) };
        assert_eq!(entry.decode(Level::Pt, MASK), Entry::Absent);
    }

    #[test]
    #[should_panic]
    fn unaligned_huge_page_is_rejected() {
        let mut entry = PageTableEntry::empty();
        unsafe { entry.set_page(Level::Pdpt, 0x20_0000, EntryFlags::PRESENT, MASK) };
    }
}
