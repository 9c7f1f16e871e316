use crate::mem::Level;

/// Bits of a page table entry that may hold a physical address, given the CPU's physical address width.
///
/// Bits above the width are reserved in entries and must be zero.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PhysAddrMask {
    width: u8,
}

impl PhysAddrMask {
    pub const fn new(width: u8) -> Self {
        assert!(width >= 32 && width <= 52, "unsupported physical address width");
        Self { width }
    }

    /// Query the width from the executing CPU
    pub fn from_cpu() -> Self {
        Self::new(crate::cpu::phys_addr_width())
    }

    pub const fn width(&self) -> u8 {
        self.width
    }

    /// All addressable bits
    pub const fn mask(&self) -> u64 {
        (1 << self.width) - 1
    }

    /// Bits holding the frame address of a page mapped at `level`
    pub const fn frame_mask(&self, level: Level) -> u64 {
        self.mask() & !(level.page_size() - 1)
    }
}

impl Default for PhysAddrMask {
    fn default() -> Self {
        Self::new(52)
    }
}
