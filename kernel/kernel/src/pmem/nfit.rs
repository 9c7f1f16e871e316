//! System physical address ranges as described by the ACPI NFIT

use core::fmt::{Debug, Display, Formatter};
use memory::PAddr;

/// A GUID in its mixed-endian in-memory representation
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct Guid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut data4 = [0; 8];
        data4.copy_from_slice(&bytes[8..]);
        Self {
            data1: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_le_bytes([bytes[4], bytes[5]]),
            data3: u16::from_le_bytes([bytes[6], bytes[7]]),
            data4,
        }
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Address range type of byte addressable persistent memory
pub const BYTE_ADDRESSABLE_PERSISTENT_MEMORY: Guid = Guid::new(
    0x66F0_D379,
    0xB4F3,
    0x4074,
    [0xAC, 0x43, 0x0D, 0x33, 0x18, 0xB7, 0x8C, 0xDB],
);

const SPA_RANGE_STRUCTURE_TYPE: u16 = 0;
const SPA_RANGE_STRUCTURE_LENGTH: usize = 56;

/// A system physical address range structure
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SpaRange {
    pub index: u16,
    pub proximity_domain: u32,
    pub type_guid: Guid,
    pub base: PAddr,
    pub length: u64,
}

impl SpaRange {
    /// Decode an NFIT sub-structure, returning `None` if it is not an SPA range
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < SPA_RANGE_STRUCTURE_LENGTH {
            return None;
        }
        let u16_at = |offset: usize| u16::from_le_bytes([raw[offset], raw[offset + 1]]);
        let u32_at = |offset: usize| {
            let mut bytes = [0; 4];
            bytes.copy_from_slice(&raw[offset..offset + 4]);
            u32::from_le_bytes(bytes)
        };
        let u64_at = |offset: usize| {
            let mut bytes = [0; 8];
            bytes.copy_from_slice(&raw[offset..offset + 8]);
            u64::from_le_bytes(bytes)
        };
        if u16_at(0) != SPA_RANGE_STRUCTURE_TYPE || (u16_at(2) as usize) < SPA_RANGE_STRUCTURE_LENGTH {
            return None;
        }
        let mut guid = [0; 16];
        guid.copy_from_slice(&raw[16..32]);
        Some(Self {
            index: u16_at(4),
            proximity_domain: u32_at(12),
            type_guid: Guid::from_bytes(guid),
            base: u64_at(32),
            length: u64_at(40),
        })
    }

    pub fn is_persistent_memory(&self) -> bool {
        self.type_guid == BYTE_ADDRESSABLE_PERSISTENT_MEMORY
    }

    pub fn end(&self) -> PAddr {
        self.base + self.length
    }
}

impl Display for SpaRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "SPA[{}] {:#x}-{:#x} domain {} type {}",
            self.index,
            self.base,
            self.end(),
            self.proximity_domain,
            self.type_guid
        )
    }
}

/// The ranges among `ranges` that are byte addressable persistent memory
pub fn persistent_memory_ranges(ranges: &[SpaRange]) -> impl Iterator<Item = &SpaRange> {
    ranges.iter().filter(|range| range.is_persistent_memory())
}
