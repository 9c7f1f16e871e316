//! Page sized memory primitives shared by every part of the kernel.
//!
//! Physical memory is described by [`PAddr`] values which are never dereferenced directly.
//! Instead, a [`PhysMapper`] strategy turns them into pointers that are valid in the current address space.
//! Two strategies exist:
//!
//! - [`IdentityMapper`] for code that runs before paging is set up by the kernel (physical == virtual)
//! - [`OffsetMapper`] for code that reaches physical memory through the kernel's straight mapping
#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

#[cfg(any(test, feature = "std"))]
pub mod arena;
mod mapper;

use core::ops::{Deref, DerefMut};
use static_assertions::{assert_eq_size, const_assert_eq};

pub use mapper::{IdentityMapper, OffsetMapper, PhysMapper};

/// Type alias for physical addresses.
pub type PAddr = u64;

/// Type alias for virtual addresses.
pub type VAddr = u64;

pub const PAGE_SIZE_EXPONENT: u64 = 12;

/// How large each memory page is.
pub const PAGE_SIZE: u64 = 1 << PAGE_SIZE_EXPONENT;

/// Mask selecting the offset of an address inside its page
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Type definition for a slice of bytes that is exactly one page large and aligned to it as well
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(C, align(4096))]
pub struct MemoryPage([u8; PAGE_SIZE as usize]);

assert_eq_size!(MemoryPage, [u8; 4096]);
const_assert_eq!(core::mem::align_of::<MemoryPage>() as u64, PAGE_SIZE);

impl Deref for MemoryPage {
    type Target = [u8; PAGE_SIZE as usize];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MemoryPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Default for MemoryPage {
    fn default() -> Self {
        Self([0u8; PAGE_SIZE as usize])
    }
}

/// How many pages are required to hold `bytes` bytes
#[inline]
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    (bytes + PAGE_OFFSET_MASK) >> PAGE_SIZE_EXPONENT
}

#[inline]
pub const fn pages_to_bytes(pages: u64) -> u64 {
    pages << PAGE_SIZE_EXPONENT
}

#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & PAGE_OFFSET_MASK == 0
}

#[inline]
pub const fn align_down(addr: u64) -> u64 {
    addr & !PAGE_OFFSET_MASK
}

#[inline]
pub const fn align_up(addr: u64) -> u64 {
    (addr + PAGE_OFFSET_MASK) & !PAGE_OFFSET_MASK
}
