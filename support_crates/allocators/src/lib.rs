//! Physical page allocators
//!
//! The allocators in this crate hand out whole pages of physical memory.
//! They never dereference physical addresses themselves but go through a [`PhysMapper`](memory::PhysMapper) so that
//! the same code works on raw physical memory, on the kernel's straight mapping and on host memory during tests.
#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

mod free_list;
mod traits;

pub use free_list::{FreeListAllocator, FreeRegion, FreeRegions};
pub use traits::{AllocError, AllocInit, PageAllocator};
