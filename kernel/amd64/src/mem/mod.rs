//! Data-Structures and Definitions for x86-64 4-Level Paging
//!
//! # Virtual Addressing Basics
//!
//! A 48-bit virtual address is split into four 9-bit table indices and a 12-bit page offset.
//!
//! ```text
//! 47          39 38          30 29          21 20          12 11            0
//! ┌─────────────┬──────────────┬──────────────┬──────────────┬───────────────┐
//! │    PML4     │     PDPT     │      PD      │      PT      │  page offset  │
//! └─────────────┴──────────────┴──────────────┴──────────────┴───────────────┘
//!     9bits          9bits          9bits          9bits          12bits
//! ```
//!
//! Bits 63–48 must all equal bit 47, otherwise the address is *non-canonical* and faults on use.
//! A PDPT entry may map a 1 GiB page directly and a PD entry a 2 MiB page, cutting the walk short.
//!
//! ## Virtual Address Regions
//!
//! | VAddr Start | VAddr End | Usage |
//! | :---------- | :-------- | ----- |
//! | `0x0000000000000000` | `0x00007fffffffffff` | per process user memory |
//! | `0xffff800000000000` | `0xffffffffffffffff` | kernel memory, shared by all address spaces via PML4 entries 256..512 |
//!
//! Physical addresses stored in entries are limited to the CPU's physical address width, see [`PhysAddrMask`].

mod paddr;
mod page_table_entry;
mod page_tables;
mod paging;
mod vaddr;

pub use paddr::*;
pub use page_table_entry::*;
pub use page_tables::*;
pub use paging::*;
pub use vaddr::*;
