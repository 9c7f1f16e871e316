//! Process execution and persistent memory core of the kernel
//!
//! Processes are either *ephemeral*, living in DRAM, or *persistent*, living entirely in byte addressable persistent
//! memory. A persistent process is checkpointed every time the scheduler switches away from it so that it can be
//! resumed from its last checkpoint after the machine restarts.
#![no_std]

#[cfg(feature = "std")]
extern crate std;

pub mod commands;
pub mod config;
mod error;
pub mod heap;
pub mod kernel;
pub mod loader;
pub mod pmem;
pub mod process;
pub mod sched;

pub use error::{CommandError, KernelError};
pub use kernel::{Kernel, KernelHandle, KernelLock};
