//! Persistent memory on byte addressable NVDIMMs
//!
//! Anything that has to survive a power loss is written with ordinary stores and then explicitly flushed out of the
//! cache. Structures that are updated in place carry a signature and follow the commit protocol of
//! [`PersistentObjectHeader`] or, for checkpoints, the double buffering of [`PersistentProcessInfo`].

mod header;
mod manager;
mod nfit;
mod process_info;

pub use header::{PersistentObjectHeader, OBJECT_SIGNATURE};
pub use manager::{
    Objects, PersistentMemoryManager, PersistentObject, PmemAllocator, PmemError, PmemReport,
    MANAGER_SIGNATURE,
};
pub use nfit::{persistent_memory_ranges, Guid, SpaRange, BYTE_ADDRESSABLE_PERSISTENT_MEMORY};
pub use process_info::{CheckpointStats, PersistentProcessInfo};
