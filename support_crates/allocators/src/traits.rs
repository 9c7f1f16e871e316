use memory::PAddr;
use thiserror_no_std::Error;

/// The error returned when an allocation fails
#[derive(Debug, Error, Eq, PartialEq)]
pub enum AllocError {
    #[error("the allocator has no free block larger than the requested {requested} pages")]
    InsufficientMemory { requested: u64 },
    #[error("proximity domain {domain} has no free block larger than the requested {requested} pages")]
    InsufficientMemoryInDomain { requested: u64, domain: u32 },
}

/// A desired initial state for allocated memory
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocInit {
    /// The pages are returned as-is from the allocator.
    /// They may potentially contain old data.
    Uninitialized,

    /// Pages are filled with zeros before being returned to the caller.
    #[default]
    Zeroed,
}

/// An implementation of `PageAllocator` hands out physically contiguous runs of pages.
pub trait PageAllocator {
    /// Allocate `count` contiguous pages and return the physical address of the first one.
    fn alloc_pages(&mut self, count: u64) -> Result<PAddr, AllocError>;

    /// Allocate `count` pages and initialize them according to `init`.
    fn alloc_pages_init(&mut self, count: u64, init: AllocInit) -> Result<PAddr, AllocError>;

    fn alloc_zeroed_page(&mut self) -> Result<PAddr, AllocError> {
        self.alloc_pages_init(1, AllocInit::Zeroed)
    }
}
