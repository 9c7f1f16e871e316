use super::header::{commit, persist, PersistentObjectHeader};
use super::nfit::SpaRange;
use super::process_info::PersistentProcessInfo;
use allocators::{AllocError, AllocInit, FreeListAllocator, PageAllocator};
use amd64::cache::{flush_range, CacheFlush, CACHE_LINE_SIZE};
use core::fmt::{Display, Formatter};
use core::marker::PhantomData;
use core::mem::{offset_of, size_of};
use memory::{bytes_to_pages, PAddr, PhysMapper, PAGE_SIZE, PAGE_SIZE_EXPONENT};
use static_assertions::const_assert;
use thiserror_no_std::Error;

/// Marks a [`PersistentMemoryManager`] as completely initialized
pub const MANAGER_SIGNATURE: u64 = 0x4D50_534F_6D75_696C;

const HEADER_SIZE: u64 = size_of::<PersistentObjectHeader>() as u64;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum PmemError {
    #[error("the region at {base:#x} holds no initialized persistent memory manager")]
    NotInitialized { base: PAddr },
    #[error("the region is exhausted: {0}")]
    Exhausted(#[from] AllocError),
    #[error("the region at {base:#x} holds no complete persistent process")]
    NoProcessInfo { base: PAddr },
    #[error("there is no persistent memory region {0}")]
    NoSuchRegion(usize),
}

/// Bookkeeping of one NVDIMM region, stored at the very start of the region it manages.
///
/// ```text
///  base                base + 1 page
///  │                   │
/// [ manager ........... | free pages ... | header page | payload ... | header page | payload ... ]
///     │  └─ sentinel <──────────────────────── next ─┘                    │
///     └── head ────────────────────────────────────────────── (newest) ──┘
/// ```
///
/// Free pages are tracked by a [`FreeListAllocator`] whose list lives in the region as well; only its head is kept
/// here. Every allocation is preceded by a page whose last bytes hold a [`PersistentObjectHeader`], so headers sit
/// directly in front of their payload and form a catalogue from the newest allocation back to the sentinel.
#[derive(Debug)]
#[repr(C)]
pub struct PersistentMemoryManager {
    signature: u64,
    page_idx: u64,
    page_count: u64,
    proximity_domain: u64,
    head: PAddr,
    last_process_info: PAddr,
    free_list: PAddr,
    sentinel: PersistentObjectHeader,
}

const_assert!(size_of::<PersistentMemoryManager>() as u64 <= PAGE_SIZE);

/// One allocation listed in the catalogue
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PersistentObject {
    pub id: u64,
    pub page_count: u64,
    pub payload: PAddr,
    pub valid: bool,
}

impl PersistentMemoryManager {
    /// Access the manager stored at the start of the region at `base`.
    ///
    /// # Safety
    /// `base` must be the start of a persistent memory region that is reachable through `mapper` and not referenced
    /// by anything else for the returned lifetime.
    pub unsafe fn open<'a, M: PhysMapper>(mapper: &M, base: PAddr) -> &'a mut Self {
        &mut *mapper.phys_to_mapped_mut::<Self>(base)
    }

    /// Set up an empty catalogue for the region this manager is stored in.
    ///
    /// Panics if `ranges` has no byte addressable persistent memory range starting at the manager's own address.
    pub fn init<M: PhysMapper + Copy, F: CacheFlush + ?Sized>(
        &mut self,
        ranges: &[SpaRange],
        mapper: M,
        flusher: &F,
    ) {
        let base = mapper.ptr_to_phys(self as *const Self);
        let Some(range) = ranges.iter().find(|range| range.base == base) else {
            panic!("no address range starts at the persistent memory manager at {base:#x}");
        };
        assert!(
            range.is_persistent_memory(),
            "{range} is not byte addressable persistent memory"
        );
        let page_count = range.length >> PAGE_SIZE_EXPONENT;
        assert!(page_count > 2, "{range} is too small to hold anything");

        let sentinel = base + offset_of!(Self, sentinel) as u64;
        // an old catalogue may still refer to the free pages, so they are only released once it is invalid
        commit(flusher, self, |manager| &mut manager.signature, MANAGER_SIGNATURE, |manager| {
            let mut free = FreeListAllocator::new(mapper);
            unsafe { free.free_pages(base + PAGE_SIZE, page_count - 1, range.proximity_domain) };
            persist_free_block(mapper, flusher, free.head());

            manager.page_idx = base >> PAGE_SIZE_EXPONENT;
            manager.page_count = page_count;
            manager.proximity_domain = range.proximity_domain as u64;
            manager.head = sentinel;
            manager.last_process_info = 0;
            manager.free_list = free.head();
            manager.sentinel.init(0, 0, 0, flusher);
        });
        log::info!(
            "initialized persistent memory at {base:#x} with {} free pages",
            page_count - 1
        );
    }

    pub fn is_valid(&self) -> bool {
        self.signature == MANAGER_SIGNATURE
    }

    pub fn base(&self) -> PAddr {
        self.page_idx << PAGE_SIZE_EXPONENT
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Allocate `count` pages, record them in the catalogue and return the address of the first one
    pub fn alloc_pages<M: PhysMapper + Copy, F: CacheFlush + ?Sized>(
        &mut self,
        count: u64,
        init: AllocInit,
        mapper: M,
        flusher: &F,
    ) -> Result<PAddr, PmemError> {
        self.ensure_valid(mapper)?;
        let mut free = unsafe { FreeListAllocator::from_head(mapper, self.free_list) };
        let region = free.alloc_pages_init(count + 1, init)?;
        // the shrunk free block has to be durable before anything refers to the allocation
        persist_free_block(mapper, flusher, free.head());
        if free.head() != self.free_list {
            self.free_list = free.head();
            persist(flusher, &self.free_list);
        }

        let header_paddr = region + PAGE_SIZE - HEADER_SIZE;
        let id = self.header(mapper, self.head).id() + 1;
        let header = unsafe { &mut *mapper.phys_to_mapped_mut::<PersistentObjectHeader>(header_paddr) };
        header.init(id, count, self.head, flusher);

        self.head = header_paddr;
        persist(flusher, &self.head);
        log::debug!("persistent object {id}: {count} pages at {:#x}", region + PAGE_SIZE);
        Ok(region + PAGE_SIZE)
    }

    /// Allocate room for a [`PersistentProcessInfo`] and remember it as the most recent one
    pub fn alloc_persistent_process_info<M: PhysMapper + Copy, F: CacheFlush + ?Sized>(
        &mut self,
        mapper: M,
        flusher: &F,
    ) -> Result<PAddr, PmemError> {
        let pages = bytes_to_pages(size_of::<PersistentProcessInfo>() as u64);
        let paddr = self.alloc_pages(pages, AllocInit::Zeroed, mapper, flusher)?;
        self.last_process_info = paddr;
        persist(flusher, &self.last_process_info);
        Ok(paddr)
    }

    /// The info of the most recently created persistent process
    pub fn last_persistent_process_info(&self) -> Option<PAddr> {
        match self.last_process_info {
            0 => None,
            paddr => Some(paddr),
        }
    }

    /// Walk the catalogue from the newest allocation to the oldest
    pub fn objects<M: PhysMapper + Copy>(&self, mapper: M) -> Objects<'_, M> {
        Objects {
            mapper,
            cursor: self.head,
            sentinel: mapper.ptr_to_phys(&self.sentinel as *const PersistentObjectHeader),
            _manager: PhantomData,
        }
    }

    pub fn free_page_count<M: PhysMapper + Copy>(&self, mapper: M) -> u64 {
        unsafe { FreeListAllocator::from_head(mapper, self.free_list) }.free_page_count()
    }

    /// A printable summary of the region and its catalogue
    pub fn report<M: PhysMapper + Copy>(&self, mapper: M) -> PmemReport<'_, M> {
        PmemReport {
            manager: self,
            mapper,
        }
    }

    fn ensure_valid<M: PhysMapper>(&self, mapper: M) -> Result<(), PmemError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(PmemError::NotInitialized {
                base: mapper.ptr_to_phys(self as *const Self),
            })
        }
    }

    fn header<M: PhysMapper>(&self, mapper: M, paddr: PAddr) -> PersistentObjectHeader {
        unsafe { mapper.phys_to_mapped_const::<PersistentObjectHeader>(paddr).read() }
    }
}

fn persist_free_block<M: PhysMapper, F: CacheFlush + ?Sized>(mapper: M, flusher: &F, block: PAddr) {
    if block != 0 {
        let line = mapper.phys_to_mapped(block) as *const u8;
        flush_range(flusher, line, CACHE_LINE_SIZE as usize);
    }
}

pub struct Objects<'a, M: PhysMapper> {
    mapper: M,
    cursor: PAddr,
    sentinel: PAddr,
    _manager: PhantomData<&'a PersistentMemoryManager>,
}

impl<M: PhysMapper> Iterator for Objects<'_, M> {
    type Item = PersistentObject;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == self.sentinel || self.cursor == 0 {
            return None;
        }
        let header_paddr = self.cursor;
        let header = unsafe {
            self.mapper
                .phys_to_mapped_const::<PersistentObjectHeader>(header_paddr)
                .read()
        };
        self.cursor = header.next();
        Some(PersistentObject {
            id: header.id(),
            page_count: header.page_count(),
            payload: header_paddr + HEADER_SIZE,
            valid: header.is_valid(),
        })
    }
}

pub struct PmemReport<'a, M: PhysMapper + Copy> {
    manager: &'a PersistentMemoryManager,
    mapper: M,
}

impl<M: PhysMapper + Copy> Display for PmemReport<'_, M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let manager = self.manager;
        if !manager.is_valid() {
            return write!(f, "not initialized");
        }
        writeln!(
            f,
            "region {:#x}, {} pages, domain {}, {} pages free",
            manager.base(),
            manager.page_count,
            manager.proximity_domain,
            manager.free_page_count(self.mapper)
        )?;
        for object in manager.objects(self.mapper) {
            writeln!(
                f,
                "  object {:>4}: {:>6} pages at {:#x}{}",
                object.id,
                object.page_count,
                object.payload,
                if object.valid { "" } else { " (incomplete)" }
            )?;
        }
        match manager.last_persistent_process_info() {
            Some(info) => write!(f, "last persistent process info at {info:#x}"),
            None => write!(f, "no persistent process"),
        }
    }
}

/// Serves page allocations from a persistent memory region, e.g. for the page tables of a persistent process
pub struct PmemAllocator<'a, M: PhysMapper + Copy, F: CacheFlush + ?Sized> {
    manager: &'a mut PersistentMemoryManager,
    mapper: M,
    flusher: &'a F,
}

impl<'a, M: PhysMapper + Copy, F: CacheFlush + ?Sized> PmemAllocator<'a, M, F> {
    pub fn new(manager: &'a mut PersistentMemoryManager, mapper: M, flusher: &'a F) -> Self {
        Self {
            manager,
            mapper,
            flusher,
        }
    }

    pub fn manager(&mut self) -> &mut PersistentMemoryManager {
        self.manager
    }
}

impl<M: PhysMapper + Copy, F: CacheFlush + ?Sized> PageAllocator for PmemAllocator<'_, M, F> {
    fn alloc_pages(&mut self, count: u64) -> Result<PAddr, AllocError> {
        self.alloc_pages_init(count, AllocInit::Uninitialized)
    }

    fn alloc_pages_init(&mut self, count: u64, init: AllocInit) -> Result<PAddr, AllocError> {
        match self.manager.alloc_pages(count, init, self.mapper, self.flusher) {
            Ok(paddr) => Ok(paddr),
            Err(PmemError::Exhausted(e)) => Err(e),
            Err(e) => {
                log::error!("{e}");
                Err(AllocError::InsufficientMemory { requested: count })
            }
        }
    }
}
