use crate::{PAddr, VAddr};

/// A strategy for reaching physical memory from the currently active address space.
///
/// # Safety
/// Implementors must guarantee that `phys_to_mapped` and `mapped_to_phys` are inverse to each other and that a
/// translated address is valid to access whenever the physical address refers to usable memory.
pub unsafe trait PhysMapper {
    fn phys_to_mapped(&self, phys: PAddr) -> VAddr;

    fn mapped_to_phys(&self, mapped: VAddr) -> PAddr;

    /// Get a mutable pointer through which the memory at `phys` can be accessed.
    ///
    /// # Safety
    /// The caller must ensure that a valid `T` lives at `phys` before reading through the pointer.
    #[inline]
    unsafe fn phys_to_mapped_mut<T>(&self, phys: PAddr) -> *mut T {
        self.phys_to_mapped(phys) as *mut T
    }

    /// # Safety
    /// See [`phys_to_mapped_mut`](PhysMapper::phys_to_mapped_mut).
    #[inline]
    unsafe fn phys_to_mapped_const<T>(&self, phys: PAddr) -> *const T {
        self.phys_to_mapped(phys) as *const T
    }

    #[inline]
    fn ptr_to_phys<T>(&self, ptr: *const T) -> PAddr {
        self.mapped_to_phys(ptr as VAddr)
    }
}

/// Physical memory is accessed at its own address.
///
/// This is the situation while still running on the firmware's page tables.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct IdentityMapper;

unsafe impl PhysMapper for IdentityMapper {
    #[inline]
    fn phys_to_mapped(&self, phys: PAddr) -> VAddr {
        phys
    }

    #[inline]
    fn mapped_to_phys(&self, mapped: VAddr) -> PAddr {
        mapped
    }
}

/// Physical memory is accessed through a straight mapping located `offset` bytes above it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OffsetMapper {
    offset: u64,
}

impl OffsetMapper {
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

unsafe impl PhysMapper for OffsetMapper {
    #[inline]
    fn phys_to_mapped(&self, phys: PAddr) -> VAddr {
        phys.wrapping_add(self.offset)
    }

    #[inline]
    fn mapped_to_phys(&self, mapped: VAddr) -> PAddr {
        mapped.wrapping_sub(self.offset)
    }
}
