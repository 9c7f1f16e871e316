use amd64::cache::{flush_object, CacheFlush};
use core::sync::atomic::{compiler_fence, Ordering};
use memory::PAddr;
use static_assertions::assert_eq_size;

/// Marks a [`PersistentObjectHeader`] as completely written
pub const OBJECT_SIGNATURE: u64 = 0x4F50_534F_6D75_696C;

/// Rewrite a signed structure in persistent memory so that a crash at any point leaves it either invalid or complete.
///
/// 1. the signature is inverted and flushed, invalidating the old content
/// 2. `write` updates the other fields, which are flushed
/// 3. the valid signature is written and flushed
///
/// Returns the number of flushed cache lines.
pub(crate) fn commit<T, F: CacheFlush + ?Sized>(
    flusher: &F,
    target: &mut T,
    signature: fn(&mut T) -> &mut u64,
    magic: u64,
    write: impl FnOnce(&mut T),
) -> u64 {
    let mut flushes = 0;
    unsafe { core::ptr::write_volatile(signature(target), !magic) };
    flushes += persist(flusher, target);
    write(target);
    flushes += persist(flusher, target);
    unsafe { core::ptr::write_volatile(signature(target), magic) };
    flushes += persist(flusher, target);
    flushes
}

/// Flush `value` once all previous writes to it have been emitted
pub(crate) fn persist<T, F: CacheFlush + ?Sized>(flusher: &F, value: *const T) -> u64 {
    compiler_fence(Ordering::SeqCst);
    flush_object(flusher, value)
}

/// The catalogue entry written in front of every persistent allocation.
///
/// Headers form a list from the most recent allocation back to the manager's sentinel whose `next` is 0.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct PersistentObjectHeader {
    signature: u64,
    id: u64,
    page_count: u64,
    next: PAddr,
}

// placed at the end of a page, a header never straddles a cache line
assert_eq_size!(PersistentObjectHeader, [u64; 4]);

impl PersistentObjectHeader {
    /// Write all fields through the commit protocol
    pub fn init<F: CacheFlush + ?Sized>(&mut self, id: u64, page_count: u64, next: PAddr, flusher: &F) -> u64 {
        commit(flusher, self, |header| &mut header.signature, OBJECT_SIGNATURE, |header| {
            header.id = id;
            header.page_count = page_count;
            header.next = next;
        })
    }

    pub fn is_valid(&self) -> bool {
        self.signature == OBJECT_SIGNATURE
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn next(&self) -> PAddr {
        self.next
    }
}
