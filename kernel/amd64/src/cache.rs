//! Writing cache lines back to memory.
//!
//! Stores to persistent memory only become durable once the cache line holding them has been written back.
//! Everything that needs durability goes through a [`CacheFlush`] so that tests can observe exactly which lines were
//! made durable and in which order.

pub const CACHE_LINE_SIZE: u64 = 64;

pub trait CacheFlush {
    /// Write back and invalidate the cache line containing `addr`.
    fn flush_line(&self, addr: *const u8);
}

/// Flushing through the `clflush` instruction
#[derive(Debug, Default, Copy, Clone)]
pub struct Clflush;

impl CacheFlush for Clflush {
    #[inline]
    fn flush_line(&self, addr: *const u8) {
        // clflush is ordered with respect to stores to the same line, which is all the commit protocol relies on
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::x86_64::_mm_clflush(addr)
        };
        #[cfg(not(target_arch = "x86_64"))]
        let _ = addr;
    }
}

/// Flush every cache line overlapping `[ptr, ptr + len)` and return how many flushes were issued.
pub fn flush_range<F: CacheFlush + ?Sized>(flusher: &F, ptr: *const u8, len: usize) -> u64 {
    if len == 0 {
        return 0;
    }
    let start = ptr as u64 & !(CACHE_LINE_SIZE - 1);
    let end = ptr as u64 + len as u64;
    let mut line = start;
    let mut count = 0;
    while line < end {
        flusher.flush_line(line as *const u8);
        line += CACHE_LINE_SIZE;
        count += 1;
    }
    count
}

/// Flush all cache lines of `value`
pub fn flush_object<F: CacheFlush + ?Sized, T>(flusher: &F, value: *const T) -> u64 {
    flush_range(flusher, value.cast(), core::mem::size_of::<T>())
}

#[cfg(any(test, feature = "std"))]
pub use recording::RecordingFlusher;

#[cfg(any(test, feature = "std"))]
mod recording {
    use super::{CacheFlush, CACHE_LINE_SIZE};
    use core::cell::{Cell, RefCell};
    use std::collections::BTreeMap;
    use std::vec::Vec;

    /// A [`CacheFlush`] that keeps a copy of every flushed line as a simulated durable medium.
    ///
    /// Reading back through [`durable_bytes`](RecordingFlusher::durable_bytes) yields what would survive a power loss:
    /// the content of each line at the time it was last flushed, or zero for lines never flushed.
    /// [`crash_after`](RecordingFlusher::crash_after) stops recording after a number of flushes to model a power loss
    /// in the middle of an operation.
    #[derive(Debug, Default)]
    pub struct RecordingFlusher {
        durable: RefCell<BTreeMap<u64, [u8; CACHE_LINE_SIZE as usize]>>,
        flushes: Cell<u64>,
        crash_after: Cell<Option<u64>>,
    }

    impl RecordingFlusher {
        pub fn new() -> Self {
            Self::default()
        }

        /// Only the first `flushes` flushes from now on reach the durable medium
        pub fn crash_after(&self, flushes: u64) {
            self.crash_after.set(Some(self.flushes.get() + flushes));
        }

        pub fn flush_count(&self) -> u64 {
            self.flushes.get()
        }

        /// Make the current content of `[ptr, ptr + len)` durable without counting it as a flush
        pub fn persist(&self, ptr: *const u8, len: usize) {
            let mut line = ptr as u64 & !(CACHE_LINE_SIZE - 1);
            while line < ptr as u64 + len as u64 {
                self.record(line);
                line += CACHE_LINE_SIZE;
            }
        }

        pub fn durable_bytes(&self, ptr: *const u8, len: usize) -> Vec<u8> {
            let durable = self.durable.borrow();
            (0..len as u64)
                .map(|i| {
                    let addr = ptr as u64 + i;
                    let line = addr & !(CACHE_LINE_SIZE - 1);
                    durable
                        .get(&line)
                        .map(|content| content[(addr - line) as usize])
                        .unwrap_or(0)
                })
                .collect()
        }

        /// Reconstruct the durable version of the `T` located at `ptr`
        ///
        /// # Safety
        /// Any bit pattern must be a valid `T`.
        pub unsafe fn durable_copy<T>(&self, ptr: *const T) -> T {
            let bytes = self.durable_bytes(ptr.cast(), core::mem::size_of::<T>());
            bytes.as_ptr().cast::<T>().read_unaligned()
        }

        fn record(&self, line: u64) {
            let mut content = [0u8; CACHE_LINE_SIZE as usize];
            unsafe {
                core::ptr::copy_nonoverlapping(line as *const u8, content.as_mut_ptr(), content.len())
            };
            self.durable.borrow_mut().insert(line, content);
        }
    }

    impl CacheFlush for RecordingFlusher {
        fn flush_line(&self, addr: *const u8) {
            let count = self.flushes.get();
            self.flushes.set(count + 1);
            if matches!(self.crash_after.get(), Some(limit) if count >= limit) {
                return;
            }
            self.record(addr as u64 & !(CACHE_LINE_SIZE - 1));
        }
    }
}
