use crate::InterruptMask;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};
use thiserror_no_std::Error;

const UNLOCKED: u64 = 0;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum LockError {
    #[error("lock is already held by its requester {owner}")]
    Recursive { owner: u64 },
    #[error("lock is held by {holder}")]
    Contended { holder: u64 },
}

/// A lock that is tagged with the id of its holder.
///
/// While a [`Guard`] exists, interrupts are masked via `I` which makes the protected section atomic with respect to
/// preemption on a single core. The holder tag turns re-entrant or contending locking, which on a single core can only
/// be a programming error, into a [`LockError`].
#[derive(Debug)]
pub struct ProcessLock<T, I: InterruptMask> {
    holder: AtomicU64,
    value: UnsafeCell<T>,
    _mask: PhantomData<I>,
}

/// A Guard protecting some data locked through a [`ProcessLock`].
///
/// Use it via the implemented [`Deref`] and [`DerefMut`] traits.
pub struct Guard<'a, T, I: InterruptMask> {
    lock: &'a ProcessLock<T, I>,
    interrupts_were_enabled: bool,
}

impl<T, I: InterruptMask> ProcessLock<T, I> {
    pub const fn new(value: T) -> Self {
        Self {
            holder: AtomicU64::new(UNLOCKED),
            value: UnsafeCell::new(value),
            _mask: PhantomData,
        }
    }

    /// Lock on behalf of `owner` and return a [`Guard`] if the lock was free.
    ///
    /// `owner` must not be 0.
    pub fn lock(&self, owner: u64) -> Result<Guard<'_, T, I>, LockError> {
        assert_ne!(owner, UNLOCKED, "0 is not a valid lock owner");
        let interrupts_were_enabled = I::disable();
        match self
            .holder
            .compare_exchange(UNLOCKED, owner, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Ok(Guard {
                lock: self,
                interrupts_were_enabled,
            }),
            Err(holder) => {
                I::restore(interrupts_were_enabled);
                log::warn!("lock {:p} requested by {owner} but held by {holder}", self);
                if holder == owner {
                    Err(LockError::Recursive { owner })
                } else {
                    Err(LockError::Contended { holder })
                }
            }
        }
    }

    /// The id of the current holder, if any
    pub fn holder(&self) -> Option<u64> {
        match self.holder.load(Ordering::Relaxed) {
            UNLOCKED => None,
            holder => Some(holder),
        }
    }

    /// Get mutable access without locking, which is possible because `&mut self` proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn unlock(&self) {
        self.holder.store(UNLOCKED, Ordering::Release);
    }
}

unsafe impl<T, I: InterruptMask> Sync for ProcessLock<T, I> where T: Send {}

impl<T, I: InterruptMask> Deref for Guard<'_, T, I> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: The very existence of this Guard guarantees we've exclusively locked the lock
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, I: InterruptMask> DerefMut for Guard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: The very existence of this Guard guarantees we've exclusively locked the lock
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T, I: InterruptMask> Drop for Guard<'_, T, I> {
    fn drop(&mut self) {
        self.lock.unlock();
        I::restore(self.interrupts_were_enabled);
    }
}
