//! Kernel Synchronisation Primitives
//!
//! The kernel runs on exactly one hardware thread and the only source of concurrency is interrupt driven preemption.
//! Masking interrupts is therefore enough to get exclusive access to shared kernel state.
//! [`ProcessLock`] builds on that and additionally remembers *who* holds it so that accidental recursive or
//! contending acquisition is reported instead of silently deadlocking.
#![no_std]

#[cfg(test)]
extern crate std;

mod interrupts;
mod process_lock;

pub use interrupts::{InterruptMask, NoInterruptMask};
pub use process_lock::{Guard, LockError, ProcessLock};
