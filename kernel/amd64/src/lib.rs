//! x86-64 specific code for the kernel
//!
//! Everything that touches privileged instructions is compiled for real only when building for bare metal
//! (`target_os = "none"`). On a hosted target the same functions exist as inert fallbacks so that the layers above can
//! be exercised by ordinary unit tests.
#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod apic;
pub mod cache;
pub mod context;
pub mod cpu;
pub mod hpet;
pub mod idt;
pub mod mem;
#[cfg(target_os = "none")]
pub mod trap;
