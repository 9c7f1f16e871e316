//! Thin wrappers around privileged and special purpose CPU instructions.

#[cfg(target_os = "none")]
use core::arch::asm;
use ksync::InterruptMask;

/// Interrupt flag in RFLAGS
const RFLAGS_IF: u64 = 1 << 9;

/// Physical address width assumed when the CPU doesn't report one
const DEFAULT_PHYS_ADDR_WIDTH: u8 = 36;

#[cfg(target_os = "none")]
pub fn rflags() -> u64 {
    let flags: u64;
    unsafe { asm!("pushfq", "pop {}", out(reg) flags, options(nomem, preserves_flags)) };
    flags
}

#[cfg(not(target_os = "none"))]
pub fn rflags() -> u64 {
    0x2
}

pub fn interrupts_enabled() -> bool {
    rflags() & RFLAGS_IF != 0
}

/// Mask maskable interrupts (`cli`)
///
/// # Safety
/// The caller becomes responsible for unmasking them again.
#[inline]
pub unsafe fn disable_interrupts() {
    #[cfg(target_os = "none")]
    asm!("cli", options(nomem, nostack));
}

/// Unmask interrupts (`sti`)
///
/// # Safety
/// Any pending interrupt is delivered right after this instruction which may switch to another process.
#[inline]
pub unsafe fn enable_interrupts() {
    #[cfg(target_os = "none")]
    asm!("sti", options(nomem, nostack));
}

/// Unmask interrupts and halt until the next one arrives.
///
/// Both instructions execute back to back so that an interrupt can't slip in between them and leave the core halted.
#[inline]
pub fn enable_interrupts_and_halt() {
    #[cfg(target_os = "none")]
    unsafe {
        asm!("sti", "hlt", options(nomem, nostack))
    };
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// Halt forever with interrupts masked
pub fn halt_forever() -> ! {
    loop {
        #[cfg(target_os = "none")]
        unsafe {
            asm!("cli", "hlt", options(nomem, nostack))
        };
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

#[cfg(target_os = "none")]
pub fn read_cr3() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

#[cfg(not(target_os = "none"))]
pub fn read_cr3() -> u64 {
    0
}

/// Switch to the address space rooted at `root`.
///
/// # Safety
/// The new address space must map the currently executing code and stack.
#[inline]
pub unsafe fn write_cr3(root: u64) {
    #[cfg(target_os = "none")]
    asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags));
    #[cfg(not(target_os = "none"))]
    let _ = root;
}

/// Drop any cached translation for `vaddr`
#[inline]
pub fn invalidate_page(vaddr: u64) {
    #[cfg(target_os = "none")]
    unsafe {
        asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags))
    };
    #[cfg(not(target_os = "none"))]
    let _ = vaddr;
}

#[cfg(target_arch = "x86_64")]
pub fn cpuid(leaf: u32, subleaf: u32) -> (u32, u32, u32, u32) {
    let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
    (r.eax, r.ebx, r.ecx, r.edx)
}

#[cfg(target_arch = "x86_64")]
pub fn read_timestamp_counter() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Number of physical address bits the CPU implements (MAXPHYADDR)
#[cfg(target_arch = "x86_64")]
pub fn phys_addr_width() -> u8 {
    let (max_extended_leaf, ..) = cpuid(0x8000_0000, 0);
    if max_extended_leaf < 0x8000_0008 {
        return DEFAULT_PHYS_ADDR_WIDTH;
    }
    let (eax, ..) = cpuid(0x8000_0008, 0);
    (eax & 0xff) as u8
}

#[cfg(not(target_arch = "x86_64"))]
pub fn phys_addr_width() -> u8 {
    DEFAULT_PHYS_ADDR_WIDTH
}

/// The interrupt flag of the executing core
#[derive(Debug)]
pub struct Interrupts;

impl InterruptMask for Interrupts {
    fn disable() -> bool {
        let was_enabled = interrupts_enabled();
        unsafe { disable_interrupts() };
        was_enabled
    }

    fn restore(was_enabled: bool) {
        if was_enabled {
            unsafe { enable_interrupts() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_address_width_is_plausible() {
        let width = phys_addr_width();
        assert!((32..=52).contains(&width), "width {width}");
    }
}
