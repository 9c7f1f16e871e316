//! Interrupt descriptor table

use crate::context::selectors;
use static_assertions::assert_eq_size;

/// The vector on which the scheduling timer interrupt arrives
pub const TIMER_VECTOR: usize = 0x20;

const PRESENT: u16 = 1 << 15;
const INTERRUPT_GATE: u16 = 0xE << 8;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    attributes: u16,
    offset_mid: u16,
    offset_high: u32,
    _reserved: u32,
}

assert_eq_size!(IdtEntry, [u8; 16]);

impl IdtEntry {
    /// An interrupt gate (interrupts stay masked while the handler runs) jumping to `handler` in kernel code
    pub fn interrupt_gate(handler: u64) -> Self {
        Self {
            offset_low: handler as u16,
            selector: selectors::KERNEL_CS as u16,
            attributes: PRESENT | INTERRUPT_GATE,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            _reserved: 0,
        }
    }

    pub fn handler(&self) -> u64 {
        self.offset_low as u64 | (self.offset_mid as u64) << 16 | (self.offset_high as u64) << 32
    }

    pub fn is_present(&self) -> bool {
        self.attributes & PRESENT != 0
    }
}

#[repr(C, align(16))]
pub struct Idt {
    pub entries: [IdtEntry; 256],
}

impl Idt {
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry {
                offset_low: 0,
                selector: 0,
                attributes: 0,
                offset_mid: 0,
                offset_high: 0,
                _reserved: 0,
            }; 256],
        }
    }

    /// Make this table the active one.
    ///
    /// # Safety
    /// Every present entry must point to a valid interrupt handler.
    #[cfg(target_os = "none")]
    pub unsafe fn load(&'static self) {
        #[repr(C, packed)]
        struct Descriptor {
            limit: u16,
            base: u64,
        }
        let descriptor = Descriptor {
            limit: (core::mem::size_of::<Self>() - 1) as u16,
            base: self as *const Self as u64,
        };
        core::arch::asm!("lidt [{}]", in(reg) &descriptor, options(readonly, nostack, preserves_flags));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_encodes_handler_address() {
        let entry = IdtEntry::interrupt_gate(0xFFFF_FFFF_8012_3456);
        assert_eq!(entry.handler(), 0xFFFF_FFFF_8012_3456);
        assert!(entry.is_present());
        assert!(!Idt::new().entries[TIMER_VECTOR].is_present());
    }
}
