//! The parts of the local APIC the kernel needs.

/// Byte offset of the end-of-interrupt register
const EOI_REGISTER: usize = 0xB0;

pub struct LocalApic {
    base: *mut u32,
}

impl LocalApic {
    /// # Safety
    /// `base` must be the mapped, uncached register page of the local APIC.
    pub unsafe fn new(base: *mut u32) -> Self {
        Self { base }
    }

    /// Signal that the interrupt currently in service has been handled
    pub fn end_of_interrupt(&mut self) {
        unsafe { self.base.byte_add(EOI_REGISTER).write_volatile(0) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eoi_writes_zero_to_register() {
        let mut page = [0xffff_ffffu32; 64];
        let mut apic = unsafe { LocalApic::new(page.as_mut_ptr()) };
        apic.end_of_interrupt();
        assert_eq!(page[EOI_REGISTER / 4], 0);
        assert_eq!(page[0], 0xffff_ffff);
    }
}
