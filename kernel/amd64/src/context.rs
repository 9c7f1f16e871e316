//! Register state of an interrupted execution.

use static_assertions::{assert_eq_size, const_assert_eq};

/// Segment selectors as laid out by the boot-time GDT
pub mod selectors {
    pub const KERNEL_CS: u64 = 1 << 3;
    pub const KERNEL_DS: u64 = 2 << 3;
    pub const USER_DS: u64 = (4 << 3) | 3;
    pub const USER_CS: u64 = (5 << 3) | 3;
}

/// The reserved bit 1 of RFLAGS is always set
pub const RFLAGS_RESERVED: u64 = 1 << 1;
pub const RFLAGS_INTERRUPT_ENABLE: u64 = 1 << 9;

/// What the CPU pushes onto the stack when it delivers an interrupt in 64-bit mode.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct InterruptFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// The complete register state of a process as it is stored while the process is not running.
///
/// Its layout is fixed because it is also stored in persistent memory as part of a checkpoint.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct CpuContext {
    pub frame: InterruptFrame,
    // scratch registers
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub rax: u64,
    pub r8: u64,
    pub rdx: u64,
    pub rcx: u64,
    // callee saved registers and arguments
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Root of the page table hierarchy
    pub cr3: u64,
}

assert_eq_size!(CpuContext, [u8; 168]);
const_assert_eq!(core::mem::offset_of!(CpuContext, r11), 40);
const_assert_eq!(core::mem::offset_of!(CpuContext, rbx), 96);
const_assert_eq!(core::mem::offset_of!(CpuContext, cr3), 160);

/// The stack layout produced by the timer interrupt entry stub.
///
/// General purpose registers are pushed in the order `rax, rbx, rcx, ..., r15` below the hardware [`InterruptFrame`]
/// which is why `r15` comes first in memory.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub frame: InterruptFrame,
}

assert_eq_size!(TrapFrame, [u64; 20]);

impl CpuContext {
    /// A context that starts executing at `rip` in user mode with stack pointer `rsp` inside the address space `cr3`.
    ///
    /// Interrupts are enabled once the context runs.
    pub fn new_user(rip: u64, rsp: u64, cr3: u64) -> Self {
        Self {
            frame: InterruptFrame {
                rip,
                cs: selectors::USER_CS,
                rflags: RFLAGS_RESERVED | RFLAGS_INTERRUPT_ENABLE,
                rsp,
                ss: selectors::USER_DS,
            },
            cr3,
            ..Default::default()
        }
    }

    /// Store the register state found in `trap` into this context.
    ///
    /// `cr3` is not part of a trap frame and left untouched.
    pub fn save_from(&mut self, trap: &TrapFrame) {
        self.frame = trap.frame;
        self.r11 = trap.r11;
        self.r10 = trap.r10;
        self.r9 = trap.r9;
        self.rax = trap.rax;
        self.r8 = trap.r8;
        self.rdx = trap.rdx;
        self.rcx = trap.rcx;
        self.rbx = trap.rbx;
        self.rbp = trap.rbp;
        self.rsi = trap.rsi;
        self.rdi = trap.rdi;
        self.r12 = trap.r12;
        self.r13 = trap.r13;
        self.r14 = trap.r14;
        self.r15 = trap.r15;
    }

    /// Write this context into `trap` so that returning from the interrupt resumes it
    pub fn restore_into(&self, trap: &mut TrapFrame) {
        *trap = TrapFrame {
            r15: self.r15,
            r14: self.r14,
            r13: self.r13,
            r12: self.r12,
            r11: self.r11,
            r10: self.r10,
            r9: self.r9,
            r8: self.r8,
            rbp: self.rbp,
            rdi: self.rdi,
            rsi: self.rsi,
            rdx: self.rdx,
            rcx: self.rcx,
            rbx: self.rbx,
            rax: self.rax,
            frame: self.frame,
        };
    }

    /// Copy everything except the page table root from `other`
    pub fn copy_registers_from(&mut self, other: &CpuContext) {
        let cr3 = self.cr3;
        *self = *other;
        self.cr3 = cr3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_frame_round_trip_keeps_cr3() {
        let trap = TrapFrame {
            rax: 1,
            r15: 15,
            rdi: 7,
            frame: InterruptFrame {
                rip: 0x40_1000,
                cs: selectors::USER_CS,
                rflags: 0x202,
                rsp: 0x1_0002_0000,
                ss: selectors::USER_DS,
            },
            ..Default::default()
        };
        let mut ctx = CpuContext {
            cr3: 0x5000,
            ..Default::default()
        };
        ctx.save_from(&trap);
        assert_eq!(ctx.cr3, 0x5000);
        assert_eq!(ctx.rax, 1);

        let mut restored = TrapFrame::default();
        ctx.restore_into(&mut restored);
        assert_eq!(restored, trap);
    }

    #[test]
    fn user_context_runs_with_interrupts_enabled() {
        let ctx = CpuContext::new_user(0x40_0000, 0x1_0000_0000, 0x9000);
        assert_eq!(ctx.frame.rflags & RFLAGS_INTERRUPT_ENABLE, RFLAGS_INTERRUPT_ENABLE);
        assert_eq!(ctx.frame.cs & 3, 3);
    }
}
