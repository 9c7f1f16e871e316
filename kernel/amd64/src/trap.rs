//! Entry stub of the scheduling timer interrupt.
//!
//! The stub saves every general purpose register below the hardware interrupt frame, forming a
//! [`TrapFrame`](crate::context::TrapFrame), and hands a pointer to it to `handle_timer_interrupt` which is provided by
//! the kernel. Whatever the handler leaves in the frame is what `iretq` resumes, so replacing the frame's content is how
//! a context switch happens.

use crate::context::TrapFrame;

extern "C" {
    /// Implemented by the kernel
    fn handle_timer_interrupt(frame: *mut TrapFrame);

    /// The address to install in the IDT for the timer vector
    pub fn timer_interrupt_entry();
}

core::arch::global_asm!(
    ".global timer_interrupt_entry",
    "timer_interrupt_entry:",
    "push rax",
    "push rbx",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push rbp",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rdi, rsp",
    "cld",
    "call handle_timer_interrupt",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rbp",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rbx",
    "pop rax",
    "iretq",
);
