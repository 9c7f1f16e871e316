use core::arch::asm;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

const COM1: u16 = 0x3F8;
const LINE_STATUS: u16 = COM1 + 5;
const DATA_READY: u8 = 1;
const TRANSMIT_EMPTY: u8 = 1 << 5;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

unsafe fn outb(port: u16, value: u8) {
    asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
}

unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
    value
}

/// Program COM1 for 115200 baud, 8 data bits, no parity, one stop bit
unsafe fn init() {
    outb(COM1 + 1, 0x00); // no interrupts
    outb(COM1 + 3, 0x80); // divisor latch access
    outb(COM1, 0x01); // divisor low byte
    outb(COM1 + 1, 0x00); // divisor high byte
    outb(COM1 + 3, 0x03);
    outb(COM1 + 2, 0xC7); // enable and clear fifo
    outb(COM1 + 4, 0x0B);
}

/// Dummy struct that makes converting [`fmt::Arguments`] easier to convert to strings
/// by offloading that to the [`Write`](fmt::Write) trait.
pub struct SerialWriter {}

impl SerialWriter {
    /// Take the next received byte, if any
    pub fn try_read_byte(&mut self) -> Option<u8> {
        if !INITIALIZED.swap(true, Ordering::AcqRel) {
            unsafe { init() };
        }
        unsafe { (inb(LINE_STATUS) & DATA_READY != 0).then(|| inb(COM1)) }
    }

    fn put_byte(&mut self, byte: u8) {
        unsafe {
            while inb(LINE_STATUS) & TRANSMIT_EMPTY == 0 {
                core::hint::spin_loop();
            }
            outb(COM1, byte);
        }
    }
}

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if !INITIALIZED.swap(true, Ordering::AcqRel) {
            unsafe { init() };
        }
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.put_byte(b'\r');
            }
            self.put_byte(byte);
        }
        Ok(())
    }
}
