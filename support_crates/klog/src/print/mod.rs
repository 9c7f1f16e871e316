use core::fmt;
use core::fmt::Write;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod serial;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use serial::SerialWriter as KernelWriter;

#[cfg(all(feature = "std", not(target_os = "none")))]
mod host;

#[cfg(all(feature = "std", not(target_os = "none")))]
pub use host::HostWriter as KernelWriter;

#[cfg(not(any(target_os = "none", feature = "std")))]
mod sink;

#[cfg(not(any(target_os = "none", feature = "std")))]
pub use sink::SinkWriter as KernelWriter;

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // there is nowhere left to report a failing console to
    let _ = KernelWriter {}.write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
