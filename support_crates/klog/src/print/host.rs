use core::fmt;
use std::io::Write as _;

/// Writes to the standard output of the hosting process.
pub struct HostWriter {}

impl fmt::Write for HostWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        std::io::stdout()
            .write_all(s.as_bytes())
            .map_err(|_| fmt::Error)
    }
}
