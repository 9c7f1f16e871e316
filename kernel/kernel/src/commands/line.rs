/// Longest console line that is accepted
pub const MAX_LINE_LENGTH: usize = 128;

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7F;

/// What a byte typed at the console did to the line being edited
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Edit {
    /// The byte was appended and should be echoed
    Append(char),
    /// The last character was removed
    Erase,
    /// The line is complete
    Submit,
    Ignore,
}

/// Collects typed bytes into a command line
#[derive(Debug, Default)]
pub struct LineBuffer {
    line: heapless::String<MAX_LINE_LENGTH>,
}

impl LineBuffer {
    pub const fn new() -> Self {
        Self {
            line: heapless::String::new(),
        }
    }

    pub fn push(&mut self, byte: u8) -> Edit {
        match byte {
            b'\r' | b'\n' => Edit::Submit,
            BACKSPACE | DELETE => match self.line.pop() {
                Some(_) => Edit::Erase,
                None => Edit::Ignore,
            },
            0x20..=0x7E => match self.line.push(byte as char) {
                Ok(()) => Edit::Append(byte as char),
                Err(()) => Edit::Ignore,
            },
            _ => Edit::Ignore,
        }
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn clear(&mut self) {
        self.line.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type_in(buffer: &mut LineBuffer, input: &[u8]) -> Edit {
        input.iter().map(|&byte| buffer.push(byte)).last().unwrap_or(Edit::Ignore)
    }

    #[test]
    fn line_ends_at_return() {
        let mut buffer = LineBuffer::new();
        assert_eq!(type_in(&mut buffer, b"ps"), Edit::Append('s'));
        assert_eq!(buffer.push(b'\r'), Edit::Submit);
        assert_eq!(buffer.line(), "ps");
        buffer.clear();
        assert_eq!(buffer.line(), "");
    }

    #[test]
    fn backspace_erases() {
        let mut buffer = LineBuffer::new();
        type_in(&mut buffer, b"kilx\x08l 2");
        assert_eq!(buffer.line(), "kill 2");
        assert_eq!(type_in(&mut buffer, &[DELETE; 7]), Edit::Ignore);
        assert_eq!(buffer.line(), "");
    }

    #[test]
    fn control_bytes_and_overflow_are_ignored() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push(0x1B), Edit::Ignore);
        type_in(&mut buffer, &[b'a'; MAX_LINE_LENGTH]);
        assert_eq!(buffer.push(b'b'), Edit::Ignore);
        assert_eq!(buffer.line().len(), MAX_LINE_LENGTH);
    }
}
