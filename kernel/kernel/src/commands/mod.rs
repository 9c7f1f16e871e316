//! The commands understood by the kernel console
//!
//! A line is split at whitespace. If its first word names one of the [`KNOWN_COMMANDS`] that command is executed,
//! otherwise the line is taken as a program invocation `<program> [args..] [&]`.

mod line;
mod pmem;
mod program;
mod system;

pub use line::{Edit, LineBuffer, MAX_LINE_LENGTH};
pub use pmem::Pmem;
pub use program::{run_program, ExecutableSource};
pub use system::{Eval, Free, Help, Kill, Ps, Time};

use crate::config::MAX_COMMAND_ARGS;
use crate::kernel::KernelHandle;
use crate::{CommandError, KernelError};
use amd64::cpu::Interrupts;
use core::fmt::Write;

pub const KNOWN_COMMANDS: [&dyn Command; 7] = [&Help, &Ps, &Kill, &Free, &Time, &Eval, &Pmem];

pub trait Command: Sync {
    /// Get the name of the command
    fn name(&self) -> &'static str;

    /// Get the summary of this command
    fn summary(&self) -> &'static str;

    /// Execute the command with the arguments following its name
    fn execute(&self, session: &mut Session<'_>, args: &[&str]) -> Result<(), KernelError>;
}

/// What a command can reach while it runs
pub struct Session<'a> {
    pub kernel: KernelHandle<'a, Interrupts>,
    pub out: &'a mut dyn Write,
    pub executables: &'a dyn ExecutableSource,
    /// Waits for the next interrupt while the console blocks on a foreground process
    pub idle: &'a mut dyn FnMut(),
}

pub type Args<'l> = heapless::Vec<&'l str, MAX_COMMAND_ARGS>;

/// Split a command line into its words
pub fn parse_line(line: &str) -> Result<Args<'_>, CommandError> {
    let mut args = Args::new();
    for word in line.split_whitespace() {
        args.push(word)
            .map_err(|_| CommandError::TooManyArguments(MAX_COMMAND_ARGS))?;
    }
    Ok(args)
}

/// Parse and run one console line
pub fn execute_line(session: &mut Session<'_>, line: &str) -> Result<(), KernelError> {
    let args = parse_line(line)?;
    dispatch(session, &args)
}

pub(crate) fn dispatch(session: &mut Session<'_>, args: &[&str]) -> Result<(), KernelError> {
    let Some((&name, rest)) = args.split_first() else {
        return Ok(());
    };
    match KNOWN_COMMANDS.iter().find(|cmd| cmd.name() == name) {
        Some(cmd) => cmd.execute(session, rest),
        None => run_program(session, args, None),
    }
}

/// Copy as much of `value` as fits into an error message
pub(crate) fn truncated(value: &str) -> heapless::String<32> {
    let mut result = heapless::String::new();
    for c in value.chars() {
        if result.push(c).is_err() {
            break;
        }
    }
    result
}

/// Parse a decimal or `0x` prefixed hexadecimal number
pub(crate) fn parse_number(command: &'static str, value: &str) -> Result<u64, CommandError> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| CommandError::InvalidNumber {
        command,
        value: truncated(value),
    })
}

pub(crate) fn required<'l>(
    args: &[&'l str],
    index: usize,
    command: &'static str,
    name: &'static str,
) -> Result<&'l str, CommandError> {
    args.get(index)
        .copied()
        .ok_or(CommandError::MissingArgument { command, name })
}

#[cfg(test)]
pub(crate) mod tests {
    extern crate std;

    use super::*;
    use crate::config::{BootFile, MAX_COMMAND_ARGS};
    use crate::kernel::tests::{boot, flusher};
    use crate::kernel::{KernelLock, CONSOLE_OWNER, TRAP_OWNER};
    use crate::loader::tests::{machine, test_image, Machine};
    use amd64::context::TrapFrame;
    use ksync::ProcessLock;
    use std::boxed::Box;
    use std::string::String;

    /// A booted kernel together with the memory it runs on and one executable called `prog`
    pub struct Console {
        _machine: Machine,
        pub lock: KernelLock,
        pub files: [BootFile; 1],
    }

    impl Console {
        pub fn new() -> Box<Self> {
            let mut machine = machine();
            let kernel = boot(&mut machine, flusher());
            let image: &'static _ = Box::leak(Box::new(test_image()));
            Box::new(Self {
                _machine: machine,
                lock: ProcessLock::new(Some(kernel)),
                files: [BootFile {
                    name: "prog",
                    content: &image.0,
                }],
            })
        }

        /// Run `line` and return what it printed
        pub fn run(&self, line: &str) -> Result<String, KernelError> {
            self.run_with_idle(line, &mut || panic!("nothing should wait"))
        }

        pub fn run_with_idle(&self, line: &str, idle: &mut dyn FnMut()) -> Result<String, KernelError> {
            let mut out = String::new();
            let mut session = Session {
                kernel: KernelHandle::new(&self.lock, CONSOLE_OWNER),
                out: &mut out,
                executables: &self.files,
                idle,
            };
            execute_line(&mut session, line)?;
            Ok(out)
        }

        /// Play the timer interrupt
        pub fn tick(&self, now_fs: u64) {
            let mut guard = self.lock.lock(TRAP_OWNER).unwrap();
            let mut frame = TrapFrame::default();
            guard.as_mut().unwrap().on_timer_tick(&mut frame, now_fs);
        }
    }

    #[test]
    fn lines_are_split_at_whitespace() {
        let args = parse_line("  pmem   alloc\t4 ").unwrap();
        assert_eq!(args.as_slice(), ["pmem", "alloc", "4"]);
        assert!(parse_line("").unwrap().is_empty());
    }

    #[test]
    fn too_many_words_are_refused() {
        assert_eq!(
            parse_line("a b c d e f g h i"),
            Err(CommandError::TooManyArguments(MAX_COMMAND_ARGS))
        );
    }

    #[test]
    fn numbers_may_be_hexadecimal() {
        assert_eq!(parse_number("kill", "42"), Ok(42));
        assert_eq!(parse_number("kill", "0x2a"), Ok(42));
        assert!(matches!(
            parse_number("kill", "forty-two"),
            Err(CommandError::InvalidNumber { command: "kill", .. })
        ));
    }

    #[test]
    fn empty_line_does_nothing() {
        let console = Console::new();
        assert_eq!(console.run("   ").unwrap(), "");
    }

    #[test]
    fn unknown_program_is_not_found() {
        let console = Console::new();
        assert_eq!(
            console.run("frobnicate --now"),
            Err(CommandError::NotFound(truncated("frobnicate")).into())
        );
    }
}
