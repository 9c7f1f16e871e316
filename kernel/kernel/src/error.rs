use crate::pmem::PmemError;
use crate::process::{HeapError, ProcessId};
use allocators::AllocError;
use amd64::mem::MapError;
use elfloader::ElfLoaderErr;
use ksync::LockError;
use thiserror_no_std::Error;

/// Everything that can go wrong below a console command or the loader.
///
/// Conditions that only concern a single process are reported through this type. Broken kernel invariants panic
/// instead.
#[derive(Debug, Error, PartialEq)]
pub enum KernelError {
    #[error("out of memory: {0}")]
    Alloc(#[from] AllocError),
    #[error("could not map memory: {0}")]
    Map(#[from] MapError),
    #[error("could not lock kernel state: {0}")]
    Lock(#[from] LockError),
    #[error("heap: {0}")]
    Heap(#[from] HeapError),
    #[error("process {0} already runs from this persistent process info")]
    AlreadyRestored(ProcessId),
    #[error("the process table is full")]
    ProcessTableFull,
    #[error("there is no process with id {0}")]
    NoSuchProcess(ProcessId),
    #[error("process {0} runs the console and cannot be killed")]
    RootProcess(ProcessId),
    #[error("persistent memory: {0}")]
    Pmem(#[from] PmemError),
    #[error("invalid executable: {0}")]
    Elf(ElfLoaderErr),
    #[error("code and data of the executable share the page at {0:#x}")]
    SharedSegmentPage(u64),
    #[error("the program arguments take {0} bytes which do not fit onto the stack")]
    ArgumentsTooLarge(u64),
    #[error("{0}")]
    Command(CommandError),
    #[error("the kernel has not been initialized yet")]
    Uninitialized,
    #[error("could not write to the console")]
    Output,
}

impl From<core::fmt::Error> for KernelError {
    fn from(_: core::fmt::Error) -> Self {
        Self::Output
    }
}

impl From<ElfLoaderErr> for KernelError {
    fn from(value: ElfLoaderErr) -> Self {
        Self::Elf(value)
    }
}

impl From<CommandError> for KernelError {
    fn from(value: CommandError) -> Self {
        Self::Command(value)
    }
}

/// Mistakes in how a console command was invoked
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    #[error("{command}: missing argument <{name}>")]
    MissingArgument {
        command: &'static str,
        name: &'static str,
    },
    #[error("{command}: cannot parse '{value}' as a number")]
    InvalidNumber {
        command: &'static str,
        value: heapless::String<32>,
    },
    #[error("{command}: unknown subcommand '{value}'")]
    UnknownSubcommand {
        command: &'static str,
        value: heapless::String<32>,
    },
    #[error("{0}: command not found")]
    NotFound(heapless::String<32>),
    #[error("too many arguments, at most {0} are supported")]
    TooManyArguments(usize),
}
