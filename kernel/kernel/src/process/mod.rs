//! Processes and the bookkeeping that belongs to them
//!
//! A process is either *ephemeral*, owning a single [`ExecutionContext`] in DRAM, or *persistent*, in which case its
//! state lives in a [`PersistentProcessInfo`] on an NVDIMM and is checkpointed every time it is switched away from.

mod context;
mod controller;
mod mapping;

pub use context::ExecutionContext;
pub use controller::ProcessController;
pub use mapping::{HeapError, ProcessMappingInfo, SegmentMapping};

use crate::pmem::{CheckpointStats, PersistentProcessInfo};
use amd64::cache::CacheFlush;
use amd64::mem::Paging;
use core::fmt::{Display, Formatter};
use core::ptr::NonNull;
use memory::{PhysMapper, VAddr};

/// Unique identification of a process, starting at 1
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(pub u64);

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Lifecycle of a process.
///
/// ```text
/// NotScheduled ──register──> Sleeping <──switch──> Running
///       │                       │                     │
///       └───────────────────────┴──────kill───────────┴──> Killed
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessStatus {
    NotScheduled,
    Sleeping,
    Running,
    Killed,
}

impl Display for ProcessStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.pad(match self {
            ProcessStatus::NotScheduled => "new",
            ProcessStatus::Sleeping => "sleeping",
            ProcessStatus::Running => "running",
            ProcessStatus::Killed => "killed",
        })
    }
}

pub enum ProcessKind {
    Ephemeral(ExecutionContext),
    /// Points to the kernel mapping of the info in persistent memory
    Persistent(NonNull<PersistentProcessInfo>),
}

/// Counters collected over the lifetime of a process
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ProcessStatistics {
    pub context_switches: u64,
    pub proc_time_fs: u64,
    pub sys_time_fs: u64,
    pub checkpoint: CheckpointStats,
    pub context_saving_time_fs: u64,
}

const FEMTOSECONDS_PER_MICROSECOND: u64 = 1_000_000_000;

impl Display for ProcessStatistics {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "context switches: {}", self.context_switches)?;
        writeln!(f, "proc time: {} us", self.proc_time_fs / FEMTOSECONDS_PER_MICROSECOND)?;
        write!(f, "sys time: {} us", self.sys_time_fs / FEMTOSECONDS_PER_MICROSECOND)?;
        if self.checkpoint != CheckpointStats::default() {
            writeln!(f)?;
            writeln!(f, "checkpoint bytes copied: {}", self.checkpoint.copied_bytes)?;
            writeln!(f, "checkpoint cache lines flushed: {}", self.checkpoint.flushed_lines)?;
            write!(
                f,
                "context saving time: {} us",
                self.context_saving_time_fs / FEMTOSECONDS_PER_MICROSECOND
            )?;
        }
        Ok(())
    }
}

pub type ProcessName = heapless::String<32>;

pub struct Process {
    id: ProcessId,
    name: ProcessName,
    status: ProcessStatus,
    scheduler_index: Option<usize>,
    kind: ProcessKind,
    stats: ProcessStatistics,
}

// Processes only ever move between the boot code and the interrupt handler of the same core, both of which access
// them through the kernel lock.
unsafe impl Send for Process {}

impl Process {
    pub(crate) fn new(id: ProcessId, name: &str, kind: ProcessKind) -> Self {
        let mut truncated = ProcessName::new();
        for c in name.chars() {
            if truncated.push(c).is_err() {
                break;
            }
        }
        Self {
            id,
            name: truncated,
            status: ProcessStatus::NotScheduled,
            scheduler_index: None,
            kind,
            stats: ProcessStatistics::default(),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: ProcessStatus) {
        log::trace!("process {} {} -> {}", self.id, self.status, status);
        self.status = status;
    }

    pub fn scheduler_index(&self) -> Option<usize> {
        self.scheduler_index
    }

    pub(crate) fn set_scheduler_index(&mut self, index: usize) {
        self.scheduler_index = Some(index);
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.kind, ProcessKind::Persistent(_))
    }

    pub fn kind(&self) -> &ProcessKind {
        &self.kind
    }

    /// The context that the process currently runs on, which for a persistent process is the working slot
    pub fn execution_context(&self) -> &ExecutionContext {
        match &self.kind {
            ProcessKind::Ephemeral(ctx) => ctx,
            ProcessKind::Persistent(info) => unsafe { info.as_ref() }.working_context(),
        }
    }

    pub fn execution_context_mut(&mut self) -> &mut ExecutionContext {
        match &mut self.kind {
            ProcessKind::Ephemeral(ctx) => ctx,
            ProcessKind::Persistent(info) => unsafe { info.as_mut() }.working_context_mut(),
        }
    }

    /// Whether this process checkpoints into `info`
    pub fn uses_persistent_info(&self, info: *const PersistentProcessInfo) -> bool {
        matches!(&self.kind, ProcessKind::Persistent(own) if core::ptr::eq(own.as_ptr(), info))
    }

    /// Let the process enter the kernel on the stack ending at `kernel_rsp`
    pub(crate) fn set_kernel_stack(&mut self, kernel_rsp: VAddr) {
        match &mut self.kind {
            ProcessKind::Ephemeral(ctx) => ctx.kernel_rsp = kernel_rsp,
            ProcessKind::Persistent(info) => {
                for ctx in unsafe { info.as_mut() }.contexts_mut() {
                    ctx.kernel_rsp = kernel_rsp;
                }
            }
        }
    }

    /// Called after the process's registers have been saved because it is being switched away from.
    ///
    /// A persistent process is checkpointed here.
    pub fn notify_context_saving<M: PhysMapper, F: CacheFlush + ?Sized>(
        &mut self,
        paging: &Paging<M>,
        flusher: &F,
    ) {
        self.stats.context_switches += 1;
        if let ProcessKind::Persistent(info) = &mut self.kind {
            let info = unsafe { info.as_mut() };
            info.switch_context(paging, flusher, &mut self.stats.checkpoint);
        }
    }

    /// Terminate the process; it is never scheduled again.
    ///
    /// Returns whether the process was alive before.
    pub fn kill(&mut self) -> bool {
        if self.status == ProcessStatus::Killed {
            return false;
        }
        log::info!("killing process {} ({})", self.id, self.name);
        self.set_status(ProcessStatus::Killed);
        true
    }

    pub fn statistics(&self) -> ProcessStatistics {
        self.stats
    }

    pub fn add_proc_time_fs(&mut self, fs: u64) {
        self.stats.proc_time_fs += fs;
    }

    pub fn add_sys_time_fs(&mut self, fs: u64) {
        self.stats.sys_time_fs += fs;
    }

    pub fn add_context_saving_time_fs(&mut self, fs: u64) {
        self.stats.context_saving_time_fs += fs;
    }
}

impl Display for Process {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:>4} {:<10} {:<10} {}",
            self.id,
            self.status,
            if self.is_persistent() { "persistent" } else { "ephemeral" },
            self.name
        )
    }
}
