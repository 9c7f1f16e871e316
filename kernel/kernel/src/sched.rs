//! Round-robin scheduling over a fixed table of processes

use crate::config::SCHEDULER_CAPACITY;
use crate::process::{Process, ProcessId, ProcessStatistics, ProcessStatus};
use crate::KernelError;

/// Index of the root process, which runs the console and is registered first
pub const ROOT_INDEX: usize = 0;

/// The process table and which of its processes is running.
///
/// Slots are filled in registration order and never reused, so a process keeps its index for its whole life and
/// killed processes stay in the table.
pub struct Scheduler {
    processes: [Option<Process>; SCHEDULER_CAPACITY],
    count: usize,
    current: usize,
}

impl Scheduler {
    /// Create a scheduler whose first process is `root`, which is considered to be running already
    pub fn new(root: Process) -> Self {
        let mut scheduler = Self {
            processes: core::array::from_fn(|_| None),
            count: 0,
            current: ROOT_INDEX,
        };
        scheduler.insert(root).set_status(ProcessStatus::Running);
        scheduler
    }

    /// Add a new process to the run queue.
    ///
    /// Panics if the process was registered before.
    pub fn register_process(&mut self, process: Process) -> Result<ProcessId, KernelError> {
        assert_eq!(
            process.status(),
            ProcessStatus::NotScheduled,
            "process {} is already scheduled",
            process.id()
        );
        if self.count == SCHEDULER_CAPACITY {
            log::warn!("cannot schedule process {}, all {SCHEDULER_CAPACITY} slots are taken", process.id());
            return Err(KernelError::ProcessTableFull);
        }
        let process = self.insert(process);
        process.set_status(ProcessStatus::Sleeping);
        log::debug!("scheduled process {} ({})", process.id(), process.name());
        Ok(process.id())
    }

    fn insert(&mut self, mut process: Process) -> &mut Process {
        let index = self.count;
        process.set_scheduler_index(index);
        self.count += 1;
        self.processes[index].insert(process)
    }

    /// Choose the next process to run.
    ///
    /// Starting right after the current process and wrapping around, the first sleeping process becomes the running
    /// one. Returns `None` if there is no such process, in which case the current process keeps running.
    pub fn switch_process(&mut self) -> Option<&mut Process> {
        let next = (1..self.count)
            .map(|offset| (self.current + offset) % self.count)
            .find(|&index| self.status_at(index) == Some(ProcessStatus::Sleeping))?;

        if let Some(current) = self.processes[self.current].as_mut() {
            if current.status() == ProcessStatus::Running {
                current.set_status(ProcessStatus::Sleeping);
            }
        }
        self.current = next;
        let next = self.processes[next].as_mut()?;
        next.set_status(ProcessStatus::Running);
        Some(next)
    }

    fn status_at(&self, index: usize) -> Option<ProcessStatus> {
        self.processes[index].as_ref().map(Process::status)
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> Option<&Process> {
        self.processes[self.current].as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Process> {
        self.processes[self.current].as_mut()
    }

    pub fn process_at_mut(&mut self, index: usize) -> Option<&mut Process> {
        self.processes.get_mut(index)?.as_mut()
    }

    pub fn process(&self, id: ProcessId) -> Option<&Process> {
        self.processes().find(|process| process.id() == id)
    }

    pub fn process_mut(&mut self, id: ProcessId) -> Option<&mut Process> {
        self.processes
            .iter_mut()
            .flatten()
            .find(|process| process.id() == id)
    }

    /// All registered processes in scheduling order
    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Mark a process as killed so that it is never scheduled again.
    ///
    /// Returns whether it was still alive.
    pub fn kill(&mut self, id: ProcessId) -> Result<bool, KernelError> {
        let process = self.process_mut(id).ok_or(KernelError::NoSuchProcess(id))?;
        if process.scheduler_index() == Some(ROOT_INDEX) {
            return Err(KernelError::RootProcess(id));
        }
        Ok(process.kill())
    }
}

/// Access to a scheduler that is shared with the timer interrupt
pub trait SchedulerHandle {
    fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> Result<R, KernelError>;
}

/// Schedule `process` and block until it has been killed, returning its final statistics.
///
/// `idle` is called between checks. On hardware it halts until the next interrupt so that the timer can run the
/// process in the meantime.
pub fn launch_and_wait_until_exit(
    handle: &impl SchedulerHandle,
    process: Process,
    mut idle: impl FnMut(),
) -> Result<ProcessStatistics, KernelError> {
    let id = handle.with_scheduler(|scheduler| scheduler.register_process(process))??;
    loop {
        let finished = handle.with_scheduler(|scheduler| {
            scheduler
                .process(id)
                .filter(|process| process.status() == ProcessStatus::Killed)
                .map(Process::statistics)
        })?;
        if let Some(statistics) = finished {
            return Ok(statistics);
        }
        idle();
    }
}
