use super::{truncated, Session};
use crate::config::{BootFile, BootInfo};
use crate::sched::launch_and_wait_until_exit;
use crate::{CommandError, KernelError};
use core::fmt::Write;

/// Where the console finds the executables it can start
pub trait ExecutableSource {
    /// The ELF image of the executable called `name`
    fn find(&self, name: &str) -> Option<&[u8]>;
}

impl<const N: usize> ExecutableSource for [BootFile; N] {
    fn find(&self, name: &str) -> Option<&[u8]> {
        self.iter().find(|file| file.name == name).map(|file| file.content)
    }
}

impl ExecutableSource for BootInfo {
    fn find(&self, name: &str) -> Option<&[u8]> {
        self.files.iter().find(|file| file.name == name).map(|file| file.content)
    }
}

/// Start the program named by `args[0]` with all of `args` as its arguments.
///
/// A trailing `&` runs it in the background. Otherwise the console waits for it to be killed and prints its
/// statistics. With `pmem_region` set the program becomes a persistent process in that region.
pub fn run_program(session: &mut Session<'_>, args: &[&str], pmem_region: Option<usize>) -> Result<(), KernelError> {
    let (args, background) = match args.split_last() {
        Some((&"&", rest)) => (rest, true),
        _ => (args, false),
    };
    let Some(&name) = args.first() else {
        return Err(CommandError::MissingArgument {
            command: "run",
            name: "program",
        }
        .into());
    };
    let executables = session.executables;
    let image = executables
        .find(name)
        .ok_or_else(|| CommandError::NotFound(truncated(name)))?;

    let process = session.kernel.with(|kernel| kernel.create_process(image, args, pmem_region))??;
    if background {
        let id = session.kernel.with(|kernel| kernel.register_process(process))??;
        writeln!(session.out, "[{id}] {name}")?;
    } else {
        let statistics = launch_and_wait_until_exit(&session.kernel, process, &mut *session.idle)?;
        writeln!(session.out, "{statistics}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    extern crate std;

    use crate::commands::tests::Console;
    use crate::process::{ProcessId, ProcessStatus};
    use crate::KernelError;

    #[test]
    fn background_program_is_scheduled() {
        let console = Console::new();
        assert_eq!(console.run("prog first second &").unwrap(), "[2] prog\n");
        let mut guard = console.lock.lock(99).unwrap();
        let kernel = guard.as_mut().unwrap();
        let process = kernel.scheduler().process(ProcessId(2)).unwrap();
        assert_eq!(process.status(), ProcessStatus::Sleeping);
        assert_eq!(process.name(), "prog");
        // argc
        assert_eq!(process.execution_context().cpu.rdi, 3);
    }

    #[test]
    fn foreground_program_blocks_until_killed() {
        let console = Console::new();
        let mut ticks = 0;
        let out = console
            .run_with_idle("prog", &mut || {
                ticks += 1;
                console.tick(ticks * 1_000_000_000);
                if ticks == 4 {
                    let mut guard = console.lock.lock(99).unwrap();
                    guard.as_mut().unwrap().scheduler_mut().kill(ProcessId(2)).unwrap();
                }
            })
            .unwrap();
        assert_eq!(ticks, 4);
        assert!(out.starts_with("context switches: 2\n"), "{out}");
    }

    #[test]
    fn lone_ampersand_is_not_a_program() {
        let console = Console::new();
        assert!(matches!(console.run("&"), Err(KernelError::Command(_))));
    }
}
