use super::{dispatch, parse_number, required, Command, Session, KNOWN_COMMANDS};
use crate::process::ProcessId;
use crate::{CommandError, KernelError};
use core::fmt::Write;

const FEMTOSECONDS_PER_MICROSECOND: u64 = 1_000_000_000;

pub struct Help;

impl Command for Help {
    fn name(&self) -> &'static str {
        "help"
    }

    fn summary(&self) -> &'static str {
        "print the list of commands"
    }

    fn execute(&self, session: &mut Session<'_>, _args: &[&str]) -> Result<(), KernelError> {
        writeln!(session.out, "Known Commands:")?;
        for cmd in KNOWN_COMMANDS {
            writeln!(session.out, "\t- {: <12} {}", cmd.name(), cmd.summary())?;
        }
        writeln!(session.out, "\t- {: <12} {}", "<program>", "run a program, a trailing & runs it in the background")?;
        Ok(())
    }
}

pub struct Ps;

impl Command for Ps {
    fn name(&self) -> &'static str {
        "ps"
    }

    fn summary(&self) -> &'static str {
        "list all processes"
    }

    fn execute(&self, session: &mut Session<'_>, _args: &[&str]) -> Result<(), KernelError> {
        let out = &mut *session.out;
        session.kernel.with(|kernel| -> Result<(), KernelError> {
            writeln!(out, "{:>4} {:<10} {:<10} name", "pid", "status", "kind")?;
            for process in kernel.scheduler().processes() {
                writeln!(out, "{process}")?;
            }
            Ok(())
        })?
    }
}

pub struct Kill;

impl Command for Kill {
    fn name(&self) -> &'static str {
        "kill"
    }

    fn summary(&self) -> &'static str {
        "kill <pid>: stop scheduling a process"
    }

    fn execute(&self, session: &mut Session<'_>, args: &[&str]) -> Result<(), KernelError> {
        let id = ProcessId(parse_number("kill", required(args, 0, "kill", "pid")?)?);
        let was_alive = session.kernel.with(|kernel| kernel.scheduler_mut().kill(id))??;
        if was_alive {
            writeln!(session.out, "killed process {id}")?;
        } else {
            writeln!(session.out, "process {id} was already killed")?;
        }
        Ok(())
    }
}

pub struct Free;

impl Command for Free {
    fn name(&self) -> &'static str {
        "free"
    }

    fn summary(&self) -> &'static str {
        "show the free memory of DRAM and every persistent memory region"
    }

    fn execute(&self, session: &mut Session<'_>, _args: &[&str]) -> Result<(), KernelError> {
        let out = &mut *session.out;
        session.kernel.with(|kernel| -> Result<(), KernelError> {
            writeln!(out, "DRAM Free List:")?;
            for region in kernel.dram().regions() {
                writeln!(
                    out,
                    "  {:#x}: {} pages, domain {}",
                    region.paddr, region.page_count, region.proximity_domain
                )?;
            }
            writeln!(out, "  total {} pages", kernel.free_dram_pages())?;

            writeln!(out, "PMEM Free List:")?;
            let mapper = *kernel.paging().mapper();
            for index in 0..kernel.pmem_region_count() {
                let manager = kernel.pmem_manager(index)?;
                if manager.is_valid() {
                    writeln!(out, "  region {index}: {} pages", manager.free_page_count(mapper))?;
                } else {
                    writeln!(out, "  region {index}: not initialized")?;
                }
            }
            Ok(())
        })?
    }
}

pub struct Time;

impl Command for Time {
    fn name(&self) -> &'static str {
        "time"
    }

    fn summary(&self) -> &'static str {
        "time [command..]: show the HPET counter or how long a command takes"
    }

    fn execute(&self, session: &mut Session<'_>, args: &[&str]) -> Result<(), KernelError> {
        if args.is_empty() {
            let counter = session.kernel.with(|kernel| kernel.hpet().map(|hpet| hpet.main_counter()))?;
            match counter {
                Some(counter) => writeln!(session.out, "HPET main counter: {counter:#x}")?,
                None => writeln!(session.out, "no HPET")?,
            }
            return Ok(());
        }

        let start = session.kernel.with(|kernel| kernel.now_fs())?;
        dispatch(session, args)?;
        let end = session.kernel.with(|kernel| kernel.now_fs())?;
        writeln!(
            session.out,
            "took {} us",
            end.saturating_sub(start) / FEMTOSECONDS_PER_MICROSECOND
        )?;
        Ok(())
    }
}

pub struct Eval;

impl Command for Eval {
    fn name(&self) -> &'static str {
        "eval"
    }

    fn summary(&self) -> &'static str {
        "eval <microseconds>: change the length of a time slice"
    }

    fn execute(&self, session: &mut Session<'_>, args: &[&str]) -> Result<(), KernelError> {
        let value = required(args, 0, "eval", "microseconds")?;
        let interval_us = parse_number("eval", value)?;
        if interval_us == 0 {
            return Err(CommandError::InvalidNumber {
                command: "eval",
                value: super::truncated(value),
            }
            .into());
        }
        session.kernel.with(|kernel| kernel.set_tick_interval(interval_us))?;
        writeln!(session.out, "time slice is {interval_us} us")?;
        Ok(())
    }
}
