use super::{parse_number, required, run_program, truncated, Command, Session};
use crate::{CommandError, KernelError};
use core::fmt::Write;

/// Managing persistent memory regions and the persistent processes inside them.
///
/// Subcommands take the index of the region as an optional last argument which defaults to the first region.
pub struct Pmem;

const SUBCOMMANDS: &str = "init|alloc|ls|restore|run";

fn region(args: &[&str], index: usize) -> Result<usize, CommandError> {
    match args.get(index) {
        Some(value) => Ok(parse_number("pmem", value)? as usize),
        None => Ok(0),
    }
}

impl Command for Pmem {
    fn name(&self) -> &'static str {
        "pmem"
    }

    fn summary(&self) -> &'static str {
        "pmem init|alloc <pages>|ls|restore|run <program..>: work with persistent memory"
    }

    fn execute(&self, session: &mut Session<'_>, args: &[&str]) -> Result<(), KernelError> {
        let subcommand = required(args, 0, "pmem", SUBCOMMANDS)?;
        match subcommand {
            "init" => {
                let region = region(args, 1)?;
                session.kernel.with(|kernel| kernel.init_pmem(region))??;
                writeln!(session.out, "initialized persistent memory region {region}")?;
            }
            "alloc" => {
                let pages = parse_number("pmem", required(args, 1, "pmem alloc", "pages")?)?;
                let region = region(args, 2)?;
                let paddr = session.kernel.with(|kernel| kernel.alloc_pmem(region, pages))??;
                writeln!(session.out, "{pages} pages at {paddr:#x}")?;
            }
            "ls" => {
                let out = &mut *session.out;
                session.kernel.with(|kernel| -> Result<(), KernelError> {
                    if kernel.pmem_region_count() == 0 {
                        writeln!(out, "no persistent memory")?;
                    }
                    let mapper = *kernel.paging().mapper();
                    for index in 0..kernel.pmem_region_count() {
                        let manager = kernel.pmem_manager(index)?;
                        writeln!(out, "{index}: {}", manager.report(mapper))?;
                    }
                    Ok(())
                })??;
            }
            "restore" => {
                let region = region(args, 1)?;
                let id = session.kernel.with(|kernel| -> Result<_, KernelError> {
                    let process = kernel.restore_persistent_process(region)?;
                    kernel.register_process(process)
                })??;
                writeln!(session.out, "[{id}] restored")?;
            }
            "run" => run_program(session, &args[1..], Some(0))?,
            other => {
                return Err(CommandError::UnknownSubcommand {
                    command: "pmem",
                    value: truncated(other),
                }
                .into())
            }
        }
        Ok(())
    }
}
