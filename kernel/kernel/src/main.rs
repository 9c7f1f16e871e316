#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod bare_metal {
    use amd64::cache::Clflush;
    use amd64::context::TrapFrame;
    use amd64::cpu;
    use amd64::idt::{Idt, IdtEntry, TIMER_VECTOR};
    use amd64::trap::timer_interrupt_entry;
    use core::panic::PanicInfo;
    use kernel::commands::{execute_line, Edit, LineBuffer, Session};
    use kernel::config::{BootInfo, KernelConfig};
    use kernel::kernel::{CONSOLE_OWNER, TRAP_OWNER};
    use kernel::{Kernel, KernelError, KernelHandle, KernelLock};
    use klog::{print, println, KernelLogger, KernelWriter};
    use ksync::ProcessLock;

    static LOGGER: KernelLogger = KernelLogger::new(log::Level::Info);

    static CLFLUSH: Clflush = Clflush;

    static KERNEL: KernelLock = ProcessLock::new(None);

    static mut IDT: Idt = Idt::new();

    #[panic_handler]
    fn panic_handler(info: &PanicInfo) -> ! {
        println!("!!! Kernel Panic !!!\n  {}", info);
        cpu::halt_forever()
    }

    /// Called by the boot loader with the kernel's page tables active and interrupts masked
    #[no_mangle]
    extern "C" fn _start(boot: &'static BootInfo) -> ! {
        let config = KernelConfig::default();
        LOGGER.install().expect("Could not install logger");
        LOGGER.update_log_level(config.log_level);

        if let Err(e) = init(boot, config) {
            panic!("could not initialize the kernel: {e}");
        }
        log::info!("launching the console");
        run_console(boot)
    }

    fn init(boot: &'static BootInfo, config: KernelConfig) -> Result<(), KernelError> {
        let kernel = Kernel::new(boot, config, &CLFLUSH)?;
        *KERNEL.lock(CONSOLE_OWNER)? = Some(kernel);

        unsafe {
            let idt = &mut *core::ptr::addr_of_mut!(IDT);
            idt.entries[TIMER_VECTOR] = IdtEntry::interrupt_gate(timer_interrupt_entry as usize as u64);
            (*core::ptr::addr_of!(IDT)).load();
        }
        Ok(())
    }

    fn run_console(boot: &'static BootInfo) -> ! {
        let mut serial = KernelWriter {};
        let mut line = LineBuffer::new();
        print!("> ");
        loop {
            let Some(byte) = serial.try_read_byte() else {
                cpu::enable_interrupts_and_halt();
                continue;
            };
            match line.push(byte) {
                Edit::Append(c) => print!("{c}"),
                Edit::Erase => print!("\x08 \x08"),
                Edit::Ignore => {}
                Edit::Submit => {
                    println!();
                    let mut out = KernelWriter {};
                    let mut session = Session {
                        kernel: KernelHandle::new(&KERNEL, CONSOLE_OWNER),
                        out: &mut out,
                        executables: boot,
                        idle: &mut cpu::enable_interrupts_and_halt,
                    };
                    if let Err(e) = execute_line(&mut session, line.line()) {
                        println!("{e}");
                    }
                    line.clear();
                    print!("> ");
                }
            }
        }
    }

    #[no_mangle]
    extern "C" fn handle_timer_interrupt(frame: *mut TrapFrame) {
        let frame = unsafe { &mut *frame };
        // the console masks interrupts while it holds the kernel, so the lock is free whenever this runs
        let Ok(mut guard) = KERNEL.lock(TRAP_OWNER) else {
            return;
        };
        if let Some(kernel) = guard.as_mut() {
            let now = kernel.now_fs();
            kernel.on_timer_tick(frame, now);
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
