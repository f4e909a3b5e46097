#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod allocator;
pub mod cmdline;
pub mod console;
pub mod devices;
pub mod fs;
pub mod interrupts;
pub mod memory;
pub mod process;
pub mod serial;
pub mod syscalls;
pub mod threads;
pub mod vm;

use bootloader::BootInfo;

/// Boot options. The loader in use has no command-line channel, so
/// the option string lives here; the syntax is `-o mlfqs` to select
/// the MLFQ scheduler and everything after `--` is the initial user
/// command.
const KERNEL_CMDLINE: &str = "";

pub fn kernel_main(boot_info: &'static BootInfo) -> ! {
    serial::init();
    console::init();
    log_info!("kernel starting");

    interrupts::init();
    memory::init(boot_info);
    devices::init();

    let options = cmdline::parse(KERNEL_CMDLINE);
    threads::init(options.mlfqs);
    vm::init();
    threads::start();

    println!("kernel ready");

    if let Some(command) = options.run {
        let tid = process::execute(&command);
        if tid == threads::thread::TID_ERROR {
            log_warn!("could not start '{}'", command);
        } else {
            let status = process::wait(tid);
            log_info!("initial process exited with status {}", status);
        }
    }

    loop {
        x86_64::instructions::hlt();
    }
}

/// Powers the machine off: QEMU's debug-exit device if present, a
/// halt loop otherwise.
pub fn shutdown() -> ! {
    log_info!("powering off");
    unsafe {
        x86_64::instructions::port::Port::<u32>::new(0xf4).write(0u32);
    }
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    log_error!("{}", info);
    println!("kernel panic: {}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
