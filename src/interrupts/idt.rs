use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::{PrivilegeLevel, VirtAddr};

use super::gdt;
use crate::{log_error, println};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// The user-reachable syscall vector.
pub const SYSCALL_VECTOR: usize = 0x30;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard = PIC_1_OFFSET + 1,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt[InterruptIndex::Timer.as_usize()].set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_usize()].set_handler_fn(keyboard_interrupt_handler);
        unsafe {
            idt[SYSCALL_VECTOR]
                .set_handler_addr(VirtAddr::new(super::usermode::syscall_entry as usize as u64))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(stack_frame: InterruptStackFrame, _code: u64) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

fn from_user(stack_frame: &InterruptStackFrame) -> bool {
    stack_frame.code_segment & 3 == 3
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let addr = Cr2::read().as_u64();
    let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let present = error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);
    let user = from_user(&stack_frame);

    // For faults taken inside a syscall, stack-growth decisions are
    // made against the stack pointer the user trapped in with.
    let fault_rsp = if user {
        stack_frame.stack_pointer.as_u64()
    } else {
        crate::threads::with_current_process(|p| p.user_rsp).unwrap_or(0)
    };

    if crate::vm::handle_fault(addr, write, present, fault_rsp) {
        return;
    }

    // Unservable. A user access dies alone; a kernel access to a user
    // address during a syscall kills the process it was serving; a
    // kernel access to kernel space is a kernel bug.
    let in_process = crate::threads::with_current_process(|_| ()).is_some();
    if user || (in_process && crate::memory::paging::is_user_vaddr(addr)) {
        crate::process::exit(-1);
    }
    log_error!(
        "page fault at {:#x} (write={} present={}) from {:#x}",
        addr,
        write,
        present,
        stack_frame.instruction_pointer.as_u64()
    );
    panic!("EXCEPTION: PAGE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    if from_user(&stack_frame) {
        crate::process::exit(-1);
    }
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT\nError Code: {error_code}\n{:#?}",
        stack_frame
    );
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    if from_user(&stack_frame) {
        crate::process::exit(-1);
    }
    panic!("EXCEPTION: INVALID OPCODE\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    crate::threads::irq_enter();
    crate::devices::timer::on_tick();
    unsafe {
        PICS.lock().notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
    crate::threads::irq_exit();
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    use x86_64::instructions::port::Port;

    crate::threads::irq_enter();
    let scancode = unsafe { Port::<u8>::new(0x60).read() };
    crate::devices::keyboard::on_scancode(scancode);
    unsafe {
        PICS.lock().notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
    crate::threads::irq_exit();
}
