use core::arch::naked_asm;

/// Saved execution state of a thread that is not running: just its
/// kernel stack pointer. The callee-saved registers and the resume
/// address live in the frame `switch` leaves on the thread's own
/// stack before the pointer is saved here.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
}

impl Context {
    /// Context for a thread that is already running (the boot thread);
    /// filled in the first time it is switched away from.
    pub const fn empty() -> Self {
        Context { rsp: 0 }
    }

    /// Context for a thread that has never run: fabricates the frame
    /// `switch` pops, with `entry` in the return slot, so the first
    /// switch to this thread "returns" into `entry` on an empty stack.
    ///
    /// The return slot sits on a 16-byte boundary, giving `entry` the
    /// stack alignment a `call` instruction would have left it.
    ///
    /// # Safety
    /// `stack_top` must be the top of a writable stack at least 64
    /// bytes deep, owned by the thread this context belongs to.
    pub unsafe fn fresh(entry: u64, stack_top: u64) -> Self {
        let ret_slot = ((stack_top & !0xF) - 16) as *mut u64;
        ret_slot.write(entry);
        // The six callee-saved register slots below it start as zero.
        for i in 1..=6 {
            ret_slot.sub(i).write(0);
        }
        Context {
            rsp: ret_slot as u64 - 6 * 8,
        }
    }
}

/// Switches stacks from `old` to `new`: saves the callee-saved
/// registers of the System V x86_64 ABI on the outgoing stack, stores
/// its stack pointer into `old`, adopts `new`'s, and pops what the
/// incoming thread pushed here earlier (or what [`Context::fresh`]
/// fabricated). The final `ret` resumes the incoming thread; the
/// outgoing one resumes just past its call site whenever some later
/// switch hands its stack back.
///
/// # Safety
/// Both pointers must reference valid `Context` values; `new` must
/// hold a stack pointer saved by this function or built by
/// `Context::fresh`. Interrupts must be disabled.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        // rdi = old, rsi = new. The caller's return address is
        // already on the outgoing stack, courtesy of the call here.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}
