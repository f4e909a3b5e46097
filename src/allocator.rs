//! Kernel heap.
//!
//! The allocator lock is only ever taken with interrupts disabled, so
//! an interrupt handler (or a scheduling pass triggered by one) can
//! never spin on a lock whose holder it preempted.

use core::alloc::{GlobalAlloc, Layout};
use linked_list_allocator::Heap;
use spin::Mutex;
use x86_64::instructions::interrupts;

pub struct Locked<A> {
    inner: Mutex<A>,
}

impl<A> Locked<A> {
    pub const fn new(inner: A) -> Locked<A> {
        Locked {
            inner: Mutex::new(inner),
        }
    }

    pub fn lock(&self) -> spin::MutexGuard<A> {
        self.inner.lock()
    }
}

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: Locked<Heap> = Locked::new(Heap::empty());

unsafe impl GlobalAlloc for Locked<Heap> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        interrupts::without_interrupts(|| {
            self.lock()
                .allocate_first_fit(layout)
                .map(|p| p.as_ptr())
                .unwrap_or(core::ptr::null_mut())
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        interrupts::without_interrupts(|| {
            self.lock()
                .deallocate(core::ptr::NonNull::new_unchecked(ptr), layout)
        })
    }
}

/// Hands the heap its memory. Called once, before anything allocates.
pub fn init(start: u64, size: usize) {
    unsafe {
        ALLOCATOR.lock().init(start as *mut u8, size);
    }
}
