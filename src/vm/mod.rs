//! User virtual memory: frame table, supplemental page tables, swap,
//! and the page-fault policy that ties them together.

pub mod frame;
pub mod page;
pub mod swap;

use crate::memory::paging::{self, STACK_LIMIT, USER_STACK_TOP};
use crate::memory::PGSIZE;
use page::{PageEntry, PageKind};

/// How far below the stack pointer an access may land and still count
/// as stack growth. x86 push instructions touch at most 32 bytes below
/// the pointer they are about to move.
const STACK_PUSH_SLOP: u64 = 32;

pub fn init() {
    swap::init();
}

/// True when a fault at `addr` with the stack pointer at `rsp` should
/// grow the stack: at or above `rsp - 32`, below the stack top, and
/// within the stack size limit.
fn in_stack_window(addr: u64, rsp: u64) -> bool {
    addr >= rsp.saturating_sub(STACK_PUSH_SLOP)
        && addr < USER_STACK_TOP
        && addr >= USER_STACK_TOP - STACK_LIMIT
}

/// Decides what a page fault means and, when it is a legitimate
/// demand-paging event, resolves it. Returns false when the faulting
/// process should be terminated (or, for kernel-mode faults on kernel
/// addresses, when the kernel itself is broken).
///
/// `present` is the fault's protection bit: set when the PTE existed,
/// meaning the access violated permissions rather than missing a page.
pub fn handle_fault(addr: u64, write: bool, present: bool, fault_rsp: u64) -> bool {
    if present {
        // Write to a read-only page, or user touching kernel-only
        // mappings. Never recoverable.
        return false;
    }
    if !paging::is_user_vaddr(addr) {
        return false;
    }

    let base = addr & !(PGSIZE - 1);
    let entry_writable = match crate::threads::with_current_process(|p| {
        p.spt.lock().get(base).map(|e| e.writable)
    }) {
        Some(found) => found,
        None => return false, // kernel thread without a process
    };

    match entry_writable {
        Some(writable) => {
            if write && !writable {
                return false;
            }
            page::page_load(addr, false)
        }
        None if in_stack_window(addr, fault_rsp) => {
            let registered = crate::threads::with_current_process(|p| {
                p.spt.lock().insert(
                    base,
                    PageEntry {
                        writable: true,
                        kind: PageKind::ZeroFill,
                    },
                )
            })
            .unwrap_or(false);
            registered && page::page_load(addr, false)
        }
        None => false,
    }
}

/// Makes `[base, base + len)` resident and pinned so kernel I/O can
/// fill or drain it without eviction pulling pages out from under the
/// transfer. Returns false if some page cannot be materialized.
pub fn pin_user_range(base: u64, len: u64, rsp: u64) -> bool {
    if len == 0 {
        return true;
    }
    let tid = crate::threads::current_tid();
    let mut page_addr = base & !(PGSIZE - 1);
    let last = base + len - 1;
    while page_addr <= last {
        if !frame::pin_resident(tid, page_addr) {
            let known = crate::threads::with_current_process(|p| p.spt.lock().contains(page_addr))
                .unwrap_or(false);
            if !known {
                if !in_stack_window(page_addr, rsp) {
                    return false;
                }
                let registered = crate::threads::with_current_process(|p| {
                    p.spt.lock().insert(
                        page_addr,
                        PageEntry {
                            writable: true,
                            kind: PageKind::ZeroFill,
                        },
                    )
                })
                .unwrap_or(false);
                if !registered {
                    return false;
                }
            }
            if !page::page_load(page_addr, true) {
                return false;
            }
        }
        page_addr += PGSIZE;
    }
    true
}

/// Releases the pins taken by [`pin_user_range`].
pub fn unpin_user_range(base: u64, len: u64) {
    if len == 0 {
        return;
    }
    let tid = crate::threads::current_tid();
    let mut page_addr = base & !(PGSIZE - 1);
    let last = base + len - 1;
    while page_addr <= last {
        frame::set_evictable_by_uaddr(tid, page_addr, true);
        page_addr += PGSIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_window_accepts_push_reach() {
        let rsp = USER_STACK_TOP - 0x2000;
        assert!(in_stack_window(rsp, rsp));
        assert!(in_stack_window(rsp - 32, rsp));
        assert!(!in_stack_window(rsp - 33, rsp));
        assert!(in_stack_window(rsp + 0x100, rsp));
    }

    #[test]
    fn stack_window_is_bounded() {
        let rsp = USER_STACK_TOP - 0x1000;
        assert!(!in_stack_window(USER_STACK_TOP, rsp));
        let deep = USER_STACK_TOP - STACK_LIMIT;
        assert!(in_stack_window(deep, deep));
        assert!(!in_stack_window(deep - 1, deep - 1));
    }
}
