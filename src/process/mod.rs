//! User processes: creation via `exec`, parent/child wait, and the
//! teardown path that unwinds everything a process touched.

pub mod elf;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use spin::Mutex;

use crate::fs::File;
use crate::memory::paging::{self, AddressSpace};
use crate::memory::PGSIZE;
use crate::threads::sync::Semaphore;
use crate::threads::thread::{Tid, PRI_DEFAULT, TID_ERROR};
use crate::vm::page::{PageKind, Spt};
use crate::vm::{frame, swap};

/// Per-process file descriptor slots. Descriptors 0 and 1 are the
/// console and never occupy a slot.
pub const FD_MAX: usize = 64;

/// Shared parent/child rendezvous record. The parent holds it in its
/// children list, the child through its parent link; whichever side
/// dies first, the other can still use it safely.
pub struct Child {
    tid: AtomicI32,
    exit_status: Mutex<i32>,
    /// Upped by the child once its image is loaded (or failed to).
    load_sema: Semaphore,
    /// Upped by the child on exit; downed by the parent in `wait`.
    wait_sema: Semaphore,
    loaded: AtomicBool,
    waited: AtomicBool,
}

impl Child {
    fn new() -> Child {
        Child {
            tid: AtomicI32::new(TID_ERROR),
            exit_status: Mutex::new(-1),
            load_sema: Semaphore::new(0),
            wait_sema: Semaphore::new(0),
            loaded: AtomicBool::new(false),
            waited: AtomicBool::new(false),
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid.load(Ordering::Relaxed)
    }
}

/// One memory-mapped file region.
pub struct MmapRegion {
    pub id: i32,
    pub file: File,
    pub base: u64,
    pub pages: u64,
}

/// Everything a thread carries when it runs a user program.
pub struct Process {
    pub name: String,
    pub aspace: AddressSpace,
    pub spt: Arc<Mutex<Spt>>,
    pub fd_table: Vec<Option<File>>,
    pub mmaps: Vec<MmapRegion>,
    pub next_mapid: i32,
    /// The running binary, held open with writes denied.
    pub exec_file: Option<File>,
    /// User stack pointer saved at syscall entry, consulted by the
    /// page-fault handler for stack growth during syscalls.
    pub user_rsp: u64,
}

impl Process {
    pub fn new(name: &str, aspace: AddressSpace) -> Process {
        let mut fd_table = Vec::new();
        fd_table.resize_with(FD_MAX, || None);
        Process {
            name: String::from(name),
            aspace,
            spt: Arc::new(Mutex::new(Spt::new())),
            fd_table,
            mmaps: Vec::new(),
            next_mapid: 1,
            exec_file: None,
            user_rsp: 0,
        }
    }
}

struct ExecInfo {
    cmdline: String,
    child: Arc<Child>,
}

/// Spawns a process running `cmdline` and blocks until its image is
/// loaded. Returns the child's tid, or `TID_ERROR` when the thread
/// could not be created or the program failed to load.
pub fn execute(cmdline: &str) -> Tid {
    let name = match cmdline.split_whitespace().next() {
        Some(name) => name,
        None => return TID_ERROR,
    };
    let child = Arc::new(Child::new());
    let info = Box::new(ExecInfo {
        cmdline: String::from(cmdline),
        child: child.clone(),
    });
    let raw = Box::into_raw(info);
    let tid = crate::threads::create(name, PRI_DEFAULT, start_process, raw as usize);
    if tid == TID_ERROR {
        // The thread never existed, so the exec info is still ours.
        unsafe { drop(Box::from_raw(raw)) };
        return TID_ERROR;
    }
    child.tid.store(tid, Ordering::Relaxed);
    crate::threads::add_child(child.clone());

    child.load_sema.down();
    if child.loaded.load(Ordering::Relaxed) {
        tid
    } else {
        TID_ERROR
    }
}

/// Entry point of every user-process thread: load the image, report
/// the outcome to the parent, and drop into user mode.
fn start_process(aux: usize) {
    let ExecInfo { cmdline, child } = *unsafe { Box::from_raw(aux as *mut ExecInfo) };
    crate::threads::set_parent_link(child.clone());

    match elf::load(&cmdline) {
        Ok((entry, rsp)) => {
            child.loaded.store(true, Ordering::Relaxed);
            child.load_sema.up();
            // Nothing owned may be alive past this point; the jump
            // never returns.
            drop(cmdline);
            drop(child);
            crate::interrupts::jump_to_usermode(entry, rsp);
        }
        Err(err) => {
            crate::log_warn!("process: loading '{}' failed: {}", cmdline, err);
            child.loaded.store(false, Ordering::Relaxed);
            child.load_sema.up();
            exit(-1);
        }
    }
}

/// Waits for a direct child to exit and returns its status. Each child
/// can be waited on once; anything else returns -1 immediately.
pub fn wait(tid: Tid) -> i32 {
    let Some(child) = crate::threads::find_child(tid) else {
        return -1;
    };
    if child.waited.swap(true, Ordering::Relaxed) {
        return -1;
    }
    child.wait_sema.down();
    let status = *child.exit_status.lock();
    crate::threads::remove_child(tid);
    status
}

/// Terminates the current process: prints the exit line, unwinds every
/// resource, signals the parent, and kills the thread.
pub fn exit(status: i32) -> ! {
    let name = crate::threads::current_name();
    crate::println!("{}: exit({})", name, status);

    // A fault can kill the process in the middle of a filesystem
    // operation; the lock must not die with it.
    if crate::fs::FS_LOCK.held_by_current() {
        crate::fs::FS_LOCK.release();
    }

    let tid = crate::threads::current_tid();
    let handles = crate::threads::with_current_process(|p| (p.aspace, p.spt.clone()));
    if let Some((aspace, spt)) = handles {
        // Run the teardown on kernel page tables; nothing below reads
        // through user addresses.
        paging::activate_kernel();

        // Dirty mapped files go back to disk, their entries away.
        let regions = crate::threads::with_current_process(|p| core::mem::take(&mut p.mmaps))
            .unwrap_or_default();
        for region in &regions {
            unmap_region(tid, aspace, &spt, region);
        }

        // Frames next: once they are gone this process can no longer
        // be chosen by the evictor.
        frame::release_all(tid, aspace);

        let process = crate::threads::take_current_process().expect("process vanished");
        for slot in process.spt.lock().drain_swap_slots() {
            swap::free_slot(slot as usize);
        }
        paging::destroy(process.aspace);
        // Dropping the process closes the fd table and releases the
        // executable's write denial.
        drop(process);
    }

    if let Some(link) = crate::threads::take_parent_link() {
        *link.exit_status.lock() = status;
        link.wait_sema.up();
    }

    crate::threads::exit();
}

/// Tears down one mmap region: writes dirty resident pages back to the
/// file, frees their frames, and removes the supplemental entries.
/// Shared by `munmap` and process exit.
pub fn unmap_region(tid: Tid, aspace: AddressSpace, spt: &Arc<Mutex<Spt>>, region: &MmapRegion) {
    for i in 0..region.pages {
        let uaddr = region.base + i * PGSIZE;
        let entry = spt.lock().remove(uaddr);
        // Pin first so eviction cannot race the writeback.
        if frame::pin_resident(tid, uaddr) {
            let dirty = paging::is_dirty(aspace, uaddr);
            if dirty {
                if let Some(PageKind::MMapped { offset, read_bytes, .. }) =
                    entry.as_ref().map(|e| e.kind.clone())
                {
                    if let Some(kaddr) = frame::kaddr_of(tid, uaddr) {
                        let contents = unsafe {
                            core::slice::from_raw_parts(kaddr as *const u8, read_bytes as usize)
                        };
                        crate::fs::FS_LOCK.acquire();
                        region.file.write_at(offset as usize, contents);
                        crate::fs::FS_LOCK.release();
                    }
                }
            }
            paging::unmap_user(aspace, uaddr);
            if let Some(kaddr) = frame::kaddr_of(tid, uaddr) {
                frame::free(kaddr);
            }
        }
    }
}
