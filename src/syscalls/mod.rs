//! System-call dispatch and argument marshalling.
//!
//! A user program traps in through vector 0x30. The syscall number is
//! the first word at the user stack pointer, arguments the words after
//! it, and the result goes back in `rax`. Every user pointer the
//! kernel dereferences is validated byte-wise on both ends of its
//! range first; a bad pointer terminates the offending process with
//! status -1 and harms nothing else.

use alloc::string::String;
use alloc::vec::Vec;

use crate::fs::{self, File, FS_LOCK};
use crate::memory::paging;
use crate::memory::PGSIZE;
use crate::process::{self, MmapRegion};
use crate::vm;

pub const SYS_HALT: u64 = 0;
pub const SYS_EXIT: u64 = 1;
pub const SYS_EXEC: u64 = 2;
pub const SYS_WAIT: u64 = 3;
pub const SYS_CREATE: u64 = 4;
pub const SYS_REMOVE: u64 = 5;
pub const SYS_OPEN: u64 = 6;
pub const SYS_FILESIZE: u64 = 7;
pub const SYS_READ: u64 = 8;
pub const SYS_WRITE: u64 = 9;
pub const SYS_SEEK: u64 = 10;
pub const SYS_TELL: u64 = 11;
pub const SYS_CLOSE: u64 = 12;
pub const SYS_MMAP: u64 = 13;
pub const SYS_MUNMAP: u64 = 14;

/// Longest user string the kernel will walk looking for a NUL.
const STRING_MAX: u64 = PGSIZE;

/// Console writes are delivered through `putbuf` in chunks this big.
const CONSOLE_CHUNK: usize = 256;

/// Saved user registers, in the exact order the trap stub pushes them
/// on top of the CPU's interrupt frame.
#[repr(C)]
pub struct SyscallFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Central dispatcher, called from the 0x30 trap stub.
pub extern "C" fn dispatch(frame: &mut SyscallFrame) {
    let usp = frame.rsp;
    // Remember where the user stack was: kernel-mode faults during
    // this syscall use it for stack-growth decisions.
    crate::threads::with_current_process(|p| p.user_rsp = usp);

    // The trap gate masked interrupts; syscalls are preemptible.
    x86_64::instructions::interrupts::enable();

    let number = read_user_word(usp);
    let result: i64 = match number {
        SYS_HALT => sys_halt(),
        SYS_EXIT => {
            let status = read_user_word(usp + 8) as i32;
            process::exit(status);
        }
        SYS_EXEC => sys_exec(read_user_word(usp + 8)),
        SYS_WAIT => process::wait(read_user_word(usp + 8) as i32) as i64,
        SYS_CREATE => sys_create(read_user_word(usp + 8), read_user_word(usp + 16)),
        SYS_REMOVE => sys_remove(read_user_word(usp + 8)),
        SYS_OPEN => sys_open(read_user_word(usp + 8)),
        SYS_FILESIZE => sys_filesize(read_user_word(usp + 8)),
        SYS_READ => sys_read(
            read_user_word(usp + 8),
            read_user_word(usp + 16),
            read_user_word(usp + 24),
        ),
        SYS_WRITE => sys_write(
            read_user_word(usp + 8),
            read_user_word(usp + 16),
            read_user_word(usp + 24),
        ),
        SYS_SEEK => sys_seek(read_user_word(usp + 8), read_user_word(usp + 16)),
        SYS_TELL => sys_tell(read_user_word(usp + 8)),
        SYS_CLOSE => sys_close(read_user_word(usp + 8)),
        SYS_MMAP => sys_mmap(read_user_word(usp + 8), read_user_word(usp + 16)),
        SYS_MUNMAP => sys_munmap(read_user_word(usp + 8)),
        _ => {
            crate::log_warn!("syscall: unknown number {}", number);
            process::exit(-1);
        }
    };
    frame.rax = result as u64;
}

// ── User-memory access ─────────────────────────────────────────────

/// True when the byte at `va` is a user address the current process
/// may touch: mapped, promised by a supplemental entry, or inside the
/// stack-growth window.
fn user_byte_ok(va: u64) -> bool {
    if !paging::is_user_vaddr(va) {
        return false;
    }
    let page = va & !(PGSIZE - 1);
    crate::threads::with_current_process(|p| {
        paging::is_mapped(p.aspace, page)
            || p.spt.lock().contains(page)
            || (va >= p.user_rsp.saturating_sub(32)
                && va >= paging::USER_STACK_TOP - paging::STACK_LIMIT)
    })
    .unwrap_or(false)
}

/// Validates the first and last byte of a user range.
fn user_range_ok(base: u64, len: u64) -> bool {
    if len == 0 {
        return true;
    }
    match base.checked_add(len - 1) {
        Some(last) => user_byte_ok(base) && user_byte_ok(last),
        None => false,
    }
}

/// Terminates the current process over a bad pointer.
fn die() -> ! {
    process::exit(-1)
}

/// Reads one argument word from the user stack, validating it first.
fn read_user_word(va: u64) -> u64 {
    if !user_range_ok(va, 8) {
        die();
    }
    unsafe { core::ptr::read_volatile(va as *const u64) }
}

/// Copies a NUL-terminated user string into the kernel, validating
/// page by page as the walk proceeds.
fn read_user_string(base: u64) -> String {
    let mut bytes = Vec::new();
    let mut va = base;
    loop {
        if va - base >= STRING_MAX || !user_byte_ok(va) {
            die();
        }
        let byte = unsafe { core::ptr::read_volatile(va as *const u8) };
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        va += 1;
    }
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(_) => die(),
    }
}

/// Validates and pins a user buffer for the duration of `f`. Pinning
/// keeps eviction away while kernel I/O (which may itself hold the
/// filesystem lock) moves data through the buffer.
fn with_pinned_buffer<R>(base: u64, len: u64, f: impl FnOnce() -> R) -> R {
    if !user_range_ok(base, len) {
        die();
    }
    let rsp = crate::threads::with_current_process(|p| p.user_rsp).unwrap_or(0);
    if !vm::pin_user_range(base, len, rsp) {
        die();
    }
    let result = f();
    vm::unpin_user_range(base, len);
    result
}

/// Runs `f` on the open file behind `fd`, with the handle position
/// carried across the call. The scheduler lock is never held while `f`
/// runs, so `f` may block on the filesystem lock.
fn with_fd<R>(fd: u64, f: impl FnOnce(&mut File) -> R) -> Option<R> {
    let fd = fd as usize;
    if fd < 2 || fd >= process::FD_MAX {
        return None;
    }
    let mut file =
        crate::threads::with_current_process(|p| p.fd_table[fd].clone()).flatten()?;
    let result = f(&mut file);
    let pos = file.tell();
    crate::threads::with_current_process(|p| {
        if let Some(stored) = p.fd_table[fd].as_mut() {
            stored.seek(pos);
        }
    });
    Some(result)
}

// ── Handlers ───────────────────────────────────────────────────────

fn sys_halt() -> i64 {
    crate::threads::print_stats();
    crate::shutdown();
}

fn sys_exec(cmd_ptr: u64) -> i64 {
    let cmdline = read_user_string(cmd_ptr);
    process::execute(&cmdline) as i64
}

fn sys_create(name_ptr: u64, size: u64) -> i64 {
    let name = read_user_string(name_ptr);
    FS_LOCK.acquire();
    let ok = fs::create(&name, size as usize);
    FS_LOCK.release();
    ok as i64
}

fn sys_remove(name_ptr: u64) -> i64 {
    let name = read_user_string(name_ptr);
    FS_LOCK.acquire();
    let ok = fs::remove(&name);
    FS_LOCK.release();
    ok as i64
}

fn sys_open(name_ptr: u64) -> i64 {
    let name = read_user_string(name_ptr);
    FS_LOCK.acquire();
    let file = fs::open(&name);
    FS_LOCK.release();
    let Some(file) = file else {
        return -1;
    };
    crate::threads::with_current_process(|p| {
        for fd in 2..process::FD_MAX {
            if p.fd_table[fd].is_none() {
                p.fd_table[fd] = Some(file);
                return fd as i64;
            }
        }
        -1
    })
    .unwrap_or(-1)
}

fn sys_filesize(fd: u64) -> i64 {
    with_fd(fd, |file| file.len() as i64).unwrap_or(-1)
}

fn sys_read(fd: u64, buf: u64, size: u64) -> i64 {
    if size == 0 {
        return 0;
    }
    match fd {
        0 => with_pinned_buffer(buf, size, || {
            for i in 0..size {
                let byte = crate::devices::keyboard::getc();
                unsafe { core::ptr::write_volatile((buf + i) as *mut u8, byte) };
            }
            size as i64
        }),
        1 => -1,
        _ => with_pinned_buffer(buf, size, || {
            with_fd(fd, |file| {
                let slice =
                    unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, size as usize) };
                FS_LOCK.acquire();
                let n = file.read(slice);
                FS_LOCK.release();
                n as i64
            })
            .unwrap_or(-1)
        }),
    }
}

fn sys_write(fd: u64, buf: u64, size: u64) -> i64 {
    if size == 0 {
        return 0;
    }
    match fd {
        1 => with_pinned_buffer(buf, size, || {
            // Stage through a kernel buffer so nothing faults while
            // the console is held, and feed putbuf in bounded chunks.
            let mut written: u64 = 0;
            let mut chunk = [0u8; CONSOLE_CHUNK];
            while written < size {
                let n = ((size - written) as usize).min(CONSOLE_CHUNK);
                for i in 0..n {
                    chunk[i] =
                        unsafe { core::ptr::read_volatile((buf + written + i as u64) as *const u8) };
                }
                crate::console::putbuf(&chunk[..n]);
                written += n as u64;
            }
            written as i64
        }),
        0 => -1,
        _ => with_pinned_buffer(buf, size, || {
            with_fd(fd, |file| {
                let slice = unsafe { core::slice::from_raw_parts(buf as *const u8, size as usize) };
                FS_LOCK.acquire();
                let n = file.write(slice);
                FS_LOCK.release();
                n as i64
            })
            .unwrap_or(-1)
        }),
    }
}

fn sys_seek(fd: u64, pos: u64) -> i64 {
    with_fd(fd, |file| {
        file.seek(pos as usize);
        0
    })
    .unwrap_or(-1)
}

fn sys_tell(fd: u64) -> i64 {
    with_fd(fd, |file| file.tell() as i64).unwrap_or(-1)
}

fn sys_close(fd: u64) -> i64 {
    let fd = fd as usize;
    if fd < 2 || fd >= process::FD_MAX {
        return -1;
    }
    crate::threads::with_current_process(|p| match p.fd_table[fd].take() {
        Some(_) => 0,
        None => -1,
    })
    .unwrap_or(-1)
}

fn sys_mmap(fd: u64, addr: u64) -> i64 {
    // The console descriptors and unaligned or null addresses are
    // never mappable.
    if fd < 2 || addr == 0 || addr % PGSIZE != 0 {
        return -1;
    }
    let Some(len) = with_fd(fd, |file| {
        FS_LOCK.acquire();
        let len = file.len() as u64;
        FS_LOCK.release();
        len
    }) else {
        return -1;
    };
    if len == 0 || !paging::user_range_ok(addr, len) {
        return -1;
    }
    let pages = paging::page_span(len);

    // Reject any overlap with existing mappings, resident or promised.
    let overlap = crate::threads::with_current_process(|p| {
        if p.spt.lock().overlaps(addr, pages) {
            return true;
        }
        (0..pages).any(|i| paging::is_mapped(p.aspace, addr + i * PGSIZE))
    })
    .unwrap_or(true);
    if overlap {
        return -1;
    }

    let Some(mapping) = with_fd(fd, |file| {
        FS_LOCK.acquire();
        let fresh = file.reopen();
        FS_LOCK.release();
        fresh
    }) else {
        return -1;
    };

    crate::threads::with_current_process(|p| {
        let id = p.next_mapid;
        p.next_mapid += 1;
        let mut spt = p.spt.lock();
        for i in 0..pages {
            let remaining = len - i * PGSIZE;
            spt.insert(
                addr + i * PGSIZE,
                crate::vm::page::PageEntry {
                    writable: true,
                    kind: crate::vm::page::PageKind::MMapped {
                        file: mapping.clone(),
                        offset: i * PGSIZE,
                        read_bytes: remaining.min(PGSIZE) as u32,
                    },
                },
            );
        }
        drop(spt);
        p.mmaps.push(MmapRegion {
            id,
            file: mapping,
            base: addr,
            pages,
        });
        id as i64
    })
    .unwrap_or(-1)
}

fn sys_munmap(id: u64) -> i64 {
    let tid = crate::threads::current_tid();
    let region = crate::threads::with_current_process(|p| {
        let idx = p.mmaps.iter().position(|r| r.id == id as i32)?;
        Some((p.mmaps.remove(idx), p.aspace, p.spt.clone()))
    })
    .flatten();
    match region {
        Some((region, aspace, spt)) => {
            process::unmap_region(tid, aspace, &spt, &region);
            0
        }
        None => -1,
    }
}
