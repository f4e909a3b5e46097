//! ELF64 program loading.
//!
//! Nothing is copied at load time: each loadable segment becomes a run
//! of supplemental page entries that the fault handler materializes on
//! first touch. Only the initial stack page is populated eagerly, with
//! the argument vector laid out for the user entry point.

use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use x86_64::VirtAddr;

use crate::fs::{File, FS_LOCK};
use crate::memory::paging::{self, USER_STACK_TOP};
use crate::memory::{virt_to_phys, PGSIZE};
use crate::process::Process;
use crate::vm::frame;
use crate::vm::page::{PageEntry, PageKind};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

bitflags! {
    #[derive(Debug, Clone, Copy)]
    struct SegmentFlags: u32 {
        const EXEC  = 1;
        const WRITE = 2;
        const READ  = 4;
    }
}

#[derive(Debug)]
pub enum ExecError {
    NotFound,
    BadFormat,
    UnsupportedArch,
    BadSegment,
    ArgsTooLong,
    OutOfMemory,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::NotFound => write!(f, "file not found"),
            ExecError::BadFormat => write!(f, "invalid ELF image"),
            ExecError::UnsupportedArch => write!(f, "unsupported architecture"),
            ExecError::BadSegment => write!(f, "malformed load segment"),
            ExecError::ArgsTooLong => write!(f, "argument list does not fit on one page"),
            ExecError::OutOfMemory => write!(f, "out of kernel memory"),
        }
    }
}

struct Ehdr {
    entry: u64,
    phoff: u64,
    phentsize: u16,
    phnum: u16,
}

impl Ehdr {
    fn parse(raw: &[u8]) -> Result<Ehdr, ExecError> {
        if raw.len() < EHDR_SIZE || raw[0..4] != ELF_MAGIC {
            return Err(ExecError::BadFormat);
        }
        if raw[4] != ELFCLASS64 || raw[5] != ELFDATA2LSB {
            return Err(ExecError::UnsupportedArch);
        }
        let e_type = u16::from_le_bytes([raw[16], raw[17]]);
        let machine = u16::from_le_bytes([raw[18], raw[19]]);
        if e_type != ET_EXEC {
            return Err(ExecError::BadFormat);
        }
        if machine != EM_X86_64 {
            return Err(ExecError::UnsupportedArch);
        }
        Ok(Ehdr {
            entry: u64::from_le_bytes(raw[24..32].try_into().unwrap()),
            phoff: u64::from_le_bytes(raw[32..40].try_into().unwrap()),
            phentsize: u16::from_le_bytes([raw[54], raw[55]]),
            phnum: u16::from_le_bytes([raw[56], raw[57]]),
        })
    }
}

struct Phdr {
    p_type: u32,
    flags: SegmentFlags,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
}

impl Phdr {
    fn parse(raw: &[u8]) -> Result<Phdr, ExecError> {
        if raw.len() < PHDR_SIZE {
            return Err(ExecError::BadFormat);
        }
        Ok(Phdr {
            p_type: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            flags: SegmentFlags::from_bits_truncate(u32::from_le_bytes(
                raw[4..8].try_into().unwrap(),
            )),
            offset: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
            vaddr: u64::from_le_bytes(raw[16..24].try_into().unwrap()),
            filesz: u64::from_le_bytes(raw[32..40].try_into().unwrap()),
            memsz: u64::from_le_bytes(raw[40..48].try_into().unwrap()),
        })
    }
}

/// Loads the program named by the first word of `cmdline` into the
/// current thread, which must not already carry a process. Returns the
/// user entry point and initial stack pointer.
pub fn load(cmdline: &str) -> Result<(u64, u64), ExecError> {
    let args: Vec<&str> = cmdline.split_whitespace().collect();
    let name = *args.first().ok_or(ExecError::BadFormat)?;

    let aspace = paging::create_address_space().ok_or(ExecError::OutOfMemory)?;
    crate::threads::set_current_process(Process::new(name, aspace));

    // From here on, any failure unwinds through process::exit, which
    // tears the half-built process down.
    FS_LOCK.acquire();
    let image = load_image(name);
    FS_LOCK.release();
    let entry = image?;

    let rsp = setup_stack(&args)?;
    Ok((entry, rsp))
}

/// Opens the binary, denies writes to it for the process lifetime, and
/// registers every loadable segment lazily. Caller holds the
/// filesystem lock.
fn load_image(name: &str) -> Result<u64, ExecError> {
    let mut file = crate::fs::open(name).ok_or(ExecError::NotFound)?;
    file.deny_write();

    let mut raw_ehdr = [0u8; EHDR_SIZE];
    if file.read_at(0, &mut raw_ehdr) != EHDR_SIZE {
        return Err(ExecError::BadFormat);
    }
    let ehdr = Ehdr::parse(&raw_ehdr)?;
    if ehdr.phentsize as usize != PHDR_SIZE || ehdr.phnum == 0 {
        return Err(ExecError::BadFormat);
    }
    if !paging::is_user_vaddr(ehdr.entry) {
        return Err(ExecError::BadFormat);
    }

    for i in 0..ehdr.phnum as usize {
        let mut raw_phdr = [0u8; PHDR_SIZE];
        let off = ehdr.phoff as usize + i * PHDR_SIZE;
        if file.read_at(off, &mut raw_phdr) != PHDR_SIZE {
            return Err(ExecError::BadFormat);
        }
        let phdr = Phdr::parse(&raw_phdr)?;
        if phdr.p_type != PT_LOAD {
            continue;
        }
        register_segment(&file, &phdr)?;
    }

    crate::threads::with_current_process(|p| p.exec_file = Some(file));
    Ok(ehdr.entry)
}

/// Registers one PT_LOAD segment as supplemental entries: file-backed
/// pages for the initialized part, zero-fill for the rest.
fn register_segment(file: &File, phdr: &Phdr) -> Result<(), ExecError> {
    if phdr.filesz > phdr.memsz || phdr.memsz == 0 {
        return Err(ExecError::BadSegment);
    }
    if !paging::user_range_ok(phdr.vaddr, phdr.memsz) {
        return Err(ExecError::BadSegment);
    }
    // Segment offset and address must share their page alignment.
    if phdr.offset % PGSIZE != phdr.vaddr % PGSIZE {
        return Err(ExecError::BadSegment);
    }

    let writable = phdr.flags.contains(SegmentFlags::WRITE);
    let page_offset = phdr.vaddr % PGSIZE;
    let mem_page = phdr.vaddr - page_offset;
    let file_page = phdr.offset - page_offset;
    let mut read_bytes = page_offset + phdr.filesz;
    let total_pages = paging::page_span(page_offset + phdr.memsz);

    let spt = crate::threads::with_current_process(|p| p.spt.clone())
        .expect("loading a segment without a process");
    for i in 0..total_pages {
        let page_read = read_bytes.min(PGSIZE) as u32;
        read_bytes -= page_read as u64;
        let kind = if page_read == 0 {
            PageKind::ZeroFill
        } else {
            PageKind::FileBacked {
                file: file.clone(),
                offset: file_page + i * PGSIZE,
                read_bytes: page_read,
            }
        };
        let inserted = spt
            .lock()
            .insert(mem_page + i * PGSIZE, PageEntry { writable, kind });
        if !inserted {
            return Err(ExecError::BadSegment);
        }
    }
    Ok(())
}

/// Maps the initial stack page and lays the argument vector out on it.
fn setup_stack(args: &[&str]) -> Result<u64, ExecError> {
    let stack_page = USER_STACK_TOP - PGSIZE;
    let kaddr = frame::alloc(stack_page, true);
    let page =
        unsafe { core::slice::from_raw_parts_mut(kaddr as *mut u8, PGSIZE as usize) };
    page.fill(0);

    let rsp = match build_argument_stack(args, page, USER_STACK_TOP) {
        Some(rsp) => rsp,
        None => {
            frame::free(kaddr);
            return Err(ExecError::ArgsTooLong);
        }
    };

    let aspace = crate::threads::with_current_process(|p| p.aspace)
        .expect("stack setup without a process");
    if !paging::map_user(aspace, stack_page, virt_to_phys(VirtAddr::new(kaddr)), true) {
        frame::free(kaddr);
        return Err(ExecError::OutOfMemory);
    }
    // Register the stack page like any other anonymous page so the
    // evictor has a recipe to update when it swaps it out.
    crate::threads::with_current_process(|p| {
        p.spt.lock().insert(
            stack_page,
            PageEntry {
                writable: true,
                kind: PageKind::ZeroFill,
            },
        )
    });
    frame::set_evictable(kaddr, true);
    Ok(rsp)
}

/// Builds the System V argument layout inside `page`, whose last byte
/// backs `stack_top - 1`. From the final stack pointer upward: a fake
/// return address, `argc`, `argv`, the `argv[]` pointers with their
/// null terminator, alignment padding, and the packed strings.
/// Returns the initial stack pointer, or `None` if it all cannot fit.
fn build_argument_stack(args: &[&str], page: &mut [u8], stack_top: u64) -> Option<u64> {
    let page_base = stack_top - page.len() as u64;
    let mut sp = stack_top;
    let mut string_addrs = Vec::new();

    // Strings first, packed downward from the very top.
    for arg in args.iter().rev() {
        let bytes = arg.as_bytes();
        sp = sp.checked_sub(bytes.len() as u64 + 1)?;
        if sp < page_base {
            return None;
        }
        let off = (sp - page_base) as usize;
        page[off..off + bytes.len()].copy_from_slice(bytes);
        page[off + bytes.len()] = 0;
        string_addrs.push(sp);
    }
    string_addrs.reverse();

    // Word-align, then the pointer area: argv[argc] = null, argv[i],
    // argv itself, argc, and the fake return address.
    sp &= !7;
    let words = args.len() as u64 + 4;
    sp = sp.checked_sub(words * 8)?;
    if sp < page_base {
        return None;
    }

    let mut write_word = |addr: u64, value: u64| {
        let off = (addr - page_base) as usize;
        page[off..off + 8].copy_from_slice(&value.to_le_bytes());
    };

    let argv = sp + 3 * 8;
    write_word(sp, 0); // fake return address
    write_word(sp + 8, args.len() as u64); // argc
    write_word(sp + 16, argv); // argv
    for (i, &addr) in string_addrs.iter().enumerate() {
        write_word(argv + i as u64 * 8, addr);
    }
    write_word(argv + args.len() as u64 * 8, 0); // argv[argc]

    Some(sp)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOP: u64 = USER_STACK_TOP;

    fn word_at(page: &[u8], base: u64, addr: u64) -> u64 {
        let off = (addr - base) as usize;
        u64::from_le_bytes(page[off..off + 8].try_into().unwrap())
    }

    fn string_at(page: &[u8], base: u64, addr: u64) -> &str {
        let off = (addr - base) as usize;
        let end = page[off..].iter().position(|&b| b == 0).unwrap() + off;
        core::str::from_utf8(&page[off..end]).unwrap()
    }

    #[test]
    fn argument_stack_layout() {
        let mut page = alloc::vec![0u8; PGSIZE as usize];
        let rsp = build_argument_stack(&["echo", "hello", "world"], &mut page, TOP).unwrap();
        let base = TOP - PGSIZE;

        // Return address slot, then argc, then argv.
        assert_eq!(word_at(&page, base, rsp), 0);
        assert_eq!(word_at(&page, base, rsp + 8), 3);
        let argv = word_at(&page, base, rsp + 16);
        assert_eq!(argv, rsp + 24);

        let argv0 = word_at(&page, base, argv);
        let argv1 = word_at(&page, base, argv + 8);
        let argv2 = word_at(&page, base, argv + 16);
        assert_eq!(word_at(&page, base, argv + 24), 0);

        assert_eq!(string_at(&page, base, argv0), "echo");
        assert_eq!(string_at(&page, base, argv1), "hello");
        assert_eq!(string_at(&page, base, argv2), "world");

        // The pointer area is word-aligned; strings sit above it.
        assert_eq!(rsp % 8, 0);
        assert!(argv0 > argv + 24);
        assert!(argv0 < TOP);
    }

    #[test]
    fn single_argument_program() {
        let mut page = alloc::vec![0u8; PGSIZE as usize];
        let rsp = build_argument_stack(&["init"], &mut page, TOP).unwrap();
        let base = TOP - PGSIZE;
        assert_eq!(word_at(&page, base, rsp + 8), 1);
        let argv = word_at(&page, base, rsp + 16);
        assert_eq!(string_at(&page, base, word_at(&page, base, argv)), "init");
    }

    #[test]
    fn oversized_arguments_are_rejected() {
        let mut page = alloc::vec![0u8; PGSIZE as usize];
        let long = alloc::string::String::from_utf8(alloc::vec![b'x'; 5000]).unwrap();
        assert!(build_argument_stack(&[&long], &mut page, TOP).is_none());
    }

    #[test]
    fn ehdr_parser_validates() {
        let mut raw = [0u8; EHDR_SIZE];
        raw[0..4].copy_from_slice(&ELF_MAGIC);
        raw[4] = ELFCLASS64;
        raw[5] = ELFDATA2LSB;
        raw[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        raw[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        raw[24..32].copy_from_slice(&0x80_0000_1000u64.to_le_bytes());
        raw[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        raw[56..58].copy_from_slice(&2u16.to_le_bytes());

        let ehdr = Ehdr::parse(&raw).unwrap();
        assert_eq!(ehdr.entry, 0x80_0000_1000);
        assert_eq!(ehdr.phnum, 2);

        raw[0] = 0;
        assert!(matches!(Ehdr::parse(&raw), Err(ExecError::BadFormat)));
        raw[0] = 0x7F;
        raw[4] = 1; // 32-bit class
        assert!(matches!(Ehdr::parse(&raw), Err(ExecError::UnsupportedArch)));
    }

    #[test]
    fn phdr_parser_reads_fields() {
        let mut raw = [0u8; PHDR_SIZE];
        raw[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        raw[4..8].copy_from_slice(&5u32.to_le_bytes()); // R+X
        raw[8..16].copy_from_slice(&0x1000u64.to_le_bytes());
        raw[16..24].copy_from_slice(&0x80_0000_0000u64.to_le_bytes());
        raw[32..40].copy_from_slice(&0x800u64.to_le_bytes());
        raw[40..48].copy_from_slice(&0x1000u64.to_le_bytes());

        let phdr = Phdr::parse(&raw).unwrap();
        assert_eq!(phdr.p_type, PT_LOAD);
        assert!(phdr.flags.contains(SegmentFlags::READ));
        assert!(!phdr.flags.contains(SegmentFlags::WRITE));
        assert_eq!(phdr.vaddr, 0x80_0000_0000);
        assert_eq!(phdr.filesz, 0x800);
    }
}
