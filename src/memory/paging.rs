//! Per-process address spaces and page-table plumbing.
//!
//! User space occupies one PML4 slot, so a process page table is the
//! kernel's table with that single slot pointing at a private subtree.
//! Everything here goes through the physical-memory window the
//! bootloader maps, so page tables can be edited no matter which
//! address space is live.

use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::mapper::TranslateResult;
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
    Translate,
};
use x86_64::{PhysAddr, VirtAddr};

use super::{palloc, phys_to_virt, PGSIZE};

/// Bottom of user virtual space. Chosen so that user mappings occupy
/// exactly one PML4 slot of their own.
pub const USER_BASE: u64 = 0x80_0000_0000;
/// Top of user virtual space: 2 GiB above the base.
pub const USER_TOP: u64 = USER_BASE + 0x8000_0000;
/// The user stack grows down from the very top of user space.
pub const USER_STACK_TOP: u64 = USER_TOP;
/// Maximum size the stack may grow to.
pub const STACK_LIMIT: u64 = 8 * 1024 * 1024;

const USER_PML4_SLOT: usize = ((USER_BASE >> 39) & 0x1FF) as usize;

/// Handle on one process's page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    pml4: PhysAddr,
}

static KERNEL_CR3: AtomicU64 = AtomicU64::new(0);

/// Records the boot page table as the kernel address space.
pub fn init() {
    let (frame, _) = Cr3::read();
    KERNEL_CR3.store(frame.start_address().as_u64(), Ordering::Relaxed);
}

pub fn is_user_vaddr(va: u64) -> bool {
    (USER_BASE..USER_TOP).contains(&va)
}

/// True when every byte of `[base, base + len)` is a user address.
pub fn user_range_ok(base: u64, len: u64) -> bool {
    if len == 0 {
        return is_user_vaddr(base);
    }
    match base.checked_add(len - 1) {
        Some(last) => is_user_vaddr(base) && is_user_vaddr(last),
        None => false,
    }
}

/// Builds a fresh address space sharing all kernel mappings. `None` if
/// the kernel pool cannot supply the root table.
pub fn create_address_space() -> Option<AddressSpace> {
    let pml4_pa = palloc::alloc_kernel(true)?;
    let kernel_pml4 =
        unsafe { &*(phys_to_virt(PhysAddr::new(KERNEL_CR3.load(Ordering::Relaxed))).as_ptr::<PageTable>()) };
    let new_pml4 = unsafe { &mut *(phys_to_virt(pml4_pa).as_mut_ptr::<PageTable>()) };
    for (i, entry) in kernel_pml4.iter().enumerate() {
        if i != USER_PML4_SLOT && !entry.is_unused() {
            new_pml4[i].set_addr(entry.addr(), entry.flags());
        }
    }
    Some(AddressSpace { pml4: pml4_pa })
}

/// Intermediate page tables come from the kernel pool.
struct PoolFrameAllocator;

unsafe impl FrameAllocator<Size4KiB> for PoolFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        palloc::alloc_kernel(true).map(PhysFrame::containing_address)
    }
}

fn with_mapper<R>(aspace: AddressSpace, f: impl FnOnce(&mut OffsetPageTable) -> R) -> R {
    let offset = phys_to_virt(PhysAddr::new(0));
    let table = unsafe { &mut *(phys_to_virt(aspace.pml4).as_mut_ptr::<PageTable>()) };
    let mut mapper = unsafe { OffsetPageTable::new(table, offset) };
    f(&mut mapper)
}

fn is_active(aspace: AddressSpace) -> bool {
    Cr3::read().0.start_address() == aspace.pml4
}

/// Installs a user mapping for the page containing `uaddr`. Returns
/// false if an intermediate table could not be allocated.
pub fn map_user(aspace: AddressSpace, uaddr: u64, pa: PhysAddr, writable: bool) -> bool {
    debug_assert!(is_user_vaddr(uaddr));
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    let parent = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    with_mapper(aspace, |mapper| {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(uaddr));
        let frame = PhysFrame::containing_address(pa);
        match unsafe { mapper.map_to_with_table_flags(page, frame, flags, parent, &mut PoolFrameAllocator) } {
            Ok(flush) => {
                if is_active(aspace) {
                    flush.flush();
                } else {
                    flush.ignore();
                }
                true
            }
            Err(_) => false,
        }
    })
}

/// Removes the mapping for `uaddr`, returning the frame it pointed at
/// and whether the page was dirty. `None` if nothing was mapped.
pub fn unmap_user(aspace: AddressSpace, uaddr: u64) -> Option<(PhysAddr, bool)> {
    let dirty = translate_user(aspace, uaddr)?.1.contains(PageTableFlags::DIRTY);
    with_mapper(aspace, |mapper| {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(uaddr));
        match mapper.unmap(page) {
            Ok((frame, flush)) => {
                if is_active(aspace) {
                    flush.flush();
                } else {
                    flush.ignore();
                }
                Some((frame.start_address(), dirty))
            }
            Err(_) => None,
        }
    })
}

/// Frame and flags behind a user address, if mapped.
pub fn translate_user(aspace: AddressSpace, uaddr: u64) -> Option<(PhysAddr, PageTableFlags)> {
    with_mapper(aspace, |mapper| match mapper.translate(VirtAddr::new(uaddr)) {
        TranslateResult::Mapped { frame, offset, flags } => {
            Some((frame.start_address() + offset, flags))
        }
        _ => None,
    })
}

pub fn is_mapped(aspace: AddressSpace, uaddr: u64) -> bool {
    translate_user(aspace, uaddr).is_some()
}

pub fn is_dirty(aspace: AddressSpace, uaddr: u64) -> bool {
    translate_user(aspace, uaddr)
        .map(|(_, flags)| flags.contains(PageTableFlags::DIRTY))
        .unwrap_or(false)
}

/// Loads this address space into CR3 (no-op when already live).
pub fn activate(aspace: AddressSpace) {
    if !is_active(aspace) {
        unsafe {
            Cr3::write(PhysFrame::containing_address(aspace.pml4), Cr3Flags::empty());
        }
    }
}

/// Switches back to the kernel's own page table.
pub fn activate_kernel() {
    let pa = PhysAddr::new(KERNEL_CR3.load(Ordering::Relaxed));
    if Cr3::read().0.start_address() != pa {
        unsafe {
            Cr3::write(PhysFrame::containing_address(pa), Cr3Flags::empty());
        }
    }
}

/// Frees the user subtree and the root table. Data frames must already
/// have been returned through the frame table; only the page-table
/// pages themselves are released here. The address space must not be
/// active.
pub fn destroy(aspace: AddressSpace) {
    assert!(!is_active(aspace), "destroying the live address space");
    let pml4 = unsafe { &*(phys_to_virt(aspace.pml4).as_ptr::<PageTable>()) };
    let entry = &pml4[USER_PML4_SLOT];
    if !entry.is_unused() {
        free_table_tree(entry.addr(), 3);
    }
    palloc::free_kernel(aspace.pml4);
}

fn free_table_tree(table_pa: PhysAddr, level: u8) {
    if level > 1 {
        let table = unsafe { &*(phys_to_virt(table_pa).as_ptr::<PageTable>()) };
        for entry in table.iter() {
            if !entry.is_unused() && !entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                free_table_tree(entry.addr(), level - 1);
            }
        }
    }
    palloc::free_kernel(table_pa);
}

/// Number of whole pages covering `len` bytes.
pub fn page_span(len: u64) -> u64 {
    (len + PGSIZE - 1) / PGSIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_range_checks() {
        assert!(is_user_vaddr(USER_BASE));
        assert!(is_user_vaddr(USER_TOP - 1));
        assert!(!is_user_vaddr(USER_TOP));
        assert!(!is_user_vaddr(0));
        assert!(user_range_ok(USER_BASE, 4096));
        assert!(!user_range_ok(USER_TOP - 8, 16));
        assert!(!user_range_ok(u64::MAX - 4, 16));
    }

    #[test]
    fn page_span_rounds_up() {
        assert_eq!(page_span(0), 0);
        assert_eq!(page_span(1), 1);
        assert_eq!(page_span(4096), 1);
        assert_eq!(page_span(4097), 2);
    }
}
