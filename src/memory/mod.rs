//! Physical-memory bring-up: kernel heap window, page pools, and the
//! physical-to-virtual window the bootloader maps for us.

pub mod palloc;
pub mod paging;

use bootloader::bootinfo::MemoryRegionType;
use bootloader::BootInfo;
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::{PhysAddr, VirtAddr};

/// Size of one page in bytes.
pub const PGSIZE: u64 = 4096;

/// Kernel heap size. Sized to hold the RAM-backed block devices and
/// the file store with room to spare.
const HEAP_SIZE: u64 = 16 * 1024 * 1024;
/// Pages reserved for kernel allocations (page tables, DMA buffers).
const KERNEL_POOL_PAGES: u64 = 1024;
/// Pages backing user frames. Deliberately small so that eviction is
/// a routine event rather than a theoretical one.
const USER_POOL_PAGES: u64 = 512;

/// Where physical memory is mapped in the kernel's virtual space.
static PHYS_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Kernel virtual address of a physical address.
pub fn phys_to_virt(pa: PhysAddr) -> VirtAddr {
    VirtAddr::new(PHYS_OFFSET.load(Ordering::Relaxed) + pa.as_u64())
}

/// Physical address behind a kernel virtual address inside the
/// physical window.
pub fn virt_to_phys(kaddr: VirtAddr) -> PhysAddr {
    let offset = PHYS_OFFSET.load(Ordering::Relaxed);
    debug_assert!(kaddr.as_u64() >= offset);
    PhysAddr::new(kaddr.as_u64() - offset)
}

/// Carves the boot memory map into heap, kernel pool, and user pool,
/// then brings up the allocators and the paging helpers.
pub fn init(boot_info: &'static BootInfo) {
    PHYS_OFFSET.store(boot_info.physical_memory_offset, Ordering::Relaxed);

    // The largest usable region holds everything we carve out.
    let region = boot_info
        .memory_map
        .iter()
        .filter(|r| r.region_type == MemoryRegionType::Usable)
        .max_by_key(|r| r.range.end_addr() - r.range.start_addr())
        .expect("no usable memory region");

    let needed = HEAP_SIZE + (KERNEL_POOL_PAGES + USER_POOL_PAGES) * PGSIZE;
    let avail = region.range.end_addr() - region.range.start_addr();
    assert!(avail >= needed, "not enough memory: {} bytes usable", avail);

    let heap_base = PhysAddr::new(region.range.start_addr());
    let kernel_pool_base = heap_base + HEAP_SIZE;
    let user_pool_base = kernel_pool_base + KERNEL_POOL_PAGES * PGSIZE;

    crate::allocator::init(phys_to_virt(heap_base).as_u64(), HEAP_SIZE as usize);
    palloc::init(
        kernel_pool_base,
        KERNEL_POOL_PAGES as usize,
        user_pool_base,
        USER_POOL_PAGES as usize,
    );
    paging::init();

    crate::log_info!(
        "memory: heap {} KiB, kernel pool {} pages, user pool {} pages",
        HEAP_SIZE / 1024,
        KERNEL_POOL_PAGES,
        USER_POOL_PAGES
    );
}
