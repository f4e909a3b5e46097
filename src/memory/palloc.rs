//! Page allocator over two fixed pools of physical frames: one for
//! kernel needs (page tables mostly) and one backing user pages. The
//! user pool running dry is what triggers frame eviction.

use alloc::vec;
use alloc::vec::Vec;
use bit_field::BitField;
use spin::Mutex;
use x86_64::PhysAddr;

use super::PGSIZE;

/// A contiguous run of physical pages with a used/free bitmap.
pub struct Pool {
    base: u64,
    pages: usize,
    bitmap: Vec<u64>,
}

impl Pool {
    pub fn new(base: PhysAddr, pages: usize) -> Pool {
        assert!(base.is_aligned(PGSIZE));
        Pool {
            base: base.as_u64(),
            pages,
            bitmap: vec![0u64; (pages + 63) / 64],
        }
    }

    /// Grabs a free page, lowest address first.
    pub fn alloc(&mut self) -> Option<PhysAddr> {
        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let page = word_idx * 64 + bit;
            if page >= self.pages {
                return None;
            }
            word.set_bit(bit, true);
            return Some(PhysAddr::new(self.base + page as u64 * PGSIZE));
        }
        None
    }

    /// Returns a page to the pool.
    pub fn free(&mut self, pa: PhysAddr) {
        assert!(self.contains(pa), "page does not belong to this pool");
        let page = ((pa.as_u64() - self.base) / PGSIZE) as usize;
        let word = &mut self.bitmap[page / 64];
        assert!(word.get_bit(page % 64), "freeing a page that is not allocated");
        word.set_bit(page % 64, false);
    }

    pub fn contains(&self, pa: PhysAddr) -> bool {
        let addr = pa.as_u64();
        addr >= self.base && addr < self.base + self.pages as u64 * PGSIZE
    }

    pub fn used(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn pages(&self) -> usize {
        self.pages
    }
}

static KERNEL_POOL: Mutex<Option<Pool>> = Mutex::new(None);
static USER_POOL: Mutex<Option<Pool>> = Mutex::new(None);

pub fn init(kernel_base: PhysAddr, kernel_pages: usize, user_base: PhysAddr, user_pages: usize) {
    *KERNEL_POOL.lock() = Some(Pool::new(kernel_base, kernel_pages));
    *USER_POOL.lock() = Some(Pool::new(user_base, user_pages));
}

fn alloc_from(pool: &Mutex<Option<Pool>>, zero: bool) -> Option<PhysAddr> {
    let pa = pool.lock().as_mut().expect("page pools not initialized").alloc()?;
    if zero {
        let kaddr = super::phys_to_virt(pa);
        unsafe { core::ptr::write_bytes(kaddr.as_mut_ptr::<u8>(), 0, PGSIZE as usize) };
    }
    Some(pa)
}

/// A page for kernel use, or `None` when the kernel pool is dry.
pub fn alloc_kernel(zero: bool) -> Option<PhysAddr> {
    alloc_from(&KERNEL_POOL, zero)
}

pub fn free_kernel(pa: PhysAddr) {
    KERNEL_POOL.lock().as_mut().expect("page pools not initialized").free(pa);
}

/// A page from the user pool, or `None` when eviction is required.
pub fn alloc_user(zero: bool) -> Option<PhysAddr> {
    alloc_from(&USER_POOL, zero)
}

pub fn free_user(pa: PhysAddr) {
    USER_POOL.lock().as_mut().expect("page pools not initialized").free(pa);
}

pub fn user_pool_used() -> usize {
    USER_POOL.lock().as_ref().map(|p| p.used()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_pages_until_full() {
        let mut pool = Pool::new(PhysAddr::new(0x10000), 3);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert_eq!(a.as_u64(), 0x10000);
        assert_eq!(b.as_u64(), 0x11000);
        assert_eq!(c.as_u64(), 0x12000);
        assert!(pool.alloc().is_none());
        assert_eq!(pool.used(), 3);
    }

    #[test]
    fn freed_pages_are_reused_lowest_first() {
        let mut pool = Pool::new(PhysAddr::new(0), 70);
        let pages: Vec<PhysAddr> = (0..70).map(|_| pool.alloc().unwrap()).collect();
        pool.free(pages[65]);
        pool.free(pages[3]);
        assert_eq!(pool.alloc().unwrap(), pages[3]);
        assert_eq!(pool.alloc().unwrap(), pages[65]);
        assert!(pool.alloc().is_none());
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn double_free_is_fatal() {
        let mut pool = Pool::new(PhysAddr::new(0), 8);
        let page = pool.alloc().unwrap();
        pool.free(page);
        pool.free(page);
    }
}
