//! Swap backing store: page-sized slots on the SWAP block device,
//! tracked by a bitmap. All I/O is synchronous.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bit_field::BitField;
use spin::Mutex;

use crate::devices::block::{self, BlockDevice, Role, SECTOR_SIZE};
use crate::memory::PGSIZE;

/// Device sectors per swap slot.
pub const SECTORS_PER_PAGE: usize = PGSIZE as usize / SECTOR_SIZE;

/// Used/free bitmap over swap slots.
pub struct SlotMap {
    bits: Vec<u64>,
    slots: usize,
}

impl SlotMap {
    pub fn new(slots: usize) -> SlotMap {
        SlotMap {
            bits: vec![0u64; (slots + 63) / 64],
            slots,
        }
    }

    /// Finds the first free slot and marks it used.
    pub fn take(&mut self) -> Option<usize> {
        for (word_idx, word) in self.bits.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let slot = word_idx * 64 + bit;
            if slot >= self.slots {
                return None;
            }
            word.set_bit(bit, true);
            return Some(slot);
        }
        None
    }

    /// Marks a used slot free again. The data on disk is left as-is.
    pub fn release(&mut self, slot: usize) {
        assert!(slot < self.slots);
        let word = &mut self.bits[slot / 64];
        assert!(word.get_bit(slot % 64), "releasing a free swap slot");
        word.set_bit(slot % 64, false);
    }

    pub fn is_used(&self, slot: usize) -> bool {
        slot < self.slots && self.bits[slot / 64].get_bit(slot % 64)
    }

    pub fn used_count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn slots(&self) -> usize {
        self.slots
    }
}

/// A slot map bound to its device.
pub struct SwapStore {
    map: SlotMap,
    dev: Arc<dyn BlockDevice>,
}

impl SwapStore {
    pub fn new(dev: Arc<dyn BlockDevice>) -> SwapStore {
        let slots = (dev.sector_count() as usize) / SECTORS_PER_PAGE;
        SwapStore {
            map: SlotMap::new(slots),
            dev,
        }
    }

    /// Writes one page into a fresh slot and returns the slot index.
    /// A full swap partition is unrecoverable.
    pub fn write_page(&mut self, page: &[u8]) -> usize {
        assert_eq!(page.len(), PGSIZE as usize);
        let slot = match self.map.take() {
            Some(slot) => slot,
            None => panic!("swap partition is full"),
        };
        let base = (slot * SECTORS_PER_PAGE) as u64;
        for i in 0..SECTORS_PER_PAGE {
            let chunk: &[u8; SECTOR_SIZE] = page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]
                .try_into()
                .unwrap();
            self.dev.write_sector(base + i as u64, chunk);
        }
        slot
    }

    /// Reads the page stored in `slot` and frees the slot.
    pub fn read_page(&mut self, slot: usize, page: &mut [u8]) {
        assert_eq!(page.len(), PGSIZE as usize);
        assert!(self.map.is_used(slot), "reading a free swap slot");
        let base = (slot * SECTORS_PER_PAGE) as u64;
        for i in 0..SECTORS_PER_PAGE {
            let chunk: &mut [u8; SECTOR_SIZE] = (&mut page
                [i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
                .try_into()
                .unwrap();
            self.dev.read_sector(base + i as u64, chunk);
        }
        self.map.release(slot);
    }

    /// Frees a slot without reading it (the owning page went away).
    pub fn free_slot(&mut self, slot: usize) {
        self.map.release(slot);
    }

    pub fn used_slots(&self) -> usize {
        self.map.used_count()
    }
}

static SWAP: Mutex<Option<SwapStore>> = Mutex::new(None);

/// Binds the swap store to the device registered for the SWAP role.
pub fn init() {
    let dev = block::device_for(Role::Swap).expect("no swap device registered");
    let store = SwapStore::new(dev);
    crate::log_info!("swap: {} slots available", store.map.slots());
    *SWAP.lock() = Some(store);
}

fn with_store<R>(f: impl FnOnce(&mut SwapStore) -> R) -> R {
    let mut guard = SWAP.lock();
    f(guard.as_mut().expect("swap not initialized"))
}

pub fn write_page(page: &[u8]) -> usize {
    with_store(|s| s.write_page(page))
}

pub fn read_page(slot: usize, page: &mut [u8]) {
    with_store(|s| s.read_page(slot, page))
}

pub fn free_slot(slot: usize) {
    with_store(|s| s.free_slot(slot))
}

pub fn used_slots() -> usize {
    with_store(|s| s.used_slots())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::block::RamDisk;

    fn store_with_slots(slots: usize) -> SwapStore {
        SwapStore::new(Arc::new(RamDisk::new(slots * SECTORS_PER_PAGE)))
    }

    #[test]
    fn slot_map_scan_and_flip() {
        let mut map = SlotMap::new(130);
        assert_eq!(map.take(), Some(0));
        assert_eq!(map.take(), Some(1));
        map.release(0);
        assert_eq!(map.take(), Some(0));
        assert_eq!(map.used_count(), 2);
        assert!(map.is_used(1));
        assert!(!map.is_used(2));
    }

    #[test]
    fn slot_map_exhausts_cleanly() {
        let mut map = SlotMap::new(65);
        for expected in 0..65 {
            assert_eq!(map.take(), Some(expected));
        }
        assert_eq!(map.take(), None);
    }

    #[test]
    #[should_panic(expected = "releasing a free swap slot")]
    fn double_release_is_fatal() {
        let mut map = SlotMap::new(8);
        let slot = map.take().unwrap();
        map.release(slot);
        map.release(slot);
    }

    #[test]
    fn page_round_trip_preserves_contents() {
        let mut store = store_with_slots(4);
        let mut page = vec![0u8; PGSIZE as usize];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = (i * 7 % 256) as u8;
        }
        let slot = store.write_page(&page);
        assert_eq!(store.used_slots(), 1);

        let mut back = vec![0u8; PGSIZE as usize];
        store.read_page(slot, &mut back);
        assert_eq!(page, back);
        // Reading frees the slot for reuse.
        assert_eq!(store.used_slots(), 0);
        assert_eq!(store.write_page(&page), slot);
    }

    #[test]
    fn distinct_pages_get_distinct_slots() {
        let mut store = store_with_slots(4);
        let a = store.write_page(&vec![0xAA; PGSIZE as usize]);
        let b = store.write_page(&vec![0xBB; PGSIZE as usize]);
        assert_ne!(a, b);
        let mut back = vec![0u8; PGSIZE as usize];
        store.read_page(a, &mut back);
        assert!(back.iter().all(|&x| x == 0xAA));
        store.read_page(b, &mut back);
        assert!(back.iter().all(|&x| x == 0xBB));
    }

    #[test]
    #[should_panic(expected = "swap partition is full")]
    fn full_swap_is_fatal() {
        let mut store = store_with_slots(2);
        let page = vec![0u8; PGSIZE as usize];
        store.write_page(&page);
        store.write_page(&page);
        store.write_page(&page);
    }
}
