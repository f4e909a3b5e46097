//! Supplemental page tables: per-process records of how to materialize
//! each not-yet-resident user page.
//!
//! An entry describes a page the process may touch but which has no
//! frame right now. Loading a page consumes no entry — the entry stays
//! behind as the recipe for the next reload — but its kind is kept
//! honest: a page read back from swap reverts to `ZeroFill` (it is
//! anonymous; eviction will write it to swap again), file pages stay
//! `FileBacked`, mapped pages stay `MMapped`.

use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;

use crate::fs::File;
use crate::memory::{paging, virt_to_phys, PGSIZE};
use crate::vm::{frame, swap};

#[derive(Clone)]
pub enum PageKind {
    /// Fresh page: all zeroes on first touch.
    ZeroFill,
    /// `read_bytes` from `file` at `offset`, zero-padded to a page.
    FileBacked {
        file: File,
        offset: u64,
        read_bytes: u32,
    },
    /// Like `FileBacked`, but dirty evictions write back to the file
    /// and the entry's lifetime is bound to an mmap region.
    MMapped {
        file: File,
        offset: u64,
        read_bytes: u32,
    },
    /// Contents live in the given swap slot.
    InSwap { slot: u32 },
}

#[derive(Clone)]
pub struct PageEntry {
    pub writable: bool,
    pub kind: PageKind,
}

/// One process's map from page-aligned user address to entry.
pub struct Spt {
    entries: HashMap<u64, PageEntry>,
}

impl Spt {
    pub fn new() -> Spt {
        Spt {
            entries: HashMap::new(),
        }
    }

    /// Registers an entry. False if the page already has one.
    pub fn insert(&mut self, uaddr: u64, entry: PageEntry) -> bool {
        debug_assert!(uaddr % PGSIZE == 0, "supplemental entries are page-aligned");
        if self.entries.contains_key(&uaddr) {
            return false;
        }
        self.entries.insert(uaddr, entry);
        true
    }

    pub fn get(&self, uaddr: u64) -> Option<&PageEntry> {
        self.entries.get(&uaddr)
    }

    pub fn contains(&self, uaddr: u64) -> bool {
        self.entries.contains_key(&uaddr)
    }

    pub fn remove(&mut self, uaddr: u64) -> Option<PageEntry> {
        self.entries.remove(&uaddr)
    }

    pub fn set_kind(&mut self, uaddr: u64, kind: PageKind) {
        self.entries.get_mut(&uaddr).expect("no supplemental entry").kind = kind;
    }

    /// True when any page of `[base, base + pages * PGSIZE)` already
    /// has an entry. Used to reject overlapping mmaps.
    pub fn overlaps(&self, base: u64, pages: u64) -> bool {
        (0..pages).any(|i| self.entries.contains_key(&(base + i * PGSIZE)))
    }

    /// Removes the entries covering an mmap region, in address order.
    pub fn remove_range(&mut self, base: u64, pages: u64) -> Vec<(u64, PageEntry)> {
        let mut removed = Vec::new();
        for i in 0..pages {
            let uaddr = base + i * PGSIZE;
            if let Some(entry) = self.entries.remove(&uaddr) {
                removed.push((uaddr, entry));
            }
        }
        removed
    }

    /// Drains every entry, handing back swap slots that must be freed.
    /// Called on process teardown.
    pub fn drain_swap_slots(&mut self) -> Vec<u32> {
        let mut slots = Vec::new();
        for (_, entry) in self.entries.drain() {
            if let PageKind::InSwap { slot } = entry.kind {
                slots.push(slot);
            }
        }
        slots
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Materializes the page containing `uaddr` for the current process.
/// This is the single entry point the fault handler (and the syscall
/// pinning path) uses. The frame is pinned across the load's own I/O;
/// `pin` keeps it pinned afterwards.
pub fn page_load(uaddr: u64, pin: bool) -> bool {
    let base = uaddr & !(PGSIZE - 1);
    let Some((spt, aspace)) = crate::threads::with_current_process(|p| (p.spt.clone(), p.aspace))
    else {
        return false;
    };
    if paging::is_mapped(aspace, base) {
        // Already resident: this fault is a protection violation, not
        // a missing page.
        return false;
    }
    let Some(entry) = spt.lock().get(base).cloned() else {
        return false;
    };

    let kaddr = frame::alloc(base, entry.writable);
    let contents = unsafe { core::slice::from_raw_parts_mut(kaddr as *mut u8, PGSIZE as usize) };

    match entry.kind {
        PageKind::ZeroFill => contents.fill(0),
        PageKind::InSwap { slot } => {
            swap::read_page(slot as usize, contents);
            // Back in memory the page is plain anonymous again; the
            // slot was freed by the read.
            spt.lock().set_kind(base, PageKind::ZeroFill);
        }
        PageKind::FileBacked { ref file, offset, read_bytes }
        | PageKind::MMapped { ref file, offset, read_bytes } => {
            crate::fs::FS_LOCK.acquire();
            let n = file.read_at(offset as usize, &mut contents[..read_bytes as usize]);
            crate::fs::FS_LOCK.release();
            contents[n..].fill(0);
        }
    }

    if !paging::map_user(aspace, base, virt_to_phys(x86_64::VirtAddr::new(kaddr)), entry.writable) {
        frame::free(kaddr);
        return false;
    }
    if !pin {
        frame::set_evictable(kaddr, true);
    }
    true
}

/// Spt handle plus address space for another module's use.
pub type SptHandle = Arc<Mutex<Spt>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_entry(writable: bool) -> PageEntry {
        PageEntry {
            writable,
            kind: PageKind::ZeroFill,
        }
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut spt = Spt::new();
        assert!(spt.insert(0x8000_0000_0000, zero_entry(true)));
        assert!(!spt.insert(0x8000_0000_0000, zero_entry(false)));
        assert_eq!(spt.len(), 1);
        assert!(spt.get(0x8000_0000_0000).unwrap().writable);
    }

    #[test]
    fn overlap_detection_covers_whole_ranges() {
        let mut spt = Spt::new();
        let base = 0x8000_0000_0000u64;
        spt.insert(base + 2 * PGSIZE, zero_entry(true));
        assert!(spt.overlaps(base, 3));
        assert!(!spt.overlaps(base, 2));
        assert!(spt.overlaps(base + 2 * PGSIZE, 1));
        assert!(!spt.overlaps(base + 3 * PGSIZE, 4));
    }

    #[test]
    fn remove_range_returns_entries_in_order() {
        let mut spt = Spt::new();
        let base = 0x8000_0000_0000u64;
        for i in [0u64, 1, 3] {
            spt.insert(base + i * PGSIZE, zero_entry(true));
        }
        let removed = spt.remove_range(base, 4);
        let addrs: Vec<u64> = removed.iter().map(|(a, _)| *a).collect();
        assert_eq!(addrs, alloc::vec![base, base + PGSIZE, base + 3 * PGSIZE]);
        assert_eq!(spt.len(), 0);
    }

    #[test]
    fn drain_returns_only_swap_slots() {
        let mut spt = Spt::new();
        let base = 0x8000_0000_0000u64;
        spt.insert(base, zero_entry(true));
        spt.insert(
            base + PGSIZE,
            PageEntry {
                writable: true,
                kind: PageKind::InSwap { slot: 9 },
            },
        );
        spt.insert(
            base + 2 * PGSIZE,
            PageEntry {
                writable: true,
                kind: PageKind::InSwap { slot: 4 },
            },
        );
        let mut slots = spt.drain_swap_slots();
        slots.sort_unstable();
        assert_eq!(slots, alloc::vec![4, 9]);
        assert_eq!(spt.len(), 0);
    }

    #[test]
    fn set_kind_rewrites_in_place() {
        let mut spt = Spt::new();
        let base = 0x8000_0000_0000u64;
        spt.insert(base, zero_entry(true));
        spt.set_kind(base, PageKind::InSwap { slot: 3 });
        match spt.get(base).unwrap().kind {
            PageKind::InSwap { slot } => assert_eq!(slot, 3),
            _ => panic!("kind not rewritten"),
        }
    }
}
