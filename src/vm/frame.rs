//! The frame table: ownership records for every physical page handed
//! to user processes, and the eviction machinery that reclaims one
//! when the user pool runs dry.

use alloc::vec::Vec;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::memory::{palloc, paging, phys_to_virt, virt_to_phys, PGSIZE};
use crate::threads::sync::Lock;
use crate::threads::thread::Tid;
use crate::vm::page::PageKind;
use crate::vm::swap;

/// One user frame, keyed by its kernel-virtual address.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub kaddr: u64,
    pub uaddr: u64,
    pub writable: bool,
    pub owner: Tid,
    /// Pinned frames (`evictable == false`) are never chosen as
    /// victims; pages are pinned while kernel I/O fills them.
    pub evictable: bool,
}

pub struct FrameTable {
    frames: HashMap<u64, Frame>,
    rng: u64,
}

impl FrameTable {
    pub fn new(seed: u64) -> FrameTable {
        FrameTable {
            frames: HashMap::new(),
            rng: seed | 1,
        }
    }

    /// Records a frame for `uaddr`, initially pinned; the caller makes
    /// it evictable once the contents are in place.
    pub fn insert(&mut self, kaddr: u64, uaddr: u64, writable: bool, owner: Tid) {
        debug_assert!(kaddr % PGSIZE == 0 && uaddr % PGSIZE == 0);
        let previous = self.frames.insert(
            kaddr,
            Frame {
                kaddr,
                uaddr,
                writable,
                owner,
                evictable: false,
            },
        );
        assert!(previous.is_none(), "frame {:#x} recorded twice", kaddr);
    }

    pub fn remove(&mut self, kaddr: u64) -> Option<Frame> {
        self.frames.remove(&kaddr)
    }

    pub fn get(&self, kaddr: u64) -> Option<&Frame> {
        self.frames.get(&kaddr)
    }

    pub fn set_evictable(&mut self, kaddr: u64, evictable: bool) {
        let frame = self.frames.get_mut(&kaddr).expect("no such frame");
        frame.evictable = evictable;
    }

    /// Linear scan for the frame backing one of `owner`'s pages.
    pub fn find_by_uaddr(&self, owner: Tid, uaddr: u64) -> Option<u64> {
        self.frames
            .values()
            .find(|f| f.owner == owner && f.uaddr == uaddr)
            .map(|f| f.kaddr)
    }

    pub fn frames_of(&self, owner: Tid) -> Vec<Frame> {
        self.frames.values().filter(|f| f.owner == owner).copied().collect()
    }

    /// Picks an eviction victim uniformly among the evictable frames.
    /// `None` when every frame is pinned.
    pub fn pick_victim(&mut self) -> Option<u64> {
        let mut candidates: Vec<u64> = self
            .frames
            .values()
            .filter(|f| f.evictable)
            .map(|f| f.kaddr)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_unstable();
        self.rng = xorshift64(self.rng);
        Some(candidates[(self.rng % candidates.len() as u64) as usize])
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

fn xorshift64(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

lazy_static! {
    static ref FRAMES: Mutex<FrameTable> = Mutex::new(FrameTable::new(0x9E37_79B9_7F4A_7C15));
}

/// Serializes allocation and eviction. Held across eviction I/O, so it
/// is a sleeping lock, not a spin lock.
static FRAME_LOCK: Lock = Lock::new();

/// Allocates a frame for the current thread's page at `uaddr`,
/// evicting if the pool is dry. The returned frame is pinned.
/// Panics only when every frame is pinned — no forward progress is
/// possible then.
pub fn alloc(uaddr: u64, writable: bool) -> u64 {
    let owner = crate::threads::current_tid();
    FRAME_LOCK.acquire();
    let kaddr = loop {
        match palloc::alloc_user(true) {
            Some(pa) => break phys_to_virt(pa).as_u64(),
            None => evict_one(),
        }
    };
    FRAMES.lock().insert(kaddr, uaddr, writable, owner);
    FRAME_LOCK.release();
    kaddr
}

/// Returns a frame to the pool and drops its record.
pub fn free(kaddr: u64) {
    FRAME_LOCK.acquire();
    if FRAMES.lock().remove(kaddr).is_some() {
        palloc::free_user(virt_to_phys(VirtAddr::new(kaddr)));
    }
    FRAME_LOCK.release();
}

pub fn set_evictable(kaddr: u64, evictable: bool) {
    FRAMES.lock().set_evictable(kaddr, evictable);
}

/// Pins or unpins the frame backing `owner`'s page at `uaddr`.
/// False if that page has no frame right now.
pub fn set_evictable_by_uaddr(owner: Tid, uaddr: u64, evictable: bool) -> bool {
    let mut frames = FRAMES.lock();
    match frames.find_by_uaddr(owner, uaddr) {
        Some(kaddr) => {
            frames.set_evictable(kaddr, evictable);
            true
        }
        None => false,
    }
}

/// Kernel address of the frame backing `owner`'s page at `uaddr`, if
/// that page is resident.
pub fn kaddr_of(owner: Tid, uaddr: u64) -> Option<u64> {
    FRAMES.lock().find_by_uaddr(owner, uaddr)
}

/// Pins the frame backing `owner`'s resident page at `uaddr`. Taking
/// the allocation lock first means no eviction is in flight, so a
/// true result guarantees the page stays resident until unpinned.
/// False when the page is simply not resident.
pub fn pin_resident(owner: Tid, uaddr: u64) -> bool {
    FRAME_LOCK.acquire();
    let pinned = set_evictable_by_uaddr(owner, uaddr, false);
    FRAME_LOCK.release();
    pinned
}

/// Unmaps and frees every frame `owner` still holds. Used on process
/// teardown, after dirty mmap pages have been written back.
pub fn release_all(owner: Tid, aspace: paging::AddressSpace) {
    FRAME_LOCK.acquire();
    let owned = FRAMES.lock().frames_of(owner);
    for frame in owned {
        paging::unmap_user(aspace, frame.uaddr);
        FRAMES.lock().remove(frame.kaddr);
        palloc::free_user(virt_to_phys(VirtAddr::new(frame.kaddr)));
    }
    FRAME_LOCK.release();
}

/// Evicts one frame, returning its page to the user pool.
/// Runs with `FRAME_LOCK` held.
fn evict_one() {
    let victim = {
        let mut frames = FRAMES.lock();
        frames
            .pick_victim()
            .unwrap_or_else(|| panic!("user pool exhausted and every frame is pinned"))
    };
    let frame = *FRAMES.lock().get(victim).expect("victim vanished");

    let (spt, aspace) = crate::threads::process_handles(frame.owner)
        .expect("evicting a frame from a thread with no process");

    // Clear the owner's mapping first so any further access faults.
    let (_, dirty) = paging::unmap_user(aspace, frame.uaddr).expect("victim frame was not mapped");

    let contents = unsafe { core::slice::from_raw_parts(frame.kaddr as *const u8, PGSIZE as usize) };
    let kind = spt
        .lock()
        .get(frame.uaddr)
        .map(|e| e.kind.clone())
        .expect("evicted page has no supplemental entry");

    match kind {
        // Clean file pages can be dropped; the entry already knows how
        // to read them back in.
        PageKind::FileBacked { .. } if !dirty => {}
        // Memory-mapped pages go back to their file, never to swap.
        PageKind::MMapped { ref file, offset, read_bytes } => {
            if dirty {
                crate::fs::FS_LOCK.acquire();
                file.write_at(offset as usize, &contents[..read_bytes as usize]);
                crate::fs::FS_LOCK.release();
            }
        }
        // Anonymous pages (and dirtied private file pages) go to swap.
        _ => {
            let slot = swap::write_page(contents);
            spt.lock().set_kind(frame.uaddr, PageKind::InSwap { slot: slot as u32 });
        }
    }

    FRAMES.lock().remove(victim);
    palloc::free_user(virt_to_phys(VirtAddr::new(victim)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> FrameTable {
        FrameTable::new(42)
    }

    #[test]
    fn insert_lookup_remove() {
        let mut t = table();
        t.insert(0x1000, 0x8000_0000_0000, true, 1);
        t.insert(0x2000, 0x8000_0000_1000, false, 1);
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(0x1000).unwrap().uaddr, 0x8000_0000_0000);
        assert!(!t.get(0x2000).unwrap().writable);
        assert!(t.remove(0x1000).is_some());
        assert!(t.remove(0x1000).is_none());
        assert_eq!(t.len(), 1);
    }

    #[test]
    #[should_panic(expected = "recorded twice")]
    fn duplicate_kaddr_is_fatal() {
        let mut t = table();
        t.insert(0x1000, 0x8000_0000_0000, true, 1);
        t.insert(0x1000, 0x8000_0000_1000, true, 1);
    }

    #[test]
    fn find_by_uaddr_matches_owner() {
        let mut t = table();
        t.insert(0x1000, 0x8000_0000_0000, true, 1);
        t.insert(0x2000, 0x8000_0000_0000, true, 2);
        assert_eq!(t.find_by_uaddr(2, 0x8000_0000_0000), Some(0x2000));
        assert_eq!(t.find_by_uaddr(3, 0x8000_0000_0000), None);
    }

    #[test]
    fn frames_start_pinned() {
        let mut t = table();
        t.insert(0x1000, 0x8000_0000_0000, true, 1);
        assert!(t.pick_victim().is_none());
        t.set_evictable(0x1000, true);
        assert_eq!(t.pick_victim(), Some(0x1000));
    }

    #[test]
    fn victims_come_only_from_evictable_frames() {
        let mut t = table();
        for i in 0..8u64 {
            t.insert(0x1000 * (i + 1), 0x8000_0000_0000 + 0x1000 * i, true, 1);
        }
        t.set_evictable(0x3000, true);
        t.set_evictable(0x6000, true);
        for _ in 0..64 {
            let v = t.pick_victim().unwrap();
            assert!(v == 0x3000 || v == 0x6000);
        }
    }

    #[test]
    fn victim_selection_reaches_every_candidate() {
        let mut t = table();
        for i in 0..4u64 {
            let kaddr = 0x1000 * (i + 1);
            t.insert(kaddr, 0x8000_0000_0000 + 0x1000 * i, true, 1);
            t.set_evictable(kaddr, true);
        }
        let mut seen = [false; 4];
        for _ in 0..256 {
            let v = t.pick_victim().unwrap();
            seen[(v / 0x1000 - 1) as usize] = true;
        }
        assert!(seen.iter().all(|&s| s), "selection never chose some frame");
    }

    #[test]
    fn frames_of_collects_per_owner() {
        let mut t = table();
        t.insert(0x1000, 0x8000_0000_0000, true, 7);
        t.insert(0x2000, 0x8000_0000_1000, true, 7);
        t.insert(0x3000, 0x8000_0000_2000, true, 8);
        assert_eq!(t.frames_of(7).len(), 2);
        assert_eq!(t.frames_of(8).len(), 1);
        assert_eq!(t.frames_of(9).len(), 0);
    }
}
