//! Blocking synchronization primitives: counting semaphore, lock with
//! priority donation, and condition variable.
//!
//! All three may suspend the caller, so none of them may be used from
//! an interrupt handler (`up` and `signal` excepted). Short-term mutual
//! exclusion against interrupts is done with interrupt disabling, which
//! is the only thing that actually excludes anyone on a single CPU.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::instructions::interrupts;

use super::thread::{LockId, Tid};

struct SemaInner {
    value: u32,
    waiters: Vec<Tid>,
}

/// Counting semaphore.
///
/// `down` blocks while the value is zero; `up` wakes the
/// highest-priority waiter. The waiter list is consulted at wake time
/// rather than kept sorted, because a waiter's effective priority can
/// change through donation while it sleeps.
pub struct Semaphore {
    inner: Mutex<SemaInner>,
}

impl Semaphore {
    pub const fn new(value: u32) -> Semaphore {
        Semaphore {
            inner: Mutex::new(SemaInner {
                value,
                waiters: Vec::new(),
            }),
        }
    }

    /// Decrements the value, blocking until that is possible.
    pub fn down(&self) {
        assert!(!super::in_interrupt(), "semaphore down in interrupt context");
        interrupts::without_interrupts(|| loop {
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                return;
            }
            inner.waiters.push(super::current_tid());
            drop(inner);
            super::block_current();
            // Woken by `up`; retry the decrement.
        });
    }

    /// Decrements the value only if that needs no waiting.
    pub fn try_down(&self) -> bool {
        interrupts::without_interrupts(|| {
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                true
            } else {
                false
            }
        })
    }

    /// Increments the value and wakes the strongest waiter, if any.
    ///
    /// Safe to call from interrupt handlers. The caller may lose the
    /// processor if the woken thread outranks it.
    pub fn up(&self) {
        interrupts::without_interrupts(|| {
            let mut inner = self.inner.lock();
            inner.value += 1;
            let woken = pick_strongest(&mut inner.waiters);
            drop(inner);
            if let Some(tid) = woken {
                super::unblock(tid);
            }
        });
        super::yield_if_necessary();
    }
}

/// Removes and returns the waiter with the highest effective priority,
/// preferring the longest-waiting one among equals.
fn pick_strongest(waiters: &mut Vec<Tid>) -> Option<Tid> {
    if waiters.is_empty() {
        return None;
    }
    let mut best = 0;
    let mut best_priority = super::priority_of(waiters[0]);
    for (i, &tid) in waiters.iter().enumerate().skip(1) {
        let p = super::priority_of(tid);
        if p > best_priority {
            best = i;
            best_priority = p;
        }
    }
    Some(waiters.remove(best))
}

/// Mutual-exclusion lock with priority donation.
///
/// A thread that blocks on a held lock donates its effective priority
/// to the holder, transitively along the chain of locks the holder is
/// itself waiting for, so that a high-priority waiter is never stalled
/// behind an unboosted low-priority holder.
pub struct Lock {
    holder: Mutex<Option<Tid>>,
    sema: Semaphore,
}

impl Lock {
    pub const fn new() -> Lock {
        Lock {
            holder: Mutex::new(None),
            sema: Semaphore::new(1),
        }
    }

    fn id(&self) -> LockId {
        self as *const Lock as LockId
    }

    /// Acquires the lock, sleeping until it is free. Donates priority
    /// to the current holder while waiting.
    pub fn acquire(&self) {
        assert!(!super::in_interrupt(), "lock acquire in interrupt context");
        assert!(!self.held_by_current(), "lock is not recursive");
        interrupts::without_interrupts(|| {
            let contended = self.holder.lock().is_some();
            if contended {
                super::donate_for_lock(self.id());
            }
            self.sema.down();
            *self.holder.lock() = Some(super::current_tid());
            super::lock_acquired(self.id());
        });
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_acquire(&self) -> bool {
        interrupts::without_interrupts(|| {
            if self.sema.try_down() {
                *self.holder.lock() = Some(super::current_tid());
                super::lock_acquired(self.id());
                true
            } else {
                false
            }
        })
    }

    /// Releases the lock, dropping any priority that was donated
    /// through it and waking the strongest waiter.
    pub fn release(&self) {
        assert!(self.held_by_current(), "released by a thread not holding it");
        interrupts::without_interrupts(|| {
            *self.holder.lock() = None;
            super::lock_released(self.id());
            self.sema.up();
        });
    }

    pub fn holder(&self) -> Option<Tid> {
        interrupts::without_interrupts(|| *self.holder.lock())
    }

    pub fn held_by_current(&self) -> bool {
        self.holder() == Some(super::current_tid())
    }
}

struct CondWaiter {
    tid: Tid,
    sema: Arc<Semaphore>,
}

/// Condition variable with Mesa semantics over a [`Lock`].
///
/// Each waiter parks on its own semaphore; a signal delivered between
/// the lock release and the block is therefore never lost. No priority
/// flows through a condition variable.
pub struct Condvar {
    waiters: Mutex<Vec<CondWaiter>>,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Atomically releases `lock` and blocks until signalled, then
    /// reacquires `lock` before returning.
    pub fn wait(&self, lock: &Lock) {
        assert!(lock.held_by_current());
        let sema = Arc::new(Semaphore::new(0));
        interrupts::without_interrupts(|| {
            self.waiters.lock().push(CondWaiter {
                tid: super::current_tid(),
                sema: sema.clone(),
            });
        });
        lock.release();
        sema.down();
        lock.acquire();
    }

    /// Wakes the highest-priority waiter, if any.
    pub fn signal(&self, lock: &Lock) {
        assert!(lock.held_by_current());
        let woken = interrupts::without_interrupts(|| {
            let mut waiters = self.waiters.lock();
            if waiters.is_empty() {
                return None;
            }
            let mut best = 0;
            let mut best_priority = super::priority_of(waiters[0].tid);
            for (i, w) in waiters.iter().enumerate().skip(1) {
                let p = super::priority_of(w.tid);
                if p > best_priority {
                    best = i;
                    best_priority = p;
                }
            }
            Some(waiters.remove(best))
        });
        if let Some(w) = woken {
            w.sema.up();
        }
    }

    /// Wakes every waiter.
    pub fn broadcast(&self, lock: &Lock) {
        assert!(lock.held_by_current());
        loop {
            let next = interrupts::without_interrupts(|| {
                let mut waiters = self.waiters.lock();
                if waiters.is_empty() {
                    None
                } else {
                    Some(waiters.remove(0))
                }
            });
            match next {
                Some(w) => w.sema.up(),
                None => break,
            }
        }
    }
}
