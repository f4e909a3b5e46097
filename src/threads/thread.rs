use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::context::Context;
use super::fixed_point::Fixed;
use super::sync::Semaphore;
use crate::process::{Child, Process};

/// Thread identifier. Allocated monotonically, never reused.
pub type Tid = i32;

/// Returned by `create` when a thread could not be built.
pub const TID_ERROR: Tid = -1;

/// Lowest priority.
pub const PRI_MIN: i32 = 0;
/// Priority given to threads that do not ask for one.
pub const PRI_DEFAULT: i32 = 31;
/// Highest priority.
pub const PRI_MAX: i32 = 63;

/// Size of each thread's kernel stack (16 KiB).
pub const KSTACK_SIZE: usize = 4096 * 4;

/// Sentinel written at the base of every kernel stack. The stack grows
/// down toward it, so an overflow tramples the sentinel before anything
/// else; `current()` checks it on every call.
pub const STACK_MAGIC: u64 = 0xcd6a_bf4b_1c0f_fee5;

/// Locks are identified by their address. A `Lock` never moves while it
/// can be acquired, so the address is stable for as long as it matters.
pub type LockId = usize;

/// States in a thread's life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Owns the processor right now.
    Running,
    /// On the ready queue, waiting for the processor.
    Ready,
    /// Waiting for an event (semaphore, sleep, child exit).
    Blocked,
    /// Finished; storage is reclaimed by the next thread to run.
    Dying,
}

/// One priority donated to a lock holder. A holder keeps at most one
/// record per lock, holding the highest priority seen among its waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Donation {
    pub lock: LockId,
    pub priority: i32,
}

pub type ThreadFunc = fn(usize);

/// A kernel thread, possibly carrying a user process.
pub struct Thread {
    pub tid: Tid,
    pub name: String,
    pub status: Status,

    /// Priority the thread (or its creator) asked for.
    pub base_priority: i32,
    /// Priority the scheduler actually uses: the maximum of
    /// `base_priority` and every live donation.
    pub effective_priority: i32,
    /// Donations received while holding locks, sorted highest first.
    pub donations: Vec<Donation>,
    /// The lock this thread is currently blocked trying to acquire.
    pub blocking_lock: Option<LockId>,

    /// Niceness, in [-20, 20]. Only consulted by the MLFQ scheduler.
    pub nice: i32,
    /// Exponentially decaying measure of CPU time received recently.
    pub recent_cpu: Fixed,

    /// Tick at which a sleeping thread becomes runnable again.
    pub wake_tick: i64,
    /// Downed to sleep, upped by the wake-up pass.
    pub sleep_sema: Arc<Semaphore>,

    /// Saved kernel stack pointer while not running; the registers
    /// live in a frame on that stack.
    pub context: Context,
    /// Owned kernel stack. `None` only for the boot thread, which runs
    /// on the stack the loader handed us.
    pub stack: Option<Box<[u8]>>,
    /// Function to run on first schedule, consumed by the entry
    /// trampoline.
    pub entry: Option<(ThreadFunc, usize)>,

    /// User-process state; `None` for pure kernel threads.
    pub process: Option<Process>,
    /// Records for the processes this thread spawned and may wait on.
    pub children: Vec<Arc<Child>>,
    /// This thread's own record in its parent's list, used to deliver
    /// the exit status. Both sides hold the record, so either may die
    /// first without stranding the other.
    pub parent_link: Option<Arc<Child>>,
}

impl Thread {
    /// Builds a thread in the Blocked state with a fresh kernel stack.
    /// Returns `None` if stack memory cannot be allocated.
    pub fn new(tid: Tid, name: &str, priority: i32, nice: i32, recent_cpu: Fixed) -> Option<Box<Thread>> {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));

        let mut stack = Vec::new();
        if stack.try_reserve_exact(KSTACK_SIZE).is_err() {
            return None;
        }
        stack.resize(KSTACK_SIZE, 0u8);
        let mut stack = stack.into_boxed_slice();
        stack[..8].copy_from_slice(&STACK_MAGIC.to_ne_bytes());

        Some(Box::new(Thread {
            tid,
            name: String::from(name),
            status: Status::Blocked,
            base_priority: priority,
            effective_priority: priority,
            donations: Vec::new(),
            blocking_lock: None,
            nice,
            recent_cpu,
            wake_tick: 0,
            sleep_sema: Arc::new(Semaphore::new(0)),
            context: Context::empty(),
            stack: Some(stack),
            entry: None,
            process: None,
            children: Vec::new(),
            parent_link: None,
        }))
    }

    /// Builds the thread record for the flow of control that booted the
    /// kernel. It is already running and owns no allocated stack.
    pub fn bootstrap(tid: Tid, name: &str) -> Box<Thread> {
        Box::new(Thread {
            tid,
            name: String::from(name),
            status: Status::Running,
            base_priority: PRI_DEFAULT,
            effective_priority: PRI_DEFAULT,
            donations: Vec::new(),
            blocking_lock: None,
            nice: 0,
            recent_cpu: Fixed::ZERO,
            wake_tick: 0,
            sleep_sema: Arc::new(Semaphore::new(0)),
            context: Context::empty(),
            stack: None,
            entry: None,
            process: None,
            children: Vec::new(),
            parent_link: None,
        })
    }

    /// Top of this thread's kernel stack, 16-byte aligned.
    pub fn stack_top(&self) -> u64 {
        let stack = self.stack.as_ref().expect("boot thread has no owned stack");
        let top = stack.as_ptr() as u64 + stack.len() as u64;
        top & !0xF
    }

    /// True while the stack-base sentinel is intact.
    pub fn magic_ok(&self) -> bool {
        match &self.stack {
            Some(stack) => {
                let mut word = [0u8; 8];
                word.copy_from_slice(&stack[..8]);
                u64::from_ne_bytes(word) == STACK_MAGIC
            }
            None => true,
        }
    }

    /// Recomputes `effective_priority` from the base priority and the
    /// surviving donations. Donations are kept sorted, so the front
    /// record is the strongest.
    pub fn refresh_effective_priority(&mut self) {
        let donated = self.donations.first().map(|d| d.priority);
        self.effective_priority = match donated {
            Some(p) if p > self.base_priority => p,
            _ => self.base_priority,
        };
    }
}
