//! Kernel threads and the scheduler.
//!
//! Two policies are available, chosen once at boot: priority
//! round-robin with donation through locks (the default), and a
//! multilevel feedback queue that computes priorities from recent CPU
//! use, niceness, and the system load average.
//!
//! All scheduler state lives behind one global spin mutex that is only
//! ever taken with interrupts disabled, which on a single CPU makes
//! every critical section atomic with respect to both other threads
//! and interrupt handlers. Threads are boxed and referenced everywhere
//! by [`Tid`], so context pointers stay stable while the map changes
//! around them.

pub mod context;
pub mod fixed_point;
pub mod sync;
pub mod thread;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::interrupts;

use crate::devices::timer;
use crate::process::Process;
use context::Context;
use fixed_point::Fixed;
use sync::Semaphore;
use thread::{Donation, LockId, Status, Thread, ThreadFunc, Tid, PRI_MAX, PRI_MIN, TID_ERROR};

/// Timer ticks each thread may run before preemption is requested.
const TIME_SLICE: u32 = 4;

/// Longest chain of locks a donation may propagate through. A deeper
/// chain indicates a locking bug and is fatal.
const DONATION_DEPTH_MAX: usize = 8;

lazy_static! {
    static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new(false));
}

/// Sleeping threads as `(wake_tick, tid)`, ordered by wake tick.
/// Thread-side mutation is serialized by `SLEEP_SEMA`; the wake-up pass
/// inside `schedule` uses `try_lock` instead, since it cannot block.
static SLEEPERS: Mutex<Vec<(i64, Tid)>> = Mutex::new(Vec::new());
static SLEEP_SEMA: Semaphore = Semaphore::new(1);

/// Set while the wake-up pass runs so that the unblocks it performs do
/// not recursively request a yield from inside `schedule`.
static WAKE_UP_RUNNING: AtomicBool = AtomicBool::new(false);

/// Nesting depth of hardware interrupt handlers on this CPU.
static IRQ_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// A wake-up performed in interrupt context found a thread that
/// outranks the interrupted one; yield once the handler unwinds.
static PREEMPT_PENDING: AtomicBool = AtomicBool::new(false);

/// TID allocation is guarded by its own lock so that it never contends
/// with scheduling itself.
static NEXT_TID: Mutex<Tid> = Mutex::new(1);

static IDLE_STARTED: Semaphore = Semaphore::new(0);

pub struct Scheduler {
    threads: BTreeMap<Tid, alloc::boxed::Box<Thread>>,
    current: Tid,
    /// Ready queue: effective priority descending, FIFO among equals.
    ready: Vec<Tid>,
    /// Which thread currently holds which lock; the donation walk
    /// follows `blocking_lock` through this map.
    lock_holders: BTreeMap<LockId, Tid>,
    idle: Option<Tid>,
    initial: Tid,
    /// A thread that died on its own stack; reclaimed by whichever
    /// thread runs next, which is the only safe place to do it.
    dying: Option<Tid>,
    mlfqs: bool,
    load_avg: Fixed,
    /// Ticks the current thread has held the CPU in this slice.
    slice_ticks: u32,
    idle_ticks: i64,
    kernel_ticks: i64,
    user_ticks: i64,
}

impl Scheduler {
    fn new(mlfqs: bool) -> Scheduler {
        Scheduler {
            threads: BTreeMap::new(),
            current: 0,
            ready: Vec::new(),
            lock_holders: BTreeMap::new(),
            idle: None,
            initial: 0,
            dying: None,
            mlfqs,
            load_avg: Fixed::ZERO,
            slice_ticks: 0,
            idle_ticks: 0,
            kernel_ticks: 0,
            user_ticks: 0,
        }
    }

    fn thread(&self, tid: Tid) -> &Thread {
        self.threads.get(&tid).map(|t| &**t).expect("no such thread")
    }

    fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        self.threads.get_mut(&tid).map(|t| &mut **t).expect("no such thread")
    }

    /// Marks `tid` ready and queues it behind every thread of equal or
    /// higher effective priority.
    fn insert_ready(&mut self, tid: Tid) {
        debug_assert!(!self.ready.contains(&tid), "thread already queued");
        let priority = self.thread(tid).effective_priority;
        self.thread_mut(tid).status = Status::Ready;
        let pos = self
            .ready
            .iter()
            .position(|&other| self.thread(other).effective_priority < priority)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, tid);
    }

    /// Re-queues a ready thread whose effective priority changed.
    fn reposition_ready(&mut self, tid: Tid) {
        if let Some(pos) = self.ready.iter().position(|&t| t == tid) {
            self.ready.remove(pos);
            self.insert_ready(tid);
        }
    }

    /// Next thread to run: the front of the ready queue, or the idle
    /// thread when nothing is ready.
    fn pick_next(&mut self) -> Tid {
        if self.ready.is_empty() {
            self.idle.expect("nothing to run and no idle thread")
        } else {
            self.ready.remove(0)
        }
    }

    /// Whether the running thread still outranks everything queued.
    fn is_highest_priority(&self) -> bool {
        match self.ready.first() {
            Some(&front) => {
                self.thread(self.current).effective_priority
                    >= self.thread(front).effective_priority
            }
            None => true,
        }
    }

    /// Recomputes `tid`'s effective priority and fixes its queue
    /// position if it is on the ready queue.
    fn refresh_priority(&mut self, tid: Tid) {
        self.thread_mut(tid).refresh_effective_priority();
        self.reposition_ready(tid);
    }

    /// Propagates `donor`'s effective priority up the chain of held
    /// locks: through the lock it blocks on, to that lock's holder, to
    /// whatever that holder blocks on, and so on. Repeated donations
    /// through the same lock only ever raise the recorded priority.
    fn donate_from(&mut self, donor: Tid) {
        let mut donor = donor;
        let mut depth = 0;
        loop {
            let Some(lock) = self.thread(donor).blocking_lock else {
                return;
            };
            let Some(&holder) = self.lock_holders.get(&lock) else {
                return;
            };
            depth += 1;
            assert!(
                depth <= DONATION_DEPTH_MAX,
                "priority donation chain deeper than {} locks",
                DONATION_DEPTH_MAX
            );
            let donated = self.thread(donor).effective_priority;
            let records = &mut self.thread_mut(holder).donations;
            match records.iter_mut().find(|d| d.lock == lock) {
                Some(d) if d.priority >= donated => return,
                Some(d) => d.priority = donated,
                None => records.push(Donation {
                    lock,
                    priority: donated,
                }),
            }
            records.sort_by(|a, b| b.priority.cmp(&a.priority));
            self.refresh_priority(holder);
            donor = holder;
        }
    }

    /// Drops the donation `holder` received through `lock`, if any.
    fn remove_donation(&mut self, holder: Tid, lock: LockId) {
        self.thread_mut(holder).donations.retain(|d| d.lock != lock);
    }

    /// MLFQ priority: `PRI_MAX - recent_cpu / 4 - nice * 2`, rounded
    /// down and clamped to the valid range.
    fn mlfqs_priority(&self, t: &Thread) -> i32 {
        let p = Fixed::from_int(PRI_MAX)
            - t.recent_cpu.div_int(4)
            - Fixed::from_int(t.nice).mul_int(2);
        p.trunc().clamp(PRI_MIN, PRI_MAX)
    }

    /// Recomputes every thread's priority from the MLFQ formula and
    /// restores the ready-queue order. The sort is stable, so equal
    /// priorities keep their round-robin order.
    fn recalculate_priorities(&mut self) {
        let tids: Vec<Tid> = self.threads.keys().copied().collect();
        for tid in tids {
            let p = self.mlfqs_priority(self.thread(tid));
            let t = self.thread_mut(tid);
            t.base_priority = p;
            t.effective_priority = p;
        }
        let snapshot: BTreeMap<Tid, i32> = self
            .ready
            .iter()
            .map(|&t| (t, self.thread(t).effective_priority))
            .collect();
        self.ready.sort_by(|a, b| snapshot[b].cmp(&snapshot[a]));
    }

    /// `load_avg = (59/60) load_avg + (1/60) ready`, where `ready`
    /// counts the queued threads plus the running one unless idle.
    fn recalculate_load_avg(&mut self) {
        let mut ready = self.ready.len() as i32;
        if Some(self.current) != self.idle {
            ready += 1;
        }
        self.load_avg = self.load_avg.mul_int(59).div_int(60) + Fixed::from_int(ready).div_int(60);
    }

    /// `recent_cpu = (2 load) / (2 load + 1) * recent_cpu + nice`
    /// for every thread.
    fn recalculate_recent_cpu(&mut self) {
        let coefficient = self
            .load_avg
            .mul_int(2)
            .div(self.load_avg.mul_int(2).add_int(1));
        for t in self.threads.values_mut() {
            t.recent_cpu = t.recent_cpu.mul(coefficient).add_int(t.nice);
        }
    }

    /// One timer tick. Returns true when the running thread has used up
    /// its slice and should be preempted on return from the interrupt.
    fn tick(&mut self, now: i64) -> bool {
        if self.threads.is_empty() {
            return false;
        }
        let cur = self.current;
        if Some(cur) == self.idle {
            self.idle_ticks += 1;
        } else if self.thread(cur).process.is_some() {
            self.user_ticks += 1;
        } else {
            self.kernel_ticks += 1;
        }

        if self.mlfqs {
            if Some(cur) != self.idle {
                let t = self.thread_mut(cur);
                t.recent_cpu = t.recent_cpu.add_int(1);
            }
            if now % timer::TIMER_FREQ as i64 == 0 {
                self.recalculate_load_avg();
                self.recalculate_recent_cpu();
            }
            if now % 4 == 0 {
                self.recalculate_priorities();
            }
        }

        self.slice_ticks += 1;
        self.slice_ticks >= TIME_SLICE
    }

    #[cfg(test)]
    fn ready_count(&self) -> usize {
        self.ready.len()
    }
}

// ── Lifecycle ──────────────────────────────────────────────────────

/// Turns the booting flow of control into the first thread. Must run
/// with interrupts disabled, after the heap is up.
pub fn init(mlfqs: bool) {
    assert!(!interrupts::are_enabled());
    let tid = allocate_tid();
    let mut sched = SCHEDULER.lock();
    sched.mlfqs = mlfqs;
    sched.threads.insert(tid, Thread::bootstrap(tid, "main"));
    sched.current = tid;
    sched.initial = tid;
    drop(sched);
    crate::log_info!(
        "threads: initialized ({} scheduler)",
        if mlfqs { "mlfqs" } else { "priority" }
    );
}

/// Creates the idle thread and enables preemptive scheduling.
pub fn start() {
    let tid = create("idle", PRI_MIN, idle, 0);
    assert!(tid != TID_ERROR, "could not create the idle thread");
    interrupts::without_interrupts(|| {
        SCHEDULER.lock().idle = Some(tid);
    });
    interrupts::enable();
    // The idle thread signals once it has parked itself.
    IDLE_STARTED.down();
}

/// The idle thread. Runs only when the ready queue is empty; otherwise
/// it sits blocked, off every queue, and `pick_next` falls back to it.
fn idle(_aux: usize) {
    IDLE_STARTED.up();
    loop {
        interrupts::disable();
        block_current();
        // `enable_and_hlt` is the atomic sti;hlt pair: an interrupt
        // cannot slip in between and leave us halted with work queued.
        interrupts::enable_and_hlt();
    }
}

/// Creates a kernel thread running `func(aux)` and makes it ready.
/// Returns `TID_ERROR` if stack memory is unavailable, in which case
/// nothing was queued anywhere.
pub fn create(name: &str, priority: i32, func: ThreadFunc, aux: usize) -> Tid {
    let tid = allocate_tid();
    let (nice, recent_cpu) = interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        let creator = sched.thread(sched.current);
        (creator.nice, creator.recent_cpu)
    });
    let Some(mut t) = Thread::new(tid, name, priority, nice, recent_cpu) else {
        return TID_ERROR;
    };
    t.entry = Some((func, aux));
    t.context = unsafe { Context::fresh(kernel_thread_entry as usize as u64, t.stack_top()) };

    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if sched.mlfqs {
            let p = sched.mlfqs_priority(&t);
            t.base_priority = p;
            t.effective_priority = p;
        }
        // Grow the queue here so the paths that run with interrupts
        // off never have to allocate.
        let population = sched.threads.len() + 2;
        sched.ready.reserve(population);
        sched.threads.insert(tid, t);
    });

    unblock(tid);
    yield_if_necessary();
    tid
}

/// First code every fresh thread runs, jumped to by the context
/// switch. Finishes the switch, then calls the thread function.
extern "C" fn kernel_thread_entry() -> ! {
    schedule_tail();
    let (func, aux) = interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        sched
            .thread_mut(cur)
            .entry
            .take()
            .expect("fresh thread has no entry function")
    });
    interrupts::enable();
    func(aux);
    exit();
}

/// Terminates the current thread. Its storage is reclaimed by the next
/// thread to be scheduled.
pub fn exit() -> ! {
    assert!(!in_interrupt());
    interrupts::disable();
    {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        sched.thread_mut(cur).status = Status::Dying;
    }
    schedule();
    unreachable!("a dying thread was rescheduled");
}

// ── State transitions ──────────────────────────────────────────────

/// Blocks the current thread. It will not run again until some other
/// thread (or interrupt handler) passes its tid to [`unblock`].
pub fn block_current() {
    assert!(!in_interrupt(), "cannot block in interrupt context");
    interrupts::without_interrupts(|| {
        {
            let mut sched = SCHEDULER.lock();
            let cur = sched.current;
            sched.thread_mut(cur).status = Status::Blocked;
        }
        schedule();
    });
}

/// Moves a blocked thread to the ready queue. Does not preempt; a
/// caller that may have woken something stronger than itself follows
/// up with [`yield_if_necessary`].
pub fn unblock(tid: Tid) {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        assert_eq!(sched.thread(tid).status, Status::Blocked);
        sched.thread_mut(tid).blocking_lock = None;
        sched.insert_ready(tid);
    });
}

/// Yields the processor, leaving the current thread ready.
pub fn yield_now() {
    assert!(!in_interrupt());
    interrupts::without_interrupts(|| {
        {
            let mut sched = SCHEDULER.lock();
            let cur = sched.current;
            if Some(cur) == sched.idle {
                sched.thread_mut(cur).status = Status::Ready;
            } else {
                sched.insert_ready(cur);
            }
        }
        schedule();
    });
}

/// Yields only if some ready thread now outranks the current one.
/// From interrupt context this just records that a yield is wanted;
/// the handler performs it on the way out.
pub fn yield_if_necessary() {
    if in_interrupt() {
        PREEMPT_PENDING.store(true, Ordering::Relaxed);
        return;
    }
    if WAKE_UP_RUNNING.load(Ordering::Relaxed) {
        return;
    }
    let wanted = interrupts::without_interrupts(|| !SCHEDULER.lock().is_highest_priority());
    if wanted {
        yield_now();
    }
}

/// Puts the current thread to sleep until the timer reaches
/// `wake_tick`. The wake-up pass delivers wake-ups in wake-tick order.
pub fn sleep_until(wake_tick: i64) {
    assert!(!in_interrupt());
    let (tid, sema) = interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        assert_eq!(sched.thread(cur).status, Status::Running);
        sched.thread_mut(cur).wake_tick = wake_tick;
        (cur, sched.thread(cur).sleep_sema.clone())
    });

    SLEEP_SEMA.down();
    interrupts::without_interrupts(|| {
        insert_sleeper(&mut SLEEPERS.lock(), wake_tick, tid);
    });
    SLEEP_SEMA.up();

    sema.down();
}

/// Ordered insertion into the sleep queue: ascending wake tick, FIFO
/// among equal ticks.
fn insert_sleeper(queue: &mut Vec<(i64, Tid)>, wake_tick: i64, tid: Tid) {
    let pos = queue
        .iter()
        .position(|&(wake, _)| wake > wake_tick)
        .unwrap_or(queue.len());
    queue.insert(pos, (wake_tick, tid));
}

/// Wakes every sleeper whose wake tick has arrived, in wake-tick
/// order, stopping at the first that hasn't expired. Runs at the
/// start of every `schedule` with the wake flag set, so the unblocks
/// here never trigger a nested yield. Sleepers are popped one at a
/// time so no wake-up list has to be built with interrupts off.
fn wake_expired() {
    let now = timer::ticks();
    loop {
        let woken = {
            let Some(mut queue) = SLEEPERS.try_lock() else {
                return;
            };
            match queue.first() {
                Some(&(wake, tid)) if wake <= now => {
                    queue.remove(0);
                    Some(tid)
                }
                _ => None,
            }
        };
        let Some(tid) = woken else {
            return;
        };
        let sema = {
            let sched = SCHEDULER.lock();
            sched.threads.get(&tid).map(|t| t.sleep_sema.clone())
        };
        if let Some(sema) = sema {
            sema.up();
        }
    }
}

// ── The scheduler proper ───────────────────────────────────────────

/// Switches to the next thread. On entry interrupts are off and the
/// current thread's status has already been changed away from Running.
fn schedule() {
    debug_assert!(!interrupts::are_enabled());

    WAKE_UP_RUNNING.store(true, Ordering::Relaxed);
    wake_expired();
    WAKE_UP_RUNNING.store(false, Ordering::Relaxed);

    let switch_pair = {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        debug_assert!(sched.thread(cur).status != Status::Running);
        if sched.thread(cur).status == Status::Dying {
            sched.dying = Some(cur);
        }
        let next = sched.pick_next();
        if next == cur {
            sched.thread_mut(cur).status = Status::Running;
            sched.slice_ticks = 0;
            None
        } else {
            sched.thread_mut(next).status = Status::Running;
            sched.current = next;
            if sched.thread(next).stack.is_some() {
                crate::interrupts::gdt::set_kernel_stack(sched.thread(next).stack_top());
            }
            let cur_ctx = &mut sched.thread_mut(cur).context as *mut Context;
            let next_ctx = &sched.thread(next).context as *const Context;
            Some((cur_ctx, next_ctx))
        }
    };

    if let Some((cur_ctx, next_ctx)) = switch_pair {
        unsafe { context::switch(cur_ctx, next_ctx) };
        schedule_tail();
    }
}

/// Completes a switch as the newly running thread: starts its time
/// slice, activates its address space, and reclaims the previous
/// thread if it was dying. Deferred reclamation is the only safe spot;
/// a dying thread cannot free the stack it is still running on.
pub(crate) fn schedule_tail() {
    let (aspace, dead) = {
        let mut sched = SCHEDULER.lock();
        sched.slice_ticks = 0;
        let mut dead = None;
        if let Some(d) = sched.dying.take() {
            if d != sched.initial && d != sched.current {
                dead = sched.threads.remove(&d);
            }
        }
        let cur = sched.current;
        let aspace = sched.thread(cur).process.as_ref().map(|p| p.aspace);
        (aspace, dead)
    };
    match aspace {
        Some(aspace) => crate::memory::paging::activate(aspace),
        None => crate::memory::paging::activate_kernel(),
    }
    drop(dead);
}

fn allocate_tid() -> Tid {
    interrupts::without_interrupts(|| {
        let mut next = NEXT_TID.lock();
        let tid = *next;
        *next += 1;
        tid
    })
}

// ── Interrupt bookkeeping ──────────────────────────────────────────

/// Called on entry to every hardware interrupt handler.
pub fn irq_enter() {
    IRQ_DEPTH.fetch_add(1, Ordering::Relaxed);
}

/// Called on the way out of a hardware interrupt handler, after the
/// EOI. Performs the yield a wake-up or an expired slice asked for.
pub fn irq_exit() {
    let depth = IRQ_DEPTH.fetch_sub(1, Ordering::Relaxed);
    if depth == 1 && PREEMPT_PENDING.swap(false, Ordering::Relaxed) {
        yield_now();
    }
}

pub fn in_interrupt() -> bool {
    IRQ_DEPTH.load(Ordering::Relaxed) > 0
}

/// One timer tick: statistics, MLFQ bookkeeping, slice accounting.
/// Called from the timer interrupt handler.
pub fn tick(now: i64) {
    let should_preempt = match SCHEDULER.try_lock() {
        Some(mut sched) => sched.tick(now),
        None => false,
    };
    if should_preempt {
        PREEMPT_PENDING.store(true, Ordering::Relaxed);
    }
}

// ── Queries and priority control ───────────────────────────────────

/// Tid of the running thread. Also checks the stack sentinel; an
/// overflowed kernel stack is caught here, close to the damage.
pub fn current_tid() -> Tid {
    interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        let t = sched.thread(sched.current);
        assert!(t.magic_ok(), "kernel stack overflow in thread {}", t.tid);
        t.tid
    })
}

pub fn current_name() -> String {
    interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        sched.thread(sched.current).name.clone()
    })
}

/// Effective priority of an arbitrary thread; `PRI_MIN` if it is gone.
pub(crate) fn priority_of(tid: Tid) -> i32 {
    interrupts::without_interrupts(|| {
        SCHEDULER
            .lock()
            .threads
            .get(&tid)
            .map(|t| t.effective_priority)
            .unwrap_or(PRI_MIN)
    })
}

/// Sets the current thread's base priority. Ignored under MLFQ, where
/// priorities are computed, not chosen.
pub fn set_priority(priority: i32) {
    let applied = interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if sched.mlfqs {
            return false;
        }
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        let cur = sched.current;
        sched.thread_mut(cur).base_priority = priority;
        sched.refresh_priority(cur);
        true
    });
    if applied {
        yield_if_necessary();
    }
}

pub fn get_priority() -> i32 {
    interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        sched.thread(sched.current).effective_priority
    })
}

/// Sets the current thread's niceness and recomputes its priority.
pub fn set_nice(nice: i32) {
    assert!((-20..=20).contains(&nice));
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        sched.thread_mut(cur).nice = nice;
        if sched.mlfqs {
            let p = sched.mlfqs_priority(sched.thread(cur));
            let t = sched.thread_mut(cur);
            t.base_priority = p;
            t.effective_priority = p;
        }
    });
    yield_if_necessary();
}

pub fn get_nice() -> i32 {
    interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        sched.thread(sched.current).nice
    })
}

/// 100 times the system load average, rounded to nearest.
pub fn load_avg_x100() -> i32 {
    interrupts::without_interrupts(|| SCHEDULER.lock().load_avg.mul_int(100).round())
}

/// 100 times the current thread's recent CPU figure.
pub fn recent_cpu_x100() -> i32 {
    interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        sched.thread(sched.current).recent_cpu.mul_int(100).round()
    })
}

pub fn print_stats() {
    let (idle, kernel, user) = interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        (sched.idle_ticks, sched.kernel_ticks, sched.user_ticks)
    });
    crate::println!(
        "threads: {} idle ticks, {} kernel ticks, {} user ticks",
        idle,
        kernel,
        user
    );
}

// ── Lock/donation hooks (used by sync::Lock) ───────────────────────

/// Records that the current thread is about to block on `lock` and
/// pushes its priority up the chain of holders.
pub(crate) fn donate_for_lock(lock: LockId) {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if sched.mlfqs {
            return;
        }
        let cur = sched.current;
        sched.thread_mut(cur).blocking_lock = Some(lock);
        sched.donate_from(cur);
    });
}

/// Records the current thread as the holder of `lock`.
pub(crate) fn lock_acquired(lock: LockId) {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        sched.thread_mut(cur).blocking_lock = None;
        sched.lock_holders.insert(lock, cur);
    });
}

/// Drops the donation received through `lock` and restores the
/// holder's effective priority to what it would have been without it.
pub(crate) fn lock_released(lock: LockId) {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        sched.remove_donation(cur, lock);
        sched.refresh_priority(cur);
        sched.lock_holders.remove(&lock);
    });
}

// ── Process attachment (used by the process and vm layers) ─────────

/// Attaches user-process state to the current thread.
pub fn set_current_process(process: Process) {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        let slot = &mut sched.thread_mut(cur).process;
        assert!(slot.is_none(), "thread already has a process");
        *slot = Some(process);
    });
}

/// Detaches and returns the current thread's process state.
pub fn take_current_process() -> Option<Process> {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        sched.thread_mut(cur).process.take()
    })
}

/// Runs `f` on the current thread's process state under the scheduler
/// lock. Keep `f` short: clone handles out, don't do I/O.
pub fn with_current_process<R>(f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        sched.thread_mut(cur).process.as_mut().map(f)
    })
}

/// Registers a child record on the current thread.
pub fn add_child(child: Arc<crate::process::Child>) {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        sched.thread_mut(cur).children.push(child);
    });
}

/// The current thread's record for the child with the given tid.
pub fn find_child(tid: Tid) -> Option<Arc<crate::process::Child>> {
    interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        sched
            .thread(sched.current)
            .children
            .iter()
            .find(|c| c.tid() == tid)
            .cloned()
    })
}

/// Drops the current thread's record for a reaped child.
pub fn remove_child(tid: Tid) {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        sched.thread_mut(cur).children.retain(|c| c.tid() != tid);
    });
}

/// Installs the current thread's link back to its parent's record.
pub fn set_parent_link(link: Arc<crate::process::Child>) {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        sched.thread_mut(cur).parent_link = Some(link);
    });
}

/// Takes the parent link away for exit-time signalling.
pub fn take_parent_link() -> Option<Arc<crate::process::Child>> {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        sched.thread_mut(cur).parent_link.take()
    })
}

/// Supplemental-table and address-space handles of an arbitrary
/// thread's process, for the eviction path.
pub fn process_handles(
    tid: Tid,
) -> Option<(Arc<Mutex<crate::vm::page::Spt>>, crate::memory::paging::AddressSpace)> {
    interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        sched
            .threads
            .get(&tid)
            .and_then(|t| t.process.as_ref())
            .map(|p| (p.spt.clone(), p.aspace))
    })
}

#[cfg(test)]
mod tests {
    use super::thread::PRI_DEFAULT;
    use super::*;

    fn sched_with(threads: &[(Tid, i32)]) -> Scheduler {
        let mut s = Scheduler::new(false);
        for &(tid, priority) in threads {
            let t = Thread::new(tid, "t", priority, 0, Fixed::ZERO).unwrap();
            s.threads.insert(tid, t);
        }
        s
    }

    #[test]
    fn ready_queue_orders_by_priority_fifo_within() {
        let mut s = sched_with(&[(1, 10), (2, 30), (3, 30), (4, 20)]);
        for tid in [1, 2, 3, 4] {
            s.insert_ready(tid);
        }
        // 30s first in insertion order, then 20, then 10.
        assert_eq!(s.ready, alloc::vec![2, 3, 4, 1]);
        assert_eq!(s.pick_next(), 2);
        assert_eq!(s.pick_next(), 3);
        assert_eq!(s.ready_count(), 2);
    }

    #[test]
    fn donation_transits_a_two_lock_chain() {
        // L holds lock A; M holds lock B and blocks on A; H blocks on B.
        let (l, m, h) = (1, 2, 3);
        let (lock_a, lock_b) = (0x1000, 0x2000);
        let mut s = sched_with(&[(l, 10), (m, 20), (h, 40)]);
        s.lock_holders.insert(lock_a, l);
        s.lock_holders.insert(lock_b, m);
        s.thread_mut(m).blocking_lock = Some(lock_a);
        s.donate_from(m);
        s.thread_mut(h).blocking_lock = Some(lock_b);
        s.donate_from(h);

        assert_eq!(s.thread(m).effective_priority, 40);
        assert_eq!(s.thread(l).effective_priority, 40);

        // Releases unwind the boost exactly.
        s.remove_donation(l, lock_a);
        s.refresh_priority(l);
        s.lock_holders.remove(&lock_a);
        assert_eq!(s.thread(l).effective_priority, 10);

        s.remove_donation(m, lock_b);
        s.refresh_priority(m);
        s.lock_holders.remove(&lock_b);
        assert_eq!(s.thread(m).effective_priority, 20);
    }

    #[test]
    fn donation_is_idempotent_per_lock() {
        let (waiter, holder) = (1, 2);
        let lock = 0x3000;
        let mut s = sched_with(&[(waiter, 35), (holder, 5)]);
        s.lock_holders.insert(lock, holder);
        s.thread_mut(waiter).blocking_lock = Some(lock);
        s.donate_from(waiter);
        s.donate_from(waiter);
        s.donate_from(waiter);
        assert_eq!(s.thread(holder).donations.len(), 1);
        assert_eq!(s.thread(holder).effective_priority, 35);
    }

    #[test]
    fn donation_keeps_highest_of_two_waiters() {
        let (a, b, holder) = (1, 2, 3);
        let lock = 0x4000;
        let mut s = sched_with(&[(a, 33), (b, 50), (holder, 5)]);
        s.lock_holders.insert(lock, holder);
        s.thread_mut(a).blocking_lock = Some(lock);
        s.donate_from(a);
        s.thread_mut(b).blocking_lock = Some(lock);
        s.donate_from(b);
        assert_eq!(s.thread(holder).donations.len(), 1);
        assert_eq!(s.thread(holder).effective_priority, 50);
        // The weaker donation arriving second must not lower anything.
        s.thread_mut(a).blocking_lock = Some(lock);
        s.donate_from(a);
        assert_eq!(s.thread(holder).effective_priority, 50);
    }

    #[test]
    #[should_panic(expected = "donation chain")]
    fn over_deep_donation_chain_is_fatal() {
        // Thread i blocks on lock i, held by thread i+1, nine levels.
        let mut s = Scheduler::new(false);
        for tid in 1..=10 {
            let t = Thread::new(tid, "t", 10, 0, Fixed::ZERO).unwrap();
            s.threads.insert(tid, t);
        }
        for i in 1..=9 {
            let lock = 0x5000 + i as LockId;
            s.lock_holders.insert(lock, (i + 1) as Tid);
            s.thread_mut(i as Tid).blocking_lock = Some(lock);
        }
        s.thread_mut(1).effective_priority = 60;
        s.donate_from(1);
    }

    #[test]
    fn refresh_repositions_ready_thread() {
        let mut s = sched_with(&[(1, 10), (2, 20), (3, 30)]);
        for tid in [1, 2, 3] {
            s.insert_ready(tid);
        }
        s.thread_mut(1).donations.push(Donation {
            lock: 0x6000,
            priority: 63,
        });
        s.refresh_priority(1);
        assert_eq!(s.ready[0], 1);
        // Dropping the donation puts it back at the tail.
        s.remove_donation(1, 0x6000);
        s.refresh_priority(1);
        assert_eq!(s.ready, alloc::vec![3, 2, 1]);
    }

    #[test]
    fn mlfqs_priority_is_clamped() {
        let s = Scheduler::new(true);
        let mut t = Thread::new(1, "t", PRI_DEFAULT, 0, Fixed::ZERO).unwrap();
        t.nice = -20;
        assert_eq!(s.mlfqs_priority(&t), PRI_MAX);
        t.nice = 20;
        t.recent_cpu = Fixed::from_int(400);
        assert_eq!(s.mlfqs_priority(&t), PRI_MIN);
        t.nice = 0;
        t.recent_cpu = Fixed::from_int(8);
        assert_eq!(s.mlfqs_priority(&t), PRI_MAX - 2);
    }

    #[test]
    fn load_avg_decays_toward_zero_when_idle() {
        let mut s = Scheduler::new(true);
        let idle = Thread::new(9, "idle", PRI_MIN, 0, Fixed::ZERO).unwrap();
        s.threads.insert(9, idle);
        s.idle = Some(9);
        s.current = 9;
        s.load_avg = Fixed::from_int(3);
        for _ in 0..600 {
            s.recalculate_load_avg();
        }
        assert_eq!(s.load_avg.mul_int(100).round(), 0);
    }

    #[test]
    fn load_avg_approaches_ready_count() {
        let mut s = sched_with(&[(1, 31), (2, 31), (3, 31)]);
        s.current = 1;
        s.mlfqs = true;
        s.insert_ready(2);
        s.insert_ready(3);
        // Two ready plus one running, held steady for a long while.
        for _ in 0..4000 {
            s.recalculate_load_avg();
        }
        assert_eq!(s.load_avg.round(), 3);
    }

    #[test]
    fn recent_cpu_grows_with_nice() {
        let mut s = sched_with(&[(1, 31)]);
        s.thread_mut(1).nice = 5;
        s.load_avg = Fixed::from_int(1);
        s.recalculate_recent_cpu();
        // (2/3) * 0 + 5
        assert_eq!(s.thread(1).recent_cpu.round(), 5);
        s.recalculate_recent_cpu();
        // (2/3) * 5 + 5 ~ 8.33
        assert_eq!(s.thread(1).recent_cpu.mul_int(3).round(), 25);
    }

    #[test]
    fn tick_requests_preemption_after_a_full_slice() {
        let mut s = sched_with(&[(1, 31)]);
        s.current = 1;
        assert!(!s.tick(1));
        assert!(!s.tick(2));
        assert!(!s.tick(3));
        assert!(s.tick(5));
    }

    #[test]
    fn sleep_queue_is_ordered_by_wake_tick() {
        let mut q = Vec::new();
        insert_sleeper(&mut q, 60, 1);
        insert_sleeper(&mut q, 20, 2);
        insert_sleeper(&mut q, 40, 3);
        insert_sleeper(&mut q, 80, 4);
        let order: Vec<Tid> = q.iter().map(|&(_, tid)| tid).collect();
        assert_eq!(order, alloc::vec![2, 3, 1, 4]);
        // Equal ticks keep arrival order.
        insert_sleeper(&mut q, 40, 5);
        assert_eq!(q[2], (40, 5));
        assert_eq!(q[1], (40, 3));
    }

    #[test]
    fn stack_sentinel_detects_overwrite() {
        let mut t = Thread::new(1, "t", PRI_DEFAULT, 0, Fixed::ZERO).unwrap();
        assert!(t.magic_ok());
        t.stack.as_mut().unwrap()[3] ^= 0xFF;
        assert!(!t.magic_ok());
    }
}
