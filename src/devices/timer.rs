//! Programmable interval timer: the system's time base.

use core::sync::atomic::{AtomicI64, Ordering};
use x86_64::instructions::port::Port;

/// Timer interrupts per second.
pub const TIMER_FREQ: u32 = 100;

/// Input clock of the 8254, in Hz.
const PIT_BASE_HZ: u32 = 1_193_182;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, square-wave mode.
const PIT_MODE: u8 = 0x36;

/// Ticks since boot.
static TICKS: AtomicI64 = AtomicI64::new(0);

/// Programs the PIT to fire `TIMER_FREQ` times per second.
pub fn init() {
    let divisor = (PIT_BASE_HZ / TIMER_FREQ) as u16;
    unsafe {
        Port::<u8>::new(PIT_COMMAND).write(PIT_MODE);
        Port::<u8>::new(PIT_CHANNEL0).write((divisor & 0xFF) as u8);
        Port::<u8>::new(PIT_CHANNEL0).write((divisor >> 8) as u8);
    }
    crate::log_info!("timer: PIT programmed for {} Hz", TIMER_FREQ);
}

/// Timer ticks since boot.
pub fn ticks() -> i64 {
    TICKS.load(Ordering::Relaxed)
}

/// Called from the timer interrupt handler on every tick.
pub fn on_tick() {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    crate::threads::tick(now);
}

/// Suspends the caller for at least `ticks` timer ticks. The deadline
/// is absolute once armed and cannot be cancelled.
pub fn sleep(ticks: i64) {
    if ticks <= 0 {
        return;
    }
    let wake = self::ticks() + ticks;
    crate::threads::sleep_until(wake);
}
