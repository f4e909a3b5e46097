//! PS/2 keyboard input.
//!
//! The interrupt handler decodes set-1 scancodes into bytes and queues
//! them; `getc` blocks on a counting semaphore that the handler ups
//! once per queued byte, so readers sleep instead of polling.

use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use x86_64::instructions::interrupts;

use crate::threads::sync::Semaphore;

const QUEUE_CAP: usize = 256;

static QUEUE: Mutex<ArrayVec<u8, QUEUE_CAP>> = Mutex::new(ArrayVec::new_const());
static AVAILABLE: Semaphore = Semaphore::new(0);
static SHIFT: AtomicBool = AtomicBool::new(false);

const SC_LSHIFT: u8 = 0x2A;
const SC_RSHIFT: u8 = 0x36;
const RELEASE_BIT: u8 = 0x80;

/// Scancode-set-1 make codes 0x02..=0x39, unshifted.
const PLAIN: &[u8] = b"1234567890-=\x08\tqwertyuiop[]\n\0asdfghjkl;'`\0\\zxcvbnm,./\0*\0 ";
/// Same range with shift held.
const SHIFTED: &[u8] = b"!@#$%^&*()_+\x08\tQWERTYUIOP{}\n\0ASDFGHJKL:\"~\0|ZXCVBNM<>?\0*\0 ";

/// Looks a make code up in the shift-appropriate table. Releases,
/// modifiers, and unprintable keys give nothing.
fn translate(scancode: u8, shift: bool) -> Option<u8> {
    if scancode & RELEASE_BIT != 0 {
        return None;
    }
    let table = if shift { SHIFTED } else { PLAIN };
    let index = (scancode as usize).checked_sub(2)?;
    match table.get(index) {
        Some(&b) if b != 0 => Some(b),
        _ => None,
    }
}

/// Translates one scancode, tracking shift state across calls.
fn decode(scancode: u8) -> Option<u8> {
    match scancode {
        SC_LSHIFT | SC_RSHIFT => {
            SHIFT.store(true, Ordering::Relaxed);
            None
        }
        sc if sc == SC_LSHIFT | RELEASE_BIT || sc == SC_RSHIFT | RELEASE_BIT => {
            SHIFT.store(false, Ordering::Relaxed);
            None
        }
        sc => translate(sc, SHIFT.load(Ordering::Relaxed)),
    }
}

/// Feeds one raw scancode from the interrupt handler.
pub fn on_scancode(scancode: u8) {
    if let Some(byte) = decode(scancode) {
        let queued = {
            let mut queue = QUEUE.lock();
            queue.try_push(byte).is_ok()
        };
        // Only advertise bytes that were actually kept.
        if queued {
            AVAILABLE.up();
        }
    }
}

/// Blocks until a key is available and returns it.
pub fn getc() -> u8 {
    AVAILABLE.down();
    interrupts::without_interrupts(|| QUEUE.lock().remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_letters_and_digits() {
        assert_eq!(translate(0x1E, false), Some(b'a'));
        assert_eq!(translate(0x02, false), Some(b'1'));
        assert_eq!(translate(0x39, false), Some(b' '));
        assert_eq!(translate(0x1C, false), Some(b'\n'));
    }

    #[test]
    fn shifted_table_differs() {
        assert_eq!(translate(0x1E, true), Some(b'A'));
        assert_eq!(translate(0x03, true), Some(b'@'));
        assert_eq!(translate(0x0D, true), Some(b'+'));
    }

    #[test]
    fn releases_and_unknown_codes_give_nothing() {
        assert_eq!(translate(0x1E | RELEASE_BIT, false), None);
        assert_eq!(translate(0x00, false), None);
        assert_eq!(translate(0x3A, false), None); // caps lock
    }

    // The only test that touches the shared shift state; everything
    // else goes through the pure translation.
    #[test]
    fn shift_state_follows_press_and_release() {
        assert_eq!(decode(SC_LSHIFT), None);
        assert_eq!(decode(0x1E), Some(b'A'));
        assert_eq!(decode(SC_LSHIFT | RELEASE_BIT), None);
        assert_eq!(decode(0x1E), Some(b'a'));
    }
}
