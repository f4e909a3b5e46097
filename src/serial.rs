//! COM1 serial output and the kernel log macros. Everything the
//! kernel logs goes here; the VGA console is for user-visible output.

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;

const COM1_BASE: u16 = 0x3F8;

// Register offsets from the port base.
const REG_DATA: u16 = 0;
const REG_INT_ENABLE: u16 = 1;
const REG_FIFO_CTRL: u16 = 2;
const REG_LINE_CTRL: u16 = 3;
const REG_MODEM_CTRL: u16 = 4;
const REG_LINE_STATUS: u16 = 5;

const LINE_STATUS_TX_EMPTY: u8 = 0x20;

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    const fn new(base: u16) -> SerialPort {
        SerialPort { base }
    }

    fn write_reg(&mut self, reg: u16, value: u8) {
        unsafe { Port::<u8>::new(self.base + reg).write(value) }
    }

    fn read_reg(&mut self, reg: u16) -> u8 {
        unsafe { Port::<u8>::new(self.base + reg).read() }
    }

    /// 38400 baud, 8N1, FIFOs on.
    fn init(&mut self) {
        self.write_reg(REG_INT_ENABLE, 0x00);
        self.write_reg(REG_LINE_CTRL, 0x80); // divisor latch
        self.write_reg(REG_DATA, 0x03); // divisor low
        self.write_reg(REG_INT_ENABLE, 0x00); // divisor high
        self.write_reg(REG_LINE_CTRL, 0x03);
        self.write_reg(REG_FIFO_CTRL, 0xC7);
        self.write_reg(REG_MODEM_CTRL, 0x0B);
    }

    pub fn send(&mut self, byte: u8) {
        while self.read_reg(REG_LINE_STATUS) & LINE_STATUS_TX_EMPTY == 0 {}
        self.write_reg(REG_DATA, byte);
    }
}

impl core::fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut port = SerialPort::new(COM1_BASE);
        port.init();
        Mutex::new(port)
    };
}

pub fn init() {
    // Force initialization early so the first log line cannot race it.
    let _ = SERIAL1.lock();
}

#[cfg(not(test))]
#[doc(hidden)]
pub fn _log(args: core::fmt::Arguments) {
    use core::fmt::Write;
    interrupts::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

// Host test builds have no serial hardware to poke.
#[cfg(test)]
#[doc(hidden)]
pub fn _log(args: core::fmt::Arguments) {
    let _ = args;
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::serial::_log(format_args!("[INFO] {}\n", format_args!($($arg)*)))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::serial::_log(format_args!("[WARN] {}\n", format_args!($($arg)*)))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::serial::_log(format_args!("[ERROR] {}\n", format_args!($($arg)*)))
    };
}
