//! COM1 16550 UART driver.
//!
//! Port layout and the initialization sequence (DLAB, divisor, 8N1,
//! FIFO, modem control) follow the original C kernel's
//! `comport.c` 1:1; the `Locked<Serial>` + `lazy_static` wrapper and
//! the `Write`/`_serial` free-function shape come from the teacher's
//! `kernel/src/arch/x86_64/serial.rs` (aarch64 sibling, same pattern
//! on x86_64 upstream).

use core::fmt::{self, Write};

use lazy_static::lazy_static;

use crate::config::{COM1_BAUD_DIVISOR, COM1_PORT};
use crate::console::Sink;
use crate::cpu::{inb, outb};
use crate::util::Locked;

const PORT_DATA: u16 = COM1_PORT;
const PORT_INT_ENABLE: u16 = COM1_PORT + 1;
const PORT_DIVISOR_MSB: u16 = COM1_PORT + 1;
const PORT_INTID_FIFOCTL: u16 = COM1_PORT + 2;
const PORT_LINECTL: u16 = COM1_PORT + 3;
const PORT_MODEMCTL: u16 = COM1_PORT + 4;
const PORT_LINE_STATUS: u16 = COM1_PORT + 5;

const LSR_DATA_READY: u8 = 0x01;
const LSR_TRANSMIT_EMPTY: u8 = 0x20;

pub struct Serial {
    initialized: bool,
}

impl Serial {
    const fn new() -> Self {
        Self { initialized: false }
    }

    /// Programs the UART for 38400 8N1 with FIFOs enabled. Idempotent.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }
        outb(PORT_INT_ENABLE, 0x00);
        outb(PORT_LINECTL, 0x80);
        outb(PORT_DATA, COM1_BAUD_DIVISOR as u8);
        outb(PORT_DIVISOR_MSB, (COM1_BAUD_DIVISOR >> 8) as u8);
        outb(PORT_LINECTL, 0x03);
        outb(PORT_INTID_FIFOCTL, 0xC7);
        outb(PORT_MODEMCTL, 0x0B);
        self.initialized = true;
    }

    fn can_write(&self) -> bool {
        inb(PORT_LINE_STATUS) & LSR_TRANSMIT_EMPTY != 0
    }

    pub fn has_data(&self) -> bool {
        inb(PORT_LINE_STATUS) & LSR_DATA_READY != 0
    }

    /// Blocking read of a single byte.
    pub fn read_byte(&mut self) -> u8 {
        while !self.has_data() {
            crate::cpu::nop();
        }
        inb(PORT_DATA)
    }

    fn write_byte(&mut self, b: u8) {
        while !self.can_write() {
            crate::cpu::nop();
        }
        outb(PORT_DATA, b);
    }
}

impl Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            if b == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(b);
        }
        Ok(())
    }
}

impl Sink for Serial {
    fn write_str(&mut self, s: &str) {
        let _ = Write::write_str(self, s);
    }
}

lazy_static! {
    pub static ref SERIAL: Locked<Serial> = Locked::new(Serial::new());
}

pub fn init() {
    SERIAL.lock().init();
}

#[doc(hidden)]
pub fn _serial(args: fmt::Arguments) {
    let _ = SERIAL.lock().write_fmt(args);
}

#[macro_export]
macro_rules! serial {
    ($($arg:tt)*) => {
        $crate::serial::_serial(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! logln {
    ($($arg:tt)*) => {
        $crate::serial!("{}\n", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::logln!("[INFO] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::logln!("[DEBUG] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn_log {
    ($($arg:tt)*) => {
        $crate::logln!("[WARN] {}", format_args!($($arg)*))
    };
}
