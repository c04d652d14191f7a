//! TSC frequency calibration and TSC-driven busy stalls.
//!
//! Ported from the original kernel's `tsc.c`/`scheduler.c` `SchStall`,
//! with `TscCalibrate`'s hand-written assembly routine replaced by a
//! portable busy-poll against PIT channel 2's gate output on port
//! 0x61 — the classic technique for timing a known window without
//! relying on interrupts, which aren't live yet this early in boot.

use crate::cpu::{inb, outb, read_tsc};
use crate::util::Locked;

const PIT_CHANNEL2_DATA: u16 = 0x42;
const PIT_COMMAND: u16 = 0x43;
const PIT_GATE_PORT: u16 = 0x61;
const PIT_INPUT_HZ: u64 = 1_193_182;

static TSC_FREQUENCY_HZ: Locked<u64> = Locked::new(0);

pub fn frequency_hz() -> u64 {
    *TSC_FREQUENCY_HZ.lock()
}

/// Times a 10 ms window on PIT channel 2 against the TSC, scales to a
/// whole second and rounds to the nearest MHz, matching the original
/// debug log's `raw=... round=...` reporting.
pub fn calibrate() {
    const WINDOW_MS: u64 = 10;
    let reload = (PIT_INPUT_HZ * WINDOW_MS / 1000) as u16;

    let gate = inb(PIT_GATE_PORT);
    outb(PIT_GATE_PORT, (gate & 0xFC) | 0x01);
    outb(PIT_COMMAND, 0xB0); // channel 2, lo/hi access, mode 0, binary
    outb(PIT_CHANNEL2_DATA, (reload & 0xFF) as u8);
    outb(PIT_CHANNEL2_DATA, (reload >> 8) as u8);

    let start = read_tsc();
    while inb(PIT_GATE_PORT) & 0x20 == 0 {}
    let end = read_tsc();

    let raw_hz = (end - start) * 1000 / WINDOW_MS;
    let round_mhz = (raw_hz + 500_000) / 1_000_000;
    let frequency = round_mhz * 1_000_000;
    *TSC_FREQUENCY_HZ.lock() = frequency;
    crate::logln!("TSC frequency: {} Hz ({} MHz raw={})", frequency, round_mhz, raw_hz);
}

/// Busy-waits for `microsecs`, matching the original `SchStall`.
pub fn stall_microseconds(microsecs: u32) {
    if microsecs == 0 {
        return;
    }
    let ticks_per_microsec = frequency_hz() / 1_000_000;
    let stall_until = read_tsc() + microsecs as u64 * ticks_per_microsec;
    while read_tsc() < stall_until {
        core::hint::spin_loop();
    }
}
