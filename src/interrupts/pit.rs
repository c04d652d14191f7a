//! The legacy 8254/8253 PIT, channel 0. Programmed once at boot so
//! IRQ0 ticks at a known rate while the 8259 PIC is still the active
//! controller; superseded by the Local APIC's own periodic timer once
//! `interrupts::init_apic_routing` runs. Ported from the original
//! kernel's `pit.c` `PitInitialize`.

use crate::cpu::outb;

const PIT_CHANNEL0_DATA: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_INPUT_HZ: u32 = 1_193_180;

/// `outb(0x43, 0x36)` selects channel 0, lo/hi access, mode 3 (square
/// wave), binary; the divisor follows as two bytes.
pub fn init(frequency_hz: u32) {
    let divisor = (PIT_INPUT_HZ / frequency_hz) as u16;
    outb(PIT_COMMAND, 0x36);
    outb(PIT_CHANNEL0_DATA, (divisor & 0xFF) as u8);
    outb(PIT_CHANNEL0_DATA, (divisor >> 8) as u8);
}
