//! IO-APIC discovery and redirection table programming.
//!
//! Ported from `ioapic.c`: find the MADT's IO-APIC subtable, map its
//! MMIO window, then for each ISA IRQ 0..15 apply any matching
//! Interrupt Source Override to resolve `(bus, GSI, polarity,
//! trigger)` before writing the redirection entry. Vectors reuse the
//! same `PIC_REMAP_BASE + irq` numbering the 8259 path already uses,
//! rather than the original's separate per-priority vector table —
//! this kernel has no IRQL concept to drive that scheme.

use crate::acpi;
use crate::config::PIC_REMAP_BASE;
use crate::memory::frame_allocator::{self, RegionTag};
use crate::memory::vspace::{self, Protection, RegionType};
use crate::util::Locked;

const REG_SELECT_OFFSET: usize = 0x00;
const REG_WINDOW_OFFSET: usize = 0x10;

const REG_VER: u32 = 0x01;
const REG_TABLE_BASE: u32 = 0x10;

const REDIRECTION_MASKED: u32 = 1 << 16;

static IOAPIC_VIRT_BASE: Locked<usize> = Locked::new(0);
static IRQ_TO_GSI: Locked<[Option<u32>; 16]> = Locked::new([None; 16]);

fn read_register(reg: u32) -> u32 {
    let base = *IOAPIC_VIRT_BASE.lock();
    unsafe {
        ((base + REG_SELECT_OFFSET) as *mut u32).write_volatile(reg & 0xFF);
        ((base + REG_WINDOW_OFFSET) as *const u32).read_volatile()
    }
}

fn write_register(reg: u32, value: u32) {
    let base = *IOAPIC_VIRT_BASE.lock();
    unsafe {
        ((base + REG_SELECT_OFFSET) as *mut u32).write_volatile(reg & 0xFF);
        ((base + REG_WINDOW_OFFSET) as *mut u32).write_volatile(value);
    }
}

fn write_redirection_entry(gsi: u32, apic_id: u8, vector: u8, bus: u8, flags: u16, masked: bool) {
    let reg = REG_TABLE_BASE + gsi * 2;
    let polarity = acpi::polarity_is_active_low(bus, flags) as u32;
    let trigger = acpi::trigger_is_level(bus, flags) as u32;
    let mut lo = vector as u32 | (polarity << 13) | (trigger << 15);
    if masked {
        lo |= REDIRECTION_MASKED;
    }
    let hi = (apic_id as u32) << 24;
    write_register(reg + 1, hi);
    write_register(reg + 0, lo);
}

fn map_isa_irq(irq: u8) {
    let mut gsi = irq as u32;
    let mut flags = 0u16;
    let mut bus = 0u8;

    for ov in acpi::interrupt_overrides() {
        if ov.bus != 0 {
            continue;
        }
        if ov.source_irq == irq {
            gsi = ov.global_irq;
            flags = ov.flags;
            bus = ov.bus;
            break;
        }
    }

    let vector = PIC_REMAP_BASE + irq;
    IRQ_TO_GSI.lock()[irq as usize] = Some(gsi);
    write_redirection_entry(gsi, 0x00, vector, bus, flags, false);
}

/// Maps the IO-APIC's MMIO window, then routes ISA IRQ0..15 to
/// vectors `PIC_REMAP_BASE..PIC_REMAP_BASE+15`. Returns `false` if the
/// MADT carries no IO-APIC subtable.
pub fn init() -> bool {
    let Some(descriptor) = acpi::find_io_apic() else {
        crate::logln!("no IOAPIC found");
        return false;
    };
    assert_eq!(descriptor.global_irq_base, 0, "IOAPIC must have global IRQ base 0");

    let phys = descriptor.address as usize;
    frame_allocator::mark(phys, 1, RegionTag::Hardware, "IOAPIC");
    let virt = vspace::kernel_space()
        .lock()
        .as_mut()
        .unwrap()
        .alloc(phys, 1, Protection::READWRITE | Protection::NOCACHE, RegionType::Hardware, "IOAPIC")
        .expect("failed to map IOAPIC MMIO window");
    *IOAPIC_VIRT_BASE.lock() = virt;

    let max_entries = ((read_register(REG_VER) >> 16) & 0xFF) + 1;
    crate::logln!("found IOAPIC (addr={:#x}, pins={})", phys, max_entries);

    for irq in 0u8..16 {
        map_isa_irq(irq);
    }
    mask_irq(0);

    true
}

pub fn mask_irq(irq: u8) {
    let Some(gsi) = IRQ_TO_GSI.lock()[irq as usize] else {
        return;
    };
    let reg = REG_TABLE_BASE + gsi * 2;
    let hi = read_register(reg + 1);
    let lo = read_register(reg + 0) | REDIRECTION_MASKED;
    write_register(reg + 1, hi);
    write_register(reg + 0, lo);
}

pub fn unmask_irq(irq: u8) {
    let Some(gsi) = IRQ_TO_GSI.lock()[irq as usize] else {
        return;
    };
    let reg = REG_TABLE_BASE + gsi * 2;
    let hi = read_register(reg + 1);
    let lo = read_register(reg + 0) & !REDIRECTION_MASKED;
    write_register(reg + 1, hi);
    write_register(reg + 0, lo);
}
