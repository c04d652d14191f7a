//! The ACPI boundary: table lookup and `\_PIC` evaluation are treated
//! as an external collaborator (a full ACPICA binding is assumed
//! available, not reimplemented here — mirrors `console::Sink` being
//! the seam for styled output rather than a framebuffer driver of our
//! own). What this module DOES own is the MADT byte layout itself:
//! walking its subtable records to find the IO-APIC and any ISA
//! Interrupt Source Overrides, ported from `ioapic.c`'s `IoApicMapIRQ`/
//! `IoApicInitialize` table walk.

use crate::util::Locked;

/// The assumed external collaborator: a table lookup API and an
/// object evaluator, standing in for a real ACPICA binding.
pub trait AcpiPlatform: Sync {
    /// Returns the raw bytes of the first table matching `signature`
    /// (e.g. `*b"APIC"` for the MADT), standard ACPI header included.
    fn find_table(&self, signature: [u8; 4]) -> Option<&'static [u8]>;

    /// Evaluates `\_PIC` with `mode` (0 = 8259, 1 = APIC). Firmware
    /// that has no such method is expected to no-op.
    fn evaluate_pic_method(&self, mode: u32);
}

static PLATFORM: Locked<Option<&'static dyn AcpiPlatform>> = Locked::new(None);

pub fn init(platform: &'static dyn AcpiPlatform) {
    *PLATFORM.lock() = Some(platform);
}

/// Tells firmware which interrupt routing model is active. Warns
/// rather than asserting success: `\_PIC` missing is a well-known,
/// non-fatal case.
pub fn set_pic_mode(mode: u32) {
    match *PLATFORM.lock() {
        Some(platform) => platform.evaluate_pic_method(mode),
        None => crate::logln!("warning: ACPI platform not registered, cannot evaluate \\_PIC"),
    }
}

const MADT_HEADER_LEN: usize = 36;
const MADT_ENTRIES_OFFSET: usize = MADT_HEADER_LEN + 8; // + LocalApicAddress(4) + Flags(4)

const MADT_TYPE_IO_APIC: u8 = 1;
const MADT_TYPE_INTERRUPT_OVERRIDE: u8 = 2;

const POLARITY_MASK: u16 = 0b11;
const POLARITY_ACTIVE_HIGH: u16 = 0b01;
const POLARITY_ACTIVE_LOW: u16 = 0b11;

const TRIGGER_MASK: u16 = 0b1100;
const TRIGGER_EDGE: u16 = 0b0100;
const TRIGGER_LEVEL: u16 = 0b1100;

#[derive(Debug, Clone, Copy)]
pub struct IoApicDescriptor {
    pub address: u32,
    pub global_irq_base: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct InterruptOverride {
    pub bus: u8,
    pub source_irq: u8,
    pub global_irq: u32,
    pub flags: u16,
}

/// Active-low polarity, resolved with the ISA-bus default when the
/// override doesn't specify one explicitly.
pub fn polarity_is_active_low(bus: u8, flags: u16) -> bool {
    match flags & POLARITY_MASK {
        POLARITY_ACTIVE_HIGH => false,
        POLARITY_ACTIVE_LOW => true,
        _ => {
            debug_assert_eq!(bus, 0, "bus type must be ISA");
            false
        }
    }
}

/// Level-triggered, resolved with the ISA-bus default (edge) when
/// unspecified.
pub fn trigger_is_level(bus: u8, flags: u16) -> bool {
    match flags & TRIGGER_MASK {
        TRIGGER_EDGE => false,
        TRIGGER_LEVEL => true,
        _ => {
            debug_assert_eq!(bus, 0, "bus type must be ISA");
            false
        }
    }
}

fn madt_bytes() -> Option<&'static [u8]> {
    PLATFORM.lock().and_then(|p| p.find_table(*b"APIC"))
}

/// The single IO-APIC this kernel supports. `None` if no MADT, or no
/// IO-APIC subtable, is present.
pub fn find_io_apic() -> Option<IoApicDescriptor> {
    let madt = madt_bytes()?;
    let length = u32::from_le_bytes(madt[4..8].try_into().unwrap()) as usize;
    let mut offset = MADT_ENTRIES_OFFSET;
    while offset + 2 <= length {
        let entry_type = madt[offset];
        let entry_len = madt[offset + 1] as usize;
        if entry_len < 2 || offset + entry_len > length {
            break;
        }
        if entry_type == MADT_TYPE_IO_APIC && entry_len >= 12 {
            let address = u32::from_le_bytes(madt[offset + 4..offset + 8].try_into().unwrap());
            let global_irq_base = u32::from_le_bytes(madt[offset + 8..offset + 12].try_into().unwrap());
            return Some(IoApicDescriptor { address, global_irq_base });
        }
        offset += entry_len;
    }
    None
}

/// Every ISA Interrupt Source Override the MADT lists, in table order.
pub fn interrupt_overrides() -> alloc::vec::Vec<InterruptOverride> {
    let mut overrides = alloc::vec::Vec::new();
    let Some(madt) = madt_bytes() else {
        return overrides;
    };
    let length = u32::from_le_bytes(madt[4..8].try_into().unwrap()) as usize;
    let mut offset = MADT_ENTRIES_OFFSET;
    while offset + 2 <= length {
        let entry_type = madt[offset];
        let entry_len = madt[offset + 1] as usize;
        if entry_len < 2 || offset + entry_len > length {
            break;
        }
        if entry_type == MADT_TYPE_INTERRUPT_OVERRIDE && entry_len >= 10 {
            overrides.push(InterruptOverride {
                bus: madt[offset + 2],
                source_irq: madt[offset + 3],
                global_irq: u32::from_le_bytes(madt[offset + 4..offset + 8].try_into().unwrap()),
                flags: u16::from_le_bytes(madt[offset + 8..offset + 10].try_into().unwrap()),
            });
        }
        offset += entry_len;
    }
    overrides
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{build_madt, interrupt_override_subtable, io_apic_subtable, FakeAcpiPlatform};
    use alloc::boxed::Box;

    /// `PLATFORM` is a single module-level static; held for the
    /// duration of each test so `cargo test`'s default parallel
    /// execution can't interleave one test's `install` with another's
    /// assertions against it.
    static TEST_LOCK: spin::Mutex<()> = spin::Mutex::new(());

    fn install(madt: alloc::vec::Vec<u8>) -> &'static FakeAcpiPlatform {
        let platform: &'static FakeAcpiPlatform = Box::leak(Box::new(FakeAcpiPlatform::new(madt)));
        init(platform);
        platform
    }

    #[test]
    fn finds_the_sole_io_apic_subtable() {
        let _serial = TEST_LOCK.lock();
        let sub = io_apic_subtable(0, 0xFEC0_0000, 0);
        install(build_madt(&sub));
        let io_apic = find_io_apic().expect("io apic subtable should parse");
        assert_eq!(io_apic.address, 0xFEC0_0000);
        assert_eq!(io_apic.global_irq_base, 0);
    }

    #[test]
    fn missing_io_apic_subtable_returns_none() {
        let _serial = TEST_LOCK.lock();
        install(build_madt(&[]));
        assert!(find_io_apic().is_none());
    }

    #[test]
    fn collects_interrupt_overrides_in_table_order() {
        let _serial = TEST_LOCK.lock();
        let mut subtables = alloc::vec::Vec::new();
        subtables.extend_from_slice(&interrupt_override_subtable(0, 0, 2, 0));
        subtables.extend_from_slice(&interrupt_override_subtable(0, 5, 5, 0b1111));
        install(build_madt(&subtables));
        let overrides = interrupt_overrides();
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides[0].source_irq, 0);
        assert_eq!(overrides[0].global_irq, 2);
        assert_eq!(overrides[1].source_irq, 5);
        assert!(polarity_is_active_low(overrides[1].bus, overrides[1].flags));
        assert!(trigger_is_level(overrides[1].bus, overrides[1].flags));
    }

    #[test]
    fn set_pic_mode_forwards_to_the_platform() {
        let _serial = TEST_LOCK.lock();
        let platform = install(build_madt(&[]));
        set_pic_mode(1);
        assert_eq!(platform.pic_calls(), alloc::vec![1]);
    }
}
