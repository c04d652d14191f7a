//! Mock-platform shims used only by `#[cfg(test)]` modules.
//!
//! This core has two declared external collaborators reached through
//! traits rather than direct hardware access — `pci::ConfigSpace` and
//! `acpi::AcpiPlatform` (see DESIGN.md). Real implementations drive
//! I/O ports and firmware tables that don't exist on the host running
//! `cargo test`, so every test that needs a PCI device or an MADT
//! builds one of the fakes here instead, the same way the teacher's
//! `kernel/src/arch/x86_64/tests.rs` swaps in host-safe stand-ins for
//! hardware state.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::acpi::AcpiPlatform;
use crate::pci::{ConfigSpace, PciAddress, Width};

/// An in-memory PCI config space: one flat byte array per device,
/// addressed the same way `PortConfigSpace` addresses real hardware
/// (byte offset, little-endian words/longs), so code written against
/// `&dyn ConfigSpace` cannot tell the difference.
#[derive(Default)]
pub struct FakeConfigSpace {
    devices: RefCell<BTreeMap<(u8, u8, u8), [u8; 256]>>,
}

impl FakeConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a device's raw 256-byte config space header at
    /// `bus:device:function`. Callers build the header with
    /// `write_field`/`write_capability` below.
    pub fn add_device(&self, addr: PciAddress, header: [u8; 256]) {
        self.devices
            .borrow_mut()
            .insert((addr.bus, addr.device, addr.function), header);
    }

    fn with_header<R>(&self, addr: PciAddress, f: impl FnOnce(&mut [u8; 256]) -> R) -> R {
        let mut devices = self.devices.borrow_mut();
        let header = devices
            .entry((addr.bus, addr.device, addr.function))
            .or_insert([0xFF; 256]);
        f(header)
    }
}

impl ConfigSpace for FakeConfigSpace {
    fn read_cfg(&self, addr: PciAddress, offset: u8, width: Width) -> u32 {
        self.with_header(addr, |header| {
            let off = offset as usize;
            match width {
                Width::Byte => header[off] as u32,
                Width::Word => u16::from_le_bytes(header[off..off + 2].try_into().unwrap()) as u32,
                Width::Long => u32::from_le_bytes(header[off..off + 4].try_into().unwrap()),
            }
        })
    }

    fn write_cfg(&self, addr: PciAddress, offset: u8, width: Width, value: u32) {
        self.with_header(addr, |header| {
            let off = offset as usize;
            match width {
                Width::Byte => header[off] = value as u8,
                Width::Word => header[off..off + 2].copy_from_slice(&(value as u16).to_le_bytes()),
                Width::Long => header[off..off + 4].copy_from_slice(&value.to_le_bytes()),
            }
        })
    }
}

/// Helper for building a synthetic device header field-by-field
/// rather than hand-indexing byte offsets at every call site.
pub fn device_header(vendor_id: u16, device_id: u16, base_class: u8, sub_class: u8) -> [u8; 256] {
    let mut header = [0u8; 256];
    header[0..2].copy_from_slice(&vendor_id.to_le_bytes());
    header[2..4].copy_from_slice(&device_id.to_le_bytes());
    header[11] = base_class;
    header[10] = sub_class;
    header
}

/// Appends one capability record (`cap_vndr`, `cap_next` wired up
/// automatically) to a header built by `device_header`, returning the
/// record's offset for use by `write_cap_field`.
pub fn append_capability(header: &mut [u8; 256], cap_id: u8, next_free: &mut u8) -> u8 {
    const STATUS_CAP_LIST: u16 = 1 << 4;
    let status = u16::from_le_bytes(header[6..8].try_into().unwrap());
    header[6..8].copy_from_slice(&(status | STATUS_CAP_LIST).to_le_bytes());

    let offset = *next_free;
    header[offset as usize] = cap_id;
    header[0x34] = if header[0x34] == 0 { offset } else { header[0x34] };
    // Chain this capability after the last one installed, if any.
    if header[0x34] != offset {
        let mut cursor = header[0x34];
        loop {
            let next = header[cursor as usize + 1];
            if next == 0 {
                header[cursor as usize + 1] = offset;
                break;
            }
            cursor = next;
        }
    }
    header[offset as usize + 1] = 0;
    *next_free += 16;
    offset
}

pub fn write_cap_field(header: &mut [u8; 256], cap_offset: u8, field_offset: u8, value: u32, width: Width) {
    let off = cap_offset as usize + field_offset as usize;
    match width {
        Width::Byte => header[off] = value as u8,
        Width::Word => header[off..off + 2].copy_from_slice(&(value as u16).to_le_bytes()),
        Width::Long => header[off..off + 4].copy_from_slice(&value.to_le_bytes()),
    }
}

/// A canned MADT plus an optional `\_PIC` call log, standing in for a
/// real ACPICA binding.
pub struct FakeAcpiPlatform {
    madt: Vec<u8>,
    pic_calls: RefCell<Vec<u32>>,
}

impl FakeAcpiPlatform {
    pub fn new(madt: Vec<u8>) -> Self {
        Self {
            madt,
            pic_calls: RefCell::new(Vec::new()),
        }
    }

    pub fn pic_calls(&self) -> Vec<u32> {
        self.pic_calls.borrow().clone()
    }
}

impl AcpiPlatform for FakeAcpiPlatform {
    fn find_table(&self, signature: [u8; 4]) -> Option<&'static [u8]> {
        if signature != *b"APIC" {
            return None;
        }
        // Tests are single-threaded and the platform outlives every
        // call made against it, so extending this borrow is sound.
        Some(unsafe { core::slice::from_raw_parts(self.madt.as_ptr(), self.madt.len()) })
    }

    fn evaluate_pic_method(&self, mode: u32) {
        self.pic_calls.borrow_mut().push(mode);
    }
}

/// Builds a minimal MADT: standard ACPI header, `LocalApicAddress` +
/// `Flags`, followed by whatever raw subtable bytes the caller
/// supplies (already-encoded IO-APIC / Interrupt Source Override
/// records).
pub fn build_madt(subtables: &[u8]) -> Vec<u8> {
    let mut madt = Vec::with_capacity(44 + subtables.len());
    madt.extend_from_slice(b"APIC");
    let length = (36 + 8 + subtables.len()) as u32;
    madt.extend_from_slice(&length.to_le_bytes());
    madt.extend_from_slice(&[0u8; 28]); // rest of the ACPI header, unused by our parser
    madt.extend_from_slice(&0xFEE0_0000u32.to_le_bytes()); // LocalApicAddress
    madt.extend_from_slice(&0u32.to_le_bytes()); // Flags
    madt.extend_from_slice(subtables);
    madt
}

/// Encodes one MADT IO-APIC subtable (type 1).
pub fn io_apic_subtable(id: u8, address: u32, global_irq_base: u32) -> [u8; 12] {
    let mut entry = [0u8; 12];
    entry[0] = 1;
    entry[1] = 12;
    entry[2] = id;
    entry[4..8].copy_from_slice(&address.to_le_bytes());
    entry[8..12].copy_from_slice(&global_irq_base.to_le_bytes());
    entry
}

/// Encodes one MADT Interrupt Source Override subtable (type 2).
pub fn interrupt_override_subtable(bus: u8, source_irq: u8, global_irq: u32, flags: u16) -> [u8; 10] {
    let mut entry = [0u8; 10];
    entry[0] = 2;
    entry[1] = 10;
    entry[2] = bus;
    entry[3] = source_irq;
    entry[4..8].copy_from_slice(&global_irq.to_le_bytes());
    entry[8..10].copy_from_slice(&flags.to_le_bytes());
    entry
}
