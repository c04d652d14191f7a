//! PCI bus enumeration and capability-chain discovery.
//!
//! Config-space access itself (`read_cfg`/`write_cfg`) is the
//! declared external capability — callers are handed a `&dyn
//! ConfigSpace` rather than reaching for the ports directly. The
//! bus/device/function scan and capability-list walk built on top are
//! in-scope: virtio device discovery (component I) needs both before
//! it ever touches a BAR. Port layout and the recursive bridge-walk
//! shape are ported from `examples/original_source/src/kernel/pci.c`
//! (`PciReadByte/Word/Long`, `PciCheckAllBuses/Bus/Device/Function`).

use crate::cpu;

pub const ADDRESS_PORT: u16 = 0xCF8;
pub const VALUE_PORT: u16 = 0xCFC;

pub const OFFSET_VENDOR_ID: u8 = 0x00;
pub const OFFSET_DEVICE_ID: u8 = 0x02;
pub const OFFSET_COMMAND: u8 = 0x04;
pub const OFFSET_STATUS: u8 = 0x06;
pub const OFFSET_BASE_CLASS: u8 = 0x0B;
pub const OFFSET_SUB_CLASS: u8 = 0x0A;
pub const OFFSET_HEADER_TYPE: u8 = 0x0E;
pub const OFFSET_BAR0: u8 = 0x10;
pub const OFFSET_SECONDARY_BUS: u8 = 0x19;
pub const OFFSET_CAP_PTR: u8 = 0x34;
pub const OFFSET_INT_LINE: u8 = 0x3C;
pub const OFFSET_INT_PIN: u8 = 0x3D;

const STATUS_CAP_LIST: u16 = 1 << 4;
const COMMAND_IO_SPACE: u16 = 1 << 0;
const COMMAND_MEMORY_SPACE: u16 = 1 << 1;
const COMMAND_BUS_MASTER: u16 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

/// Access width for a config-space read/write, matching
/// `read_cfg(bus,dev,fn,offset,width)`'s declared shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Long,
}

pub trait ConfigSpace: Sync {
    fn read_cfg(&self, addr: PciAddress, offset: u8, width: Width) -> u32;
    fn write_cfg(&self, addr: PciAddress, offset: u8, width: Width, value: u32);
}

/// The obvious implementation over the legacy `0xCF8`/`0xCFC`
/// mechanism port I/O already carries in this kernel's External
/// Interfaces — unlike the ACPI object evaluator, there is no
/// external binding here to assume away.
pub struct PortConfigSpace;

fn select(addr: PciAddress, offset: u8) -> u32 {
    0x8000_0000
        | ((addr.bus as u32) << 16)
        | ((addr.device as u32) << 11)
        | ((addr.function as u32) << 8)
        | (offset & 0xFC) as u32
}

impl ConfigSpace for PortConfigSpace {
    fn read_cfg(&self, addr: PciAddress, offset: u8, width: Width) -> u32 {
        cpu::outl(ADDRESS_PORT, select(addr, offset));
        match width {
            Width::Byte => cpu::inb(VALUE_PORT + (offset as u16 & 3)) as u32,
            Width::Word => cpu::inw(VALUE_PORT + (offset as u16 & 2)) as u32,
            Width::Long => cpu::inl(VALUE_PORT),
        }
    }

    fn write_cfg(&self, addr: PciAddress, offset: u8, width: Width, value: u32) {
        cpu::outl(ADDRESS_PORT, select(addr, offset));
        match width {
            Width::Byte => cpu::outb(VALUE_PORT + (offset as u16 & 3), value as u8),
            Width::Word => cpu::outw(VALUE_PORT + (offset as u16 & 2), value as u16),
            Width::Long => cpu::outl(VALUE_PORT, value),
        }
    }
}

pub fn read_byte(cfg: &dyn ConfigSpace, addr: PciAddress, offset: u8) -> u8 {
    cfg.read_cfg(addr, offset, Width::Byte) as u8
}

fn read_word(cfg: &dyn ConfigSpace, addr: PciAddress, offset: u8) -> u16 {
    cfg.read_cfg(addr, offset, Width::Word) as u16
}

fn read_long(cfg: &dyn ConfigSpace, addr: PciAddress, offset: u8) -> u32 {
    cfg.read_cfg(addr, offset, Width::Long)
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub address: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub base_class: u8,
    pub sub_class: u8,
}

/// Enables memory-space decode and bus mastering, required before a
/// virtio driver can use the device's BARs or have it write back to
/// RAM (descriptor/used-ring updates).
pub fn enable_device(cfg: &dyn ConfigSpace, addr: PciAddress) {
    let command = read_word(cfg, addr, OFFSET_COMMAND);
    cfg.write_cfg(
        addr,
        OFFSET_COMMAND,
        Width::Word,
        (command | COMMAND_MEMORY_SPACE | COMMAND_IO_SPACE | COMMAND_BUS_MASTER) as u32,
    );
}

/// Finds the first device matching `vendor_id`/`device_id`, scanning
/// every bus reachable from bridges the way `PciCheckAllBuses` does:
/// single root bus unless the host bridge itself is multi-function.
pub fn find_device(cfg: &dyn ConfigSpace, vendor_id: u16, device_id: u16) -> Option<DeviceInfo> {
    let root = PciAddress { bus: 0, device: 0, function: 0 };
    let mut found = None;
    if read_byte(cfg, root, OFFSET_HEADER_TYPE) & 0x80 == 0 {
        check_bus(cfg, 0, vendor_id, device_id, &mut found);
    } else {
        for bus in 0u8..8 {
            let probe = PciAddress { bus: 0, device: 0, function: bus };
            if read_word(cfg, probe, OFFSET_VENDOR_ID) == 0xFFFF {
                break;
            }
            check_bus(cfg, bus, vendor_id, device_id, &mut found);
            if found.is_some() {
                break;
            }
        }
    }
    found
}

fn check_bus(cfg: &dyn ConfigSpace, bus: u8, vendor_id: u16, device_id: u16, found: &mut Option<DeviceInfo>) {
    for device in 0u8..32 {
        if found.is_some() {
            return;
        }
        check_device(cfg, bus, device, vendor_id, device_id, found);
    }
}

fn check_device(cfg: &dyn ConfigSpace, bus: u8, device: u8, vendor_id: u16, device_id: u16, found: &mut Option<DeviceInfo>) {
    let addr0 = PciAddress { bus, device, function: 0 };
    if read_word(cfg, addr0, OFFSET_VENDOR_ID) == 0xFFFF {
        return;
    }
    check_function(cfg, addr0, vendor_id, device_id, found);
    if found.is_some() {
        return;
    }

    if read_byte(cfg, addr0, OFFSET_HEADER_TYPE) & 0x80 != 0 {
        for function in 1u8..8 {
            let addr = PciAddress { bus, device, function };
            if read_word(cfg, addr, OFFSET_VENDOR_ID) != 0xFFFF {
                check_function(cfg, addr, vendor_id, device_id, found);
                if found.is_some() {
                    return;
                }
            }
        }
    }
}

fn check_function(cfg: &dyn ConfigSpace, addr: PciAddress, vendor_id: u16, device_id: u16, found: &mut Option<DeviceInfo>) {
    let base_class = read_byte(cfg, addr, OFFSET_BASE_CLASS);
    let sub_class = read_byte(cfg, addr, OFFSET_SUB_CLASS);
    if base_class == 0x06 && sub_class == 0x04 {
        let secondary_bus = read_byte(cfg, addr, OFFSET_SECONDARY_BUS);
        check_bus(cfg, secondary_bus, vendor_id, device_id, found);
        if found.is_some() {
            return;
        }
    }

    let vid = read_word(cfg, addr, OFFSET_VENDOR_ID);
    let did = read_word(cfg, addr, OFFSET_DEVICE_ID);
    if vid == vendor_id && did == device_id {
        *found = Some(DeviceInfo {
            address: addr,
            vendor_id: vid,
            device_id: did,
            base_class,
            sub_class,
        });
    }
}

/// Resolves BAR `index` (0..5) to its physical base address, assuming
/// a 32-bit (non-prefetchable or otherwise) memory BAR — the only
/// kind a v1.0 modern virtio device's common/notify/isr/device
/// capabilities point into.
pub fn read_bar(cfg: &dyn ConfigSpace, addr: PciAddress, index: u8) -> u32 {
    let raw = read_long(cfg, addr, OFFSET_BAR0 + index * 4);
    raw & !0xF
}

/// One entry in a device's capability linked list, walked via
/// `next_capability`/`first_capability`.
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    pub id: u8,
    pub offset: u8,
}

/// Returns the first capability-list entry, or `None` if the device's
/// status register doesn't advertise one.
pub fn first_capability(cfg: &dyn ConfigSpace, addr: PciAddress) -> Option<Capability> {
    if read_word(cfg, addr, OFFSET_STATUS) & STATUS_CAP_LIST == 0 {
        return None;
    }
    let offset = read_byte(cfg, addr, OFFSET_CAP_PTR) & 0xFC;
    capability_at(cfg, addr, offset)
}

pub fn next_capability(cfg: &dyn ConfigSpace, addr: PciAddress, current: Capability) -> Option<Capability> {
    let next_offset = read_byte(cfg, addr, current.offset + 1) & 0xFC;
    capability_at(cfg, addr, next_offset)
}

fn capability_at(cfg: &dyn ConfigSpace, addr: PciAddress, offset: u8) -> Option<Capability> {
    if offset == 0 {
        return None;
    }
    Some(Capability {
        id: read_byte(cfg, addr, offset),
        offset,
    })
}

/// Reads a byte at `cap.offset + field_offset` within a capability
/// structure — the shared primitive virtio's vendor-specific
/// capability parsing (component I) is built from.
pub fn capability_field_byte(cfg: &dyn ConfigSpace, addr: PciAddress, cap: Capability, field_offset: u8) -> u8 {
    read_byte(cfg, addr, cap.offset + field_offset)
}

pub fn capability_field_long(cfg: &dyn ConfigSpace, addr: PciAddress, cap: Capability, field_offset: u8) -> u32 {
    read_long(cfg, addr, cap.offset + field_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{append_capability, device_header, write_cap_field, FakeConfigSpace};

    const ROOT: PciAddress = PciAddress { bus: 0, device: 0, function: 0 };

    #[test]
    fn find_device_matches_on_vendor_and_device_id() {
        let cfg = FakeConfigSpace::new();
        cfg.add_device(ROOT, device_header(0x8086, 0x1234, 0x06, 0x00)); // host bridge
        let target = PciAddress { bus: 0, device: 3, function: 0 };
        cfg.add_device(target, device_header(0x1AF4, 0x1042, 0x01, 0x00));

        let found = find_device(&cfg, 0x1AF4, 0x1042).expect("device should be found");
        assert_eq!(found.address, target);
        assert_eq!(found.vendor_id, 0x1AF4);
    }

    #[test]
    fn find_device_returns_none_when_absent() {
        let cfg = FakeConfigSpace::new();
        cfg.add_device(ROOT, device_header(0x8086, 0x1234, 0x06, 0x00));
        assert!(find_device(&cfg, 0x1AF4, 0x1050).is_none());
    }

    #[test]
    fn capability_list_walk_visits_every_entry_in_chain_order() {
        let mut header = device_header(0x1AF4, 0x1042, 0x01, 0x00);
        let mut next_free = 0x40u8;
        let common = append_capability(&mut header, 0x09, &mut next_free);
        write_cap_field(&mut header, common, 3, 1, Width::Byte); // cfg_type = common
        let notify = append_capability(&mut header, 0x09, &mut next_free);
        write_cap_field(&mut header, notify, 3, 2, Width::Byte); // cfg_type = notify

        let cfg = FakeConfigSpace::new();
        cfg.add_device(ROOT, header);

        let first = first_capability(&cfg, ROOT).expect("capability list should be present");
        assert_eq!(first.offset, common);
        let second = next_capability(&cfg, ROOT, first).expect("second capability should follow");
        assert_eq!(second.offset, notify);
        assert!(next_capability(&cfg, ROOT, second).is_none());
    }

    #[test]
    fn no_capability_list_when_status_bit_clear() {
        let cfg = FakeConfigSpace::new();
        cfg.add_device(ROOT, device_header(0x1AF4, 0x1042, 0x01, 0x00));
        assert!(first_capability(&cfg, ROOT).is_none());
    }
}
