//! Local APIC: detection, MMIO register access, and timer calibration.
//!
//! Ported from the original kernel's `apic.c` `ApicInitialize`. The
//! MMIO page is owned by the kernel's own virtual address space, the
//! same way every other hardware-backed mapping in this kernel is
//! (`vspace::alloc` with `RegionType::Hardware`), rather than a
//! fixed recursive mapping.

use crate::config::APIC_TIMER_VECTOR;
use crate::cpu::{cpuid, read_msr, write_msr};
use crate::interrupts::tsc;
use crate::memory::frame_allocator::{self, RegionTag};
use crate::memory::vspace::{self, Protection, RegionType};
use crate::util::Locked;

const CPUID_GETFEATURES: u32 = 1;
const CPUID_FEAT_EDX_APIC: u32 = 1 << 9;

const IA32_APIC_BASE_MSR: u32 = 0x1B;
const IA32_APIC_BASE_MSR_ENABLE: u64 = 0x800;

const REG_ID: usize = 0x020;
const REG_VER: usize = 0x030;
const REG_TPR: usize = 0x080;
const REG_EOI: usize = 0x0B0;
const REG_SIV: usize = 0x0F0;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INIT: usize = 0x380;
const REG_TIMER_CURR: usize = 0x390;
const REG_TIMER_DIV: usize = 0x3E0;

const TIMER_LVT_PERIODIC: u32 = 1 << 17;

static APIC_VIRT_BASE: Locked<usize> = Locked::new(0);
static APIC_FREQUENCY_HZ: Locked<u32> = Locked::new(0);

fn cpu_has_local_apic() -> bool {
    let (_, _, _, edx) = cpuid(CPUID_GETFEATURES);
    edx & CPUID_FEAT_EDX_APIC != 0
}

fn apic_base_phys() -> usize {
    (read_msr(IA32_APIC_BASE_MSR) & 0xFFFF_F000) as usize
}

fn read_register(offset: usize) -> u32 {
    debug_assert!(offset % 16 == 0, "APIC register accesses must be 16-byte aligned");
    let addr = (*APIC_VIRT_BASE.lock() + offset) as *const u32;
    unsafe { addr.read_volatile() }
}

fn write_register(offset: usize, value: u32) {
    debug_assert!(offset % 16 == 0, "APIC register accesses must be 16-byte aligned");
    let addr = (*APIC_VIRT_BASE.lock() + offset) as *mut u32;
    unsafe { addr.write_volatile(value) }
}

/// Detects, maps and brings up the Local APIC: spurious vector,
/// priority 0, timer divisor 16, then calibrates the timer against a
/// 500 ms TSC-measured window and arms it periodic at
/// [`crate::config::TIMER_HZ`]. Returns `false` (without touching any
/// state) if this CPU has no Local APIC — mirrors the original, which
/// logs and carries on rather than treating it as fatal.
pub fn enable() -> bool {
    if !cpu_has_local_apic() {
        crate::logln!("no local APIC found");
        return false;
    }

    let phys = apic_base_phys();
    frame_allocator::mark(phys, 1, RegionTag::Hardware, "APIC");
    let virt = vspace::kernel_space()
        .lock()
        .as_mut()
        .unwrap()
        .alloc(phys, 1, Protection::READWRITE | Protection::NOCACHE, RegionType::Hardware, "APIC")
        .expect("failed to map Local APIC MMIO page");
    *APIC_VIRT_BASE.lock() = virt;

    write_msr(IA32_APIC_BASE_MSR, read_msr(IA32_APIC_BASE_MSR) | IA32_APIC_BASE_MSR_ENABLE);
    write_register(REG_SIV, 0x1FF);
    write_register(REG_TPR, 0);
    write_register(REG_TIMER_DIV, 3); // divide by 16

    crate::logln!(
        "Local APIC id={} version={:#x}",
        read_register(REG_ID),
        read_register(REG_VER)
    );

    write_register(REG_LVT_TIMER, APIC_TIMER_VECTOR as u32);

    write_register(REG_TIMER_INIT, u32::MAX);
    tsc::stall_microseconds(500_000);
    let raw_hz = (u32::MAX - read_register(REG_TIMER_CURR)) as u64 * 2;
    let raw_khz = raw_hz / 1000;
    let round_khz = (raw_khz + 50) / 100 * 100;
    let frequency = (round_khz * 1000) as u32;
    *APIC_FREQUENCY_HZ.lock() = frequency;
    crate::logln!("Local APIC timer frequency: {} Hz (raw={} Hz)", frequency, raw_hz);

    write_register(REG_LVT_TIMER, APIC_TIMER_VECTOR as u32 | TIMER_LVT_PERIODIC);
    write_register(REG_TIMER_INIT, frequency / crate::config::TIMER_HZ);

    true
}

pub fn send_eoi() {
    write_register(REG_EOI, 0);
}

pub fn set_task_priority(tpr: u8) {
    write_register(REG_TPR, tpr as u32);
}

pub fn task_priority() -> u8 {
    read_register(REG_TPR) as u8
}

pub fn timer_frequency_hz() -> u32 {
    *APIC_FREQUENCY_HZ.lock()
}
