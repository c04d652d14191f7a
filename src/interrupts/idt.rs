//! Builds and loads the 256-entry Interrupt Descriptor Table.
//!
//! Gate layout is the standard 32-bit protected-mode 8-byte descriptor
//! (offset split high/low around a selector and type/attribute byte);
//! every gate points at the matching `isr_stub_N` trampoline from
//! `trampoline.rs`. The kernel code selector is assumed fixed at
//! `0x08`, the flat segment a multiboot loader's own GDT already
//! establishes — this kernel never builds its own GDT.

use core::arch::asm;
use core::mem::size_of;

use crate::interrupts::trampoline::isr_stub_table;
use crate::util::Locked;

const KERNEL_CODE_SELECTOR: u16 = 0x08;
const GATE_PRESENT_RING0_INTERRUPT32: u8 = 0x8E;

#[derive(Clone, Copy)]
#[repr(C)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn new(handler: u32) -> Self {
        Self {
            offset_low: (handler & 0xFFFF) as u16,
            selector: KERNEL_CODE_SELECTOR,
            zero: 0,
            type_attr: GATE_PRESENT_RING0_INTERRUPT32,
            offset_high: (handler >> 16) as u16,
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

struct Idt {
    entries: [IdtEntry; 256],
}

unsafe impl Send for Idt {}

static IDT: Locked<Idt> = Locked::new(Idt {
    entries: [IdtEntry::missing(); 256],
});

/// Populates every gate from `isr_stub_table` and loads the table with
/// `lidt`. Called once from `interrupts::init_early`.
pub fn init() {
    let mut idt = IDT.lock();
    unsafe {
        for vector in 0..256usize {
            idt.entries[vector] = IdtEntry::new(isr_stub_table[vector]);
        }
    }

    let pointer = IdtPointer {
        limit: (size_of::<[IdtEntry; 256]>() - 1) as u16,
        base: idt.entries.as_ptr() as u32,
    };

    unsafe {
        asm!("lidt [{}]", in(reg) &pointer, options(readonly, nostack, preserves_flags));
    }
}
