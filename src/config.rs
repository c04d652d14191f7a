//! Centralized tunables.
//!
//! Mirrors the teacher's practice of keeping stack/layout constants at
//! the top of a module (`kernel/src/threading/mod.rs`) instead of
//! scattering magic numbers; values themselves come from the original
//! C kernel's `#define`s (`memory.h`, `scheduler.h`, `virtio_ring.h`).

/// Size of a physical/virtual page on x86 without PAE.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Lowest physical address the frame allocator will ever hand out.
/// Keeps the first megabyte (real-mode IVT, EBDA, video memory, BIOS)
/// permanently off limits to `alloc`.
pub const LOW_MEMORY_RESERVED: usize = 0x0010_0000;

/// Higher-half split: kernel lives at and above this virtual address,
/// and it is the address every user address space aliases in from the
/// kernel's own page tables.
pub const KERNEL_VIRT_BASE: usize = 0xC000_0000;

/// Number of directory entries / entries per page table, x86 32-bit.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Kernel heap arena size. The teacher's heap is fixed-size, allocated
/// once out of the physical allocator at boot.
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Guard byte pattern sandwiching every allocation in debug builds.
pub const HEAP_GUARD_BYTES: usize = 16;
pub const HEAP_GUARD_PATTERN: u8 = 0xAC;

/// Default kernel task stack size, in pages.
pub const TASK_STACK_PAGES: usize = 4;

/// Per-vector interrupt callback fan-out is bounded rather than
/// `alloc`-backed: `register`/`unregister` run with interrupts
/// disabled and sometimes from inside an ISR itself (a driver
/// re-arming its own callback), and a handful of fixed slots is plenty
/// for the drivers this kernel actually has.
pub const MAX_CALLBACKS_PER_VECTOR: usize = 4;

/// Scheduler tick rate, matching the LAPIC timer's periodic rate.
pub const TIMER_HZ: u32 = 100;

/// Vector the LAPIC timer's LVT entry is programmed with.
pub const APIC_TIMER_VECTOR: u8 = 0x31;

/// PIC remap base: IRQ0 is remapped to this vector.
pub const PIC_REMAP_BASE: u8 = 0x20;

/// COM1 I/O port base.
pub const COM1_PORT: u16 = 0x3F8;
pub const COM1_BAUD_DIVISOR: u16 = 3; // 115200 / 3 = 38400 8N1

/// Sentinel meaning "block forever" for every timeout-accepting
/// primitive (spec.md §5).
pub const TIMEOUT_INFINITE: u32 = u32::MAX;
/// Sentinel meaning "do not block at all".
pub const TIMEOUT_NONE: u32 = 0;

/// Multiboot-1 loader magic, checked by `kinit`.
pub const MULTIBOOT1_MAGIC: u32 = 0x2BAD_B002;
