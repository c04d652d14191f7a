//! Component K — the boot/init orchestrator.
//!
//! Sequences components A through J exactly the way the original
//! kernel's `kinit`/`kmain` pair does: low-level bring-up (interrupts,
//! memory, ACPI, the APIC/IO-APIC transition, the scheduler) runs
//! inline on the boot stack, `kinit` hands off to the scheduler with
//! the boot stack itself becoming the idle task, and a `kmain` task
//! does PCI/virtio discovery plus the rest of the one-time startup
//! work before falling into the same `kmonitor`-style periodic task
//! list dump.
//!
//! The multiboot-1 info block parsing and the from-scratch RSDP/RSDT
//! walk below are the two pieces of boot infrastructure this crate
//! owns outright rather than treating as an external collaborator —
//! unlike `AcpiPlatform`'s `find_table`/`evaluate_pic_method`, which
//! stand in for a real ACPICA binding, nothing here assumes one exists
//! yet: it has to be built before ACPI can be initialized at all.

use alloc::boxed::Box;

use crate::acpi::{self, AcpiPlatform};
use crate::config::{self, LOW_MEMORY_RESERVED, MULTIBOOT1_MAGIC, PAGE_SIZE, PIC_REMAP_BASE};
use crate::interrupts::{self, pit, tsc};
use crate::memory::frame_allocator::{self, FrameAllocator, RegionTag};
use crate::memory::vspace::{self, Protection, RegionType, VirtSpace};
use crate::memory::{align_down, align_up, heap, pages_for};
use crate::pci::{self, ConfigSpace, PortConfigSpace};
use crate::sched::{self, scheduler};
use crate::util::halt_fatal;
use crate::virtio::{self, blk::VirtioBlk, gpu::VirtioGpu, DeviceKind};

extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

/// Multiboot-1 information block, as GRUB (or any compliant loader)
/// hands it to `kinit` in `ebx`. Only the fields this kernel reads are
/// declared; the struct's tail (framebuffer/VBE info) is never
/// touched, so a `repr(C)` prefix match is sufficient.
#[repr(C)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

const FLAG_MEM_MAP: u32 = 1 << 6;

/// One `multiboot_memory_map_t` entry. `size` describes the length of
/// the record *excluding itself*, the classic multiboot quirk that
/// makes the entries variable-stride.
#[repr(C, packed)]
struct MmapEntry {
    size: u32,
    base_addr: u64,
    length: u64,
    ty: u32,
}

const MMAP_AVAILABLE: u32 = 1;
const MMAP_ACPI_RECLAIMABLE: u32 = 3;
const MMAP_NVS: u32 = 4;

/// Walks the multiboot memory map once to size a fresh
/// [`FrameAllocator`], then a second time to mark every non-available
/// span, the kernel image and the low-memory reservation used.
/// Mirrors `kinit`'s `MemInitialize(info)` call.
fn parse_memory_map(info: &MultibootInfo) -> FrameAllocator {
    if info.flags & FLAG_MEM_MAP == 0 {
        halt_fatal("multiboot info has no memory map (bit 6 of flags unset)");
    }

    let mmap_addr = info.mmap_addr as usize;
    let mmap_end = mmap_addr + info.mmap_length as usize;

    let mut max_phys = 0u64;
    let mut cursor = mmap_addr;
    while cursor < mmap_end {
        let entry = unsafe { &*(cursor as *const MmapEntry) };
        max_phys = max_phys.max(entry.base_addr + entry.length);
        cursor += entry.size as usize + 4;
    }

    let mut allocator = FrameAllocator::new_early(align_up(max_phys as usize, PAGE_SIZE));

    let mut cursor = mmap_addr;
    while cursor < mmap_end {
        let entry = unsafe { &*(cursor as *const MmapEntry) };
        let tag = match entry.ty {
            MMAP_AVAILABLE => None,
            MMAP_ACPI_RECLAIMABLE => Some(RegionTag::E820Acpi),
            MMAP_NVS => Some(RegionTag::E820Nvs),
            2 => Some(RegionTag::E820Reserved),
            _ => Some(RegionTag::E820Bad),
        };
        if let Some(tag) = tag {
            let beg = align_down(entry.base_addr as usize, PAGE_SIZE);
            let end = align_up((entry.base_addr + entry.length) as usize, PAGE_SIZE);
            if end > beg {
                allocator.mark(beg, (end - beg) / PAGE_SIZE, tag, "multiboot mmap entry");
            }
        }
        cursor += entry.size as usize + 4;
    }

    allocator.mark(0, LOW_MEMORY_RESERVED / PAGE_SIZE, RegionTag::RealModeIvt, "low 1 MiB reservation");

    let kernel_start = unsafe { &__kernel_start as *const u8 as usize };
    let kernel_end = unsafe { &__kernel_end as *const u8 as usize };
    let kernel_beg = align_down(kernel_start, PAGE_SIZE);
    let kernel_pages = pages_for(kernel_end - kernel_beg);
    allocator.mark(kernel_beg, kernel_pages, RegionTag::KernelImage, "kernel image");

    allocator
}

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
const BIOS_SCAN_START: usize = 0x000E_0000;
const BIOS_SCAN_END: usize = 0x0010_0000;

fn rsdp_checksum_ok(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == 0
}

/// Scans the BIOS area for the RSDP signature the way every x86
/// firmware-table consumer does absent an EFI system table pointer:
/// every 16-byte-aligned paragraph between 0xE0000 and 0xFFFFF.
fn find_rsdp() -> Option<usize> {
    let mut addr = BIOS_SCAN_START;
    while addr < BIOS_SCAN_END {
        let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, 20) };
        if &bytes[0..8] == RSDP_SIGNATURE && rsdp_checksum_ok(&bytes[0..20]) {
            return Some(addr);
        }
        addr += 16;
    }
    None
}

/// Minimal, from-scratch [`AcpiPlatform`]: a BIOS-area RSDP scan plus
/// an RSDT entry walk to answer `find_table`. `evaluate_pic_method` has
/// no real AML interpreter behind it — the declared external part of
/// this boundary — so it just logs the request.
struct BiosAcpiPlatform {
    rsdt_phys: Option<u32>,
}

impl BiosAcpiPlatform {
    fn discover() -> Self {
        let rsdt_phys = find_rsdp().map(|rsdp| {
            let rsdt_addr_ptr = (rsdp + 16) as *const u32;
            unsafe { rsdt_addr_ptr.read_unaligned() }
        });
        if rsdt_phys.is_none() {
            crate::logln!("warning: no RSDP found in BIOS area, ACPI tables unavailable");
        }
        Self { rsdt_phys }
    }
}

impl AcpiPlatform for BiosAcpiPlatform {
    fn find_table(&self, signature: [u8; 4]) -> Option<&'static [u8]> {
        let rsdt_phys = self.rsdt_phys?;
        let header = unsafe { core::slice::from_raw_parts(rsdt_phys as usize as *const u8, 36) };
        let length = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        let entries = (length - 36) / 4;
        let entry_ptr = (rsdt_phys as usize + 36) as *const u32;

        for i in 0..entries {
            let table_phys = unsafe { entry_ptr.add(i).read_unaligned() } as usize;
            let table_header = unsafe { core::slice::from_raw_parts(table_phys as *const u8, 36) };
            if table_header[0..4] == signature {
                let table_length = u32::from_le_bytes(table_header[4..8].try_into().unwrap()) as usize;
                return Some(unsafe { core::slice::from_raw_parts(table_phys as *const u8, table_length) });
            }
        }
        None
    }

    fn evaluate_pic_method(&self, mode: u32) {
        crate::logln!("ACPI: \\_PIC({}) requested, no AML interpreter bound", mode);
    }
}

/// Discovers one virtio device of `kind`, brings its driver up and
/// registers its legacy PCI interrupt line at `PIC_REMAP_BASE +
/// interrupt_line` — the uniform vector numbering `interrupts::
/// init_apic_routing` already arranged, whether the system ended up in
/// PIC or IO-APIC mode.
fn bring_up_blk(cfg: &dyn ConfigSpace) {
    let Some(info) = virtio::discover(cfg, DeviceKind::Block) else {
        crate::logln!("no virtio-blk device found");
        return;
    };
    let drv: &'static mut VirtioBlk = Box::leak(Box::new(VirtioBlk::new(cfg, info)));
    if let Err(e) = drv.start() {
        crate::logln!("virtio-blk feature negotiation failed: {}", e);
        return;
    }
    let vector = PIC_REMAP_BASE + drv.interrupt_line();
    drv.register_interrupt(vector);
    crate::logln!("virtio-blk ready, interrupt line {} -> vector {:#04x}", drv.interrupt_line(), vector);
}

fn bring_up_gpu(cfg: &dyn ConfigSpace) {
    let Some(info) = virtio::discover(cfg, DeviceKind::Gpu) else {
        crate::logln!("no virtio-gpu device found");
        return;
    };
    let drv: &'static mut VirtioGpu = Box::leak(Box::new(VirtioGpu::new(cfg, info)));
    if let Err(e) = drv.start() {
        crate::logln!("virtio-gpu start failed: {}", e);
        return;
    }
    let (_fb, width, height) = drv.framebuffer();
    crate::logln!("virtio-gpu scanned out at {}x{}", width, height);
}

/// Task body for the background worker that takes over PCI/virtio
/// discovery and periodic diagnostics — the `kmain`/`kmonitor` half of
/// the original's boot sequence, which runs as scheduler tasks rather
/// than inline in `kinit` once the scheduler itself is up.
fn kmain_task(_ctx: usize) -> u32 {
    let cfg = PortConfigSpace;
    bring_up_blk(&cfg);
    bring_up_gpu(&cfg);

    frame_allocator::dump();

    loop {
        scheduler::sleep(2500);
        let mut count = 0usize;
        scheduler::for_each(|task| {
            crate::logln!("  task #{} - {:?} - {}", task.id, task.status, task.name);
            count += 1;
        });
        crate::logln!("kmonitor: {} tasks running, {} interrupts dispatched", count, interrupts::total_dispatch_count());
    }
}

/// The multiboot-1 entry point. Never returns: it either falls through
/// to the idle loop after handing control to the scheduler, or halts
/// fatally on a boot-time precondition failure.
pub fn kinit(multiboot_magic: u32, multiboot_info: *const MultibootInfo) -> ! {
    crate::serial::init();
    crate::logln!("booting...");

    if multiboot_magic != MULTIBOOT1_MAGIC {
        halt_fatal("multiboot magic mismatch, not loaded by a multiboot-1 compliant loader");
    }
    let info = unsafe { &*multiboot_info };

    interrupts::init_early();
    pit::init(config::TIMER_HZ);
    tsc::calibrate();

    let allocator = parse_memory_map(info);
    frame_allocator::init(allocator);

    let kernel_start = unsafe { &__kernel_start as *const u8 as usize };
    let kernel_end = unsafe { &__kernel_end as *const u8 as usize };
    let kernel_beg = align_down(kernel_start, PAGE_SIZE);
    let kernel_pages = pages_for(kernel_end - kernel_beg);

    let space = VirtSpace::new_kernel(kernel_beg, kernel_pages).unwrap_or_else(|e| halt_fatal_with(e));
    space.activate();
    vspace::init_kernel_space(space);

    let heap_pages = pages_for(config::HEAP_SIZE);
    let heap_phys = frame_allocator::alloc(heap_pages, RegionTag::KernelHeap, "kernel heap");
    if heap_phys == 0 {
        halt_fatal("out of memory allocating the kernel heap");
    }
    let heap_virt = vspace::kernel_space()
        .lock()
        .as_mut()
        .unwrap()
        .alloc(heap_phys, heap_pages, Protection::READWRITE, RegionType::KernelHeap, "kernel heap")
        .unwrap_or_else(|e| halt_fatal_with(e));
    unsafe { crate::ALLOCATOR.init(heap_virt, heap_pages * PAGE_SIZE) };

    let platform: &'static BiosAcpiPlatform = Box::leak(Box::new(BiosAcpiPlatform::discover()));
    acpi::init(platform);

    interrupts::init_apic_routing();

    sched::init("kidle");
    crate::cpu::enable_interrupts();

    sched::create_task("kmain", kmain_task, 0);

    crate::logln!("boot complete, idling");
    khalt()
}

fn halt_fatal_with(err: crate::error::KernelError) -> ! {
    crate::logln!("fatal during boot: {}", err);
    crate::cpu::halt_forever()
}

/// Infinite-`hlt` idle loop the boot task (now the scheduler's anchor
/// task) falls into once setup is done. Scheduler ticks run it from
/// here via the timer interrupt's `yield_now` call, not by this
/// function ever returning.
pub fn khalt() -> ! {
    crate::cpu::halt_forever()
}
