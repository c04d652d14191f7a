//! The multiboot-1 boot stub: from `_start`, where a compliant loader
//! hands control over with `eax` = the boot-time magic, `ebx` = a
//! pointer to the [`crate::boot::MultibootInfo`] block, paging off and
//! no guaranteed stack, to [`crate::boot::kinit`] running at its
//! linked higher-half address.
//!
//! Unlike the per-vector ISR stubs in `interrupts::trampoline` (spec.md
//! §1's declared assembly-boundary collaborator, a direct port of
//! `isr.h`), this stub has no counterpart in the original C kernel's
//! retrieved sources — `kmain.c` assumes a loader-provided stack and a
//! running MMU are already in place when it starts. It is this crate's
//! own boot glue, built the way every hand-rolled higher-half multiboot
//! kernel's `boot.S` is ("Higher Half Bare Bones", the standard OSDev
//! recipe): a `.multiboot` header the loader scans for in the image's
//! first 8 KiB, a two-entry temporary page directory using 4 MiB pages
//! that aliases the kernel's low physical load address at both its
//! identity address and `config::KERNEL_VIRT_BASE` so the instruction
//! pointer survives the `mov cr0` that turns paging on, and a `jmp` to
//! a normal, higher-half-linked label once it does. `linker.ld` keeps
//! everything in this file at its physical link address (a
//! `.text.boot`/`.data.boot` pair of sections, not shifted by
//! `KERNEL_VIRT_BASE` the way the rest of the kernel is) for exactly
//! this reason: it has to run correctly before any page table exists.
//!
//! [`crate::memory::vspace::VirtSpace::new_kernel`] replaces this
//! temporary directory with the kernel's real one once the physical
//! frame allocator is up; because both map the kernel's physical image
//! to the same higher-half virtual range, the switch is invisible to
//! whatever happens to be executing when it occurs.

use core::arch::global_asm;

const MULTIBOOT_HEADER_MAGIC: u32 = 0x1BAD_B002;
const MULTIBOOT_FLAG_ALIGN_MODULES: u32 = 1 << 0;
const MULTIBOOT_FLAG_MEMORY_INFO: u32 = 1 << 1;
const MULTIBOOT_HEADER_FLAGS: u32 = MULTIBOOT_FLAG_ALIGN_MODULES | MULTIBOOT_FLAG_MEMORY_INFO;

/// `CR0.PG` (bit 31) and `CR4.PSE` (bit 4).
const CR0_PAGING: u32 = 1 << 31;
const CR4_PSE: u32 = 1 << 4;
/// Present | writable | page-size (4 MiB page), physical base 0.
const BOOT_PDE_4MB_IDENTITY: u32 = 0x83;

global_asm!(
    ".section .multiboot, \"a\"",
    ".align 4",
    ".long {magic}",
    ".long {flags}",
    ".long -({magic} + {flags})",

    // Maps physical [0, 4MiB) at both linear address 0 (so `_start`'s
    // own fetch stream survives `mov cr0`) and at `KERNEL_VIRT_BASE`
    // (so the very next instruction, at its *linked* higher-half
    // address, is already mapped once paging is live). PDE 768 is
    // `KERNEL_VIRT_BASE >> 22`; `config::KERNEL_VIRT_BASE` is a plain
    // integer literal here since `global_asm!` templates can't see
    // Rust `const` paths, only `const` operands substituted below.
    ".section .data.boot, \"aw\"",
    ".align 4096",
    ".global boot_page_directory",
    "boot_page_directory:",
    ".long {pde}",
    ".fill 767, 4, 0",
    ".long {pde}",
    ".fill 255, 4, 0",

    ".section .bss.boot, \"aw\", @nobits",
    ".align 16",
    "boot_stack_bottom:",
    ".skip 0x4000", // 16 KiB; this stack becomes the idle task's once kinit hands off to sched::init
    ".global boot_stack_top",
    "boot_stack_top:",

    ".section .text.boot, \"ax\"",
    ".global _start",
    "_start:",
    "mov edi, eax", // stash multiboot_magic/multiboot_info across the CR0/CR4 writes below
    "mov esi, ebx",
    "lea ecx, [boot_page_directory]",
    "mov cr3, ecx",
    "mov ecx, cr4",
    "or ecx, {cr4_pse}",
    "mov cr4, ecx",
    "mov ecx, cr0",
    "or ecx, {cr0_pg}",
    "mov cr0, ecx",
    "lea ecx, [2f]", // 2f's *linked* address is already the higher-half one; paging makes it reachable
    "jmp ecx",

    // Everything from here on lives in the normal, higher-half-linked
    // `.text` section — reachable only once the jump above lands,
    // since `linker.ld` does not alias this section down low.
    ".section .text",
    "2:",
    "lea esp, [boot_stack_top]",
    "push esi", // &MultibootInfo, kinit's second cdecl argument
    "push edi", // multiboot_magic, kinit's first cdecl argument
    "call kinit",
    // kinit never returns; this is only reached if it somehow does.
    "cli",
    "3:",
    "hlt",
    "jmp 3b",
    magic = const MULTIBOOT_HEADER_MAGIC,
    flags = const MULTIBOOT_HEADER_FLAGS,
    pde = const BOOT_PDE_4MB_IDENTITY,
    cr4_pse = const CR4_PSE,
    cr0_pg = const CR0_PAGING,
);
