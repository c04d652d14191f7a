//! Component E+F — interrupt controllers and dispatcher.
//!
//! The IDT/trampoline/callback-registry split follows the teacher's
//! `arch/x86_64/interrupts` layout; the PIC-mode transition, vector
//! numbering (`0x00..0x1F` CPU exceptions, `0x20..0x2F` legacy PIC
//! IRQs, `0x31` the periodic timer) and the page-fault-deferral
//! protocol are ported from the original C kernel's `interrupts.h`
//! (`IntRegisterCallback`/`IntBeginDeferPageFaults` et al.).

pub mod apic;
pub mod idt;
pub mod ioapic;
pub mod pic;
pub mod pit;
pub mod trampoline;
pub mod tsc;

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::config::{APIC_TIMER_VECTOR, MAX_CALLBACKS_PER_VECTOR};
use crate::util::{IrqGuard, Locked};

pub const VECTOR_COUNT: usize = 256;
pub const VECTOR_GP_FAULT: u8 = 0x0D;
pub const VECTOR_PAGE_FAULT: u8 = 0x0E;
pub const VECTOR_PIC_IRQ0: u8 = 0x20;
pub const VECTOR_PIC_IRQ15: u8 = 0x2F;
pub const VECTOR_KEYBOARD: u8 = 0x21;
pub const VECTOR_SYSCALL: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicMode {
    Pic8259,
    Apic,
}

static PIC_MODE: Locked<PicMode> = Locked::new(PicMode::Pic8259);

pub fn pic_mode() -> PicMode {
    *PIC_MODE.lock()
}

pub fn set_pic_mode(mode: PicMode) {
    *PIC_MODE.lock() = mode;
}

/// Saved general-purpose register state, laid out the way
/// `trampoline.rs`'s `isr_common_stub` pushes it onto the stack
/// before calling into `common_handler`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct InterruptFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

type CallbackFn = fn(ctx: usize);

#[derive(Clone, Copy)]
struct CallbackRecord {
    func: CallbackFn,
    ctx: usize,
}

type CallbackList = heapless::Vec<CallbackRecord, MAX_CALLBACKS_PER_VECTOR>;

static CALLBACKS: Locked<Option<[CallbackList; VECTOR_COUNT]>> = Locked::new(None);

fn callbacks() -> spin::MutexGuard<'static, Option<[CallbackList; VECTOR_COUNT]>> {
    let mut guard = CALLBACKS.lock();
    if guard.is_none() {
        *guard = Some(core::array::from_fn(|_| heapless::Vec::new()));
    }
    guard
}

/// Appends a callback to `vector`'s list. Runs under a critical
/// section, matching every other mutator of shared dispatcher state.
/// Silently drops the registration past [`MAX_CALLBACKS_PER_VECTOR`]
/// rather than growing without bound.
pub fn register(vector: u8, func: CallbackFn, ctx: usize) {
    let _guard = IrqGuard::acquire();
    let mut guard = callbacks();
    let list = &mut guard.as_mut().unwrap()[vector as usize];
    if list.push(CallbackRecord { func, ctx }).is_err() {
        crate::logln!("warning: vector {:#04x} already has {} callbacks registered, dropping", vector, MAX_CALLBACKS_PER_VECTOR);
    }
}

/// Removes the first callback matching `func` (and `ctx` if given).
pub fn unregister(vector: u8, func: CallbackFn, ctx: Option<usize>) {
    let _guard = IrqGuard::acquire();
    let mut guard = callbacks();
    let list = &mut guard.as_mut().unwrap()[vector as usize];
    if let Some(pos) = list
        .iter()
        .position(|r| r.func == func && ctx.map(|c| c == r.ctx).unwrap_or(true))
    {
        list.remove(pos);
    }
}

static TICK_COUNT: AtomicU64 = AtomicU64::new(0);
static DISPATCH_COUNT: AtomicU64 = AtomicU64::new(0);
static DEFER_PAGE_FAULTS: AtomicBool = AtomicBool::new(false);
static DEFERRED_FAULT_COUNT: AtomicU32 = AtomicU32::new(0);

/// Per-vector dispatch counters, grounded on the original's
/// `g_interrupt_stats` table — lazily installed the same way
/// `CALLBACKS` is, since a `[AtomicU32; 256]` has no const initializer
/// short of the const-block repeat syntax the rest of this module
/// avoids.
static VECTOR_COUNTS: Locked<Option<[u64; VECTOR_COUNT]>> = Locked::new(None);

pub fn tick_count() -> u64 {
    TICK_COUNT.load(Ordering::Relaxed)
}

/// Total dispatches across every vector.
pub fn total_dispatch_count() -> u64 {
    DISPATCH_COUNT.load(Ordering::Relaxed)
}

/// Dispatches observed for one specific vector, for boot diagnostics
/// and test assertions.
pub fn dispatch_count(vector: u8) -> u64 {
    VECTOR_COUNTS.lock().as_ref().map(|t| t[vector as usize]).unwrap_or(0)
}

fn bump_vector_count(vector: u8) {
    let mut guard = VECTOR_COUNTS.lock();
    let table = guard.get_or_insert_with(|| [0u64; VECTOR_COUNT]);
    table[vector as usize] += 1;
}

/// Enables the page-fault-deferral fast path: faults on a non-NULL
/// page eagerly map a scratch RW/NOCACHE page instead of treating the
/// fault as fatal. Asserts it was not already active.
pub fn begin_defer_page_faults() {
    let was_set = DEFER_PAGE_FAULTS.swap(true, Ordering::SeqCst);
    assert!(!was_set, "begin_defer_page_faults called while already deferring");
    DEFERRED_FAULT_COUNT.store(0, Ordering::SeqCst);
}

/// Disables deferral and reports how many faults it absorbed.
pub fn finish_defer_page_faults() -> u32 {
    let was_set = DEFER_PAGE_FAULTS.swap(false, Ordering::SeqCst);
    assert!(was_set, "finish_defer_page_faults called while not deferring");
    let count = DEFERRED_FAULT_COUNT.load(Ordering::SeqCst);
    crate::logln!("page fault deferral finished: {} faults absorbed", count);
    count
}

fn is_deferring() -> bool {
    DEFER_PAGE_FAULTS.load(Ordering::SeqCst)
}

/// The single entry point every ISR trampoline calls into. Handles
/// PIC/APIC EOI, tick accounting, callback fan-out and the small set
/// of vectors with terminal-policy side effects.
#[no_mangle]
pub extern "C" fn common_handler(frame: &InterruptFrame) {
    DISPATCH_COUNT.fetch_add(1, Ordering::Relaxed);
    let vector = frame.vector as u8;
    bump_vector_count(vector);

    match pic_mode() {
        PicMode::Pic8259 => {
            if (VECTOR_PIC_IRQ0..=VECTOR_PIC_IRQ15).contains(&vector) {
                pic::send_eoi(vector - VECTOR_PIC_IRQ0);
                if vector == VECTOR_PIC_IRQ0 {
                    TICK_COUNT.fetch_add(1, Ordering::Relaxed);
                }
                if vector == VECTOR_KEYBOARD {
                    let _scancode = crate::cpu::inb(0x60);
                }
                run_callbacks(vector, frame);
                return;
            }
        }
        PicMode::Apic => {
            if vector != 0xFF {
                apic::send_eoi();
            }
        }
    }

    run_callbacks(vector, frame);

    match vector {
        VECTOR_GP_FAULT => {
            crate::logln!("#GP fault: {:#x?}", frame);
            crate::util::halt_fatal("general protection fault");
        }
        VECTOR_PAGE_FAULT => handle_page_fault(frame),
        v if v == APIC_TIMER_VECTOR => {
            TICK_COUNT.fetch_add(1, Ordering::Relaxed);
            crate::sched::scheduler::yield_now();
        }
        VECTOR_SYSCALL => {
            // placeholder: ebx holds a pointer to a NUL-terminated
            // string to print.
            let ptr = frame.ebx as *const u8;
            if !ptr.is_null() {
                unsafe {
                    let mut len = 0;
                    while *ptr.add(len) != 0 {
                        len += 1;
                    }
                    let s = core::str::from_utf8_unchecked(core::slice::from_raw_parts(ptr, len));
                    crate::serial!("{}", s);
                }
            }
        }
        _ => {
            if !(VECTOR_PIC_IRQ0..=VECTOR_PIC_IRQ15).contains(&vector) {
                crate::logln!("unknown interrupt {:#04x}", vector);
            }
        }
    }
}

fn run_callbacks(vector: u8, _frame: &InterruptFrame) {
    let guard = callbacks();
    if let Some(table) = guard.as_ref() {
        for record in table[vector as usize].iter() {
            (record.func)(record.ctx);
        }
    }
}

fn handle_page_fault(_frame: &InterruptFrame) {
    let addr = crate::cpu::read_cr2();
    if addr != 0 && is_deferring() {
        let page = crate::memory::align_down(addr, crate::config::PAGE_SIZE);
        let phys = crate::memory::frame_allocator::alloc(
            1,
            crate::memory::frame_allocator::RegionTag::KernelHeap,
            "deferred page fault",
        );
        if phys != 0 {
            crate::memory::vspace::kernel_space()
                .lock()
                .as_mut()
                .unwrap()
                .map(
                    phys,
                    page,
                    1,
                    crate::memory::vspace::Protection::READWRITE | crate::memory::vspace::Protection::NOCACHE,
                    crate::memory::vspace::RegionType::Fault,
                    "deferred fault",
                )
                .ok();
            DEFERRED_FAULT_COUNT.fetch_add(1, Ordering::SeqCst);
            return;
        }
    }
    crate::logln!("page fault at {:#x}, not deferring: fatal", addr);
    crate::util::halt_fatal("unhandled page fault");
}

/// Brings up the IDT, remaps the PIC, and enables IRQ0/IRQ1. Called
/// once during early boot, before the APIC/IO-APIC transition.
pub fn init_early() {
    idt::init();
    pic::remap();
    pic::unmask(0);
    pic::unmask(1);
}

/// Switches routing from the 8259 to Local APIC + IO-APIC once ACPI
/// is available, then tells firmware which routing model is active.
pub fn init_apic_routing() {
    if !apic::enable() {
        return;
    }
    pic::disable();
    ioapic::init();
    set_pic_mode(PicMode::Apic);
    crate::acpi::set_pic_mode(PicMode::Apic as u32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    static HITS: AtomicUsize = AtomicUsize::new(0);
    static LAST_CTX: AtomicUsize = AtomicUsize::new(0);

    /// `CALLBACKS`/`DEFER_PAGE_FAULTS` are module-level statics; held
    /// for the duration of each test so `cargo test`'s default
    /// parallel execution can't interleave two tests' view of them.
    static TEST_LOCK: spin::Mutex<()> = spin::Mutex::new(());

    fn record_hit(ctx: usize) {
        HITS.fetch_add(1, AtomicOrdering::SeqCst);
        LAST_CTX.store(ctx, AtomicOrdering::SeqCst);
    }

    fn other_callback(_ctx: usize) {}

    fn reset() {
        HITS.store(0, AtomicOrdering::SeqCst);
        LAST_CTX.store(0, AtomicOrdering::SeqCst);
        *CALLBACKS.lock() = None;
    }

    #[test]
    fn register_then_dispatch_runs_the_callback() {
        let _serial = TEST_LOCK.lock();
        reset();
        register(VECTOR_KEYBOARD, record_hit, 42);
        run_callbacks(VECTOR_KEYBOARD, &InterruptFrame::default());
        assert_eq!(HITS.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(LAST_CTX.load(AtomicOrdering::SeqCst), 42);
    }

    #[test]
    fn unregister_removes_only_the_matching_entry() {
        let _serial = TEST_LOCK.lock();
        reset();
        register(VECTOR_KEYBOARD, record_hit, 1);
        register(VECTOR_KEYBOARD, other_callback, 2);
        unregister(VECTOR_KEYBOARD, other_callback, None);
        run_callbacks(VECTOR_KEYBOARD, &InterruptFrame::default());
        assert_eq!(HITS.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn unregister_matches_on_context_when_given() {
        let _serial = TEST_LOCK.lock();
        reset();
        register(VECTOR_KEYBOARD, record_hit, 1);
        register(VECTOR_KEYBOARD, record_hit, 2);
        unregister(VECTOR_KEYBOARD, record_hit, Some(1));
        run_callbacks(VECTOR_KEYBOARD, &InterruptFrame::default());
        assert_eq!(HITS.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(LAST_CTX.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn registrations_past_capacity_are_dropped_not_panicking() {
        let _serial = TEST_LOCK.lock();
        reset();
        for _ in 0..(MAX_CALLBACKS_PER_VECTOR + 2) {
            register(VECTOR_KEYBOARD, record_hit, 7);
        }
        run_callbacks(VECTOR_KEYBOARD, &InterruptFrame::default());
        assert_eq!(HITS.load(AtomicOrdering::SeqCst), MAX_CALLBACKS_PER_VECTOR);
    }

    #[test]
    fn page_fault_deferral_tracks_absorbed_count() {
        let _serial = TEST_LOCK.lock();
        DEFER_PAGE_FAULTS.store(false, AtomicOrdering::SeqCst);
        begin_defer_page_faults();
        assert!(is_deferring());
        DEFERRED_FAULT_COUNT.fetch_add(3, AtomicOrdering::SeqCst);
        assert_eq!(finish_defer_page_faults(), 3);
        assert!(!is_deferring());
    }

    #[test]
    #[should_panic(expected = "already deferring")]
    fn begin_defer_page_faults_twice_is_fatal() {
        let _serial = TEST_LOCK.lock();
        DEFER_PAGE_FAULTS.store(false, AtomicOrdering::SeqCst);
        begin_defer_page_faults();
        begin_defer_page_faults();
    }
}
