//! Small shared helpers used across every subsystem.
//!
//! `Locked`/`LazyLock` are grounded on `kernel/src/utils/mod.rs`'s
//! identically-named wrappers. `IrqGuard` gives the "disable
//! interrupts, run the sequence, restore the previous state" critical
//! section spec.md §5 describes as the kernel's sole mutual-exclusion
//! primitive a single reusable type, instead of bare `cli`/`sti` pairs
//! sprinkled through every subsystem.

use core::ops::Deref;

use crate::cpu;

pub struct Locked<T: ?Sized> {
    inner: spin::Mutex<T>,
}

impl<T> Locked<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            inner: spin::Mutex::new(inner),
        }
    }
}

impl<T: ?Sized> Deref for Locked<T> {
    type Target = spin::Mutex<T>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// A `Lazy<Mutex<T>>` that derefs straight to the `Mutex`, so callers
/// write `STATE.lock()` instead of `STATE.lock()` through two layers.
pub struct LazyLock<T> {
    inner: spin::Lazy<spin::Mutex<T>>,
}

impl<T> LazyLock<T> {
    pub const fn new(f: fn() -> spin::Mutex<T>) -> Self {
        Self {
            inner: spin::Lazy::new(f),
        }
    }
}

impl<T> Deref for LazyLock<T> {
    type Target = spin::Mutex<T>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// RAII critical section: disables interrupts on construction and
/// restores whatever the interrupt-enable state was beforehand on
/// drop, rather than unconditionally re-enabling them. Every public
/// operation across memory, interrupts, scheduling and virtio uses
/// this as its only synchronization primitive (spec.md §5) — critical
/// sections never nest with a suspension point.
pub struct IrqGuard {
    was_enabled: bool,
}

impl IrqGuard {
    #[inline]
    pub fn acquire() -> Self {
        let was_enabled = cpu::interrupts_enabled();
        cpu::disable_interrupts();
        Self { was_enabled }
    }
}

impl Drop for IrqGuard {
    #[inline]
    fn drop(&mut self) {
        if self.was_enabled {
            cpu::enable_interrupts();
        }
    }
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & (align - 1) == 0
}

/// Logs `reason` to the serial sink and halts the CPU forever.
/// Reserved for conditions spec.md calls out as fatal rather than
/// recoverable (corrupt heap, unknown-address free, unhandled page
/// fault): these stop the machine instead of unwinding, matching a
/// freestanding kernel's usual `panic`-without-unwind posture.
pub fn halt_fatal(reason: &str) -> ! {
    crate::logln!("fatal: {}", reason);
    cpu::halt_forever()
}
