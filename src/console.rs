//! The `Sink` abstraction logging and diagnostics write through.
//!
//! spec.md keeps the actual display/terminal surface out of scope (an
//! external collaborator); what it does require is somewhere for
//! `logln!`/`info!`/`debug!` to go. `Sink` is that seam, grounded on
//! the teacher's `print!`/`serial!` split in `kernel/src/main.rs`:
//! kernel code never writes to a port directly, it goes through a
//! trait object any backend (serial, a future framebuffer terminal)
//! can implement.

use core::fmt;

/// Anything logging can be written to: `write_str` must never block
/// on anything other than the device itself (no scheduler
/// involvement), since logging runs inside interrupt context too.
pub trait Sink: Send {
    fn write_str(&mut self, s: &str);
}

impl fmt::Write for &mut dyn Sink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (**self).write_str(s);
        Ok(())
    }
}
