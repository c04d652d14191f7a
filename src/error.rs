//! Error vocabulary shared across subsystems.
//!
//! Grounded on `kernel/src/utils/errors.rs`'s `ErrorStatus` enum: a
//! flat, `Copy`, `thiserror`-derived enum that every fallible kernel
//! API converts into, so call sites match on one concrete type. This
//! does not replace the sentinel-return style spec.md §7 mandates for
//! allocators (`alloc` still returns `0`/`None`) — it backs the
//! smaller set of operations that spec.md's taxonomy calls out as
//! returning a typed failure rather than a bare sentinel: mapping
//! failures, protocol violations, and ACPI lookups.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("out of memory")]
    Oom,
    #[error("address is not page aligned")]
    Unaligned,
    #[error("address is already mapped")]
    AlreadyMapped,
    #[error("address is not mapped")]
    NotMapped,
    #[error("no virtual region covers this address")]
    NoSuchRegion,
    #[error("virtio device violated the protocol contract")]
    ProtocolViolation,
    #[error("required virtio feature bit was not offered by the device")]
    MissingFeature,
    #[error("not enough free descriptors in the virtqueue")]
    NoDescriptors,
    #[error("ACPI method or table not found")]
    AcpiNotFound,
    #[error("operation timed out")]
    TimedOut,
}

pub type KResult<T> = Result<T, KernelError>;
