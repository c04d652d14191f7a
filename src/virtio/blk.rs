//! Component J (block half) — the virtio-blk front-end.
//!
//! Request/response shapes are ported from `virtio_blk.h`
//! (`virtio_blk_req`, feature bits, command/status constants); the
//! three-descriptor chain and the process/reap loop follow
//! `virtio_blk.c`'s `DrvVirtioBlk_Read`/`_ReadAsync`/`_Process` 1:1,
//! including the combined `AsyncCall{Success,Transferred,Event,
//! UserData}` completion record. The one deliberate departure: instead
//! of recovering the owning `DrvVirtioBlk_IoOp` from a bare request
//! pointer via `CONTAINING_RECORD`, completions are looked up in a
//! `BTreeMap` keyed by descriptor-chain head, which needs no unsafe
//! pointer arithmetic to get back to the heap allocation.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::size_of;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::KResult;
use crate::interrupts;
use crate::memory::vspace;
use crate::memory::PhysAddr;
use crate::pci::{ConfigSpace, DeviceInfo};
use crate::sched::scheduler;
use crate::sched::sync::Event;
use crate::virtio::{self, Transport};

const QUEUE: usize = 0;

const TYPE_IN: u32 = 0;

const STATUS_OK: u8 = 0;

const FEATURE_RO: u32 = 1 << 5;
const FEATURE_BLK_SIZE: u32 = 1 << 6;
const FEATURE_DISCARD: u32 = 1 << 13;
const FEATURE_WRITE_ZEROES: u32 = 1 << 14;

/// `virtio_blk_req`: 16 bytes, device-readable.
#[repr(C)]
struct BlkRequest {
    kind: u32,
    ioprio: u32,
    sector: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncCompletion {
    pub success: bool,
    pub transferred: usize,
}

pub type AsyncCallback = fn(&AsyncCall);

/// The async completion record a caller of `read_async` owns and
/// outlives the request by — mirrors the original's `AsyncCall`
/// struct directly: an optional event to signal, an optional callback
/// to invoke, and the result the caller reads after either fires.
pub struct AsyncCall {
    event: Option<&'static Event>,
    callback: Option<AsyncCallback>,
    result: UnsafeCell<AsyncCompletion>,
}

unsafe impl Sync for AsyncCall {}

impl AsyncCall {
    pub const fn new(event: Option<&'static Event>, callback: Option<AsyncCallback>) -> Self {
        Self {
            event,
            callback,
            result: UnsafeCell::new(AsyncCompletion { success: false, transferred: 0 }),
        }
    }

    pub fn result(&self) -> AsyncCompletion {
        unsafe { *self.result.get() }
    }

    fn complete(&self, outcome: AsyncCompletion) {
        unsafe {
            *self.result.get() = outcome;
        }
        if let Some(event) = self.event {
            // TODO: what should happen if this re-enables interrupts mid-ISR?
            event.signal();
        }
        if let Some(callback) = self.callback {
            callback(self);
        }
    }
}

/// One outstanding I/O operation, heap-allocated so the request header
/// and status byte have a stable physical address for the duration of
/// the transfer.
struct IoOp {
    #[allow(dead_code)]
    id: u32,
    req: BlkRequest,
    status_byte: u8,
    finished: bool,
    transferred: usize,
    async_call: Option<&'static AsyncCall>,
}

static NEXT_OP_ID: AtomicU32 = AtomicU32::new(1);

fn virt_to_phys(addr: usize) -> PhysAddr {
    vspace::kernel_space()
        .lock()
        .as_ref()
        .unwrap()
        .virt_to_phys(addr)
        .expect("virtio-blk buffer not mapped in kernel space")
}

pub struct VirtioBlk {
    transport: Transport,
    pending: BTreeMap<u16, Box<IoOp>>,
}

impl VirtioBlk {
    pub fn new(cfg: &dyn ConfigSpace, info: DeviceInfo) -> Self {
        Self {
            transport: Transport::new(cfg, info),
            pending: BTreeMap::new(),
        }
    }

    /// Negotiates features per spec.md §6: `VERSION_1` required,
    /// `RO`/`BLK_SIZE`/`DISCARD`/`WRITE_ZEROES` accepted if offered.
    pub fn start(&mut self) -> KResult<()> {
        let required = [0u32, virtio::FEATURE_VERSION_1];
        let optional = [FEATURE_RO | FEATURE_BLK_SIZE | FEATURE_DISCARD | FEATURE_WRITE_ZEROES, 0];
        self.transport.start(required, optional)
    }

    /// The PCI interrupt line this device was wired to, as reported by
    /// its config space — the caller (boot orchestrator) still has to
    /// translate that into an IDT vector and route it via the IO-APIC.
    pub fn interrupt_line(&self) -> u8 {
        self.transport.interrupt_line
    }

    /// Registers `on_interrupt` for `vector`. `self` must be at a
    /// stable address for as long as the registration lives — callers
    /// own a `'static` instance (e.g. `Box::leak`'d at boot).
    pub fn register_interrupt(&'static mut self, vector: u8) {
        let ctx = self as *mut Self as usize;
        interrupts::register(vector, on_interrupt, ctx);
    }

    fn new_op(sector: u64, async_call: Option<&'static AsyncCall>) -> Box<IoOp> {
        Box::new(IoOp {
            id: NEXT_OP_ID.fetch_add(1, Ordering::Relaxed),
            req: BlkRequest { kind: TYPE_IN, ioprio: 0, sector },
            status_byte: 0xFF,
            finished: false,
            transferred: 0,
            async_call,
        })
    }

    fn submit(&mut self, buf_ptr: usize, buf_len: usize, op: Box<IoOp>) -> u16 {
        let req_phys = virt_to_phys(&op.req as *const _ as usize);
        let status_phys = virt_to_phys(&op.status_byte as *const _ as usize);
        let buf_phys = virt_to_phys(buf_ptr);

        let mut descs = [0u16; 3];
        loop {
            if self.transport.alloc_descs(QUEUE, &mut descs).is_ok() {
                break;
            }
            scheduler::yield_now();
        }

        self.transport
            .set_desc(QUEUE, descs[0], req_phys, size_of::<BlkRequest>() as u32, false, Some(descs[1]));
        self.transport
            .set_desc(QUEUE, descs[1], buf_phys, buf_len as u32, true, Some(descs[2]));
        self.transport.set_desc(QUEUE, descs[2], status_phys, 1, true, None);

        let head = descs[0];
        self.pending.insert(head, op);
        self.transport.batch_add(QUEUE, &[head]);
        self.transport.batch_complete(QUEUE);
        head
    }

    /// Drains the used ring, marking finished operations and firing
    /// the `AsyncCall` (if any) each one carries. Called from the
    /// registered ISR, and from `read`'s own spin-yield loop as a
    /// fallback poll when no interrupt has arrived yet.
    pub fn process(&mut self) {
        let mut completed: Vec<(u16, u32)> = Vec::new();
        self.transport.reap_completions(QUEUE, |head, len| completed.push((head, len)));
        for (head, len) in completed {
            let Some(op) = self.pending.get_mut(&head) else {
                continue;
            };
            op.transferred = (len as usize).saturating_sub(1);
            op.finished = true;
            let outcome = AsyncCompletion {
                success: op.status_byte == STATUS_OK,
                transferred: op.transferred,
            };
            if let Some(call) = op.async_call {
                call.complete(outcome);
                self.pending.remove(&head);
            }
            // Synchronous reads carry no `async_call`; `read` removes
            // the entry itself once it observes `finished`.
        }
    }

    /// Synchronous read: spins in `yield` until the completion path
    /// marks the operation finished, per spec.md §4.J. Returns the
    /// number of bytes transferred, or 0 on a device-reported error.
    pub fn read(&mut self, sector: u64, buf: &mut [u8]) -> usize {
        let op = Self::new_op(sector, None);
        let head = self.submit(buf.as_mut_ptr() as usize, buf.len(), op);

        loop {
            self.process();
            match self.pending.get(&head) {
                Some(op) if !op.finished => scheduler::yield_now(),
                _ => break,
            }
        }
        match self.pending.remove(&head) {
            Some(op) if op.status_byte == STATUS_OK => op.transferred,
            _ => 0,
        }
    }

    /// Asynchronous read: returns immediately. `process` (driven by
    /// the registered interrupt handler) signals `call.event` and/or
    /// invokes `call.callback` once the device completes the request;
    /// `call` must outlive the transfer.
    pub fn read_async(&mut self, sector: u64, buf: &mut [u8], call: &'static AsyncCall) {
        let op = Self::new_op(sector, Some(call));
        self.submit(buf.as_mut_ptr() as usize, buf.len(), op);
    }
}

fn on_interrupt(ctx: usize) {
    let drv = unsafe { &mut *(ctx as *mut VirtioBlk) };
    let _ = drv.transport.read_isr();
    drv.process();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blk_request_is_sixteen_bytes() {
        assert_eq!(size_of::<BlkRequest>(), 16);
    }

    #[test]
    fn required_features_ask_only_for_version_one() {
        let required = [0u32, virtio::FEATURE_VERSION_1];
        assert_eq!(required[0], 0);
        assert_ne!(required[1], 0);
    }

    #[test]
    fn optional_features_cover_the_four_named_bits() {
        let optional = FEATURE_RO | FEATURE_BLK_SIZE | FEATURE_DISCARD | FEATURE_WRITE_ZEROES;
        assert_eq!(optional, (1 << 5) | (1 << 6) | (1 << 13) | (1 << 14));
    }

    #[test]
    fn async_call_starts_with_no_result_until_completed() {
        let call = AsyncCall::new(None, None);
        let result = call.result();
        assert!(!result.success);
        assert_eq!(result.transferred, 0);
    }

    #[test]
    fn async_call_complete_stores_the_outcome_and_signals_the_event() {
        static EVENT: Event = Event::new();
        let call = AsyncCall::new(Some(&EVENT), None);
        call.complete(AsyncCompletion { success: true, transferred: 512 });
        assert!(EVENT.is_signaled());
        let result = call.result();
        assert!(result.success);
        assert_eq!(result.transferred, 512);
    }

    #[test]
    fn async_call_complete_invokes_the_callback() {
        fn saw_it(call: &AsyncCall) {
            assert!(call.result().success);
        }
        let call = AsyncCall::new(None, Some(saw_it));
        call.complete(AsyncCompletion { success: true, transferred: 4096 });
    }
}
