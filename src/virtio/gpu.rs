//! Component J (GPU half) — the virtio-gpu 2D front-end.
//!
//! Command/response layouts are ported from `virtio_gpu.h`
//! (`virtio_gpu_ctrl_hdr` and the 2D command structs); the one-shot
//! request/response helper shape — allocate two descriptors, submit,
//! spin-process until the single outstanding request completes, check
//! the response header — follows `virtio_gpu.c`'s
//! `DrvVirtioGpu_GetDispInfo`/`_CreateResource2D`/`_AttachResourceBacking`/
//! `_SetScanout`/`_TransferToHost2D`/`_ResourceFlush` 1:1. Unlike the
//! original's driver-wide `Outstanding` counter, each helper here
//! tracks its own single in-flight request locally: this front-end
//! never overlaps control-queue requests, so there is nothing for a
//! shared counter to add.

use core::mem::size_of;

use crate::error::KResult;
use crate::memory::vspace;
use crate::memory::frame_allocator::{self, RegionTag};
use crate::memory::vspace::{Protection, RegionType};
use crate::memory::{PhysAddr, VirtAddr};
use crate::pci::{ConfigSpace, DeviceInfo};
use crate::sched::scheduler;
use crate::virtio::{self, Transport};

const QUEUE_CONTROL: usize = 0;

const CMD_GET_DISPLAY_INFO: u32 = 0x0100;
const CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
const CMD_SET_SCANOUT: u32 = 0x0103;
const CMD_RESOURCE_FLUSH: u32 = 0x0104;
const CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
const CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;

const RESP_OK_NODATA: u32 = 0x1100;
const RESP_OK_DISPLAY_INFO: u32 = 0x1101;

pub const FORMAT_R8G8B8A8_UNORM: u32 = 67;

pub const FRAMEBUFFER_RESOURCE_ID: u32 = 1;
const MAX_SCANOUTS: usize = 16;

const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;

#[repr(C)]
#[derive(Clone, Copy)]
struct CtrlHeader {
    kind: u32,
    flags: u32,
    fence_id: u64,
    ctx_id: u32,
    padding: u32,
}

impl CtrlHeader {
    fn request(kind: u32) -> Self {
        Self { kind, flags: 0, fence_id: 0, ctx_id: 0, padding: 0 }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Rect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ResourceCreate2D {
    hdr: CtrlHeader,
    resource_id: u32,
    format: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ResourceAttachBacking1 {
    hdr: CtrlHeader,
    resource_id: u32,
    nr_entries: u32,
    entry_addr: u64,
    entry_length: u32,
    entry_padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SetScanout {
    hdr: CtrlHeader,
    r: Rect,
    scanout_id: u32,
    resource_id: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct TransferToHost2D {
    hdr: CtrlHeader,
    r: Rect,
    offset: u64,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ResourceFlush {
    hdr: CtrlHeader,
    r: Rect,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DisplayOne {
    r: Rect,
    enabled: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RespDisplayInfo {
    hdr: CtrlHeader,
    pmodes: [DisplayOne; MAX_SCANOUTS],
}

impl RespDisplayInfo {
    fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

/// The scanout resolution reported by the device — selects the first
/// enabled mode, falling back to 1280x720 when none is. The original
/// driver reads this response but left the mode-selection loop
/// commented out, always using the default; this front-end completes
/// that selection.
#[derive(Debug, Clone, Copy)]
pub struct DisplayInfo {
    pub width: u32,
    pub height: u32,
}

fn virt_to_phys(addr: VirtAddr) -> PhysAddr {
    vspace::kernel_space()
        .lock()
        .as_ref()
        .unwrap()
        .virt_to_phys(addr)
        .expect("virtio-gpu buffer not mapped in kernel space")
}

pub struct VirtioGpu {
    transport: Transport,
    framebuffer: VirtAddr,
    width: u32,
    height: u32,
}

impl VirtioGpu {
    pub fn new(cfg: &dyn ConfigSpace, info: DeviceInfo) -> Self {
        Self {
            transport: Transport::new(cfg, info),
            framebuffer: 0,
            width: 0,
            height: 0,
        }
    }

    /// Negotiates features (`VERSION_1` only, no optional bits per
    /// spec.md §6), picks a scanout resolution, allocates and maps the
    /// framebuffer, wires it up as resource 1 and presents it once.
    pub fn start(&mut self) -> KResult<()> {
        let required = [0u32, virtio::FEATURE_VERSION_1];
        self.transport.start(required, [0, 0])?;

        let display = self.get_display_info().unwrap_or(DisplayInfo {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        });
        self.width = display.width;
        self.height = display.height;

        let fb_bytes = self.width as usize * self.height as usize * 4;
        let pages = crate::memory::pages_for(fb_bytes);
        let fb_phys = frame_allocator::alloc(pages, RegionTag::Hardware, "virtio-gpu-fb");
        if fb_phys == 0 {
            crate::util::halt_fatal("out of memory allocating virtio-gpu framebuffer");
        }
        let fb_virt = vspace::kernel_space()
            .lock()
            .as_mut()
            .unwrap()
            .alloc(fb_phys, pages, Protection::READWRITE, RegionType::Hardware, "virtio-gpu-fb")?;
        unsafe {
            core::ptr::write_bytes(fb_virt as *mut u8, 0, pages * crate::config::PAGE_SIZE);
        }
        self.framebuffer = fb_virt;

        self.create_resource_2d(FRAMEBUFFER_RESOURCE_ID, FORMAT_R8G8B8A8_UNORM, self.width, self.height);
        self.attach_resource_backing(FRAMEBUFFER_RESOURCE_ID, fb_phys, pages * crate::config::PAGE_SIZE);
        self.set_scanout(0, FRAMEBUFFER_RESOURCE_ID, 0, 0, self.width, self.height);
        self.present();
        Ok(())
    }

    pub fn framebuffer(&self) -> (VirtAddr, u32, u32) {
        (self.framebuffer, self.width, self.height)
    }

    /// Submits one request/response descriptor pair and spins until
    /// the device has consumed it, per spec.md §4.J's "built from the
    /// same descriptor-pair pattern" helper shape.
    fn exchange(&mut self, req_ptr: VirtAddr, req_len: usize, resp_ptr: VirtAddr, resp_len: usize) {
        let req_phys = virt_to_phys(req_ptr);
        let resp_phys = virt_to_phys(resp_ptr);

        let mut descs = [0u16; 2];
        loop {
            if self.transport.alloc_descs(QUEUE_CONTROL, &mut descs).is_ok() {
                break;
            }
            scheduler::yield_now();
        }
        self.transport
            .set_desc(QUEUE_CONTROL, descs[0], req_phys, req_len as u32, false, Some(descs[1]));
        self.transport.set_desc(QUEUE_CONTROL, descs[1], resp_phys, resp_len as u32, true, None);
        self.transport.batch_add(QUEUE_CONTROL, &[descs[0]]);
        self.transport.batch_complete(QUEUE_CONTROL);

        let mut remaining = 1usize;
        while remaining != 0 {
            self.transport.reap_completions(QUEUE_CONTROL, |_id, _len| remaining -= 1);
        }
    }

    pub fn get_display_info(&mut self) -> Option<DisplayInfo> {
        let req = CtrlHeader::request(CMD_GET_DISPLAY_INFO);
        let mut resp = RespDisplayInfo::zeroed();
        self.exchange(
            &req as *const _ as VirtAddr,
            size_of::<CtrlHeader>(),
            &mut resp as *mut _ as VirtAddr,
            size_of::<RespDisplayInfo>(),
        );
        if resp.hdr.kind != RESP_OK_DISPLAY_INFO {
            return None;
        }
        resp.pmodes
            .iter()
            .find(|mode| mode.enabled != 0)
            .map(|mode| DisplayInfo { width: mode.r.width, height: mode.r.height })
    }

    pub fn create_resource_2d(&mut self, resource_id: u32, format: u32, width: u32, height: u32) -> bool {
        let req = ResourceCreate2D {
            hdr: CtrlHeader::request(CMD_RESOURCE_CREATE_2D),
            resource_id,
            format,
            width,
            height,
        };
        let mut resp = CtrlHeader::request(0);
        self.exchange(
            &req as *const _ as VirtAddr,
            size_of::<ResourceCreate2D>(),
            &mut resp as *mut _ as VirtAddr,
            size_of::<CtrlHeader>(),
        );
        resp.kind == RESP_OK_NODATA
    }

    pub fn attach_resource_backing(&mut self, resource_id: u32, phys_addr: PhysAddr, length: usize) -> bool {
        let req = ResourceAttachBacking1 {
            hdr: CtrlHeader::request(CMD_RESOURCE_ATTACH_BACKING),
            resource_id,
            nr_entries: 1,
            entry_addr: phys_addr as u64,
            entry_length: length as u32,
            entry_padding: 0,
        };
        let mut resp = CtrlHeader::request(0);
        self.exchange(
            &req as *const _ as VirtAddr,
            size_of::<ResourceAttachBacking1>(),
            &mut resp as *mut _ as VirtAddr,
            size_of::<CtrlHeader>(),
        );
        resp.kind == RESP_OK_NODATA
    }

    pub fn set_scanout(&mut self, scanout_id: u32, resource_id: u32, x: u32, y: u32, width: u32, height: u32) -> bool {
        let req = SetScanout {
            hdr: CtrlHeader::request(CMD_SET_SCANOUT),
            r: Rect { x, y, width, height },
            scanout_id,
            resource_id,
        };
        let mut resp = CtrlHeader::request(0);
        self.exchange(
            &req as *const _ as VirtAddr,
            size_of::<SetScanout>(),
            &mut resp as *mut _ as VirtAddr,
            size_of::<CtrlHeader>(),
        );
        resp.kind == RESP_OK_NODATA
    }

    pub fn transfer_to_host_2d(&mut self, resource_id: u32, x: u32, y: u32, width: u32, height: u32) -> bool {
        let req = TransferToHost2D {
            hdr: CtrlHeader::request(CMD_TRANSFER_TO_HOST_2D),
            r: Rect { x, y, width, height },
            offset: 0,
            resource_id,
            padding: 0,
        };
        let mut resp = CtrlHeader::request(0);
        self.exchange(
            &req as *const _ as VirtAddr,
            size_of::<TransferToHost2D>(),
            &mut resp as *mut _ as VirtAddr,
            size_of::<CtrlHeader>(),
        );
        resp.kind == RESP_OK_NODATA
    }

    pub fn resource_flush(&mut self, resource_id: u32, x: u32, y: u32, width: u32, height: u32) -> bool {
        let req = ResourceFlush {
            hdr: CtrlHeader::request(CMD_RESOURCE_FLUSH),
            r: Rect { x, y, width, height },
            resource_id,
            padding: 0,
        };
        let mut resp = CtrlHeader::request(0);
        self.exchange(
            &req as *const _ as VirtAddr,
            size_of::<ResourceFlush>(),
            &mut resp as *mut _ as VirtAddr,
            size_of::<CtrlHeader>(),
        );
        resp.kind == RESP_OK_NODATA
    }

    /// Transfer-to-host + flush over the full framebuffer, on resource
    /// id 1 — the `Present` helper spec.md §4.J names.
    pub fn present(&mut self) -> bool {
        self.transfer_to_host_2d(FRAMEBUFFER_RESOURCE_ID, 0, 0, self.width, self.height)
            && self.resource_flush(FRAMEBUFFER_RESOURCE_ID, 0, 0, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_header_is_twenty_four_bytes() {
        assert_eq!(size_of::<CtrlHeader>(), 24);
    }

    #[test]
    fn display_info_picks_first_enabled_mode() {
        let mut resp = RespDisplayInfo::zeroed();
        resp.hdr.kind = RESP_OK_DISPLAY_INFO;
        resp.pmodes[2].enabled = 1;
        resp.pmodes[2].r = Rect { x: 0, y: 0, width: 1920, height: 1080 };

        let picked = resp.pmodes.iter().find(|m| m.enabled != 0).map(|m| DisplayInfo {
            width: m.r.width,
            height: m.r.height,
        });
        assert_eq!(picked.unwrap().width, 1920);
        assert_eq!(picked.unwrap().height, 1080);
    }

    #[test]
    fn no_enabled_mode_yields_no_display_info() {
        let resp = RespDisplayInfo::zeroed();
        assert!(resp.pmodes.iter().all(|m| m.enabled == 0));
    }
}
