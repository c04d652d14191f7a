//! Component B — physical frame allocator.
//!
//! Bitmap allocation pattern (bit set ⇒ free, linear scan for the
//! first free run) is grounded on the teacher's
//! `memory/frame_allocator.rs` `RegionAllocator`. The typed region
//! list, tag numbering and the "highest tag wins" coalesce policy
//! follow the original C kernel's `memory.h` `PhysRegion` /
//! `PhysMark`/`PhysAlloc`/`PhysFree` family 1:1 — the teacher has no
//! region-tracking layer of its own (limine reports usable RAM
//! directly), so this part of the module is newly written in the
//! teacher's idiom rather than adapted from its code.

use alloc::vec::Vec;

use crate::config::{LOW_MEMORY_RESERVED, PAGE_SIZE};
use crate::util::{align_down, align_up, IrqGuard, Locked};

/// Region classification. Numeric order matters: coalescing a pair of
/// overlapping regions keeps whichever has the higher tag, mirroring
/// the original kernel's `PHYS_REGION_TYPE_*` numbering where E820
/// bookkeeping types are the smallest and kernel/hardware reservations
/// are the largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum RegionTag {
    Free = 0,
    E820Reserved = 101,
    E820Acpi = 102,
    E820Nvs = 103,
    E820Bad = 104,
    RealModeIvt = 200,
    Ebda = 201,
    VideoMemory = 202,
    VideoBios = 203,
    MotherboardBios = 204,
    KernelImage = 400,
    KernelBitmap = 401,
    KernelPageDir = 402,
    KernelHeap = 403,
    KernelTaskStack = 404,
    Hardware = 500,
}

#[derive(Debug, Clone)]
pub struct PhysRegion {
    pub tag: RegionTag,
    pub beg: usize,
    pub end: usize,
    pub description: &'static str,
}

impl PhysRegion {
    fn size(&self) -> usize {
        self.end - self.beg
    }

    fn overlaps(&self, other: &PhysRegion) -> bool {
        self.beg < other.end && other.beg < self.end
    }

    fn touches(&self, other: &PhysRegion) -> bool {
        self.beg <= other.end && other.beg <= self.end
    }
}

pub struct FrameAllocator {
    bitmap: Vec<u8>,
    regions: Vec<PhysRegion>,
    max_phys: usize,
}

impl FrameAllocator {
    /// Bootstrap allocator over a single span, used before a heap
    /// exists: everything is free except what `mark` reserves
    /// explicitly. `max_phys` is the highest address the bitmap
    /// tracks.
    pub fn new_early(max_phys: usize) -> Self {
        let frames = max_phys / PAGE_SIZE;
        let bytes = align_up(frames, 8) / 8;
        Self {
            bitmap: alloc::vec![0xFFu8; bytes],
            regions: Vec::new(),
            max_phys,
        }
    }

    fn bit_loc(addr: usize) -> (usize, usize) {
        let frame = addr / PAGE_SIZE;
        (frame / 8, frame % 8)
    }

    fn set_bit_used(&mut self, addr: usize) {
        let (row, col) = Self::bit_loc(addr);
        self.bitmap[row] &= !(1 << col);
    }

    fn set_bit_free(&mut self, addr: usize) {
        let (row, col) = Self::bit_loc(addr);
        self.bitmap[row] |= 1 << col;
    }

    fn bit_is_free(&self, addr: usize) -> bool {
        let (row, col) = Self::bit_loc(addr);
        self.bitmap[row] & (1 << col) != 0
    }

    /// Marks `pages` frames starting at `start` used, tags the span
    /// and coalesces it into the region list. `start` must be page
    /// aligned; violating this is a boot-time programming error.
    pub fn mark(&mut self, start: usize, pages: usize, tag: RegionTag, description: &'static str) {
        let _guard = IrqGuard::acquire();
        assert!(
            align_down(start, PAGE_SIZE) == start,
            "frame_allocator::mark: unaligned start {:#x}",
            start
        );
        let end = start + pages * PAGE_SIZE;
        let mut addr = start;
        while addr < end {
            self.set_bit_used(addr);
            addr += PAGE_SIZE;
        }
        self.insert_region(PhysRegion {
            tag,
            beg: start,
            end,
            description,
        });
    }

    /// Searches for the first run of `pages` free bits at or above
    /// the low-memory reservation, marks it used and records a
    /// region. Returns `0` on exhaustion, matching the sentinel the
    /// original allocator returns rather than an `Option`.
    pub fn alloc(&mut self, pages: usize, tag: RegionTag, description: &'static str) -> usize {
        let _guard = IrqGuard::acquire();
        let start_frame = LOW_MEMORY_RESERVED / PAGE_SIZE;
        let total_frames = self.max_phys / PAGE_SIZE;

        let mut run_start: Option<usize> = None;
        let mut run_len = 0usize;

        for frame in start_frame..total_frames {
            let addr = frame * PAGE_SIZE;
            if self.bit_is_free(addr) {
                if run_start.is_none() {
                    run_start = Some(frame);
                }
                run_len += 1;
                if run_len == pages {
                    let start = run_start.unwrap() * PAGE_SIZE;
                    for f in 0..pages {
                        self.set_bit_used(start + f * PAGE_SIZE);
                    }
                    self.insert_region(PhysRegion {
                        tag,
                        beg: start,
                        end: start + pages * PAGE_SIZE,
                        description,
                    });
                    return start;
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        0
    }

    /// Frees the region whose `beg == start`. Fatal on an unknown
    /// address or an attempt to free an already-free region, matching
    /// the original kernel's `PhysFree` assertions.
    pub fn free(&mut self, start: usize) {
        let _guard = IrqGuard::acquire();
        let idx = self
            .regions
            .iter()
            .position(|r| r.beg == start)
            .unwrap_or_else(|| panic!("frame_allocator::free: no region at {:#x}", start));
        assert!(
            self.regions[idx].tag != RegionTag::Free,
            "frame_allocator::free: double free at {:#x}",
            start
        );

        let region = self.regions.remove(idx);
        let mut addr = region.beg;
        while addr < region.end {
            self.set_bit_free(addr);
            addr += PAGE_SIZE;
        }
        self.insert_region(PhysRegion {
            tag: RegionTag::Free,
            beg: region.beg,
            end: region.end,
            description: "free",
        });
    }

    /// Inserts `region`, then sorts and coalesces the list so that
    /// regions stay non-overlapping and ordered by `beg`. Overlaps are
    /// resolved by highest-tag-wins: the loser is deleted, split, or
    /// trimmed depending on containment.
    fn insert_region(&mut self, region: PhysRegion) {
        self.regions.push(region);
        self.regions.sort_by_key(|r| r.beg);
        self.coalesce();
    }

    fn coalesce(&mut self) {
        let mut i = 0;
        while i + 1 < self.regions.len() {
            let a = self.regions[i].clone();
            let b = self.regions[i + 1].clone();

            if a.tag == b.tag && a.touches(&b) {
                self.regions[i].end = a.end.max(b.end);
                self.regions.remove(i + 1);
                continue;
            }

            if a.overlaps(&b) {
                let (winner_idx, loser_idx, winner, loser) = if a.tag >= b.tag {
                    (i, i + 1, a, b)
                } else {
                    (i + 1, i, b, a)
                };

                if winner.beg <= loser.beg && winner.end >= loser.end {
                    // winner fully contains loser: drop the loser.
                    self.regions.remove(loser_idx);
                    continue;
                }

                if loser.beg < winner.beg && loser.end > winner.end {
                    // loser fully contains winner: split the loser in two.
                    let mut left = loser.clone();
                    left.end = winner.beg;
                    let mut right = loser.clone();
                    right.beg = winner.end;
                    self.regions.remove(loser_idx);
                    if right.beg < right.end {
                        self.regions.insert(loser_idx, right);
                    }
                    if left.beg < left.end {
                        self.regions.insert(loser_idx, left);
                    }
                    self.regions.sort_by_key(|r| r.beg);
                    continue;
                }

                // partial overlap at one edge: trim the loser.
                if loser.beg < winner.beg {
                    self.regions[loser_idx].end = winner.beg;
                } else {
                    self.regions[loser_idx].beg = winner.end;
                }
                self.regions.sort_by_key(|r| r.beg);
                continue;
            }

            i += 1;
        }
    }

    pub fn regions(&self) -> &[PhysRegion] {
        &self.regions
    }

    pub fn bytes_free(&self) -> usize {
        self.bitmap.iter().map(|b| b.count_ones() as usize).sum::<usize>() * PAGE_SIZE
    }

    pub fn bytes_used(&self) -> usize {
        self.max_phys - self.bytes_free()
    }

    /// Logs every tracked region, grounded on the original's
    /// `phys_dump_regions` boot diagnostic.
    pub fn dump(&self) {
        crate::logln!(
            "phys regions: {} free, {} used ({} entries)",
            self.bytes_free(),
            self.bytes_used(),
            self.regions.len()
        );
        for region in &self.regions {
            crate::logln!(
                "  [{:#010x}-{:#010x}) {:?} - {}",
                region.beg,
                region.end,
                region.tag,
                region.description
            );
        }
    }
}

lazy_static::lazy_static! {
    static ref FRAME_ALLOCATOR: Locked<Option<FrameAllocator>> = Locked::new(None);
}

/// Installs the allocator once the multiboot memory map has been
/// parsed. Must run exactly once, before any other frame_allocator
/// call.
pub fn init(allocator: FrameAllocator) {
    *FRAME_ALLOCATOR.lock() = Some(allocator);
}

pub fn mark(start: usize, pages: usize, tag: RegionTag, description: &'static str) {
    FRAME_ALLOCATOR
        .lock()
        .as_mut()
        .expect("frame allocator not initialized")
        .mark(start, pages, tag, description);
}

pub fn alloc(pages: usize, tag: RegionTag, description: &'static str) -> usize {
    FRAME_ALLOCATOR
        .lock()
        .as_mut()
        .expect("frame allocator not initialized")
        .alloc(pages, tag, description)
}

pub fn free(start: usize) {
    FRAME_ALLOCATOR
        .lock()
        .as_mut()
        .expect("frame allocator not initialized")
        .free(start);
}

pub fn bytes_free() -> usize {
    FRAME_ALLOCATOR
        .lock()
        .as_ref()
        .map(FrameAllocator::bytes_free)
        .unwrap_or(0)
}

pub fn dump() {
    if let Some(allocator) = FRAME_ALLOCATOR.lock().as_ref() {
        allocator.dump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(max_phys: usize) -> FrameAllocator {
        FrameAllocator::new_early(max_phys)
    }

    #[test]
    fn alloc_respects_low_memory_reservation() {
        let mut fa = fresh(16 * 1024 * 1024);
        let start = fa.alloc(1, RegionTag::KernelHeap, "test");
        assert!(start >= LOW_MEMORY_RESERVED);
    }

    #[test]
    fn alloc_then_free_returns_frame_to_pool() {
        let mut fa = fresh(16 * 1024 * 1024);
        let before = fa.bytes_free();
        let start = fa.alloc(4, RegionTag::KernelHeap, "test");
        assert_ne!(start, 0);
        assert_eq!(fa.bytes_free(), before - 4 * PAGE_SIZE);
        fa.free(start);
        assert_eq!(fa.bytes_free(), before);
    }

    #[test]
    fn exhaustion_returns_zero_sentinel() {
        let mut fa = fresh(2 * 1024 * 1024);
        let total_pages = (2 * 1024 * 1024 - LOW_MEMORY_RESERVED) / PAGE_SIZE;
        let first = fa.alloc(total_pages, RegionTag::KernelHeap, "all");
        assert_ne!(first, 0);
        assert_eq!(fa.alloc(1, RegionTag::KernelHeap, "overflow"), 0);
    }

    #[test]
    fn equal_tag_touching_regions_coalesce() {
        let mut fa = fresh(16 * 1024 * 1024);
        fa.mark(LOW_MEMORY_RESERVED, 2, RegionTag::KernelImage, "a");
        fa.mark(LOW_MEMORY_RESERVED + 2 * PAGE_SIZE, 2, RegionTag::KernelImage, "b");
        let kernel_regions: Vec<_> = fa
            .regions()
            .iter()
            .filter(|r| r.tag == RegionTag::KernelImage)
            .collect();
        assert_eq!(kernel_regions.len(), 1);
        assert_eq!(kernel_regions[0].end - kernel_regions[0].beg, 4 * PAGE_SIZE);
    }

    #[test]
    fn higher_tag_splits_lower_tag_region() {
        let mut fa = fresh(16 * 1024 * 1024);
        fa.mark(LOW_MEMORY_RESERVED, 10, RegionTag::E820Reserved, "reserved");
        fa.mark(LOW_MEMORY_RESERVED + 4 * PAGE_SIZE, 2, RegionTag::Hardware, "mmio");

        let hw = fa
            .regions()
            .iter()
            .find(|r| r.tag == RegionTag::Hardware)
            .unwrap();
        assert_eq!(hw.beg, LOW_MEMORY_RESERVED + 4 * PAGE_SIZE);

        let reserved: Vec<_> = fa
            .regions()
            .iter()
            .filter(|r| r.tag == RegionTag::E820Reserved)
            .collect();
        assert_eq!(reserved.len(), 2);
    }

    #[test]
    #[should_panic]
    fn mark_with_unaligned_start_panics() {
        let mut fa = fresh(16 * 1024 * 1024);
        fa.mark(LOW_MEMORY_RESERVED + 1, 1, RegionTag::KernelHeap, "bad");
    }

    #[test]
    #[should_panic]
    fn free_unknown_address_panics() {
        let mut fa = fresh(16 * 1024 * 1024);
        fa.free(LOW_MEMORY_RESERVED);
    }
}
