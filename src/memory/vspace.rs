//! Component C — virtual address spaces & page tables.
//!
//! The `Entry`/`EntryFlags` split and the "flags live in the low bits
//! of the physical address" representation are grounded on the
//! teacher's `memory/paging.rs`, narrowed from the teacher's 64-bit
//! four-level format to the 32-bit two-level directory/table pair the
//! original C kernel's `memory.h` `PageDirectory`/`PageTable` describe.
//! The `VirtRegion` list and the `map`/`unmap`/`alloc`/`free`/
//! `phys_to_virt`/`virt_to_phys` operation set are ported from
//! `VirtMapMemory`/`VirtSpaceMap`/`VirtSpaceAlloc`/`PhysToVirt` in the
//! same header, expressed as methods on a `VirtSpace` rather than a
//! family of freestanding C functions.
//!
//! Every physical frame this module touches (page directories, page
//! tables) is reachable at `phys + KERNEL_VIRT_BASE`: the kernel's own
//! upper quarter is a straight offset alias over all physical RAM it
//! manages, the same trick the original boot code uses for early
//! access via `KEARLY_PHYS_TO_VIRT`.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::{ENTRIES_PER_TABLE, KERNEL_VIRT_BASE, PAGE_SIZE};
use crate::cpu;
use crate::error::{KResult, KernelError};
use crate::memory::frame_allocator::{self, RegionTag};
use crate::memory::{align_down, align_up, PhysAddr, VirtAddr};
use crate::util::IrqGuard;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READONLY  = 1 << 0;
        const READWRITE = 1 << 1;
        const NOCACHE   = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct EntryFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const CACHE_DISABLE = 1 << 4;
    }
}

impl EntryFlags {
    fn from_protection(prot: Protection, user: bool) -> Self {
        let mut flags = EntryFlags::PRESENT;
        if prot.contains(Protection::READWRITE) {
            flags |= EntryFlags::WRITABLE;
        }
        if prot.contains(Protection::NOCACHE) {
            flags |= EntryFlags::CACHE_DISABLE;
        }
        if user {
            flags |= EntryFlags::USER;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum RegionType {
    Hardware = 0,
    Acpi = 1,
    KernelImage = 2,
    KernelPageDir = 3,
    KernelHeap = 4,
    KernelTaskStack = 5,
    Fault = 7,
}

#[derive(Debug, Clone)]
pub struct VirtRegion {
    pub protection: Protection,
    pub ty: RegionType,
    pub physical: PhysAddr,
    pub beg: VirtAddr,
    pub end: VirtAddr,
    pub description: &'static str,
}

impl VirtRegion {
    fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.beg && addr < self.end
    }
}

#[repr(C, align(4096))]
struct RawTable {
    entries: [u32; ENTRIES_PER_TABLE],
}

impl RawTable {
    fn entry_flags(raw: u32) -> EntryFlags {
        EntryFlags::from_bits_truncate(raw & 0xFFF)
    }

    fn entry_phys(raw: u32) -> PhysAddr {
        (raw & !0xFFF) as PhysAddr
    }
}

fn phys_ram_virt(phys: PhysAddr) -> VirtAddr {
    phys + KERNEL_VIRT_BASE
}

fn table_at(phys: PhysAddr) -> &'static mut RawTable {
    unsafe { &mut *(phys_ram_virt(phys) as *mut RawTable) }
}

fn pd_index(virt: VirtAddr) -> usize {
    (virt >> 22) & 0x3FF
}

fn pt_index(virt: VirtAddr) -> usize {
    (virt >> 12) & 0x3FF
}

/// A page directory plus its 1024 page tables, and the region list
/// that tracks what every mapped page is for.
pub struct VirtSpace {
    pub page_dir_phys: PhysAddr,
    table_phys: [PhysAddr; ENTRIES_PER_TABLE],
    regions: Vec<VirtRegion>,
    begin_alloc: usize,
    is_kernel: bool,
}

impl VirtSpace {
    /// Builds the kernel's own address space: allocates 1025 frames
    /// (one directory, 1024 tables), installs every PDE, identity-maps
    /// VGA text memory, maps the kernel image at `KERNEL_VIRT_BASE`
    /// and maps the table array over itself so table edits after CR3
    /// is loaded go through the same alias this module always uses.
    pub fn new_kernel(kernel_phys_base: PhysAddr, kernel_pages: usize) -> KResult<Self> {
        let dir_phys = frame_allocator::alloc(1, RegionTag::KernelPageDir, "page directory");
        if dir_phys == 0 {
            return Err(KernelError::Oom);
        }

        let mut table_phys = [0usize; ENTRIES_PER_TABLE];
        for slot in table_phys.iter_mut() {
            let phys = frame_allocator::alloc(1, RegionTag::KernelPageDir, "page table");
            if phys == 0 {
                return Err(KernelError::Oom);
            }
            *slot = phys;
            table_at(phys).entries.fill(0);
        }

        let dir = table_at(dir_phys);
        for (i, &table) in table_phys.iter().enumerate() {
            dir.entries[i] = (table as u32) | EntryFlags::PRESENT.bits() | EntryFlags::WRITABLE.bits();
        }

        let mut space = Self {
            page_dir_phys: dir_phys,
            table_phys,
            regions: Vec::new(),
            begin_alloc: 0,
            is_kernel: true,
        };

        space.map_raw(
            0x000A_0000,
            0x000A_0000,
            (0x000C_0000 - 0x000A_0000) / PAGE_SIZE,
            EntryFlags::from_protection(Protection::READWRITE, false),
        );
        space.regions.push(VirtRegion {
            protection: Protection::READWRITE,
            ty: RegionType::Hardware,
            physical: 0x000A_0000,
            beg: 0x000A_0000,
            end: 0x000C_0000,
            description: "VGA text memory",
        });

        let kernel_pages_rounded = kernel_pages;
        space.map_raw(
            kernel_phys_base,
            KERNEL_VIRT_BASE,
            kernel_pages_rounded,
            EntryFlags::from_protection(Protection::READWRITE, false),
        );
        space.regions.push(VirtRegion {
            protection: Protection::READWRITE,
            ty: RegionType::KernelImage,
            physical: kernel_phys_base,
            beg: KERNEL_VIRT_BASE,
            end: KERNEL_VIRT_BASE + kernel_pages_rounded * PAGE_SIZE,
            description: "kernel image",
        });

        for &phys in table_phys.iter().chain(core::iter::once(&dir_phys)) {
            space.map_raw(
                phys,
                phys_ram_virt(phys),
                1,
                EntryFlags::from_protection(Protection::READWRITE, false),
            );
        }
        space.regions.push(VirtRegion {
            protection: Protection::READWRITE,
            ty: RegionType::KernelPageDir,
            physical: dir_phys,
            beg: phys_ram_virt(dir_phys),
            end: phys_ram_virt(dir_phys) + PAGE_SIZE,
            description: "page directory and tables",
        });

        space.sort_regions();
        space.begin_alloc = KERNEL_VIRT_BASE + kernel_pages_rounded * PAGE_SIZE;

        Ok(space)
    }

    /// Creates a user address space: fresh lower-3GiB page tables, the
    /// upper quarter aliased directly from the kernel's own table
    /// array so kernel mappings are always visible.
    pub fn new_user(kernel: &VirtSpace) -> KResult<Self> {
        assert!(kernel.is_kernel);
        let dir_phys = frame_allocator::alloc(1, RegionTag::KernelPageDir, "user page directory");
        if dir_phys == 0 {
            return Err(KernelError::Oom);
        }

        let mut table_phys = [0usize; ENTRIES_PER_TABLE];
        let kernel_start_pde = pd_index(KERNEL_VIRT_BASE);

        for i in 0..kernel_start_pde {
            let phys = frame_allocator::alloc(1, RegionTag::KernelPageDir, "user page table");
            if phys == 0 {
                return Err(KernelError::Oom);
            }
            table_phys[i] = phys;
            table_at(phys).entries.fill(0);
        }
        for i in kernel_start_pde..ENTRIES_PER_TABLE {
            table_phys[i] = kernel.table_phys[i];
        }

        let dir = table_at(dir_phys);
        for (i, &table) in table_phys.iter().enumerate() {
            let flags = if i < kernel_start_pde {
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER
            } else {
                EntryFlags::PRESENT | EntryFlags::WRITABLE
            };
            dir.entries[i] = (table as u32) | flags.bits();
        }

        Ok(Self {
            page_dir_phys: dir_phys,
            table_phys,
            regions: Vec::new(),
            begin_alloc: 0,
            is_kernel: false,
        })
    }

    pub fn destroy(self) {
        let kernel_start_pde = pd_index(KERNEL_VIRT_BASE);
        if !self.is_kernel {
            for &phys in self.table_phys[..kernel_start_pde].iter() {
                frame_allocator::free(phys);
            }
        }
        frame_allocator::free(self.page_dir_phys);
    }

    /// Writes CR3. Skipped as a no-op by callers that track the
    /// active space and already match it, to avoid a needless TLB
    /// flush of the entire address space.
    pub fn activate(&self) {
        let _guard = IrqGuard::acquire();
        unsafe { cpu::write_cr3(self.page_dir_phys) };
    }

    fn map_raw(&mut self, phys: PhysAddr, virt: VirtAddr, pages: usize, flags: EntryFlags) {
        for i in 0..pages {
            let v = virt + i * PAGE_SIZE;
            let p = phys + i * PAGE_SIZE;
            let table = table_at(self.table_phys[pd_index(v)]);
            table.entries[pt_index(v)] = (p as u32) | flags.bits();
            cpu::flush_tlb_page(v);
        }
    }

    fn unmap_raw(&mut self, virt: VirtAddr, pages: usize) {
        for i in 0..pages {
            let v = virt + i * PAGE_SIZE;
            let table = table_at(self.table_phys[pd_index(v)]);
            table.entries[pt_index(v)] = 0;
            cpu::flush_tlb_page(v);
        }
    }

    fn sort_regions(&mut self) {
        self.regions.sort_by_key(|r| r.beg);
    }

    /// Edits PTEs for an already-chosen virtual range and flushes the
    /// TLB. Caller supplies both addresses; no region bookkeeping is
    /// implied (use `alloc` when a fresh virtual range is wanted).
    pub fn map(
        &mut self,
        phys: PhysAddr,
        virt: VirtAddr,
        pages: usize,
        prot: Protection,
        ty: RegionType,
        description: &'static str,
    ) -> KResult<()> {
        let _guard = IrqGuard::acquire();
        if !crate::util::is_aligned(phys, PAGE_SIZE) || !crate::util::is_aligned(virt, PAGE_SIZE) {
            return Err(KernelError::Unaligned);
        }
        let flags = EntryFlags::from_protection(prot, !self.is_kernel);
        self.map_raw(phys, virt, pages, flags);
        self.regions.push(VirtRegion {
            protection: prot,
            ty,
            physical: phys,
            beg: virt,
            end: virt + pages * PAGE_SIZE,
            description,
        });
        self.sort_regions();
        Ok(())
    }

    pub fn unmap(&mut self, virt: VirtAddr, pages: usize, _reason: &'static str) {
        let _guard = IrqGuard::acquire();
        self.unmap_raw(virt, pages);
        self.regions.retain(|r| r.beg != virt);
    }

    /// Finds the first gap of at least `pages` pages at or after
    /// `begin_alloc`, maps `phys` there and records a region.
    pub fn alloc(
        &mut self,
        phys: PhysAddr,
        pages: usize,
        prot: Protection,
        ty: RegionType,
        description: &'static str,
    ) -> KResult<VirtAddr> {
        let _guard = IrqGuard::acquire();
        let needed = pages * PAGE_SIZE;
        let mut candidate = self.begin_alloc;

        loop {
            let next_region = self.regions.iter().find(|r| r.beg >= candidate);
            let gap_end = next_region.map(|r| r.beg).unwrap_or(usize::MAX);
            if gap_end - candidate >= needed {
                break;
            }
            candidate = next_region.unwrap().end;
        }

        let flags = EntryFlags::from_protection(prot, !self.is_kernel);
        self.map_raw(phys, candidate, pages, flags);
        self.regions.push(VirtRegion {
            protection: prot,
            ty,
            physical: phys,
            beg: candidate,
            end: candidate + needed,
            description,
        });
        self.sort_regions();
        Ok(candidate)
    }

    /// Same as `alloc` but `phys` need not be page aligned; the
    /// intra-page offset is folded back into the returned pointer.
    pub fn alloc_unaligned(
        &mut self,
        phys: PhysAddr,
        size: usize,
        prot: Protection,
        ty: RegionType,
        description: &'static str,
    ) -> KResult<VirtAddr> {
        let offset = phys - align_down(phys, PAGE_SIZE);
        let pages = align_up(size + offset, PAGE_SIZE) / PAGE_SIZE;
        let virt = self.alloc(align_down(phys, PAGE_SIZE), pages, prot, ty, description)?;
        Ok(virt + offset)
    }

    /// Finds the region containing `virt`, unmaps its pages and
    /// removes it.
    pub fn free(&mut self, virt: VirtAddr) -> KResult<()> {
        let _guard = IrqGuard::acquire();
        let idx = self
            .regions
            .iter()
            .position(|r| r.contains(virt))
            .ok_or(KernelError::NoSuchRegion)?;
        let region = self.regions.remove(idx);
        let pages = (region.end - region.beg) / PAGE_SIZE;
        self.unmap_raw(region.beg, pages);
        Ok(())
    }

    pub fn phys_to_virt(&self, phys: PhysAddr) -> KResult<VirtAddr> {
        for region in &self.regions {
            let size = region.end - region.beg;
            if phys >= region.physical && phys < region.physical + size {
                return Ok(region.beg + (phys - region.physical));
            }
        }
        Err(KernelError::NoSuchRegion)
    }

    pub fn virt_to_phys(&self, virt: VirtAddr) -> KResult<PhysAddr> {
        for region in &self.regions {
            if region.contains(virt) {
                return Ok(region.physical + (virt - region.beg));
            }
        }
        Err(KernelError::NoSuchRegion)
    }

    /// Reads the PTE flags for `virt`, used by the #PF handler to tell
    /// present-but-protected faults from genuinely unmapped ones.
    pub fn entry_is_present(&self, virt: VirtAddr) -> bool {
        let table = table_at(self.table_phys[pd_index(virt)]);
        RawTable::entry_flags(table.entries[pt_index(virt)]).contains(EntryFlags::PRESENT)
    }

    pub fn regions(&self) -> &[VirtRegion] {
        &self.regions
    }
}

unsafe impl Send for VirtSpace {}

static KERNEL_SPACE: crate::util::Locked<Option<VirtSpace>> = crate::util::Locked::new(None);

/// Installs the kernel address space singleton. Must run exactly once
/// during boot, after `VirtSpace::new_kernel` succeeds.
pub fn init_kernel_space(space: VirtSpace) {
    *KERNEL_SPACE.lock() = Some(space);
}

pub fn kernel_space() -> &'static crate::util::Locked<Option<VirtSpace>> {
    &KERNEL_SPACE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_flags_from_protection_readonly_is_present_only() {
        let flags = EntryFlags::from_protection(Protection::READONLY, false);
        assert!(flags.contains(EntryFlags::PRESENT));
        assert!(!flags.contains(EntryFlags::WRITABLE));
    }

    #[test]
    fn entry_flags_from_protection_readwrite_sets_writable() {
        let flags = EntryFlags::from_protection(Protection::READWRITE, false);
        assert!(flags.contains(EntryFlags::WRITABLE));
    }

    #[test]
    fn entry_flags_nocache_sets_cache_disable() {
        let flags = EntryFlags::from_protection(Protection::READONLY | Protection::NOCACHE, false);
        assert!(flags.contains(EntryFlags::CACHE_DISABLE));
    }

    #[test]
    fn pd_pt_index_split_covers_full_address() {
        let virt = 0xC010_2000usize;
        assert_eq!(pd_index(virt), (virt >> 22) & 0x3FF);
        assert_eq!(pt_index(virt), (virt >> 12) & 0x3FF);
    }
}
