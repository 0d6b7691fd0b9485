// Virtual Memory Manager: 3-level page-table walker/builder.
//
// Tables hold 512 eight-byte descriptors. An entry either descends to the
// next-level table or terminates translation at a physical page (a leaf
// descriptor). Intermediate tables are allocated lazily from the PMM and
// are owned transitively by the root.
//
// Table memory is read and written through its physical address, which the
// kernel reaches via the identity mapping established at boot (and via plain
// host memory in the test suite).

use bitflags::bitflags;
use log::debug;

use crate::memory::pmm::{PageAllocator, PAGE_SIZE};
use crate::memory::{PhysAddr, VirtAddr};

bitflags! {
    /// Descriptor attribute bits (AArch64 4 KiB granule, lower + upper
    /// attributes).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID          = 1 << 0;
        /// Distinguishes table/page descriptors from block descriptors.
        const TABLE          = 1 << 1;
        /// MAIR index 1: normal, write-back cacheable memory.
        const ATTR_NORMAL    = 1 << 2;
        /// AP[1]: accessible from unprivileged (EL0) execution.
        const USER           = 1 << 6;
        /// AP[2]: write-protected.
        const READ_ONLY      = 1 << 7;
        /// SH[1:0] = 0b11, inner shareable.
        const INNER_SHARE    = 3 << 8;
        /// Access flag; descriptors without it fault on first use.
        const ACCESS         = 1 << 10;
        /// Unprivileged execute-never.
        const NO_EXEC        = 1 << 54;
    }
}

/// Descend descriptor: physical address of the next-level table, valid.
const PT_TABLE: u64 = 0b11;
/// Leaf descriptor at level 3: physical page address, valid.
const PT_PAGE: u64 = 0b11;

/// Bits [47:12] of a descriptor carry the output address.
const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

const ENTRY_COUNT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// The PMM ran dry while allocating an intermediate table. The mapping
    /// was aborted; the caller must treat the request as failed.
    OutOfMemory,
}

/// 4 KiB granule, 39-bit VA split: L1 covers 1 GiB, L2 2 MiB, L3 4 KiB.
fn l1_index(virt: VirtAddr) -> usize {
    ((virt >> 30) & 0x1FF) as usize
}

fn l2_index(virt: VirtAddr) -> usize {
    ((virt >> 21) & 0x1FF) as usize
}

fn l3_index(virt: VirtAddr) -> usize {
    ((virt >> 12) & 0x1FF) as usize
}

fn entry_ptr(table: PhysAddr, index: usize) -> *mut u64 {
    debug_assert!(index < ENTRY_COUNT);
    (table + (index * 8) as u64) as *mut u64
}

/// Allocate and zero a fresh root table. The PMM already zero-fills pages,
/// so every entry starts invalid.
pub fn init_root(pmm: &mut PageAllocator) -> Option<PhysAddr> {
    let root = pmm.alloc_page()?;
    debug!("vmm: root table at {:#x}", root);
    Some(root)
}

/// Map the page containing `virt` to the physical page at `phys` with the
/// given attributes, building intermediate tables as needed.
///
/// The caller is responsible for invalidating any cached translation for
/// `virt` afterwards; until then stale translations remain observable.
pub fn map_page(
    pmm: &mut PageAllocator,
    root: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PteFlags,
) -> Result<(), VmmError> {
    let l2 = descend(pmm, root, l1_index(virt))?;
    let l3 = descend(pmm, l2, l2_index(virt))?;

    let descriptor = (phys & ADDR_MASK) | PT_PAGE | (flags | PteFlags::ACCESS).bits();
    unsafe {
        entry_ptr(l3, l3_index(virt)).write(descriptor);
    }
    Ok(())
}

/// Follow (or create) the descend descriptor at `table[index]`, returning
/// the next-level table's physical address.
fn descend(pmm: &mut PageAllocator, table: PhysAddr, index: usize) -> Result<PhysAddr, VmmError> {
    let slot = entry_ptr(table, index);
    let entry = unsafe { slot.read() };

    if entry & PteFlags::VALID.bits() == 0 {
        let next = pmm.alloc_page().ok_or(VmmError::OutOfMemory)?;
        unsafe {
            slot.write((next & ADDR_MASK) | PT_TABLE);
        }
        Ok(next)
    } else {
        Ok(entry & ADDR_MASK)
    }
}

/// Software walk of the tables: the physical address `virt` currently
/// translates to, or `None` if any level is invalid.
pub fn translate(root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    let phys_page = leaf_entry(root, virt)? & ADDR_MASK;
    Some(phys_page | (virt & (PAGE_SIZE as u64 - 1)))
}

/// The raw level-3 descriptor for `virt`, if the walk reaches one.
pub fn leaf_entry(root: PhysAddr, virt: VirtAddr) -> Option<u64> {
    let mut table = root;
    for index in [l1_index(virt), l2_index(virt)] {
        let entry = unsafe { entry_ptr(table, index).read() };
        if entry & PteFlags::VALID.bits() == 0 {
            return None;
        }
        table = entry & ADDR_MASK;
    }

    let entry = unsafe { entry_ptr(table, l3_index(virt)).read() };
    if entry & PteFlags::VALID.bits() == 0 {
        return None;
    }
    Some(entry)
}
