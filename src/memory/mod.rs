// Memory subsystem: physical pages, kernel heap, page tables, demand paging.

pub mod fault;
pub mod heap;
pub mod pmm;
pub mod vmm;

use log::info;

use heap::KernelHeap;
use pmm::PageAllocator;
use vmm::PteFlags;

pub type PhysAddr = u64;
pub type VirtAddr = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The PMM could not supply the root translation table.
    OutOfMemory,
}

/// Owner of the memory subsystem: the page bitmap, the kernel heap and the
/// root translation table (and, transitively, every table hanging off it).
pub struct MemoryManager {
    pub pmm: PageAllocator,
    pub heap: KernelHeap,
    root: PhysAddr,
}

impl MemoryManager {
    pub const fn new() -> Self {
        Self {
            pmm: PageAllocator::new(),
            heap: KernelHeap::new(),
            root: 0,
        }
    }

    /// Bring up the subsystem in boot order: page bitmap first, then the
    /// heap (its managed range must already be mapped), then the root
    /// table, carved zeroed out of the PMM.
    ///
    /// # Safety
    /// Both ranges must be disjoint, kernel-owned, mapped RAM; see
    /// [`PageAllocator::init`] and [`KernelHeap::init`].
    pub unsafe fn init(
        &mut self,
        phys_start: PhysAddr,
        phys_size: usize,
        heap_start: usize,
        heap_end: usize,
    ) -> Result<(), MemoryError> {
        self.pmm.init(phys_start, phys_size);
        self.heap.init(heap_start, heap_end);
        self.root = vmm::init_root(&mut self.pmm).ok_or(MemoryError::OutOfMemory)?;

        info!("memory: subsystem up, root table {:#x}", self.root);
        Ok(())
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Map one page in the kernel's address space.
    pub fn map(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PteFlags,
    ) -> Result<(), vmm::VmmError> {
        vmm::map_page(&mut self.pmm, self.root, virt, phys, flags)
    }

    /// Current translation of `virt`, if any (software walk).
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        vmm::translate(self.root, virt)
    }
}
