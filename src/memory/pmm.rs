// Physical Memory Manager: bitmap page allocator over a fixed region.

use log::{info, warn};

use crate::memory::PhysAddr;

/// Standard page size, 4 KiB.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Upper bound on the managed region: 128 MiB of 4 KiB pages. One bit per
/// page, so the bitmap itself is 4 KiB.
pub const MANAGED_MEMORY: usize = 128 * 1024 * 1024;
pub const TOTAL_PAGES: usize = MANAGED_MEMORY / PAGE_SIZE;

/// Bitmap-backed physical page allocator. Bit set = page allocated.
///
/// The bitmap is owned exclusively by this struct; nothing else hands out
/// physical pages. Freed pages are zero-filled on their next allocation so
/// no process ever observes a previous occupant's data.
pub struct PageAllocator {
    bitmap: [u8; TOTAL_PAGES / 8],
    base: PhysAddr,
    pages: usize,
}

impl PageAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: [0; TOTAL_PAGES / 8],
            base: 0,
            pages: 0,
        }
    }

    /// Start managing `size` bytes of physical memory at `start`. The base
    /// is aligned up to a page boundary; regions larger than
    /// [`MANAGED_MEMORY`] are clamped.
    ///
    /// # Safety
    /// Every page in `[start, start + size)` must be ordinary RAM that the
    /// kernel may read and write through an identity mapping, and must not
    /// be in use by anything else.
    pub unsafe fn init(&mut self, start: PhysAddr, size: usize) {
        let base = align_page_up(start);
        let skipped = (base - start) as usize;

        self.base = base;
        self.pages = size.saturating_sub(skipped) / PAGE_SIZE;
        if self.pages > TOTAL_PAGES {
            self.pages = TOTAL_PAGES;
        }
        self.bitmap.fill(0);

        info!(
            "pmm: managing {} pages ({} KiB) from {:#x}",
            self.pages,
            self.pages * PAGE_SIZE / 1024,
            self.base
        );
    }

    /// First-fit scan for a free page. On success the page is marked
    /// allocated and zero-filled before its address is returned. `None`
    /// means physical memory is exhausted; callers must never treat that
    /// address-shaped `0` as mappable.
    pub fn alloc_page(&mut self) -> Option<PhysAddr> {
        for index in 0..self.pages {
            let byte = index / 8;
            let bit = index % 8;

            if self.bitmap[byte] & (1 << bit) == 0 {
                self.bitmap[byte] |= 1 << bit;

                let addr = self.base + (index * PAGE_SIZE) as u64;
                // Security zeroing: the previous owner's data must not leak.
                unsafe {
                    core::ptr::write_bytes(addr as *mut u8, 0, PAGE_SIZE);
                }
                return Some(addr);
            }
        }

        warn!("pmm: out of physical pages");
        None
    }

    /// Return a page to the pool. Addresses outside the managed region are
    /// ignored.
    pub fn free_page(&mut self, addr: PhysAddr) {
        if addr < self.base {
            return;
        }
        let index = ((addr - self.base) as usize) >> PAGE_SHIFT;
        if index >= self.pages {
            return;
        }

        self.bitmap[index / 8] &= !(1 << (index % 8));
    }

    /// Number of pages currently free.
    pub fn free_pages(&self) -> usize {
        (0..self.pages)
            .filter(|i| self.bitmap[i / 8] & (1 << (i % 8)) == 0)
            .count()
    }

    pub fn managed_pages(&self) -> usize {
        self.pages
    }
}

pub(crate) fn align_page_up(addr: PhysAddr) -> PhysAddr {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

pub(crate) fn align_page_down(addr: PhysAddr) -> PhysAddr {
    addr & !(PAGE_SIZE as u64 - 1)
}
