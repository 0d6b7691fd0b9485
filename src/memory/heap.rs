// Kernel heap: first-fit allocator over a singly linked block list.
//
// All of the core's raw pointer arithmetic for dynamic memory lives in this
// module; the rest of the kernel only sees `allocate`/`free`.

use core::mem::size_of;
use core::ptr::{self, NonNull};

use log::{info, warn};

/// Allocation granule. Requests are rounded up to this, and block headers
/// are aligned to it, so every payload is 16-byte aligned (required by the
/// AAPCS64 stack pointer, since process stacks come from this heap).
pub const HEAP_ALIGN: usize = 16;

/// A block is only split when the slack can hold another header plus this
/// much payload; smaller remainders stay attached to the allocation.
const MIN_SPLIT_PAYLOAD: usize = 16;

/// Header preceding every block. Blocks are contiguous in the managed
/// region: the block after `self` starts at `self + header + size`, and the
/// `next` links run in strictly increasing address order with no gaps.
#[repr(C, align(16))]
struct BlockHeader {
    /// Payload bytes, excluding this header.
    size: usize,
    next: *mut BlockHeader,
    free: bool,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

pub struct KernelHeap {
    head: *mut BlockHeader,
}

// Access is serialized by the owning kernel's lock; single core.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    /// Turn `[start, end)` into a single free block spanning the range.
    /// `start` is aligned up to the allocation granule first.
    ///
    /// # Safety
    /// The range must be mapped, writable memory owned by the heap and at
    /// least a few granules long.
    pub unsafe fn init(&mut self, start: usize, end: usize) {
        let start = (start + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1);
        let head = start as *mut BlockHeader;

        (*head).size = end - start - HEADER_SIZE;
        (*head).next = ptr::null_mut();
        (*head).free = true;
        self.head = head;

        info!("heap: {} bytes available at {:#x}", (*head).size, start);
    }

    /// First-fit allocation. The returned payload is zero-filled. `None`
    /// means no free block can satisfy the request.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if self.head.is_null() || size == 0 {
            return None;
        }
        let size = (size + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1);

        let mut curr = self.head;
        while !curr.is_null() {
            unsafe {
                if (*curr).free && (*curr).size >= size {
                    // Split when enough slack remains for a header plus a
                    // minimum payload; otherwise hand over the whole block.
                    if (*curr).size > size + HEADER_SIZE + MIN_SPLIT_PAYLOAD {
                        let remainder =
                            (curr as *mut u8).add(HEADER_SIZE + size) as *mut BlockHeader;
                        (*remainder).size = (*curr).size - size - HEADER_SIZE;
                        (*remainder).next = (*curr).next;
                        (*remainder).free = true;

                        (*curr).size = size;
                        (*curr).next = remainder;
                    }

                    (*curr).free = false;
                    let payload = (curr as *mut u8).add(HEADER_SIZE);
                    ptr::write_bytes(payload, 0, (*curr).size);
                    return NonNull::new(payload);
                }
                curr = (*curr).next;
            }
        }

        warn!("heap: exhausted ({size} bytes requested)");
        None
    }

    /// Release an allocation and coalesce forward: while the next block in
    /// address order is also free, absorb it (header included) into this
    /// one. Backward coalescing is not attempted; the list is singly
    /// linked, so a free block's predecessor is not reachable from here.
    ///
    /// # Safety
    /// `ptr` must have come from `allocate` on this heap and must not be
    /// used again afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let header = (ptr.as_ptr() as *mut BlockHeader).sub(1);
        (*header).free = true;

        while !(*header).next.is_null() && (*(*header).next).free {
            let absorbed = (*header).next;
            (*header).size += HEADER_SIZE + (*absorbed).size;
            (*header).next = (*absorbed).next;
        }
    }

    /// Total free payload bytes. Diagnostic only.
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut curr = self.head;
        while !curr.is_null() {
            unsafe {
                if (*curr).free {
                    total += (*curr).size;
                }
                curr = (*curr).next;
            }
        }
        total
    }
}
