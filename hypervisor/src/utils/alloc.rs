use crate::utils::nt::{ExAllocatePoolWithTag, ExFreePoolWithTag, NON_PAGED_POOL, POOL_TAG};
use core::alloc::{GlobalAlloc, Layout};

/// Allocates non-paged virtual memory.
pub struct KernelAlloc;

unsafe impl GlobalAlloc for KernelAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Pool allocations are 16 byte aligned, page aligned from a page on.
        //
        if layout.align() > 16 && layout.size() < x86::bits64::paging::BASE_PAGE_SIZE {
            return core::ptr::null_mut();
        }

        ExAllocatePoolWithTag(NON_PAGED_POOL, layout.size(), POOL_TAG).cast()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        ExFreePoolWithTag(ptr.cast(), POOL_TAG);
    }
}
