//! Everything related to memory.

use crate::{
    error::{AllocationFailedSnafu, NotPageAlignedSnafu, Result, SizeTooSmallSnafu},
    platform::{AllocType, Platform},
};
use core::{
    ops::{Deref, DerefMut},
    ptr::NonNull,
};
use snafu::{ensure, OptionExt};
use x86::bits64::paging::BASE_PAGE_SIZE;

/// Allocated memory that can never be null.
///
/// It will automatically be freed with the matching primitive when dropped.
/// `Deref` and `DerefMut` abstract the pointer away. Memory whose ownership
/// has to leave the Rust world (e.g. the per-processor data, which is owned by
/// the hypervisor until the processor is devirtualized) is handed out with
/// [`AllocatedMemory::into_raw`] and taken back with
/// [`AllocatedMemory::from_raw`].
pub struct AllocatedMemory<'p, T, P: Platform> {
    platform: &'p P,
    ptr: NonNull<T>,
    kind: AllocType,
}

impl<'p, T, P: Platform> AllocatedMemory<'p, T, P> {
    /// Allocates page aligned, zero filled memory for a `T`.
    pub fn alloc_aligned(platform: &'p P) -> Result<Self> {
        Self::alloc(platform, AllocType::Normal)
    }

    /// Allocates page aligned, zero filled contiguous physical memory for a `T`.
    ///
    /// # What is contiguous memory?
    /// Click [here](https://stackoverflow.com/questions/4059363/what-is-a-contiguous-memory-block).
    pub fn alloc_contiguous(platform: &'p P) -> Result<Self> {
        Self::alloc(platform, AllocType::Contiguous)
    }

    fn alloc(platform: &'p P, kind: AllocType) -> Result<Self> {
        let bytes = core::mem::size_of::<T>();
        log::trace!("Allocating {} bytes of {:?} memory", bytes, kind);

        // The size must equal/greater than a page, to align it to a page
        //
        ensure!(bytes >= BASE_PAGE_SIZE, SizeTooSmallSnafu { bytes });

        let memory = platform
            .allocate(kind, bytes)
            .context(AllocationFailedSnafu { bytes })?;
        let memory = Self {
            platform,
            ptr: memory.cast(),
            kind,
        };

        // Make sure it's aligned
        //
        let address = memory.ptr.as_ptr() as u64;
        ensure!(
            address % BASE_PAGE_SIZE as u64 == 0,
            NotPageAlignedSnafu { address }
        );

        // Zero the memory
        //
        unsafe { core::ptr::write_bytes(memory.ptr.as_ptr() as *mut u8, 0, bytes) };

        Ok(memory)
    }

    /// Gives up ownership without freeing the memory.
    pub fn into_raw(self) -> NonNull<T> {
        let ptr = self.ptr;
        core::mem::forget(self);
        ptr
    }

    /// Takes ownership of memory that has been handed out by
    /// [`AllocatedMemory::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw` of an allocation of the same `kind`, and
    /// nothing else may own it anymore.
    pub unsafe fn from_raw(platform: &'p P, ptr: NonNull<T>, kind: AllocType) -> Self {
        Self {
            platform,
            ptr,
            kind,
        }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

impl<T, P: Platform> Deref for AllocatedMemory<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, P: Platform> DerefMut for AllocatedMemory<'_, T, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T, P: Platform> Drop for AllocatedMemory<'_, T, P> {
    fn drop(&mut self) {
        log::trace!("Freeing memory: {:p} - {:?}", self.ptr, self.kind);

        unsafe {
            self.platform
                .free(self.kind, self.ptr.cast(), core::mem::size_of::<T>())
        };
    }
}
