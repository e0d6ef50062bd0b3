use crate::{
    config::HypervisorConfig,
    error::Result,
    platform::Platform,
    svm::data::{msr_bitmap::MsrBitmap, nested_page_table::NestedPageTable},
    utils::{
        addresses::{physical_address, PhysicalAddress},
        memory::AllocatedMemory,
    },
};
use core::ops::Deref;

/// State shared by all processors. Built once before the first processor is
/// virtualized and never written again until the last one is devirtualized.
///
/// The msr bitmap has to be physically contiguous, so it lives in its own
/// allocation.
#[repr(C, align(4096))]
pub struct SharedData {
    pub npt: NestedPageTable,
    pub pml4_pa: PhysicalAddress,

    pub msr_bitmap: *const MsrBitmap,
    pub msr_bitmap_pa: PhysicalAddress,

    pub config: HypervisorConfig,
}

impl SharedData {
    /// Allocates and builds the nested page table and the msr bitmap.
    pub fn new<P: Platform>(platform: &P, config: HypervisorConfig) -> Result<OwnedSharedData<'_, P>> {
        log::info!("Creating shared data");

        let mut data = AllocatedMemory::<SharedData, _>::alloc_aligned(platform)?;
        let mut msr_bitmap = AllocatedMemory::<MsrBitmap, _>::alloc_contiguous(platform)?;

        data.npt.build(platform);
        msr_bitmap.build();

        data.pml4_pa = physical_address(platform, data.npt.pml4.as_ptr());
        data.msr_bitmap = msr_bitmap.as_ptr();
        data.msr_bitmap_pa = physical_address(platform, msr_bitmap.as_ptr());
        data.config = config;

        log::trace!("pml4_pa: {:x}", data.pml4_pa);
        log::trace!("msr_bitmap_pa: {:x}", data.msr_bitmap_pa);

        Ok(OwnedSharedData { data, msr_bitmap })
    }

    pub fn msr_bitmap(&self) -> &MsrBitmap {
        unsafe { &*self.msr_bitmap }
    }
}

/// Owns the [`SharedData`] and the msr bitmap it points to. Both are freed
/// when this is dropped.
pub struct OwnedSharedData<'p, P: Platform> {
    data: AllocatedMemory<'p, SharedData, P>,
    msr_bitmap: AllocatedMemory<'p, MsrBitmap, P>,
}

impl<P: Platform> OwnedSharedData<'_, P> {
    /// The address stored in the per-processor data.
    pub fn as_ptr(&self) -> *mut SharedData {
        self.data.as_ptr()
    }
}

impl<P: Platform> Deref for OwnedSharedData<'_, P> {
    type Target = SharedData;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<P: Platform> Drop for OwnedSharedData<'_, P> {
    fn drop(&mut self) {
        log::info!("Freeing shared data at {:p} and msr bitmap at {:p}", self.data.as_ptr(), self.msr_bitmap.as_ptr());
    }
}
