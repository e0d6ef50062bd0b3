//! Physical addresses and the translation helpers built on top of the
//! platform.

use crate::platform::Platform;
use core::{fmt, ptr::NonNull};
use x86::bits64::paging::{PAddr, BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

/// A system physical address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn from_pa(pa: u64) -> Self {
        Self(pa)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the page frame number of a 4 KB page.
    pub const fn pfn(self) -> u64 {
        self.0 >> BASE_PAGE_SHIFT
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (BASE_PAGE_SIZE as u64 - 1) == 0
    }

    pub const fn align_down_to_page(self) -> Self {
        Self(self.0 & !(BASE_PAGE_SIZE as u64 - 1))
    }
}

impl From<PhysicalAddress> for PAddr {
    fn from(address: PhysicalAddress) -> Self {
        PAddr::from(address.0)
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Returns the physical address of `value`.
pub fn physical_address<P: Platform, T>(platform: &P, value: *const T) -> PhysicalAddress {
    platform.physical_address(value as *const u8)
}

/// Maps a physical address back to the virtual address of a `T`.
///
/// # Safety
///
/// The memory at `pa` must hold a valid, exclusively accessible `T` for as long
/// as the returned reference lives.
pub unsafe fn virtual_address<'a, P: Platform, T>(
    platform: &P, pa: PhysicalAddress,
) -> Option<&'a mut T> {
    let va: NonNull<u8> = platform.virtual_address(pa)?;

    Some(&mut *va.cast::<T>().as_ptr())
}
