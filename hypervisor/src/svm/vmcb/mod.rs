//! See `Appendix B - Layout of VMCB` in AMD64 Architecture Programmer’s Manual
//! Volume 2: System Programming.

use crate::svm::vmcb::{control_area::ControlArea, save_area::SaveArea};
use x86::bits64::paging::BASE_PAGE_SIZE;

pub mod control_area;
pub mod save_area;

const VMCB_RESERVED_SIZE: usize =
    BASE_PAGE_SIZE - core::mem::size_of::<ControlArea>() - core::mem::size_of::<SaveArea>();

/// # Layout
///
/// The VMCB is divided into two areas—the first one contains various control
/// bits including the intercept vectors and the second one contains saved
/// guest state.
///
/// Depending on which guest it describes, the same layout is used for the
/// outer guest (`01`), the guest of a nested hypervisor as seen by that
/// hypervisor (`12`) and the merged control block hardware actually runs
/// while nested (`02`).
#[repr(C, align(4096))]
#[derive(Clone, Copy)]
pub struct Vmcb {
    /// Control bits, intercept vectors and exit information. Padded to 1024
    /// bytes, unused bytes must be zero.
    pub control_area: ControlArea,

    /// Saved guest state.
    pub save_area: SaveArea,

    pub reserved: [u8; VMCB_RESERVED_SIZE],
}
const_assert_eq!(core::mem::size_of::<Vmcb>(), BASE_PAGE_SIZE);

impl Vmcb {
    /// Completes the intercepted instruction by moving to the next one.
    pub fn advance_rip(&mut self) {
        self.save_area.rip = self.control_area.nrip;
    }
}
