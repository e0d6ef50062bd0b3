use alloc::boxed::Box;
use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HypervisorError {
    #[snafu(display("SVM with nested paging is not available on this processor"))]
    FeatureUnavailable,

    #[snafu(display("Failed to allocate {bytes} bytes"))]
    AllocationFailed { bytes: usize },

    #[snafu(display("Allocation of {bytes} bytes is smaller than a page"))]
    SizeTooSmall { bytes: usize },

    #[snafu(display("Allocation at {address:#x} is not page aligned"))]
    NotPageAligned { address: u64 },

    #[snafu(display("Failed to switch execution to processor {index}"))]
    ProcessorSwitchFailed { index: u32 },

    #[snafu(display("Virtualization stopped after {completed} processor(s): {reason}"))]
    PartialVirtualization {
        completed: u32,
        reason: Box<HypervisorError>,
    },

    #[snafu(display("The host stack sentinel has been overwritten"))]
    CorruptedSentinel,

    #[snafu(display("Processor {index} is still virtualized after the unload request"))]
    UnloadRefused { index: u32 },

    #[snafu(display("The launch of the guest returned"))]
    LaunchReturned,
}

pub type Result<T, E = HypervisorError> = core::result::Result<T, E>;
