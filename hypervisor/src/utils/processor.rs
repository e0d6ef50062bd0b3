//! Handles everything related to the physical processors.

use crate::{error::HypervisorError, platform::Platform};

/// Why [`for_each_processor`] stopped.
#[derive(Debug)]
pub struct ForEachError {
    /// The number of processors the callback completed on.
    pub completed: u32,
    pub error: HypervisorError,
}

/// Executes `f` on each processor, one after another, in index order.
///
/// Stops at the first processor where switching or the callback fails and
/// reports how many processors have completed before.
pub fn for_each_processor<P, F>(platform: &P, mut f: F) -> Result<u32, ForEachError>
where
    P: Platform,
    F: FnMut(u32) -> crate::error::Result<()>,
{
    let count = platform.processor_count();

    for index in 0..count {
        log::trace!("Executing on processor {}", index);

        if let Err(error) = platform.run_on_processor(index, &mut || f(index)) {
            log::error!("Processor {} failed: {}", index, error);

            return Err(ForEachError {
                completed: index,
                error,
            });
        }
    }

    Ok(count)
}
