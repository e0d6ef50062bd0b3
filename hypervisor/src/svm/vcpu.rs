use crate::{
    config::HypervisorConfig,
    error::{CorruptedSentinelSnafu, Result},
    platform::{AllocType, Platform},
    svm::{
        data::{
            nested_data::{NestedData, VirtualMsrs},
            processor_data::{check_sentinel, ProcessorData, UnloadHandle},
            shared_data::SharedData,
        },
        msr::{EFER_SVME, IA32_EFER},
        vmexit::cpuid::{CPUID_HV_VENDOR_AND_MAX_FUNCTIONS, CPUID_UNLOAD, UNLOAD_MARKER},
    },
    utils::memory::AllocatedMemory,
};
use core::ptr::NonNull;
use snafu::OptionExt;

/// Whether the current processor already runs as a guest of this hypervisor.
pub fn is_virtualized<P: Platform>(platform: &P, config: &HypervisorConfig) -> bool {
    let result = platform.cpuid(CPUID_HV_VENDOR_AND_MAX_FUNCTIONS, 0);

    (result.ebx, result.ecx, result.edx) == config.vendor_registers()
}

/// Virtualizes the current processor. Does nothing if it already is.
///
/// On success, execution continues as the guest, right where the context has
/// been captured.
pub fn virtualize_current_processor<P: Platform>(platform: &P, shared_data: &SharedData) -> Result<()> {
    let index = platform.current_processor_index();
    log::info!("Virtualizing processor {}", index);

    // Based on this: https://github.com/tandasat/SimpleSvm/blob/master/SimpleSvm/SimpleSvm.cpp#L1137

    // IMPORTANT: We have to capture the context right here, so that the launch
    // continues the execution of the current processor at this point of time.
    // The guest comes back here and takes the early return below.
    //
    log::info!("Capturing context");
    let context = platform.capture_context();

    if is_virtualized(platform, &shared_data.config) {
        log::info!("Processor {} is virtualized", index);
        return Ok(());
    }

    log::info!("Preparing for virtualization");
    let mut data = AllocatedMemory::<ProcessorData, _>::alloc_aligned(platform)?;
    let mut nested = AllocatedMemory::<NestedData, _>::alloc_aligned(platform)?;

    // Enable SVM by setting EFER.SVME. The guest keeps seeing the old value.
    //
    let efer = platform.read_msr(IA32_EFER);
    nested.state.msrs = VirtualMsrs::new(efer);
    platform.write_msr(IA32_EFER, efer | EFER_SVME);

    let nested_ptr = NonNull::from(&mut *nested);
    data.prepare_for_virtualization(platform, shared_data, nested_ptr, &context);

    // Both blocks belong to the hypervisor until the processor is devirtualized.
    //
    let nested = nested.into_raw();
    let mut data = data.into_raw();
    let host_rsp = unsafe { data.as_mut() }.host_rsp();

    // Launch vm
    // https://github.com/tandasat/SimpleSvm/blob/master/SimpleSvm/x64.asm#L78
    //
    log::info!("Launching vm");
    if let Err(error) = unsafe { platform.launch(host_rsp) } {
        log::error!("Failed to launch processor {}: {}", index, error);

        drop(unsafe { AllocatedMemory::from_raw(platform, data, AllocType::Normal) });
        drop(unsafe { AllocatedMemory::from_raw(platform, nested, AllocType::Normal) });
        platform.write_msr(IA32_EFER, efer);

        return Err(error);
    }

    Ok(())
}

/// Asks the hypervisor on the current processor to unload and frees the
/// per-processor memory.
///
/// Returns the shared data the processor was using, or `None` if the processor
/// was not virtualized (or the hypervisor did not unload).
pub fn devirtualize_current_processor<P: Platform>(platform: &P) -> Result<Option<NonNull<SharedData>>> {
    let index = platform.current_processor_index();

    let result = platform.cpuid(CPUID_UNLOAD, CPUID_UNLOAD);
    if result.ecx != UNLOAD_MARKER {
        log::info!("Processor {} is not virtualized. Ecx: {:x}", index, result.ecx);
        return Ok(None);
    }

    // The hypervisor is gone at this point, only its memory is left.
    //
    let data = UnloadHandle::decode(result.eax, result.edx)
        .context(CorruptedSentinelSnafu)?
        .data();
    unsafe { check_sentinel(data)? };

    let data = unsafe { AllocatedMemory::from_raw(platform, data, AllocType::Normal) };
    let shared_data = NonNull::new(data.host_stack_layout.shared_data);
    if let Some(nested) = NonNull::new(data.host_stack_layout.nested_data) {
        drop(unsafe { AllocatedMemory::from_raw(platform, nested, AllocType::Normal) });
    }
    drop(data);

    log::info!("Processor {} has been devirtualized", index);

    Ok(shared_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::HypervisorError,
        utils::testing::{MockPlatform, MOCK_EFER},
    };

    #[test]
    fn test_virtualize_and_devirtualize() {
        let platform = MockPlatform::new(1);
        let config = HypervisorConfig::default();
        let shared = SharedData::new(&platform, config).unwrap();

        assert!(!is_virtualized(&platform, &config));
        virtualize_current_processor(&platform, &shared).unwrap();

        assert!(platform.is_running_guest(0));
        assert!(is_virtualized(&platform, &config));
        assert_eq!(platform.read_msr(IA32_EFER), MOCK_EFER | EFER_SVME);
        assert_eq!(platform.live_allocations(), 4);

        let returned = devirtualize_current_processor(&platform).unwrap();

        assert_eq!(returned.map(NonNull::as_ptr), Some(shared.as_ptr()));
        assert!(!platform.is_running_guest(0));
        assert!(!is_virtualized(&platform, &config));
        assert_eq!(platform.read_msr(IA32_EFER), MOCK_EFER);
        assert_eq!(platform.live_allocations(), 2);
    }

    #[test]
    fn test_virtualize_twice() {
        let platform = MockPlatform::new(1);
        let shared = SharedData::new(&platform, HypervisorConfig::default()).unwrap();

        virtualize_current_processor(&platform, &shared).unwrap();
        virtualize_current_processor(&platform, &shared).unwrap();

        assert_eq!(platform.live_allocations(), 4);
        devirtualize_current_processor(&platform).unwrap();
    }

    #[test]
    fn test_devirtualize_without_hypervisor() {
        let platform = MockPlatform::new(1);

        assert!(devirtualize_current_processor(&platform).unwrap().is_none());
    }

    #[test]
    fn test_failed_launch_is_rolled_back() {
        let platform = MockPlatform::new(1);
        let shared = SharedData::new(&platform, HypervisorConfig::default()).unwrap();
        platform.fail_launch();

        let error = virtualize_current_processor(&platform, &shared).unwrap_err();

        assert!(matches!(error, HypervisorError::LaunchReturned));
        assert_eq!(platform.read_msr(IA32_EFER), MOCK_EFER);
        assert_eq!(platform.live_allocations(), 2);
    }

    #[test]
    fn test_allocation_failure() {
        let platform = MockPlatform::new(1);
        let shared = SharedData::new(&platform, HypervisorConfig::default()).unwrap();
        platform.fail_allocation_after(1);

        let error = virtualize_current_processor(&platform, &shared).unwrap_err();

        assert!(matches!(error, HypervisorError::AllocationFailed { .. }));
        assert_eq!(platform.read_msr(IA32_EFER), MOCK_EFER);
        assert_eq!(platform.live_allocations(), 2);
    }
}
