use crate::{
    config::HypervisorConfig,
    error::{FeatureUnavailableSnafu, HypervisorError, Result, UnloadRefusedSnafu},
    platform::Platform,
    svm::data::shared_data::{OwnedSharedData, SharedData},
    utils::processor::{for_each_processor, ForEachError},
};
use alloc::boxed::Box;
use snafu::ensure;

pub mod data;
pub mod events;
pub mod msr;
pub mod support;
pub mod vcpu;
pub mod vmcb;
pub mod vmexit;
#[cfg(target_os = "windows")]
pub mod vmlaunch;

/// A power state change the hypervisor has to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerTransition {
    /// The system is about to enter a sleep state. The processors lose the
    /// virtualization state.
    EnteringSleep,
    /// The system has resumed from a sleep state.
    Resumed,
}

/// The hypervisor on all processors of the system.
pub struct Hypervisor<'p, P: Platform> {
    platform: &'p P,
    config: HypervisorConfig,
    shared_data: Option<OwnedSharedData<'p, P>>,

    /// Set while the processors are devirtualized because of a sleep state.
    suspended: bool,
}

impl<'p, P: Platform> Hypervisor<'p, P> {
    pub fn new(platform: &'p P, config: HypervisorConfig) -> Self {
        Self {
            platform,
            config,
            shared_data: None,
            suspended: false,
        }
    }

    pub fn config(&self) -> &HypervisorConfig {
        &self.config
    }

    /// Whether the shared data exists, i.e. at least one processor may be
    /// virtualized.
    pub fn is_virtualized(&self) -> bool {
        self.shared_data.is_some()
    }

    /// Virtualizes every processor in index order.
    ///
    /// If a processor fails, the processors before it are devirtualized again
    /// and the error is returned, wrapped in
    /// [`HypervisorError::PartialVirtualization`] if any processor has been
    /// virtualized.
    pub fn virtualize_all(&mut self) -> Result<()> {
        log::info!("Virtualizing processors");

        ensure!(support::is_svm_supported(self.platform), FeatureUnavailableSnafu);

        // Processors that are virtualized already keep running on the same data.
        //
        let reused = self.shared_data.is_some();
        let shared_data = match self.shared_data.take() {
            Some(shared_data) => shared_data,
            None => SharedData::new(self.platform, self.config)?,
        };

        let platform = self.platform;
        let result = for_each_processor(platform, |_| {
            vcpu::virtualize_current_processor(platform, &shared_data)
        });
        self.shared_data = Some(shared_data);

        let ForEachError { completed, error } = match result {
            Ok(count) => {
                log::info!("Virtualized {} processors", count);
                return Ok(());
            }
            Err(error) => error,
        };

        log::error!("Failed to virtualize processors, devirtualizing");

        let rollback = if reused {
            self.platform.processor_count()
        } else {
            completed
        };
        if let Err(rollback_error) = self.devirtualize_processors(rollback) {
            log::error!("Failed to devirtualize: {}", rollback_error);
        }

        if completed == 0 {
            return Err(error);
        }

        Err(HypervisorError::PartialVirtualization {
            completed,
            reason: Box::new(error),
        })
    }

    /// Devirtualizes every processor. The shared data is freed once no
    /// processor uses it anymore.
    pub fn devirtualize_all(&mut self) -> Result<()> {
        log::info!("Devirtualizing processors");

        self.devirtualize_processors(self.platform.processor_count())
    }

    /// Follows the power state of the system.
    pub fn on_power_state_change(&mut self, transition: PowerTransition) -> Result<()> {
        log::info!("Power state change: {:?}", transition);

        match transition {
            PowerTransition::EnteringSleep if self.is_virtualized() => {
                self.devirtualize_all()?;
                self.suspended = true;
                Ok(())
            }
            PowerTransition::Resumed if self.suspended => {
                self.suspended = false;
                self.virtualize_all()
            }
            _ => Ok(()),
        }
    }

    /// Devirtualizes the processors `0..count`. Continues after failures and
    /// returns the first one.
    fn devirtualize_processors(&mut self, count: u32) -> Result<()> {
        let platform = self.platform;
        let config = self.config;
        let expected = self.shared_data.as_ref().map(|data| data.as_ptr());
        let mut first_error = None;

        for index in 0..count {
            let result = platform.run_on_processor(index, &mut || {
                match vcpu::devirtualize_current_processor(platform)? {
                    Some(shared_data) => {
                        if Some(shared_data.as_ptr()) != expected {
                            log::warn!("Processor {} used foreign shared data at {:p}", index, shared_data);
                        }
                        Ok(())
                    }
                    None => {
                        ensure!(!vcpu::is_virtualized(platform, &config), UnloadRefusedSnafu { index });
                        Ok(())
                    }
                }
            });

            if let Err(error) = result {
                log::error!("Failed to devirtualize processor {}: {}", index, error);
                first_error.get_or_insert(error);
            }
        }

        // A processor that is still virtualized keeps using the shared data.
        //
        match first_error {
            Some(error) => Err(error),
            None => {
                self.shared_data = None;
                Ok(())
            }
        }
    }
}

impl<P: Platform> Drop for Hypervisor<'_, P> {
    fn drop(&mut self) {
        if self.is_virtualized() {
            if let Err(error) = self.devirtualize_all() {
                log::error!("Failed to devirtualize: {}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        platform::CpuIdResult,
        svm::{
            msr::{EFER_SVME, IA32_EFER},
            vmexit::cpuid::CPUID_HV_VENDOR_AND_MAX_FUNCTIONS,
        },
        utils::testing::{MockPlatform, MOCK_EFER},
    };

    fn vendor_leaf(platform: &MockPlatform, index: u32) -> CpuIdResult {
        let mut result = None;
        platform
            .run_on_processor(index, &mut || {
                result = Some(platform.cpuid(CPUID_HV_VENDOR_AND_MAX_FUNCTIONS, 0));
                Ok(())
            })
            .unwrap();

        result.unwrap()
    }

    #[test]
    fn test_virtualize_all() {
        let platform = MockPlatform::new(4);
        let mut hypervisor = Hypervisor::new(&platform, HypervisorConfig::default());

        hypervisor.virtualize_all().unwrap();

        let (ebx, ecx, edx) = hypervisor.config().vendor_registers();
        for index in 0..4 {
            let result = vendor_leaf(&platform, index);
            assert_eq!((result.eax, result.ebx, result.ecx, result.edx), (0x4000_0001, ebx, ecx, edx));
            assert_eq!(platform.msr_on(index, IA32_EFER), MOCK_EFER | EFER_SVME);
        }

        // The shared data and two blocks per processor
        //
        assert_eq!(platform.live_allocations(), 2 + 4 * 2);
    }

    #[test]
    fn test_virtualize_all_twice() {
        let platform = MockPlatform::new(2);
        let mut hypervisor = Hypervisor::new(&platform, HypervisorConfig::default());

        hypervisor.virtualize_all().unwrap();
        hypervisor.virtualize_all().unwrap();

        assert_eq!(platform.live_allocations(), 2 + 2 * 2);
    }

    #[test]
    fn test_devirtualize_all() {
        let platform = MockPlatform::new(3);
        let mut hypervisor = Hypervisor::new(&platform, HypervisorConfig::default());
        hypervisor.virtualize_all().unwrap();

        hypervisor.devirtualize_all().unwrap();

        assert!(!hypervisor.is_virtualized());
        assert_eq!(platform.live_allocations(), 0);
        for index in 0..3 {
            assert!(!platform.is_running_guest(index));
            assert_eq!(vendor_leaf(&platform, index).ebx, 0);
            assert_eq!(platform.msr_on(index, IA32_EFER), MOCK_EFER);
        }
    }

    #[test]
    fn test_devirtualize_without_virtualize() {
        let platform = MockPlatform::new(2);
        let mut hypervisor = Hypervisor::new(&platform, HypervisorConfig::default());

        hypervisor.devirtualize_all().unwrap();
        assert_eq!(platform.live_allocations(), 0);
    }

    #[test]
    fn test_unsupported_processor() {
        let platform = MockPlatform::new(2);
        platform.set_cpuid(
            0x8000_0001,
            CpuIdResult {
                eax: 0,
                ebx: 0,
                ecx: 0,
                edx: 0,
            },
        );
        let mut hypervisor = Hypervisor::new(&platform, HypervisorConfig::default());

        let error = hypervisor.virtualize_all().unwrap_err();

        assert!(matches!(error, HypervisorError::FeatureUnavailable));
        assert_eq!(platform.live_allocations(), 0);
    }

    #[test]
    fn test_failure_rolls_back_previous_processors() {
        let platform = MockPlatform::new(4);
        platform.fail_processor(2);
        let mut hypervisor = Hypervisor::new(&platform, HypervisorConfig::default());

        let error = hypervisor.virtualize_all().unwrap_err();

        match error {
            HypervisorError::PartialVirtualization { completed, reason } => {
                assert_eq!(completed, 2);
                assert!(matches!(*reason, HypervisorError::ProcessorSwitchFailed { index: 2 }));
            }
            other => panic!("unexpected error: {}", other),
        }

        assert!(!hypervisor.is_virtualized());
        assert_eq!(platform.live_allocations(), 0);
        for index in [0, 1, 3] {
            assert!(!platform.is_running_guest(index));
            assert_eq!(platform.msr_on(index, IA32_EFER), MOCK_EFER);
        }
    }

    #[test]
    fn test_failure_on_the_first_processor() {
        let platform = MockPlatform::new(2);
        platform.fail_processor(0);
        let mut hypervisor = Hypervisor::new(&platform, HypervisorConfig::default());

        let error = hypervisor.virtualize_all().unwrap_err();

        assert!(matches!(error, HypervisorError::ProcessorSwitchFailed { index: 0 }));
        assert!(!hypervisor.is_virtualized());
        assert_eq!(platform.live_allocations(), 0);
        assert!(!platform.is_running_guest(1));
    }

    #[test]
    fn test_shared_data_allocation_failure() {
        let platform = MockPlatform::new(2);
        platform.fail_allocation_after(1);
        let mut hypervisor = Hypervisor::new(&platform, HypervisorConfig::default());

        let error = hypervisor.virtualize_all().unwrap_err();

        assert!(matches!(error, HypervisorError::AllocationFailed { .. }));
        assert_eq!(platform.live_allocations(), 0);
    }

    #[test]
    fn test_sleep_and_resume() {
        let platform = MockPlatform::new(2);
        let mut hypervisor = Hypervisor::new(&platform, HypervisorConfig::default());
        hypervisor.virtualize_all().unwrap();

        hypervisor.on_power_state_change(PowerTransition::EnteringSleep).unwrap();
        assert!(!platform.is_running_guest(0));
        assert_eq!(platform.live_allocations(), 0);

        hypervisor.on_power_state_change(PowerTransition::Resumed).unwrap();
        assert!(platform.is_running_guest(0));
        assert!(platform.is_running_guest(1));
    }

    #[test]
    fn test_resume_without_sleep() {
        let platform = MockPlatform::new(2);
        let mut hypervisor = Hypervisor::new(&platform, HypervisorConfig::default());

        hypervisor.on_power_state_change(PowerTransition::Resumed).unwrap();

        assert!(!hypervisor.is_virtualized());
        assert!(!platform.is_running_guest(0));
    }

    #[test]
    fn test_drop_devirtualizes() {
        let platform = MockPlatform::new(2);

        {
            let mut hypervisor = Hypervisor::new(&platform, HypervisorConfig::default());
            hypervisor.virtualize_all().unwrap();
        }

        assert_eq!(platform.live_allocations(), 0);
        assert!(!platform.is_running_guest(1));
    }
}
