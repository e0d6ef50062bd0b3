//! Loads the hypervisor into the Windows kernel.

#![cfg(target_os = "windows")]
#![no_std]

extern crate alloc;

use crate::{
    nt::{
        DRIVER_OBJECT, NTSTATUS, STATUS_HV_FEATURE_UNAVAILABLE, STATUS_INSUFFICIENT_RESOURCES,
        STATUS_SUCCESS, STATUS_UNSUCCESSFUL,
    },
    power::PowerCallback,
};
use core::ffi::c_void;
use spin::Mutex;
use svm_nest::{
    config::HypervisorConfig,
    error::HypervisorError,
    svm::Hypervisor,
    utils::{alloc::KernelAlloc, logger, nt::NtPlatform},
};

mod lang;
mod nt;
mod power;

#[global_allocator]
static GLOBAL: KernelAlloc = KernelAlloc;

static PLATFORM: NtPlatform = NtPlatform;

struct Driver {
    hypervisor: Hypervisor<'static, NtPlatform>,
    power_callback: PowerCallback,
}

// SAFETY: Only accessed behind `DRIVER`.
unsafe impl Send for Driver {}

static DRIVER: Mutex<Option<Driver>> = Mutex::new(None);

fn status(error: &HypervisorError) -> NTSTATUS {
    match error {
        HypervisorError::FeatureUnavailable => STATUS_HV_FEATURE_UNAVAILABLE,
        HypervisorError::AllocationFailed { .. } => STATUS_INSUFFICIENT_RESOURCES,
        HypervisorError::PartialVirtualization { reason, .. } => status(reason),
        _ => STATUS_UNSUCCESSFUL,
    }
}

extern "system" fn power_state_callback(
    _context: *mut c_void, argument1: *mut c_void, argument2: *mut c_void,
) {
    let Some(transition) = power::transition(argument1, argument2) else {
        return;
    };

    if let Some(driver) = DRIVER.lock().as_mut() {
        if let Err(error) = driver.hypervisor.on_power_state_change(transition) {
            log::error!("Failed to follow the power state change: {}", error);
        }
    }
}

extern "system" fn driver_unload(_driver: *mut DRIVER_OBJECT) {
    log::info!("Unloading the hypervisor");

    // The callback takes the lock, so it has to be unregistered without
    // holding it.
    //
    let Some(driver) = DRIVER.lock().take() else {
        return;
    };
    let Driver {
        mut hypervisor,
        power_callback,
    } = driver;
    drop(power_callback);

    if let Err(error) = hypervisor.devirtualize_all() {
        log::error!("Failed to devirtualize processors: {}", error);
    }
}

#[no_mangle]
pub extern "system" fn DriverEntry(driver: *mut DRIVER_OBJECT, _registry_path: *mut c_void) -> NTSTATUS {
    let config = HypervisorConfig::default();
    let _ = logger::init(config.log_level);

    log::info!("Loading the hypervisor");

    let power_callback = match PowerCallback::register(power_state_callback) {
        Ok(power_callback) => power_callback,
        Err(status) => {
            log::error!("Failed to register the power state callback: {:x}", status);
            return status;
        }
    };

    let mut hypervisor = Hypervisor::new(&PLATFORM, config);
    if let Err(error) = hypervisor.virtualize_all() {
        log::error!("Failed to virtualize processors: {}", error);
        return status(&error);
    }

    *DRIVER.lock() = Some(Driver {
        hypervisor,
        power_callback,
    });
    unsafe { (*driver).DriverUnload = Some(driver_unload) };

    log::info!("Hypervisor loaded");

    STATUS_SUCCESS
}
