//! Kernel types and functions only the driver needs.

#![allow(non_snake_case, non_camel_case_types)]

use core::ffi::c_void;

pub use svm_nest::utils::nt::NTSTATUS;

pub const STATUS_SUCCESS: NTSTATUS = 0;
pub const STATUS_UNSUCCESSFUL: NTSTATUS = 0xC000_0001_u32 as i32;
pub const STATUS_INSUFFICIENT_RESOURCES: NTSTATUS = 0xC000_009A_u32 as i32;
pub const STATUS_HV_FEATURE_UNAVAILABLE: NTSTATUS = 0xC035_001E_u32 as i32;

pub const OBJ_CASE_INSENSITIVE: u32 = 0x0000_0040;

/// `Argument1` of the power state callback when the system state changes.
pub const PO_CB_SYSTEM_STATE_LOCK: usize = 3;

pub type DRIVER_UNLOAD = extern "system" fn(driver: *mut DRIVER_OBJECT);

pub type CALLBACK_FUNCTION =
    extern "system" fn(context: *mut c_void, argument1: *mut c_void, argument2: *mut c_void);

#[repr(C)]
pub struct UNICODE_STRING {
    pub Length: u16,
    pub MaximumLength: u16,
    pub Buffer: *const u16,
}

#[repr(C)]
pub struct OBJECT_ATTRIBUTES {
    pub Length: u32,
    pub RootDirectory: *mut c_void,
    pub ObjectName: *const UNICODE_STRING,
    pub Attributes: u32,
    pub SecurityDescriptor: *mut c_void,
    pub SecurityQualityOfService: *mut c_void,
}

#[repr(C)]
pub struct DRIVER_OBJECT {
    pub Type: i16,
    pub Size: i16,
    pub DeviceObject: *mut c_void,
    pub Flags: u32,
    pub DriverStart: *mut c_void,
    pub DriverSize: u32,
    pub DriverSection: *mut c_void,
    pub DriverExtension: *mut c_void,
    pub DriverName: UNICODE_STRING,
    pub HardwareDatabase: *mut UNICODE_STRING,
    pub FastIoDispatch: *mut c_void,
    pub DriverInit: *mut c_void,
    pub DriverStartIo: *mut c_void,
    pub DriverUnload: Option<DRIVER_UNLOAD>,
}

extern "system" {
    pub fn ExCreateCallback(
        callback_object: *mut *mut c_void, object_attributes: *const OBJECT_ATTRIBUTES,
        create: u8, allow_multiple_callbacks: u8,
    ) -> NTSTATUS;

    pub fn ExRegisterCallback(
        callback_object: *mut c_void, callback: CALLBACK_FUNCTION, context: *mut c_void,
    ) -> *mut c_void;

    pub fn ExUnregisterCallback(registration: *mut c_void);

    pub fn ObfDereferenceObject(object: *mut c_void) -> isize;
}
