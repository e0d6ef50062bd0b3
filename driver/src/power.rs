//! Registration for `\Callback\PowerState`. The processors lose the
//! virtualization when the system goes to sleep, so the hypervisor follows
//! the system state.

use crate::nt::{
    ExCreateCallback, ExRegisterCallback, ExUnregisterCallback, ObfDereferenceObject,
    CALLBACK_FUNCTION, NTSTATUS, OBJECT_ATTRIBUTES, OBJ_CASE_INSENSITIVE, PO_CB_SYSTEM_STATE_LOCK,
    STATUS_UNSUCCESSFUL, UNICODE_STRING,
};
use core::{ffi::c_void, ptr};
use svm_nest::svm::PowerTransition;
use widestring::u16cstr;

/// A registered power state callback. Unregistered when dropped.
pub struct PowerCallback {
    object: *mut c_void,
    registration: *mut c_void,
}

impl PowerCallback {
    pub fn register(callback: CALLBACK_FUNCTION) -> Result<Self, NTSTATUS> {
        let name = u16cstr!("\\Callback\\PowerState");
        let name = UNICODE_STRING {
            Length: (name.len() * 2) as u16,
            MaximumLength: (name.len() * 2) as u16,
            Buffer: name.as_ptr(),
        };
        let attributes = OBJECT_ATTRIBUTES {
            Length: core::mem::size_of::<OBJECT_ATTRIBUTES>() as u32,
            RootDirectory: ptr::null_mut(),
            ObjectName: &name,
            Attributes: OBJ_CASE_INSENSITIVE,
            SecurityDescriptor: ptr::null_mut(),
            SecurityQualityOfService: ptr::null_mut(),
        };

        let mut object = ptr::null_mut();
        let status = unsafe { ExCreateCallback(&mut object, &attributes, 0, 1) };
        if status < 0 {
            return Err(status);
        }

        let registration = unsafe { ExRegisterCallback(object, callback, ptr::null_mut()) };
        if registration.is_null() {
            unsafe { ObfDereferenceObject(object) };
            return Err(STATUS_UNSUCCESSFUL);
        }

        Ok(Self {
            object,
            registration,
        })
    }
}

impl Drop for PowerCallback {
    fn drop(&mut self) {
        unsafe {
            ExUnregisterCallback(self.registration);
            ObfDereferenceObject(self.object);
        }
    }
}

/// Decodes the arguments of a power state callback.
pub fn transition(argument1: *mut c_void, argument2: *mut c_void) -> Option<PowerTransition> {
    if argument1 as usize != PO_CB_SYSTEM_STATE_LOCK {
        return None;
    }

    // Zero: the system is about to sleep. One: it has resumed.
    //
    Some(if argument2.is_null() {
        PowerTransition::EnteringSleep
    } else {
        PowerTransition::Resumed
    })
}
