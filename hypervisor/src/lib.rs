//! An AMD-V hypervisor that virtualizes the running Windows kernel, with
//! support for a hypervisor running inside the guest.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate static_assertions;

pub mod config;
pub mod error;
pub mod platform;
pub mod svm;
pub mod utils;
