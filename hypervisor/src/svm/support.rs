//! Checks whether the current system is able to run the hypervisor.

use crate::{
    platform::Platform,
    svm::msr::{SVM_MSR_VM_CR, SVM_VM_CR_SVMDIS},
};

const CPUID_VENDOR: u32 = 0x0000_0000;
const CPUID_EXTENDED_FEATURES: u32 = 0x8000_0001;
const CPUID_SVM_FEATURES: u32 = 0x8000_000A;

/// `CPUID Fn8000_0001_ECX[SVM]`
const CPUID_FN8000_0001_ECX_SVM: u32 = 1 << 2;

/// `CPUID Fn8000_000A_EDX[NP]`
const CPUID_FN8000_000A_EDX_NP: u32 = 1 << 0;

/// `CPUID Fn8000_000A_EDX[SVML]`
const CPUID_FN8000_000A_EDX_SVML: u32 = 1 << 2;

/// `CPUID Fn8000_000A_EDX[V_VMSAVE_VMLOAD]`
const CPUID_FN8000_000A_EDX_V_VMSAVE_VMLOAD: u32 = 1 << 15;

/// `CPUID Fn8000_000A_EDX[vGIF]`
const CPUID_FN8000_000A_EDX_VGIF: u32 = 1 << 16;

/// Checks whether svm is supported by the processor.
///
/// # Recommended Algorithm
/// This algorithm has been taken from section `15.4 Enabling SVM` from the AMD
/// manual, extended by the vendor and nested paging checks.
/// ```pseudocode
/// if (CPUID Fn8000_0001_ECX[SVM] == 0)
///     return SVM_NOT_AVAIL;
///
/// if (VM_CR.SVMDIS == 0)
///     return SVM_ALLOWED;
///
/// if (CPUID Fn8000_000A_EDX[SVML]==0)
///     return SVM_DISABLED_AT_BIOS_NOT_UNLOCKABLE
///     // the user must change a platform firmware setting to enable SVM
/// else
///     return SVM_DISABLED_WITH_KEY;
///     // SVMLock may be unlockable; consult platform firmware or TPM to obtain the key.
/// ```
pub fn is_svm_supported<P: Platform>(platform: &P) -> bool {
    // Check the vendor: `AuthenticAMD` is returned in EBX, EDX, ECX.
    //
    let vendor = platform.cpuid(CPUID_VENDOR, 0);
    let mut vendor_id = [0u8; 12];
    vendor_id[0..4].copy_from_slice(&vendor.ebx.to_le_bytes());
    vendor_id[4..8].copy_from_slice(&vendor.edx.to_le_bytes());
    vendor_id[8..12].copy_from_slice(&vendor.ecx.to_le_bytes());
    if &vendor_id != b"AuthenticAMD" {
        log::warn!("Processor is not an AMD processor");
        return false;
    }

    // Check `CPUID Fn8000_0001_ECX[SVM] == 0`
    //
    if platform.cpuid(CPUID_EXTENDED_FEATURES, 0).ecx & CPUID_FN8000_0001_ECX_SVM == 0 {
        log::warn!("Processor does not support SVM");
        return false;
    }

    // Check features that are used by this hypervisor
    //
    let svm_features = platform.cpuid(CPUID_SVM_FEATURES, 0).edx;
    if svm_features & CPUID_FN8000_000A_EDX_NP == 0 {
        log::warn!("Processor does not support nested paging");
        return false;
    }

    // Check `VM_CR.SVMDIS == 0`
    //
    // See in the AMD Manual '15.30.1  VM_CR MSR (C001_0114h)'
    //
    let vm_cr = platform.read_msr(SVM_MSR_VM_CR);
    if (vm_cr & SVM_VM_CR_SVMDIS) == 0 {
        return true;
    }

    // Check `CPUID Fn8000_000A_EDX[SVML]==0`
    //
    if svm_features & CPUID_FN8000_000A_EDX_SVML == 0 {
        log::warn!(
            "SVM is disabled at BIOS level. You must change a platform firmware setting to \
             enable SVM."
        );
    } else {
        log::warn!(
            "SVMLock may be unlockable; consult platform firmware or TPM to obtain the key."
        );
    }

    false
}

/// Optional SVM features that are enabled for the guest when present.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OptionalFeatures {
    pub virtual_vmsave_vmload: bool,
    pub virtual_gif: bool,
}

pub fn optional_features<P: Platform>(platform: &P) -> OptionalFeatures {
    let edx = platform.cpuid(CPUID_SVM_FEATURES, 0).edx;

    OptionalFeatures {
        virtual_vmsave_vmload: edx & CPUID_FN8000_000A_EDX_V_VMSAVE_VMLOAD != 0,
        virtual_gif: edx & CPUID_FN8000_000A_EDX_VGIF != 0,
    }
}
