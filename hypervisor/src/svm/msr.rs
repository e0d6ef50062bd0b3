//! Model specific registers the hypervisor touches.

pub use x86::msr::{IA32_EFER, IA32_PAT};

pub const SVM_MSR_VM_CR: u32 = 0xC001_0114;
pub const SVM_MSR_VM_HSAVE_PA: u32 = 0xC001_0117;
pub const MSR_LSTAR: u32 = 0xC000_0082;

/// `VM_CR.SVMDIS`: SVM has been disabled by the firmware.
pub const SVM_VM_CR_SVMDIS: u64 = 1 << 4;

pub const EFER_SCE: u64 = 1 << 0;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;
pub const EFER_SVME: u64 = 1 << 12;
pub const EFER_LMSLE: u64 = 1 << 13;
pub const EFER_FFXSR: u64 = 1 << 14;
pub const EFER_TCE: u64 = 1 << 15;

/// Every bit a guest may set in EFER. Setting any other bit raises `#GP`.
///
/// See `3.1.7 Extended Feature Enable Register (EFER)`.
pub const EFER_VALID_BITS: u64 =
    EFER_SCE | EFER_LME | EFER_LMA | EFER_NXE | EFER_SVME | EFER_LMSLE | EFER_FFXSR | EFER_TCE;

/// Whether `value` can be written to EFER without raising `#GP`.
///
/// Newer processors add bits (e.g. `AutoIBRS`) that are not listed in
/// [`EFER_VALID_BITS`]. The ones set in `initial_efer` are accepted as well.
pub const fn is_valid_efer(value: u64, initial_efer: u64) -> bool {
    value & !(EFER_VALID_BITS | initial_efer) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_efer_validation() {
        assert!(is_valid_efer(EFER_SCE | EFER_LME | EFER_LMA | EFER_NXE, 0));
        assert!(is_valid_efer(EFER_SCE | EFER_LME | EFER_LMA | EFER_NXE | EFER_SVME, 0));
        assert!(!is_valid_efer(1 << 1, 0));
        assert!(!is_valid_efer(1 << 32, 0));
    }

    #[test]
    fn test_efer_bits_set_at_boot_are_valid() {
        const AUTO_IBRS: u64 = 1 << 21;
        let boot = EFER_SCE | EFER_LME | EFER_LMA | EFER_NXE | AUTO_IBRS;

        assert!(is_valid_efer(boot, boot));
        assert!(is_valid_efer(boot & !AUTO_IBRS, boot));
        assert!(!is_valid_efer(boot, boot & !AUTO_IBRS));
        assert!(!is_valid_efer(boot | 1 << 1, boot));
    }
}
