use crate::{
    config::HypervisorConfig,
    platform::Platform,
    svm::{data::guest::GuestRegisters, vmcb::Vmcb, vmexit::ExitType},
};

pub const CPUID_PROCESSOR_AND_PROCESSOR_FEATURE_IDENTIFIERS: u32 = 0x0000_0001;
pub const CPUID_HV_VENDOR_AND_MAX_FUNCTIONS: u32 = 0x4000_0000;
pub const CPUID_HV_INTERFACE: u32 = 0x4000_0001;
pub const CPUID_HV_MAX: u32 = CPUID_HV_INTERFACE;

/// Leaf and sub-leaf that request the unload of the hypervisor.
pub const CPUID_UNLOAD: u32 = 0x4141_4141;

/// Returned in `ecx` when the hypervisor has been unloaded: `JSVM`.
pub const UNLOAD_MARKER: u32 = u32::from_le_bytes(*b"JSVM");

/// `CPUID Fn0000_0001_ECX[31]`: Reserved for use by hypervisor to indicate
/// guest status.
const CPUID_FN0000_0001_ECX_HYPERVISOR_PRESENT: u32 = 1 << 31;

/// Interface signature that tells the guest the hypervisor does not implement
/// the Microsoft hypervisor interface.
const HV_INTERFACE_NOT_COMPATIBLE: u32 = u32::from_le_bytes(*b"Hv#0");

/// Emulates `cpuid` for the guest described by `vmcb`.
///
/// The unload request is only honored if `allow_unload` is set and the guest
/// runs in kernel mode.
pub fn handle_cpuid<P: Platform>(
    platform: &P, vmcb: &Vmcb, config: &HypervisorConfig, guest_regs: &mut GuestRegisters,
    allow_unload: bool,
) -> ExitType {
    let leaf = guest_regs.rax as u32;
    let sub_leaf = guest_regs.rcx as u32;

    // Only kernel mode may unload the hypervisor.
    //
    if allow_unload
        && leaf == CPUID_UNLOAD
        && sub_leaf == CPUID_UNLOAD
        && vmcb.save_area.ss_dpl() == 0
    {
        return ExitType::ExitHypervisor;
    }

    let mut result = platform.cpuid(leaf, sub_leaf);

    match leaf {
        CPUID_PROCESSOR_AND_PROCESSOR_FEATURE_IDENTIFIERS => {
            // Indicate presence of a hypervisor by setting the bit that is
            // reserved for use by hypervisor to indicate guest status.
            //
            result.ecx |= CPUID_FN0000_0001_ECX_HYPERVISOR_PRESENT;
        }
        CPUID_HV_VENDOR_AND_MAX_FUNCTIONS => {
            let (ebx, ecx, edx) = config.vendor_registers();

            result.eax = CPUID_HV_MAX;
            result.ebx = ebx;
            result.ecx = ecx;
            result.edx = edx;
        }
        CPUID_HV_INTERFACE => {
            result.eax = HV_INTERFACE_NOT_COMPATIBLE;
            result.ebx = 0;
            result.ecx = 0;
            result.edx = 0;
        }
        _ => {}
    }

    guest_regs.rax = result.eax as u64;
    guest_regs.rbx = result.ebx as u64;
    guest_regs.rcx = result.ecx as u64;
    guest_regs.rdx = result.edx as u64;

    ExitType::IncrementRIP
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{platform::CpuIdResult, utils::testing::MockPlatform};

    fn kernel_vmcb() -> Vmcb {
        unsafe { core::mem::zeroed() }
    }

    fn cpuid(platform: &MockPlatform, vmcb: &Vmcb, leaf: u32, sub_leaf: u32) -> (ExitType, GuestRegisters) {
        let mut regs = GuestRegisters {
            rax: leaf as u64,
            rcx: sub_leaf as u64,
            ..Default::default()
        };
        let exit_type = handle_cpuid(platform, vmcb, &HypervisorConfig::default(), &mut regs, true);

        (exit_type, regs)
    }

    #[test]
    fn test_hypervisor_present_bit() {
        let platform = MockPlatform::new(1);
        platform.set_cpuid(1, CpuIdResult { eax: 0xa20f10, ebx: 0, ecx: 0x7ef8_3203, edx: 0x178b_fbff });

        let (exit_type, regs) = cpuid(&platform, &kernel_vmcb(), 1, 0);

        assert_eq!(exit_type, ExitType::IncrementRIP);
        assert_eq!(regs.rax, 0xa20f10);
        assert_eq!(regs.rcx, 0xfef8_3203);
        assert_eq!(regs.rdx, 0x178b_fbff);
    }

    #[test]
    fn test_vendor_leaf() {
        let platform = MockPlatform::new(1);

        let (_, regs) = cpuid(&platform, &kernel_vmcb(), CPUID_HV_VENDOR_AND_MAX_FUNCTIONS, 0);

        assert_eq!(regs.rax, 0x4000_0001);
        assert_eq!((regs.rbx as u32).to_le_bytes(), *b"SvmN");
        assert_eq!((regs.rcx as u32).to_le_bytes(), *b"est ");
        assert_eq!((regs.rdx as u32).to_le_bytes(), *b"    ");
    }

    #[test]
    fn test_interface_leaf() {
        let platform = MockPlatform::new(1);

        let (_, regs) = cpuid(&platform, &kernel_vmcb(), CPUID_HV_INTERFACE, 0);

        assert_eq!((regs.rax as u32).to_le_bytes(), *b"Hv#0");
        assert_eq!((regs.rbx, regs.rcx, regs.rdx), (0, 0, 0));
    }

    #[test]
    fn test_other_leaves_pass_through() {
        let platform = MockPlatform::new(1);
        let expected = CpuIdResult { eax: 1, ebx: 2, ecx: 3, edx: 4 };
        platform.set_cpuid(0x8000_0008, expected);

        let (exit_type, regs) = cpuid(&platform, &kernel_vmcb(), 0x8000_0008, 0);

        assert_eq!(exit_type, ExitType::IncrementRIP);
        assert_eq!((regs.rax, regs.rbx, regs.rcx, regs.rdx), (1, 2, 3, 4));
    }

    #[test]
    fn test_unload_request() {
        let platform = MockPlatform::new(1);

        let (exit_type, _) = cpuid(&platform, &kernel_vmcb(), CPUID_UNLOAD, CPUID_UNLOAD);
        assert_eq!(exit_type, ExitType::ExitHypervisor);

        // Wrong sub-leaf
        //
        let (exit_type, _) = cpuid(&platform, &kernel_vmcb(), CPUID_UNLOAD, 0);
        assert_eq!(exit_type, ExitType::IncrementRIP);
    }

    #[test]
    fn test_unload_from_user_mode_is_ignored() {
        let platform = MockPlatform::new(1);
        let mut vmcb = kernel_vmcb();
        vmcb.save_area.ss_attrib = 0x0cf3; // DPL 3

        let (exit_type, _) = cpuid(&platform, &vmcb, CPUID_UNLOAD, CPUID_UNLOAD);

        assert_eq!(exit_type, ExitType::IncrementRIP);
    }

    #[test]
    fn test_unload_can_be_disabled() {
        let platform = MockPlatform::new(1);
        let mut regs = GuestRegisters {
            rax: CPUID_UNLOAD as u64,
            rcx: CPUID_UNLOAD as u64,
            ..Default::default()
        };

        let exit_type = handle_cpuid(&platform, &kernel_vmcb(), &HypervisorConfig::default(), &mut regs, false);

        assert_eq!(exit_type, ExitType::IncrementRIP);
    }

    #[test]
    fn test_unload_marker() {
        assert_eq!(UNLOAD_MARKER, 0x4D56_534A);
    }
}
