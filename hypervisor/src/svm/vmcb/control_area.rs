use bitflags::bitflags;

// Size: 0x400
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ControlArea {
    pub intercept_cr_read: u16,                       // +0x000
    pub intercept_cr_write: u16,                      // +0x002
    pub intercept_dr_read: u16,                       // +0x004
    pub intercept_dr_write: u16,                      // +0x006
    pub intercept_exception: ExceptionVector,         // +0x008
    pub intercept_misc1: InterceptMisc1,              // +0x00c
    pub intercept_misc2: InterceptMisc2,              // +0x010
    pub reserved1: [u8; 0x03c - 0x014],               // +0x014
    pub pause_filter_threshold: u16,                  // +0x03c
    pub pause_filter_count: u16,                      // +0x03e
    pub iopm_base_pa: u64,                            // +0x040
    pub msrpm_base_pa: u64,                           // +0x048
    pub tsc_offset: u64,                              // +0x050
    pub guest_asid: u32,                              // +0x058
    pub tlb_control: u32,                             // +0x05c
    pub vintr: u64,                                   // +0x060
    pub interrupt_shadow: u64,                        // +0x068
    pub exit_code: u64,                               // +0x070
    pub exit_info1: u64,                              // +0x078
    pub exit_info2: u64,                              // +0x080
    pub exit_int_info: u64,                           // +0x088
    pub np_enable: NpEnable,                          // +0x090
    pub avic_apic_bar: u64,                           // +0x098
    pub guest_pa_of_ghcb: u64,                        // +0x0a0
    pub event_inj: u64,                               // +0x0a8
    pub ncr3: u64,                                    // +0x0b0
    pub lbr_virtualization_enable: LbrVirtualization, // +0x0b8
    pub vmcb_clean: u64,                              // +0x0c0
    pub nrip: u64,                                    // +0x0c8
    pub num_of_bytes_fetched: u8,                     // +0x0d0
    pub guest_instruction_bytes: [u8; 15],            // +0x0d1
    pub avic_apic_backing_page_pointer: u64,          // +0x0e0
    pub reserved2: u64,                               // +0x0e8
    pub avic_logical_table_pointer: u64,              // +0x0f0
    pub avic_physical_table_pointer: u64,             // +0x0f8
    pub reserved3: u64,                               // +0x100
    pub vmcb_save_state_pointer: u64,                 // +0x108
    pub reserved4: [u8; 0x400 - 0x110],               // +0x110
}
const_assert_eq!(core::mem::size_of::<ControlArea>(), 0x400);

bitflags! {
    /// Exception intercepts, one bit per vector.
    pub struct ExceptionVector: u32 {
        const DEBUG = 1 << 1;
        const BREAKPOINT = 1 << 3;
        const INVALID_OPCODE = 1 << 6;
        const GENERAL_PROTECTION = 1 << 13;
        const PAGE_FAULT = 1 << 14;
    }

    pub struct InterceptMisc1: u32 {
        const INTERCEPT_INTR = 1 << 0;
        const INTERCEPT_NMI = 1 << 1;
        const INTERCEPT_SMI = 1 << 2;
        const INTERCEPT_INIT = 1 << 3;
        const INTERCEPT_RDTSC = 1 << 14;
        const INTERCEPT_CPUID = 1 << 18;
        const INTERCEPT_HLT = 1 << 24;
        const INTERCEPT_IOIO_PROT = 1 << 27;
        const INTERCEPT_MSR_PROT = 1 << 28;
        const INTERCEPT_SHUTDOWN = 1 << 31;
    }

    pub struct InterceptMisc2: u32 {
        const INTERCEPT_VMRUN = 1 << 0;
        const INTERCEPT_VMMCALL = 1 << 1;
        const INTERCEPT_VMLOAD = 1 << 2;
        const INTERCEPT_VMSAVE = 1 << 3;
        const INTERCEPT_STGI = 1 << 4;
        const INTERCEPT_CLGI = 1 << 5;
        const INTERCEPT_RDTSCP = 1 << 7;
    }

    pub struct NpEnable: u64 {
        const NESTED_PAGING                     = 1 << 0;
        const SECURE_ENCRYPTED_VIRTUALIZATION   = 1 << 1;
        const ENCRYPTED_STATE                   = 1 << 2;
    }

    /// See `15.23.1 Virtual Interrupt Control` and `15.33 Virtual GIF`.
    pub struct LbrVirtualization: u64 {
        const LBR_VIRTUALIZATION = 1 << 0;
        const VIRTUALIZED_VMSAVE_VMLOAD = 1 << 1;
    }
}

/// Virtual GIF enable, bit 25 of the `vintr` field.
pub const V_GIF_ENABLE: u64 = 1 << 25;

/// `TLB_CONTROL` values, see `15.16.1 TLB Flush`.
pub const TLB_CONTROL_DO_NOTHING: u32 = 0;
pub const TLB_CONTROL_FLUSH_GUEST: u32 = 3;

/// Exit codes, see `Appendix C - SVM Intercept Exit Codes`.
pub mod exit_code {
    pub const VMEXIT_EXCEPTION_BP: u64 = 67;
    pub const VMEXIT_CPUID: u64 = 114;
    pub const VMEXIT_MSR: u64 = 124;
    pub const VMEXIT_VMRUN: u64 = 128;
    pub const VMEXIT_VMMCALL: u64 = 129;
    pub const VMEXIT_NPF: u64 = 1024;
    pub const VMEXIT_INVALID: u64 = u64::MAX;
}

/// The reasons for a #VMEXIT this hypervisor configures intercepts for.
///
/// Every other exit code lands in `Unexpected`, so the dispatcher has to
/// decide explicitly what happens with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExitReason {
    Cpuid,
    Msr,
    Vmrun,
    Vmmcall,
    Breakpoint,
    NestedPageFault,
    Unexpected(u64),
}

impl From<u64> for VmExitReason {
    fn from(code: u64) -> Self {
        match code {
            exit_code::VMEXIT_CPUID => Self::Cpuid,
            exit_code::VMEXIT_MSR => Self::Msr,
            exit_code::VMEXIT_VMRUN => Self::Vmrun,
            exit_code::VMEXIT_VMMCALL => Self::Vmmcall,
            exit_code::VMEXIT_EXCEPTION_BP => Self::Breakpoint,
            exit_code::VMEXIT_NPF => Self::NestedPageFault,
            other => Self::Unexpected(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_reason_from_code() {
        assert_eq!(VmExitReason::from(114), VmExitReason::Cpuid);
        assert_eq!(VmExitReason::from(124), VmExitReason::Msr);
        assert_eq!(VmExitReason::from(128), VmExitReason::Vmrun);
        assert_eq!(VmExitReason::from(129), VmExitReason::Vmmcall);
        assert_eq!(VmExitReason::from(67), VmExitReason::Breakpoint);
        assert_eq!(VmExitReason::from(1024), VmExitReason::NestedPageFault);
        assert_eq!(
            VmExitReason::from(exit_code::VMEXIT_INVALID),
            VmExitReason::Unexpected(u64::MAX)
        );
    }

    #[test]
    fn test_control_area_offsets() {
        let area = core::mem::MaybeUninit::<ControlArea>::uninit();
        let base = area.as_ptr() as usize;
        let offset = |field: *const u8| field as usize - base;

        unsafe {
            let ptr = area.as_ptr();
            assert_eq!(offset(core::ptr::addr_of!((*ptr).msrpm_base_pa) as _), 0x48);
            assert_eq!(offset(core::ptr::addr_of!((*ptr).exit_code) as _), 0x70);
            assert_eq!(offset(core::ptr::addr_of!((*ptr).np_enable) as _), 0x90);
            assert_eq!(offset(core::ptr::addr_of!((*ptr).event_inj) as _), 0xa8);
            assert_eq!(offset(core::ptr::addr_of!((*ptr).nrip) as _), 0xc8);
        }
    }
}
