//! Emulation of `vmrun` for a hypervisor running in the guest.

use crate::{
    platform::Platform,
    svm::{
        data::{
            guest::GuestRegisters,
            nested_data::{CpuMode, InnerVcpu, L1HostState, NestedData, NestedMode, VirtualMsrs},
            processor_data::ProcessorData,
        },
        events::EventInjection,
        msr::EFER_SVME,
        vmcb::Vmcb,
        vmexit::{
            nested::{enter_guest, map_vmcb12},
            ExitType,
        },
    },
    utils::addresses::{physical_address, PhysicalAddress},
};

/// Returns the exception `vmrun` raises in the guest described by `vmcb`, if
/// any. `efer` is the value the guest believes is set.
fn vmrun_fault(vmcb: &Vmcb, efer: u64) -> Option<EventInjection> {
    if efer & EFER_SVME == 0 {
        return Some(EventInjection::ud());
    }

    if vmcb.save_area.cpl != 0 {
        return Some(EventInjection::gp());
    }

    None
}

/// The first `vmrun` of the guest: switches the processor to nested mode.
///
/// `02` starts as a copy of `01`, so the inner hypervisor continues with the
/// state it had when its guest exits.
pub fn enter_nested<P: Platform>(
    platform: &P, data: &mut ProcessorData, nested: &mut NestedData,
    guest_regs: &mut GuestRegisters,
) -> ExitType {
    if let Some(event) = vmrun_fault(&data.guest_vmcb, nested.state.msrs.efer) {
        event.inject(&mut data.guest_vmcb);
        return ExitType::Continue;
    }

    let vmcb12_pa = PhysicalAddress::from_pa(guest_regs.rax);
    let Some(vmcb12) = (unsafe { map_vmcb12(platform, vmcb12_pa) }) else {
        if platform.can_log() {
            log::trace!("Invalid VMCB address: {:x}", vmcb12_pa);
        }

        EventInjection::gp().inject(&mut data.guest_vmcb);
        return ExitType::Continue;
    };

    let vmcb_guest_02_pa = physical_address(platform, &nested.vmcb_guest_02);
    let vmcb_host_02_pa = physical_address(platform, &nested.vmcb_host_02);

    nested.vmcb_guest_02 = data.guest_vmcb;

    // Save the host state, which is currently loaded, for the exits of `02`.
    //
    platform.vmsave(vmcb_host_02_pa);

    let mut inner = InnerVcpu {
        vmcb_guest_02_pa,
        vmcb_host_02_pa,
        vmcb_guest_12_pa: vmcb12_pa,
        host_state_area_12_pa: PhysicalAddress::from_pa(nested.state.msrs.hsave_pa),
        mode: NestedMode::Root,
        l1_host: L1HostState::default(),
        l2_msrs: VirtualMsrs::default(),
    };
    enter_guest(&data.guest_vmcb, &mut nested.vmcb_guest_02, vmcb12, &mut inner, guest_regs);

    nested.state.mode = CpuMode::Nested(inner);
    data.host_stack_layout.guest_vmcb_pa = vmcb_guest_02_pa;

    if platform.can_log() {
        log::trace!("Entered nested mode with VMCB {:x}", vmcb12_pa);
    }

    ExitType::Continue
}

/// `vmrun` of the inner hypervisor after the first one: resumes its guest.
pub fn resume_inner_guest<P: Platform>(
    platform: &P, vmcb01: &Vmcb, vmcb02: &mut Vmcb, inner: &mut InnerVcpu, l1_msrs: &VirtualMsrs,
    guest_regs: &mut GuestRegisters,
) -> ExitType {
    if let Some(event) = vmrun_fault(vmcb02, l1_msrs.efer) {
        event.inject(vmcb02);
        return ExitType::Continue;
    }

    let vmcb12_pa = PhysicalAddress::from_pa(guest_regs.rax);
    let Some(vmcb12) = (unsafe { map_vmcb12(platform, vmcb12_pa) }) else {
        EventInjection::gp().inject(vmcb02);
        return ExitType::Continue;
    };

    inner.vmcb_guest_12_pa = vmcb12_pa;
    inner.host_state_area_12_pa = PhysicalAddress::from_pa(l1_msrs.hsave_pa);
    enter_guest(vmcb01, vmcb02, vmcb12, inner, guest_regs);

    ExitType::Continue
}
