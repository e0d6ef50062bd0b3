//! #VMEXIT handling while a hypervisor runs inside the guest.
//!
//! The hardware always runs `02`. While the inner hypervisor runs (`Root`),
//! `02` carries its state and the intercepts of `01`. While its guest runs
//! (`Guest`), `02` carries the state from `12` and the intercepts of both.

use crate::{
    config::HypervisorConfig,
    platform::Platform,
    svm::{
        data::{
            guest::GuestRegisters,
            msr_bitmap::MsrBitmap,
            nested_data::{
                CpuMode, InnerVcpu, L1HostState, NestedData, NestedMode, NestedState, VirtualMsrs,
            },
        },
        events::EventInjection,
        msr::EFER_SVME,
        vmcb::{
            control_area::{
                ExceptionVector, InterceptMisc1, InterceptMisc2, VmExitReason,
                TLB_CONTROL_DO_NOTHING, TLB_CONTROL_FLUSH_GUEST,
            },
            save_area::SaveArea,
            Vmcb,
        },
        vmexit::{breakpoint, cpuid, fatal, msr, vmrun, ExitType},
    },
    utils::addresses::{virtual_address, PhysicalAddress},
};

/// Maps the VMCB of the inner hypervisor. Returns `None` if the address is not
/// page aligned or not backed by memory.
///
/// # Safety
///
/// The returned reference aliases guest memory; the guest must not be running
/// while it is alive.
pub(crate) unsafe fn map_vmcb12<'a, P: Platform>(
    platform: &P, vmcb12_pa: PhysicalAddress,
) -> Option<&'a mut Vmcb> {
    if !vmcb12_pa.is_page_aligned() {
        return None;
    }

    virtual_address(platform, vmcb12_pa)
}

/// Returns the `12` view after a #VMEXIT of the guest of the inner hypervisor:
/// `vmcb12` with the exit information and the guest state `02` ended up with.
///
/// `guest_rax` is the `rax` of the exited guest, which is not stored in `02`
/// while the exit is handled.
pub fn vmcb12_after_exit(vmcb02: &Vmcb, vmcb12: &Vmcb, guest_rax: u64) -> Vmcb {
    let mut next = *vmcb12;
    let (control, save) = (&vmcb02.control_area, &vmcb02.save_area);

    // Exit information
    //
    next.control_area.exit_code = control.exit_code;
    next.control_area.exit_info1 = control.exit_info1;
    next.control_area.exit_info2 = control.exit_info2;
    next.control_area.exit_int_info = control.exit_int_info;
    next.control_area.event_inj = control.event_inj;
    next.control_area.nrip = control.nrip;
    next.control_area.interrupt_shadow = control.interrupt_shadow;

    // Guest state that is saved on #VMEXIT
    //
    next.save_area.rax = guest_rax;
    next.save_area.rsp = save.rsp;
    next.save_area.rflags = save.rflags;
    next.save_area.rip = save.rip;
    next.save_area.cpl = save.cpl;
    next.save_area.lstar = save.lstar;

    next.save_area.cr0 = save.cr0;
    next.save_area.cr2 = save.cr2;
    next.save_area.cr3 = save.cr3;
    next.save_area.cr4 = save.cr4;
    next.save_area.dr6 = save.dr6;
    next.save_area.dr7 = save.dr7;

    next.save_area.gdtr_base = save.gdtr_base;
    next.save_area.gdtr_limit = save.gdtr_limit;
    next.save_area.idtr_base = save.idtr_base;
    next.save_area.idtr_limit = save.idtr_limit;

    copy_segments(save, &mut next);

    next
}

/// Copies ES, CS, SS and DS.
fn copy_segments(from: &SaveArea, to: &mut Vmcb) {
    let to = &mut to.save_area;

    macro_rules! copy_segment {
        ($($field:ident),*) => {
            $(to.$field = from.$field;)*
        };
    }

    copy_segment!(es_selector, es_attrib, es_limit, es_base);
    copy_segment!(cs_selector, cs_attrib, cs_limit, cs_base);
    copy_segment!(ss_selector, ss_attrib, ss_limit, ss_base);
    copy_segment!(ds_selector, ds_attrib, ds_limit, ds_base);
}

/// Sets the controls `02` runs with while the inner hypervisor runs: the ones
/// of `01`.
pub fn apply_outer_controls(vmcb01: &Vmcb, vmcb02: &mut Vmcb) {
    let (outer, merged) = (&vmcb01.control_area, &mut vmcb02.control_area);

    merged.intercept_cr_read = outer.intercept_cr_read;
    merged.intercept_cr_write = outer.intercept_cr_write;
    merged.intercept_dr_read = outer.intercept_dr_read;
    merged.intercept_dr_write = outer.intercept_dr_write;
    merged.intercept_exception = outer.intercept_exception;
    merged.intercept_misc1 = outer.intercept_misc1;
    merged.intercept_misc2 = outer.intercept_misc2;
    merged.iopm_base_pa = outer.iopm_base_pa;
    merged.msrpm_base_pa = outer.msrpm_base_pa;
    merged.tsc_offset = outer.tsc_offset;
    merged.guest_asid = outer.guest_asid;
    merged.np_enable = outer.np_enable;
    merged.ncr3 = outer.ncr3;
    merged.lbr_virtualization_enable = outer.lbr_virtualization_enable;
    merged.vintr = outer.vintr;
}

/// Sets the controls `02` runs with while the guest of the inner hypervisor
/// runs: everything either hypervisor intercepts, with the address
/// translation of `01`.
pub fn merge_controls(vmcb01: &Vmcb, vmcb12: &Vmcb, vmcb02: &mut Vmcb) {
    apply_outer_controls(vmcb01, vmcb02);

    let (inner, merged) = (&vmcb12.control_area, &mut vmcb02.control_area);

    merged.intercept_cr_read |= inner.intercept_cr_read;
    merged.intercept_cr_write |= inner.intercept_cr_write;
    merged.intercept_dr_read |= inner.intercept_dr_read;
    merged.intercept_dr_write |= inner.intercept_dr_write;
    merged.intercept_exception |= inner.intercept_exception;
    merged.intercept_misc1 |= inner.intercept_misc1;
    merged.intercept_misc2 |= inner.intercept_misc2;

    // Only the inner hypervisor intercepts I/O.
    //
    merged.iopm_base_pa = inner.iopm_base_pa;
    merged.tsc_offset = inner.tsc_offset;
}

/// Loads the guest state the inner hypervisor has set up in `12` into `02`.
pub fn load_guest_state(vmcb12: &Vmcb, vmcb02: &mut Vmcb) {
    let (from, to) = (&vmcb12.save_area, &mut vmcb02.save_area);

    to.gdtr_base = from.gdtr_base;
    to.gdtr_limit = from.gdtr_limit;
    to.idtr_base = from.idtr_base;
    to.idtr_limit = from.idtr_limit;

    to.efer = from.efer | EFER_SVME;
    to.cr0 = from.cr0;
    to.cr2 = from.cr2;
    to.cr3 = from.cr3;
    to.cr4 = from.cr4;
    to.dr6 = from.dr6;
    to.dr7 = from.dr7;
    to.gpat = from.gpat;
    to.cpl = from.cpl;

    to.rflags = from.rflags;
    to.rsp = from.rsp;
    to.rip = from.rip;
    to.rax = from.rax;

    // The state `vmload` transfers. The inner hypervisor loaded it before `vmrun`,
    // but it has been replaced by the host state since.
    //
    to.fs_selector = from.fs_selector;
    to.fs_attrib = from.fs_attrib;
    to.fs_limit = from.fs_limit;
    to.fs_base = from.fs_base;
    to.gs_selector = from.gs_selector;
    to.gs_attrib = from.gs_attrib;
    to.gs_limit = from.gs_limit;
    to.gs_base = from.gs_base;
    to.tr_selector = from.tr_selector;
    to.tr_attrib = from.tr_attrib;
    to.tr_limit = from.tr_limit;
    to.tr_base = from.tr_base;
    to.ldtr_selector = from.ldtr_selector;
    to.ldtr_attrib = from.ldtr_attrib;
    to.ldtr_limit = from.ldtr_limit;
    to.ldtr_base = from.ldtr_base;
    to.kernel_gs_base = from.kernel_gs_base;
    to.star = from.star;
    to.lstar = from.lstar;
    to.cstar = from.cstar;
    to.sf_mask = from.sf_mask;
    to.sysenter_cs = from.sysenter_cs;
    to.sysenter_esp = from.sysenter_esp;
    to.sysenter_eip = from.sysenter_eip;

    copy_segments(&vmcb12.save_area, vmcb02);

    vmcb02.control_area.event_inj = vmcb12.control_area.event_inj;
}

/// Switches `02` from the inner hypervisor to its guest, as `vmrun` of the
/// inner hypervisor would.
pub fn enter_guest(
    vmcb01: &Vmcb, vmcb02: &mut Vmcb, vmcb12: &Vmcb, inner: &mut InnerVcpu,
    guest_regs: &mut GuestRegisters,
) {
    inner.l1_host = L1HostState::capture(vmcb02);
    // The processor supports what either hypervisor has enabled.
    //
    inner.l2_msrs = VirtualMsrs {
        efer: vmcb12.save_area.efer,
        hsave_pa: 0,
        initial_efer: vmcb01.save_area.efer | vmcb12.save_area.efer,
    };

    merge_controls(vmcb01, vmcb12, vmcb02);
    load_guest_state(vmcb12, vmcb02);

    // Both guests share the ASID of `01`.
    //
    vmcb02.control_area.tlb_control = TLB_CONTROL_FLUSH_GUEST;

    guest_regs.rax = vmcb12.save_area.rax;
    inner.mode = NestedMode::Guest;
}

/// Delivers the current #VMEXIT of the guest to the inner hypervisor and
/// resumes it after its `vmrun`.
pub fn reflect_exit(
    vmcb01: &Vmcb, vmcb02: &mut Vmcb, vmcb12: &mut Vmcb, inner: &mut InnerVcpu,
    guest_regs: &mut GuestRegisters,
) -> ExitType {
    *vmcb12 = vmcb12_after_exit(vmcb02, vmcb12, guest_regs.rax);
    vmcb12.save_area.efer = inner.l2_msrs.efer;

    apply_outer_controls(vmcb01, vmcb02);
    inner.l1_host.restore(vmcb02);
    vmcb02.control_area.event_inj = 0;
    vmcb02.control_area.tlb_control = TLB_CONTROL_FLUSH_GUEST;

    // The inner hypervisor receives the address of the VMCB in `rax`, like
    // after a real #VMEXIT.
    //
    guest_regs.rax = inner.vmcb_guest_12_pa.as_u64();
    inner.mode = NestedMode::Root;

    ExitType::Continue
}

/// Whether the inner hypervisor wants to see the `rdmsr`/`wrmsr` of `msr`.
fn l1_intercepts_msr<P: Platform>(platform: &P, vmcb12: &Vmcb, msr: u32, write: bool) -> bool {
    let control = &vmcb12.control_area;
    if !control.intercept_misc1.contains(InterceptMisc1::INTERCEPT_MSR_PROT) {
        return false;
    }

    let msrpm_pa = PhysicalAddress::from_pa(control.msrpm_base_pa);
    match unsafe { virtual_address::<_, MsrBitmap>(platform, msrpm_pa) } {
        Some(bitmap) => bitmap.is_hooked(msr, write),
        None => true,
    }
}

/// Handles a #VMEXIT of `02`.
pub fn handle_nested_exit<P: Platform>(
    platform: &P, vmcb01: &Vmcb, nested: &mut NestedData, config: &HypervisorConfig,
    guest_regs: &mut GuestRegisters,
) -> ExitType {
    let NestedData {
        vmcb_guest_02: vmcb02,
        state: NestedState { mode, msrs },
        ..
    } = nested;

    let CpuMode::Nested(inner) = mode else {
        fatal(platform, format_args!("Nested #VMEXIT without an inner hypervisor"));
    };

    let Some(vmcb12) = (unsafe { map_vmcb12(platform, inner.vmcb_guest_12_pa) }) else {
        fatal(platform, format_args!("VMCB {:x} is gone", inner.vmcb_guest_12_pa));
    };

    vmcb02.control_area.tlb_control = TLB_CONTROL_DO_NOTHING;
    let reason = VmExitReason::from(vmcb02.control_area.exit_code);

    if platform.can_log() {
        log::trace!("Nested #VMEXIT in {:?}: {:?}", inner.mode, reason);
    }

    match inner.mode {
        NestedMode::Root => match reason {
            VmExitReason::Cpuid => cpuid::handle_cpuid(platform, vmcb02, config, guest_regs, false),
            VmExitReason::Msr => msr::handle_msr(platform, vmcb02, msrs, guest_regs),
            VmExitReason::Vmrun => {
                vmrun::resume_inner_guest(platform, vmcb01, vmcb02, inner, msrs, guest_regs)
            }
            VmExitReason::Vmmcall => ExitType::IncrementRIP,
            VmExitReason::Breakpoint => breakpoint::handle_breakpoint(vmcb02),
            VmExitReason::NestedPageFault | VmExitReason::Unexpected(_) => {
                fatal(platform, format_args!("Unexpected #VMEXIT of the inner hypervisor: {:?}", reason))
            }
        },
        NestedMode::Guest => {
            let intercepts12 = (
                vmcb12.control_area.intercept_misc1,
                vmcb12.control_area.intercept_misc2,
                vmcb12.control_area.intercept_exception,
            );

            match reason {
                VmExitReason::Cpuid
                    if intercepts12.0.contains(InterceptMisc1::INTERCEPT_CPUID) =>
                {
                    reflect_exit(vmcb01, vmcb02, vmcb12, inner, guest_regs)
                }
                VmExitReason::Cpuid => cpuid::handle_cpuid(platform, vmcb02, config, guest_regs, false),
                VmExitReason::Msr => {
                    let msr = guest_regs.rcx as u32;
                    let write = vmcb02.control_area.exit_info1 != 0;

                    if l1_intercepts_msr(platform, vmcb12, msr, write) {
                        reflect_exit(vmcb01, vmcb02, vmcb12, inner, guest_regs)
                    } else {
                        msr::handle_msr(platform, vmcb02, &mut inner.l2_msrs, guest_regs)
                    }
                }
                VmExitReason::Vmrun => {
                    EventInjection::gp().inject(vmcb02);
                    ExitType::Continue
                }
                VmExitReason::Vmmcall
                    if intercepts12.1.contains(InterceptMisc2::INTERCEPT_VMMCALL) =>
                {
                    reflect_exit(vmcb01, vmcb02, vmcb12, inner, guest_regs)
                }
                VmExitReason::Vmmcall => {
                    EventInjection::ud().inject(vmcb02);
                    ExitType::Continue
                }
                VmExitReason::Breakpoint
                    if intercepts12.2.contains(ExceptionVector::BREAKPOINT) =>
                {
                    reflect_exit(vmcb01, vmcb02, vmcb12, inner, guest_regs)
                }
                VmExitReason::Breakpoint => breakpoint::handle_breakpoint(vmcb02),
                VmExitReason::NestedPageFault => {
                    fatal(platform, format_args!("Nested page fault at {:x}", vmcb02.control_area.exit_info2))
                }
                // Only the inner hypervisor intercepts anything else.
                //
                VmExitReason::Unexpected(_) => reflect_exit(vmcb01, vmcb02, vmcb12, inner, guest_regs),
            }
        }
    }
}
