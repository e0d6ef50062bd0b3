use crate::{
    platform::Platform,
    svm::{
        data::{guest::GuestRegisters, nested_data::VirtualMsrs},
        events::EventInjection,
        msr::{is_valid_efer, EFER_SVME, IA32_EFER, MSR_LSTAR, SVM_MSR_VM_HSAVE_PA},
        vmcb::Vmcb,
        vmexit::ExitType,
    },
};
use x86::bits64::paging::BASE_PAGE_SIZE;

/// Emulates `rdmsr`/`wrmsr` of the MSRs intercepted by the msr bitmap.
///
/// `msrs` is the view of the guest `vmcb` belongs to. Any other MSR raises
/// `#GP`, as it can only get here if the guest hypervisor intercepts it.
pub fn handle_msr<P: Platform>(
    platform: &P, vmcb: &mut Vmcb, msrs: &mut VirtualMsrs, guest_regs: &mut GuestRegisters,
) -> ExitType {
    let msr = guest_regs.rcx as u32;
    let write_access = vmcb.control_area.exit_info1 != 0;

    match (msr, write_access) {
        (IA32_EFER, false) => guest_regs.set_msr_value(msrs.efer),
        (IA32_EFER, true) => {
            let value = guest_regs.msr_value();

            // Setting reserved bits raises #GP. Resuming with an invalid value would
            // fail with VMEXIT_INVALID instead.
            //
            // See `Extended Feature Enable Register (EFER)` for what values are allowed.
            //
            if !is_valid_efer(value, msrs.initial_efer) {
                if platform.can_log() {
                    log::trace!("Invalid EFER value: {:x}", value);
                }

                EventInjection::gp().inject(vmcb);
                return ExitType::Continue;
            }

            // The guest may clear SVME, but the processor has to keep it.
            //
            msrs.efer = value;
            vmcb.save_area.efer = value | EFER_SVME;
        }
        (MSR_LSTAR, false) => guest_regs.set_msr_value(vmcb.save_area.lstar),
        (MSR_LSTAR, true) => {
            if platform.can_log() {
                log::trace!("Ignoring write to LSTAR: {:x}", guest_regs.msr_value());
            }
        }
        (SVM_MSR_VM_HSAVE_PA, false) => guest_regs.set_msr_value(msrs.hsave_pa),
        (SVM_MSR_VM_HSAVE_PA, true) => {
            let value = guest_regs.msr_value();
            if value % BASE_PAGE_SIZE as u64 != 0 {
                EventInjection::gp().inject(vmcb);
                return ExitType::Continue;
            }

            msrs.hsave_pa = value;
        }
        _ => {
            EventInjection::gp().inject(vmcb);
            return ExitType::Continue;
        }
    }

    ExitType::IncrementRIP
}
