//! The #VMEXIT dispatcher.

use crate::{
    config::HypervisorConfig,
    platform::Platform,
    svm::{
        data::{
            guest::GuestRegisters,
            nested_data::{CpuMode, NestedData},
            processor_data::{ProcessorData, UnloadHandle},
        },
        events::EventInjection,
        vmcb::control_area::VmExitReason,
    },
};
use core::{fmt, ptr::NonNull};

pub mod breakpoint;
pub mod cpuid;
pub mod msr;
pub mod nested;
pub mod vmmcall;
pub mod vmrun;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    /// Unload the hypervisor on this processor.
    ExitHypervisor,
    /// The instruction has been emulated: continue after it.
    IncrementRIP,
    /// Resume the guest without touching the instruction pointer.
    Continue,
}

/// Halts the system. Used for exits that leave the hypervisor in an unknown
/// state.
pub(crate) fn fatal<P: Platform>(platform: &P, reason: fmt::Arguments<'_>) -> ! {
    if platform.can_log() {
        log::error!("{}", reason);
    }

    platform.debug_break();
    platform.bugcheck()
}

/// Leaves the hypervisor on the unload path.
///
/// Sets the registers the trampoline and the caller of the unload request
/// expect:
/// - `rax`, `rdx` = the address of the processor data
/// - `rbx` = address to return
/// - `rcx` = stack pointer to restore
unsafe fn exit_hypervisor<P: Platform>(
    platform: &P, data: &mut ProcessorData, guest_regs: &mut GuestRegisters,
) {
    let (low, high) = UnloadHandle::new(NonNull::from(&mut *data)).encode();
    guest_regs.rax = low as u64;
    guest_regs.rdx = high as u64;

    guest_regs.rbx = data.guest_vmcb.control_area.nrip;
    guest_regs.rcx = data.guest_vmcb.save_area.rsp;

    platform.leave_hypervisor(
        data.host_stack_layout.guest_vmcb_pa,
        data.guest_vmcb.save_area.rflags,
    );
}

/// Handles a #VMEXIT of `01`.
fn handle_flat_exit<P: Platform>(
    platform: &P, data: &mut ProcessorData, nested: &mut NestedData, config: &HypervisorConfig,
    guest_regs: &mut GuestRegisters,
) -> ExitType {
    let reason = VmExitReason::from(data.guest_vmcb.control_area.exit_code);

    if platform.can_log() {
        log::trace!("#VMEXIT: {:?}", reason);
    }

    match reason {
        VmExitReason::Cpuid => {
            cpuid::handle_cpuid(platform, &data.guest_vmcb, config, guest_regs, true)
        }
        VmExitReason::Msr => {
            msr::handle_msr(platform, &mut data.guest_vmcb, &mut nested.state.msrs, guest_regs)
        }
        VmExitReason::Vmrun if config.nested_virtualization => {
            vmrun::enter_nested(platform, data, nested, guest_regs)
        }
        VmExitReason::Vmrun => {
            EventInjection::gp().inject(&mut data.guest_vmcb);
            ExitType::Continue
        }
        VmExitReason::Vmmcall => {
            vmmcall::handle_vmmcall(platform, &mut data.guest_vmcb, guest_regs)
        }
        VmExitReason::Breakpoint => breakpoint::handle_breakpoint(&mut data.guest_vmcb),
        VmExitReason::NestedPageFault => fatal(
            platform,
            format_args!(
                "Nested page fault at {:x}",
                data.guest_vmcb.control_area.exit_info2
            ),
        ),
        VmExitReason::Unexpected(code) => {
            fatal(platform, format_args!("Unexpected #VMEXIT: {:x}", code))
        }
    }
}

/// Handles a #VMEXIT. Returns `true` if the hypervisor has been unloaded on
/// this processor.
pub fn handle_vmexit<P: Platform>(
    platform: &P, data: &mut ProcessorData, guest_regs: &mut GuestRegisters,
) -> bool {
    let nested = unsafe { &mut *data.host_stack_layout.nested_data };

    // Load host state that is not loaded on #VMEXIT.
    //
    let host_vmcb_pa = match &nested.state.mode {
        CpuMode::Flat => data.host_stack_layout.host_vmcb_pa,
        CpuMode::Nested(inner) => inner.vmcb_host_02_pa,
    };
    platform.vmload(host_vmcb_pa);

    if !data.host_stack_layout.is_intact() {
        fatal(platform, format_args!("The host stack has been overwritten"));
    }

    let config = unsafe { (*data.host_stack_layout.shared_data).config };

    // Guest's RAX is overwritten by the host's value on #VMEXIT and saved in
    // the VMCB instead. Reflect the guest RAX to the context.
    //
    let exit_type = if nested.state.mode.is_nested() {
        guest_regs.rax = nested.vmcb_guest_02.save_area.rax;

        let exit_type =
            nested::handle_nested_exit(platform, &data.guest_vmcb, nested, &config, guest_regs);
        if exit_type == ExitType::IncrementRIP {
            nested.vmcb_guest_02.advance_rip();
        }
        exit_type
    } else {
        guest_regs.rax = data.guest_vmcb.save_area.rax;

        let exit_type = handle_flat_exit(platform, data, nested, &config, guest_regs);
        if exit_type == ExitType::IncrementRIP {
            data.guest_vmcb.advance_rip();
        }
        exit_type
    };

    if exit_type == ExitType::ExitHypervisor {
        unsafe { exit_hypervisor(platform, data, guest_regs) };
        return true;
    }

    // Reflect potentially updated guest's RAX to the VMCB that runs next. Again,
    // unlike other GPRs, RAX is loaded from VMCB on VMRUN.
    //
    let next_vmcb = if nested.state.mode.is_nested() {
        &mut nested.vmcb_guest_02
    } else {
        &mut data.guest_vmcb
    };
    next_vmcb.save_area.rax = guest_regs.rax;

    false
}
