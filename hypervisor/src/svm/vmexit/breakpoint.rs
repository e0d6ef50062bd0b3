use crate::svm::{events::EventInjection, vmcb::Vmcb, vmexit::ExitType};

/// Delivers an intercepted `#BP` to the guest.
///
/// The instruction pointer is moved past `int3` first, so the guest sees the
/// same return address as without the intercept.
pub fn handle_breakpoint(vmcb: &mut Vmcb) -> ExitType {
    EventInjection::bp().inject(vmcb);

    ExitType::IncrementRIP
}
