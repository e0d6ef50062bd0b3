use crate::{
    platform::Platform,
    svm::{data::guest::GuestRegisters, events::EventInjection, vmcb::Vmcb, vmexit::ExitType},
};

/// The hypercalls the guest can issue with `vmmcall`. The number is passed in
/// `rcx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Hypercall {
    /// Returns [`PING_REPLY`] in `rax`.
    Ping = 1,
}

pub const PING_REPLY: u64 = u32::from_le_bytes(*b"SvmN") as u64;

impl TryFrom<u64> for Hypercall {
    type Error = u64;

    fn try_from(number: u64) -> Result<Self, Self::Error> {
        match number {
            1 => Ok(Self::Ping),
            other => Err(other),
        }
    }
}

pub fn handle_vmmcall<P: Platform>(
    platform: &P, vmcb: &mut Vmcb, guest_regs: &mut GuestRegisters,
) -> ExitType {
    platform.debug_break();

    // Hypercalls are only available to kernel mode.
    //
    if vmcb.save_area.cpl != 0 {
        EventInjection::gp().inject(vmcb);
        return ExitType::Continue;
    }

    match Hypercall::try_from(guest_regs.rcx) {
        Ok(Hypercall::Ping) => guest_regs.rax = PING_REPLY,
        Err(number) => {
            if platform.can_log() {
                log::trace!("Unknown hypercall: {:x}", number);
            }

            EventInjection::gp().inject(vmcb);
            return ExitType::Continue;
        }
    }

    ExitType::IncrementRIP
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::MockPlatform;

    #[test]
    fn test_ping() {
        let platform = MockPlatform::new(1);
        let mut vmcb: Vmcb = unsafe { core::mem::zeroed() };
        let mut regs = GuestRegisters { rcx: 1, ..Default::default() };

        assert_eq!(handle_vmmcall(&platform, &mut vmcb, &mut regs), ExitType::IncrementRIP);
        assert_eq!((regs.rax as u32).to_le_bytes(), *b"SvmN");
        assert_eq!(platform.debug_breaks(), 1);
    }

    #[test]
    fn test_unknown_hypercall() {
        let platform = MockPlatform::new(1);
        let mut vmcb: Vmcb = unsafe { core::mem::zeroed() };
        let mut regs = GuestRegisters { rcx: 0x42, ..Default::default() };

        assert_eq!(handle_vmmcall(&platform, &mut vmcb, &mut regs), ExitType::Continue);
        assert_eq!(vmcb.control_area.event_inj, EventInjection::gp().bits());
    }

    #[test]
    fn test_user_mode_is_rejected() {
        let platform = MockPlatform::new(1);
        let mut vmcb: Vmcb = unsafe { core::mem::zeroed() };
        vmcb.save_area.cpl = 3;
        let mut regs = GuestRegisters { rcx: 1, ..Default::default() };

        assert_eq!(handle_vmmcall(&platform, &mut vmcb, &mut regs), ExitType::Continue);
        assert_eq!(regs.rax, 0);
        assert_eq!(vmcb.control_area.event_inj, EventInjection::gp().bits());
    }
}
