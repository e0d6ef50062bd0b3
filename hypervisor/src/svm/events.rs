use crate::svm::vmcb::Vmcb;
use bitfield::bitfield;

bitfield! {
    /// See `15.20 Event Injection`.
    ///
    /// The VMM can inject exceptions or interrupts (collectively referred to as
    /// events) into the guest by setting bits in the VMCB’s EVENTINJ field prior
    /// to executing the VMRUN instruction.
    ///
    /// ## Fields
    ///
    /// - `Vector`: The 8-bit IDT vector of the interrupt or exception.
    /// - `Type`: 0 = INTR, 2 = NMI, 3 = exception, 4 = software interrupt.
    /// - `Error Code Valid` (`EV`): Whether the exception pushes an error code.
    /// - `Valid`: Whether an event is to be injected.
    /// - `Error Code`: Pushed onto the stack if `EV` is set.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EventInjection(u64);
    impl Debug;
    pub get_vector, set_vector: 7, 0;                       // [0-7]
    pub get_type, set_type: 10, 8;                          // [8-10]
    pub get_error_code_valid, set_error_code_valid: 11, 11; // [11]
    // Reserved                                             // [12-30]
    pub get_valid, set_valid: 31, 31;                       // [31]
    pub get_error_code, set_error_code: 63, 32;             // [32-63]
}

const EVENT_TYPE_EXCEPTION: u64 = 3;

impl EventInjection {
    /// See `8 Exceptions and Interrupts > 8.2 Vectors > 8.2.14 #GP`.
    pub fn gp() -> Self {
        let mut event = EventInjection(0);
        event.set_vector(13); // #GP
        event.set_type(EVENT_TYPE_EXCEPTION);
        event.set_error_code_valid(1);
        event.set_valid(1);

        event
    }

    /// See `8.2.4 #BP—Breakpoint Exception (Vector 3)`.
    pub fn bp() -> Self {
        let mut event = EventInjection(0);
        event.set_vector(3); // #BP
        event.set_type(EVENT_TYPE_EXCEPTION);
        event.set_valid(1);

        event
    }

    /// See `8.2.7 #UD—Invalid-Opcode Exception (Vector 6)`.
    pub fn ud() -> Self {
        let mut event = EventInjection(0);
        event.set_vector(6); // #UD
        event.set_type(EVENT_TYPE_EXCEPTION);
        event.set_valid(1);

        event
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Injects the event into the guest described by `vmcb` on its next run.
    pub fn inject(&self, vmcb: &mut Vmcb) {
        vmcb.control_area.event_inj = self.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_general_protection_encoding() {
        let event = EventInjection::gp();

        assert_eq!(event.0, 0x8000_0b0d);
        assert_eq!(event.get_error_code(), 0);
    }

    #[test]
    fn test_breakpoint_encoding() {
        let event = EventInjection::bp();

        assert_eq!(event.0, 0x8000_0303);
        assert_eq!(event.get_error_code_valid(), 0);
    }

    #[test]
    fn test_inject_writes_the_event_field() {
        let mut vmcb: Vmcb = unsafe { core::mem::zeroed() };

        EventInjection::ud().inject(&mut vmcb);

        assert_eq!(vmcb.control_area.event_inj, 0x8000_0306);
    }
}
