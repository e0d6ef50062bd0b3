/// The general purpose registers of the guest, as pushed by the trampoline
/// after a #VMEXIT.
///
/// The order is the reverse of the push sequence, so the struct can be used
/// as a view on the host stack. `rsp` is not part of it: it lives in the VMCB,
/// as does the authoritative copy of `rax`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}
const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 15 * 8);

impl GuestRegisters {
    /// The 64-bit value of a `wrmsr`, passed in `edx:eax`.
    pub fn msr_value(&self) -> u64 {
        (self.rdx << 32) | (self.rax & 0xffff_ffff)
    }

    /// Sets the result of a `rdmsr` in `edx:eax`.
    pub fn set_msr_value(&mut self, value: u64) {
        self.rax = value & 0xffff_ffff;
        self.rdx = value >> 32;
    }
}
