//! The host side of the world switch.
//!
//! `launch_vm` switches to the host stack and runs the guest in a loop. On
//! every #VMEXIT the guest registers are pushed onto the host stack, right
//! below the [`HostStackLayout`], and `handle_vmexit` is called with the
//! processor data and these registers. The layout of the pushed registers is
//! [`GuestRegisters`].
//!
//! Based on: https://github.com/tandasat/SimpleSvm/blob/master/SimpleSvm/x64.asm
//!
//! [`HostStackLayout`]: crate::svm::data::processor_data::HostStackLayout
//! [`GuestRegisters`]: crate::svm::data::guest::GuestRegisters

use core::arch::global_asm;

global_asm!(
    r#"
.global launch_vm
launch_vm:
    // Switch to the host stack. [rsp] is the guest VMCB, [rsp + 8] the host VMCB.
    mov rsp, rcx

1:
    mov rax, [rsp]
    vmload rax
    vmrun rax
    vmsave rax

    // Save the guest registers, in the order of `GuestRegisters`.
    push rax
    push rcx
    push rdx
    push rbx
    push rbp
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    // rdx = guest registers, rcx = self_data.
    mov rdx, rsp
    mov rcx, [rdx + 15 * 8 + 0x10]

    // The handler may use the volatile xmm registers. Keeps rsp 16 byte
    // aligned at the call, with the shadow space below the saved registers.
    sub rsp, 0x88
    movaps [rsp + 0x20], xmm0
    movaps [rsp + 0x30], xmm1
    movaps [rsp + 0x40], xmm2
    movaps [rsp + 0x50], xmm3
    movaps [rsp + 0x60], xmm4
    movaps [rsp + 0x70], xmm5

    call handle_vmexit

    movaps xmm5, [rsp + 0x70]
    movaps xmm4, [rsp + 0x60]
    movaps xmm3, [rsp + 0x50]
    movaps xmm2, [rsp + 0x40]
    movaps xmm1, [rsp + 0x30]
    movaps xmm0, [rsp + 0x20]
    add rsp, 0x88

    test al, al

    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rbp
    pop rbx
    pop rdx
    pop rcx
    pop rax

    jz 1b

    // Unloaded: rbx = guest rip, rcx = guest rsp, rax:rdx = processor data.
    mov rsp, rcx
    mov ecx, 0x4D56534A
    jmp rbx
"#
);

extern "C" {
    /// Never returns if the guest has been launched.
    pub fn launch_vm(host_rsp: u64);
}
