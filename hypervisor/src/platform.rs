//! The boundary between the hypervisor and the processor/kernel it runs on.
//!
//! Everything that executes a privileged instruction or calls into the kernel
//! goes through [`Platform`]. The Windows kernel implementation lives in
//! `utils::nt`, the unit tests use an in-memory processor model.

use crate::{error::Result, utils::addresses::PhysicalAddress};
use core::ptr::NonNull;
pub use x86::cpuid::CpuIdResult;

/// How a block of memory has been allocated, so it can be freed with the
/// matching primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocType {
    /// Page aligned, non paged memory.
    Normal,
    /// Page aligned, physically contiguous memory.
    Contiguous,
}

/// The register state captured at the point where the current processor is
/// virtualized. The guest resumes exactly there after the launch.
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub seg_cs: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_ss: u16,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ControlRegisters {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptorTables {
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
}

pub trait Platform {
    /// Executes `cpuid` with the specified leaf and sub-leaf.
    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuIdResult;

    fn read_msr(&self, msr: u32) -> u64;

    fn write_msr(&self, msr: u32, value: u64);

    /// Captures the caller's register state. Implementations must be inlined
    /// into the caller, as the guest resumes at the captured instruction.
    fn capture_context(&self) -> Context;

    fn control_registers(&self) -> ControlRegisters;

    fn descriptor_tables(&self) -> DescriptorTables;

    /// Returns the segment limit of `selector` (`lsl`).
    fn segment_limit(&self, selector: u16) -> u32;

    fn vmsave(&self, vmcb_pa: PhysicalAddress);

    fn vmload(&self, vmcb_pa: PhysicalAddress);

    /// Enters the guest with the host stack at `host_rsp`.
    ///
    /// On hardware this only returns if the trampoline failed. Execution of the
    /// guest continues at the context captured before.
    ///
    /// # Safety
    ///
    /// `host_rsp` must point to the `guest_vmcb_pa` field of a fully prepared
    /// host stack layout.
    unsafe fn launch(&self, host_rsp: NonNull<u64>) -> Result<()>;

    /// Leaves host mode for good: loads the guest state of `guest_vmcb_pa`,
    /// disables interrupts, sets GIF, clears `EFER.SVME` and restores the guest
    /// `rflags`.
    ///
    /// # Safety
    ///
    /// Must only be called from the #VMEXIT handler on the unload path.
    unsafe fn leave_hypervisor(&self, guest_vmcb_pa: PhysicalAddress, rflags: u64);

    /// Allocates `bytes` of page aligned memory.
    fn allocate(&self, kind: AllocType, bytes: usize) -> Option<NonNull<u8>>;

    /// Frees memory that has been returned by [`Platform::allocate`].
    ///
    /// # Safety
    ///
    /// `memory` must have been allocated with the same `kind` and `bytes` and
    /// must not be used afterwards.
    unsafe fn free(&self, kind: AllocType, memory: NonNull<u8>, bytes: usize);

    fn physical_address(&self, va: *const u8) -> PhysicalAddress;

    fn virtual_address(&self, pa: PhysicalAddress) -> Option<NonNull<u8>>;

    fn processor_count(&self) -> u32;

    fn current_processor_index(&self) -> u32;

    /// Pins the current thread to processor `index`, runs `f` and reverts the
    /// affinity.
    fn run_on_processor(&self, index: u32, f: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    /// Breaks into the debugger if one is attached.
    fn debug_break(&self);

    /// Halts the system.
    fn bugcheck(&self) -> !;

    /// Whether logging is allowed at the current interrupt level.
    fn can_log(&self) -> bool;
}
