//! The Windows kernel: bindings and the [`Platform`] the driver runs on.

#![allow(non_snake_case, non_camel_case_types)]

use crate::{
    error::{HypervisorError, Result},
    platform::{
        AllocType, Context, ControlRegisters, CpuIdResult, DescriptorTable, DescriptorTables,
        Platform,
    },
    svm::{
        data::{guest::GuestRegisters, processor_data::ProcessorData},
        msr::{EFER_SVME, IA32_EFER},
        vmlaunch::launch_vm,
    },
    utils::addresses::PhysicalAddress,
};
use core::{arch::asm, ffi::c_void, ptr::NonNull};
use x86::{
    controlregs::{cr0, cr2, cr3, cr4},
    msr::{rdmsr, wrmsr},
};
use x86_64::instructions::tables::{sgdt, sidt};

pub type NTSTATUS = i32;
pub type KIRQL = u8;

pub const DISPATCH_LEVEL: KIRQL = 2;
pub const MANUALLY_INITIATED_CRASH: u32 = 0xE2;
pub const ALL_PROCESSOR_GROUPS: u16 = 0xffff;
pub const MM_ANY_NODE_OK: u32 = 0x8000_0000;
pub const MM_CACHED: u32 = 1;
pub const NON_PAGED_POOL: u32 = 0;

/// 'tsuR'
pub const POOL_TAG: u32 = 0x7473_7552;

pub fn NT_SUCCESS(status: NTSTATUS) -> bool {
    status >= 0
}

#[repr(C)]
#[derive(Default)]
pub struct PROCESSOR_NUMBER {
    pub Group: u16,
    pub Number: u8,
    pub Reserved: u8,
}

#[repr(C)]
#[derive(Default)]
pub struct GROUP_AFFINITY {
    pub Mask: u64,
    pub Group: u16,
    pub Reserved: [u16; 3],
}

/// `CONTEXT` of x64. Only the control part is used, the rest is kept for the
/// size.
#[repr(C, align(16))]
pub struct CONTEXT {
    pub P1Home: [u64; 6],
    pub ContextFlags: u32,
    pub MxCsr: u32,
    pub SegCs: u16,
    pub SegDs: u16,
    pub SegEs: u16,
    pub SegFs: u16,
    pub SegGs: u16,
    pub SegSs: u16,
    pub EFlags: u32,
    pub Dr: [u64; 6],
    pub Gpr: [u64; 16],
    pub Rip: u64,
    pub Rest: [u8; 0x3d0],
}
const_assert_eq!(core::mem::size_of::<CONTEXT>(), 0x4d0);

const CONTEXT_GPR_RSP: usize = 4;

extern "system" {
    pub static KdDebuggerNotPresent: *mut u8;

    pub fn RtlCaptureContext(context: *mut CONTEXT);

    pub fn KeGetCurrentIrql() -> KIRQL;

    pub fn KeBugCheck(code: u32) -> !;

    pub fn ExAllocatePoolWithTag(pool_type: u32, bytes: usize, tag: u32) -> *mut c_void;

    pub fn ExFreePoolWithTag(memory: *mut c_void, tag: u32);

    pub fn MmAllocateContiguousMemorySpecifyCacheNode(
        bytes: usize, lowest: i64, highest: i64, boundary: i64, cache_type: u32, node: u32,
    ) -> *mut c_void;

    pub fn MmFreeContiguousMemory(memory: *mut c_void);

    pub fn MmGetPhysicalAddress(va: *const c_void) -> i64;

    pub fn MmGetVirtualForPhysical(pa: i64) -> *mut c_void;

    pub fn KeQueryActiveProcessorCountEx(group: u16) -> u32;

    pub fn KeGetCurrentProcessorNumberEx(number: *mut PROCESSOR_NUMBER) -> u32;

    pub fn KeGetProcessorNumberFromIndex(index: u32, number: *mut PROCESSOR_NUMBER) -> NTSTATUS;

    pub fn KeSetSystemGroupAffinityThread(affinity: *const GROUP_AFFINITY, previous: *mut GROUP_AFFINITY);

    pub fn KeRevertToUserGroupAffinityThread(previous: *const GROUP_AFFINITY);
}

extern "C" {
    pub fn DbgPrint(format: *const u8, ...) -> NTSTATUS;
}

/// Called by the trampoline on every #VMEXIT.
///
/// # Safety
///
/// Only the trampoline may call this, with the processor data of the current
/// processor and the registers it pushed.
#[no_mangle]
pub unsafe extern "system" fn handle_vmexit(data: *mut ProcessorData, regs: *mut GuestRegisters) -> u8 {
    crate::svm::vmexit::handle_vmexit(&NtPlatform, &mut *data, &mut *regs) as u8
}

/// The Windows kernel.
pub struct NtPlatform;

impl Platform for NtPlatform {
    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuIdResult {
        x86::cpuid::cpuid!(leaf, sub_leaf)
    }

    fn read_msr(&self, msr: u32) -> u64 {
        unsafe { rdmsr(msr) }
    }

    fn write_msr(&self, msr: u32, value: u64) {
        unsafe { wrmsr(msr, value) }
    }

    #[inline(always)]
    fn capture_context(&self) -> Context {
        let mut context = core::mem::MaybeUninit::<CONTEXT>::zeroed();
        unsafe { RtlCaptureContext(context.as_mut_ptr()) };
        let context = unsafe { context.assume_init() };

        Context {
            rip: context.Rip,
            rsp: context.Gpr[CONTEXT_GPR_RSP],
            rflags: context.EFlags as u64,
            seg_cs: context.SegCs,
            seg_ds: context.SegDs,
            seg_es: context.SegEs,
            seg_ss: context.SegSs,
        }
    }

    fn control_registers(&self) -> ControlRegisters {
        unsafe {
            ControlRegisters {
                cr0: cr0().bits() as u64,
                cr2: cr2() as u64,
                cr3: cr3(),
                cr4: cr4().bits() as u64,
            }
        }
    }

    fn descriptor_tables(&self) -> DescriptorTables {
        let (gdt, idt) = (sgdt(), sidt());

        DescriptorTables {
            gdt: DescriptorTable {
                base: gdt.base.as_u64(),
                limit: gdt.limit,
            },
            idt: DescriptorTable {
                base: idt.base.as_u64(),
                limit: idt.limit,
            },
        }
    }

    fn segment_limit(&self, selector: u16) -> u32 {
        let limit: u32;
        unsafe { asm!("lsl {0:e}, {1:e}", out(reg) limit, in(reg) selector as u32, options(nostack)) };

        limit
    }

    fn vmsave(&self, vmcb_pa: PhysicalAddress) {
        unsafe { asm!("vmsave rax", in("rax") vmcb_pa.as_u64()) };
    }

    fn vmload(&self, vmcb_pa: PhysicalAddress) {
        unsafe { asm!("vmload rax", in("rax") vmcb_pa.as_u64()) };
    }

    unsafe fn launch(&self, host_rsp: NonNull<u64>) -> Result<()> {
        launch_vm(host_rsp.as_ptr() as u64);

        // We should never continue the guest execution here.
        //
        Err(HypervisorError::LaunchReturned)
    }

    unsafe fn leave_hypervisor(&self, guest_vmcb_pa: PhysicalAddress, rflags: u64) {
        // Load the guest state that is not restored on #VMEXIT, then leave with
        // interrupts disabled until the guest flags are restored.
        //
        asm!("vmload rax", in("rax") guest_vmcb_pa.as_u64());
        asm!("cli");
        asm!("stgi");

        wrmsr(IA32_EFER, rdmsr(IA32_EFER) & !EFER_SVME);

        asm!("push {0}", "popfq", in(reg) rflags);
    }

    fn allocate(&self, kind: AllocType, bytes: usize) -> Option<NonNull<u8>> {
        let memory = match kind {
            AllocType::Normal => unsafe { ExAllocatePoolWithTag(NON_PAGED_POOL, bytes, POOL_TAG) },
            AllocType::Contiguous => unsafe {
                MmAllocateContiguousMemorySpecifyCacheNode(bytes, 0, -1, 0, MM_CACHED, MM_ANY_NODE_OK)
            },
        };

        NonNull::new(memory.cast())
    }

    unsafe fn free(&self, kind: AllocType, memory: NonNull<u8>, _bytes: usize) {
        match kind {
            AllocType::Normal => ExFreePoolWithTag(memory.as_ptr().cast(), POOL_TAG),
            AllocType::Contiguous => MmFreeContiguousMemory(memory.as_ptr().cast()),
        }
    }

    fn physical_address(&self, va: *const u8) -> PhysicalAddress {
        PhysicalAddress::from_pa(unsafe { MmGetPhysicalAddress(va.cast()) } as u64)
    }

    fn virtual_address(&self, pa: PhysicalAddress) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { MmGetVirtualForPhysical(pa.as_u64() as i64) }.cast())
    }

    fn processor_count(&self) -> u32 {
        unsafe { KeQueryActiveProcessorCountEx(ALL_PROCESSOR_GROUPS) }
    }

    fn current_processor_index(&self) -> u32 {
        unsafe { KeGetCurrentProcessorNumberEx(core::ptr::null_mut()) }
    }

    fn run_on_processor(&self, index: u32, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let mut processor_number = PROCESSOR_NUMBER::default();
        let status = unsafe { KeGetProcessorNumberFromIndex(index, &mut processor_number) };
        if !NT_SUCCESS(status) {
            return Err(HypervisorError::ProcessorSwitchFailed { index });
        }

        // Switch execution of this code to processor `index`.
        //
        let affinity = GROUP_AFFINITY {
            Mask: 1 << processor_number.Number,
            Group: processor_number.Group,
            Reserved: [0; 3],
        };
        let mut previous = GROUP_AFFINITY::default();
        unsafe { KeSetSystemGroupAffinityThread(&affinity, &mut previous) };

        let result = f();

        // Revert the previously executed processor.
        //
        unsafe { KeRevertToUserGroupAffinityThread(&previous) };

        result
    }

    /// Breaks if a kernel debugger is present on the system.
    fn debug_break(&self) {
        if unsafe { *KdDebuggerNotPresent } == 0 {
            unsafe { asm!("int 3") };
        }
    }

    fn bugcheck(&self) -> ! {
        unsafe { KeBugCheck(MANUALLY_INITIATED_CRASH) }
    }

    fn can_log(&self) -> bool {
        unsafe { KeGetCurrentIrql() <= DISPATCH_LEVEL }
    }
}
