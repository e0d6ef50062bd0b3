//! An in-memory processor model for the unit tests.

use crate::{
    config::HypervisorConfig,
    error::{HypervisorError, Result},
    platform::{
        AllocType, Context, ControlRegisters, CpuIdResult, DescriptorTable, DescriptorTables,
        Platform,
    },
    svm::{
        data::{
            guest::GuestRegisters,
            nested_data::{NestedData, VirtualMsrs},
            processor_data::ProcessorData,
            shared_data::{OwnedSharedData, SharedData},
        },
        msr::{EFER_SVME, IA32_EFER, IA32_PAT, MSR_LSTAR, SVM_MSR_VM_CR},
        vmcb::{
            control_area::exit_code::{VMEXIT_CPUID, VMEXIT_MSR},
            Vmcb,
        },
        vmexit::{self, cpuid::UNLOAD_MARKER},
    },
    utils::{addresses::PhysicalAddress, memory::AllocatedMemory},
};
use std::{
    alloc::Layout,
    cell::{Cell, RefCell},
    collections::HashMap,
    ptr::NonNull,
    vec::Vec,
};
use x86::bits64::paging::BASE_PAGE_SIZE;

/// Null, 64-bit kernel code, kernel data, 32-bit user code and user data.
static GDT: [u64; 5] = [
    0,
    0x0020_9b00_0000_0000,
    0x00cf_9300_0000_ffff,
    0x00cf_fb00_0000_ffff,
    0x00cf_f300_0000_ffff,
];

pub const MOCK_EFER: u64 = 0xd01;
pub const MOCK_LSTAR: u64 = 0xfffff800_1234_5678;
const MOCK_PAT: u64 = 0x0007_0406_0007_0406;

struct MockProcessor {
    msrs: RefCell<HashMap<u32, u64>>,
    /// Set while the processor runs a guest.
    host_rsp: Cell<Option<NonNull<u64>>>,
}

impl MockProcessor {
    fn new() -> Self {
        let msrs = [
            (IA32_EFER, MOCK_EFER),
            (IA32_PAT, MOCK_PAT),
            (MSR_LSTAR, MOCK_LSTAR),
            (SVM_MSR_VM_CR, 0),
        ];

        Self {
            msrs: RefCell::new(msrs.into_iter().collect()),
            host_rsp: Cell::new(None),
        }
    }
}

/// A machine with `n` AMD processors that support SVM with nested paging.
///
/// Memory is allocated from the test process, physical addresses are the
/// virtual ones. `launch` does not run anything: the processor is marked as
/// running a guest and every `cpuid` it executes afterwards is turned into a
/// #VMEXIT that is handled by the real dispatcher.
pub struct MockPlatform {
    processors: Vec<MockProcessor>,
    current: Cell<u32>,
    in_host: Cell<bool>,
    cpuid: RefCell<HashMap<u32, CpuIdResult>>,

    allocations: RefCell<HashMap<usize, (AllocType, usize)>>,
    allocation_budget: Cell<Option<usize>>,
    failing_processor: Cell<Option<u32>>,
    failing_launch: Cell<bool>,

    vmsaves: RefCell<Vec<PhysicalAddress>>,
    vmloads: RefCell<Vec<PhysicalAddress>>,
    debug_breaks: Cell<u32>,
    log_checks: Cell<u32>,
}

impl MockPlatform {
    pub fn new(processor_count: u32) -> Self {
        let cpuid = [
            (
                0x0000_0000,
                CpuIdResult {
                    eax: 0x10,
                    ebx: u32::from_le_bytes(*b"Auth"),
                    ecx: u32::from_le_bytes(*b"cAMD"),
                    edx: u32::from_le_bytes(*b"enti"),
                },
            ),
            (
                0x8000_0001,
                CpuIdResult {
                    eax: 0,
                    ebx: 0,
                    ecx: 1 << 2,
                    edx: 0,
                },
            ),
            (
                0x8000_000A,
                CpuIdResult {
                    eax: 1,
                    ebx: 0x8000,
                    ecx: 0,
                    edx: 1 << 0,
                },
            ),
        ];

        Self {
            processors: (0..processor_count).map(|_| MockProcessor::new()).collect(),
            current: Cell::new(0),
            in_host: Cell::new(false),
            cpuid: RefCell::new(cpuid.into_iter().collect()),
            allocations: RefCell::new(HashMap::new()),
            allocation_budget: Cell::new(None),
            failing_processor: Cell::new(None),
            failing_launch: Cell::new(false),
            vmsaves: RefCell::new(Vec::new()),
            vmloads: RefCell::new(Vec::new()),
            debug_breaks: Cell::new(0),
            log_checks: Cell::new(0),
        }
    }

    pub fn set_cpuid(&self, leaf: u32, result: CpuIdResult) {
        self.cpuid.borrow_mut().insert(leaf, result);
    }

    /// Lets the next `count` allocations succeed and every one after fail.
    pub fn fail_allocation_after(&self, count: usize) {
        self.allocation_budget.set(Some(count));
    }

    pub fn fail_processor(&self, index: u32) {
        self.failing_processor.set(Some(index));
    }

    pub fn fail_launch(&self) {
        self.failing_launch.set(true);
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.borrow().len()
    }

    pub fn is_running_guest(&self, index: u32) -> bool {
        self.processors[index as usize].host_rsp.get().is_some()
    }

    pub fn msr_on(&self, index: u32, msr: u32) -> u64 {
        self.processors[index as usize]
            .msrs
            .borrow()
            .get(&msr)
            .copied()
            .unwrap_or(0)
    }

    pub fn vmsaves(&self) -> Vec<PhysicalAddress> {
        self.vmsaves.borrow().clone()
    }

    pub fn vmloads(&self) -> Vec<PhysicalAddress> {
        self.vmloads.borrow().clone()
    }

    pub fn debug_breaks(&self) -> u32 {
        self.debug_breaks.get()
    }

    /// How often the hypervisor asked whether it may log.
    pub fn log_checks(&self) -> u32 {
        self.log_checks.get()
    }

    fn processor(&self) -> &MockProcessor {
        &self.processors[self.current.get() as usize]
    }

    fn raw_cpuid(&self, leaf: u32) -> CpuIdResult {
        self.cpuid
            .borrow()
            .get(&leaf)
            .copied()
            .unwrap_or(CpuIdResult {
                eax: 0,
                ebx: 0,
                ecx: 0,
                edx: 0,
            })
    }

    /// Executes `cpuid` in the guest: the intercept fires and the #VMEXIT is
    /// handled like on hardware.
    unsafe fn guest_cpuid(&self, host_rsp: NonNull<u64>, leaf: u32, sub_leaf: u32) -> CpuIdResult {
        let layout = host_rsp.as_ptr();

        {
            let vmcb = &mut *(*layout as *mut Vmcb);
            vmcb.control_area.exit_code = VMEXIT_CPUID;
            vmcb.control_area.nrip = vmcb.save_area.rip + 2;
            vmcb.save_area.rax = leaf as u64;
        }

        let data = &mut *(*layout.add(2) as *mut ProcessorData);
        let mut regs = GuestRegisters {
            rcx: sub_leaf as u64,
            ..Default::default()
        };

        self.in_host.set(true);
        let unloaded = vmexit::handle_vmexit(self, data, &mut regs);
        self.in_host.set(false);

        if unloaded {
            self.processor().host_rsp.set(None);

            return CpuIdResult {
                eax: regs.rax as u32,
                ebx: regs.rbx as u32,
                ecx: UNLOAD_MARKER,
                edx: regs.rdx as u32,
            };
        }

        // Hardware reloads rax from the VMCB that runs next.
        //
        let vmcb = &*(*layout as *const Vmcb);
        CpuIdResult {
            eax: vmcb.save_area.rax as u32,
            ebx: regs.rbx as u32,
            ecx: regs.rcx as u32,
            edx: regs.rdx as u32,
        }
    }
}

impl Platform for MockPlatform {
    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuIdResult {
        match self.processor().host_rsp.get() {
            Some(host_rsp) if !self.in_host.get() => unsafe {
                self.guest_cpuid(host_rsp, leaf, sub_leaf)
            },
            _ => self.raw_cpuid(leaf),
        }
    }

    fn read_msr(&self, msr: u32) -> u64 {
        self.msr_on(self.current.get(), msr)
    }

    fn write_msr(&self, msr: u32, value: u64) {
        self.processor().msrs.borrow_mut().insert(msr, value);
    }

    fn capture_context(&self) -> Context {
        Context {
            rip: 0xfffff800_0000_1000,
            rsp: 0xffffa000_0000_8000,
            rflags: 0x246,
            seg_cs: 0x08,
            seg_ds: 0x23,
            seg_es: 0x23,
            seg_ss: 0x10,
        }
    }

    fn control_registers(&self) -> ControlRegisters {
        ControlRegisters {
            cr0: 0x8005_0033,
            cr2: 0,
            cr3: 0x1ad000,
            cr4: 0x0035_06f8,
        }
    }

    fn descriptor_tables(&self) -> DescriptorTables {
        DescriptorTables {
            gdt: DescriptorTable {
                base: GDT.as_ptr() as u64,
                limit: (core::mem::size_of_val(&GDT) - 1) as u16,
            },
            idt: DescriptorTable {
                base: 0xfffff800_0000_2000,
                limit: 0xfff,
            },
        }
    }

    fn segment_limit(&self, selector: u16) -> u32 {
        if selector == 0 {
            0
        } else {
            u32::MAX
        }
    }

    fn vmsave(&self, vmcb_pa: PhysicalAddress) {
        self.vmsaves.borrow_mut().push(vmcb_pa);
    }

    fn vmload(&self, vmcb_pa: PhysicalAddress) {
        self.vmloads.borrow_mut().push(vmcb_pa);
    }

    unsafe fn launch(&self, host_rsp: NonNull<u64>) -> Result<()> {
        if self.failing_launch.get() {
            return Err(HypervisorError::LaunchReturned);
        }

        self.processor().host_rsp.set(Some(host_rsp));
        Ok(())
    }

    unsafe fn leave_hypervisor(&self, guest_vmcb_pa: PhysicalAddress, _rflags: u64) {
        self.vmload(guest_vmcb_pa);

        let efer = self.read_msr(IA32_EFER);
        self.write_msr(IA32_EFER, efer & !EFER_SVME);
    }

    fn allocate(&self, kind: AllocType, bytes: usize) -> Option<NonNull<u8>> {
        if let Some(budget) = self.allocation_budget.get() {
            if budget == 0 {
                return None;
            }
            self.allocation_budget.set(Some(budget - 1));
        }

        let layout = Layout::from_size_align(bytes, BASE_PAGE_SIZE).ok()?;
        let memory = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;

        self.allocations
            .borrow_mut()
            .insert(memory.as_ptr() as usize, (kind, bytes));

        Some(memory)
    }

    unsafe fn free(&self, kind: AllocType, memory: NonNull<u8>, bytes: usize) {
        let recorded = self
            .allocations
            .borrow_mut()
            .remove(&(memory.as_ptr() as usize));
        assert_eq!(recorded, Some((kind, bytes)), "freed memory that was not allocated like this");

        std::alloc::dealloc(
            memory.as_ptr(),
            Layout::from_size_align_unchecked(bytes, BASE_PAGE_SIZE),
        );
    }

    fn physical_address(&self, va: *const u8) -> PhysicalAddress {
        PhysicalAddress::from_pa(va as u64)
    }

    fn virtual_address(&self, pa: PhysicalAddress) -> Option<NonNull<u8>> {
        NonNull::new(pa.as_u64() as *mut u8)
    }

    fn processor_count(&self) -> u32 {
        self.processors.len() as u32
    }

    fn current_processor_index(&self) -> u32 {
        self.current.get()
    }

    fn run_on_processor(&self, index: u32, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        if index >= self.processor_count() || self.failing_processor.get() == Some(index) {
            return Err(HypervisorError::ProcessorSwitchFailed { index });
        }

        let previous = self.current.replace(index);
        let result = f();
        self.current.set(previous);

        result
    }

    fn debug_break(&self) {
        self.debug_breaks.set(self.debug_breaks.get() + 1);
    }

    fn bugcheck(&self) -> ! {
        panic!("bugcheck");
    }

    fn can_log(&self) -> bool {
        self.log_checks.set(self.log_checks.get() + 1);
        true
    }
}

/// A prepared processor whose guest is driven by the tests: every #VMEXIT is
/// triggered explicitly with [`TestVcpu::exit`].
pub struct TestVcpu<'p> {
    pub platform: &'p MockPlatform,
    pub shared: OwnedSharedData<'p, MockPlatform>,
    pub data: AllocatedMemory<'p, ProcessorData, MockPlatform>,
    pub nested: AllocatedMemory<'p, NestedData, MockPlatform>,
}

impl<'p> TestVcpu<'p> {
    pub fn new(platform: &'p MockPlatform, config: HypervisorConfig) -> Self {
        let shared = SharedData::new(platform, config).unwrap();
        let mut data = AllocatedMemory::<ProcessorData, _>::alloc_aligned(platform).unwrap();
        let mut nested = AllocatedMemory::<NestedData, _>::alloc_aligned(platform).unwrap();

        let efer = platform.read_msr(IA32_EFER);
        nested.state.msrs = VirtualMsrs::new(efer);
        platform.write_msr(IA32_EFER, efer | EFER_SVME);

        let context = platform.capture_context();
        let nested_ptr = NonNull::from(&mut *nested);
        data.prepare_for_virtualization(platform, &shared, nested_ptr, &context);

        Self {
            platform,
            shared,
            data,
            nested,
        }
    }

    /// The VMCB the hardware runs next.
    pub fn running_vmcb(&mut self) -> &mut Vmcb {
        unsafe { &mut *(self.data.host_stack_layout.guest_vmcb_pa.as_u64() as *mut Vmcb) }
    }

    /// Triggers a #VMEXIT of the running guest. `length` is the length of the
    /// intercepted instruction.
    pub fn exit(
        &mut self, exit_code: u64, exit_info1: u64, regs: &mut GuestRegisters, length: u64,
    ) -> bool {
        let vmcb = self.running_vmcb();
        vmcb.control_area.exit_code = exit_code;
        vmcb.control_area.exit_info1 = exit_info1;
        vmcb.control_area.nrip = vmcb.save_area.rip + length;
        vmcb.save_area.rax = regs.rax;

        vmexit::handle_vmexit(self.platform, &mut self.data, regs)
    }

    /// Executes `wrmsr` in the running guest.
    pub fn wrmsr(&mut self, msr: u32, value: u64) -> GuestRegisters {
        let mut regs = GuestRegisters {
            rax: value & 0xffff_ffff,
            rcx: msr as u64,
            rdx: value >> 32,
            ..Default::default()
        };
        self.exit(VMEXIT_MSR, 1, &mut regs, 2);

        regs
    }
}
