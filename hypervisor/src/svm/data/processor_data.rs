use crate::{
    error::Result,
    platform::{Context, Platform},
    svm::{
        data::{nested_data::NestedData, shared_data::SharedData},
        msr::{IA32_EFER, SVM_MSR_VM_HSAVE_PA},
        support,
        vmcb::{
            control_area::{
                ExceptionVector, InterceptMisc1, InterceptMisc2, LbrVirtualization, NpEnable,
                V_GIF_ENABLE,
            },
            Vmcb,
        },
    },
    utils::addresses::{physical_address, PhysicalAddress},
};
use core::ptr::NonNull;
use x86::bits64::paging::BASE_PAGE_SIZE;

pub const KERNEL_STACK_SIZE: usize = 0x6000;
pub const STACK_CONTENTS_SIZE: usize = KERNEL_STACK_SIZE - (core::mem::size_of::<u64>() * 6);

/// Written below the host stack and checked on every #VMEXIT.
pub const STACK_SENTINEL: u64 = u64::MAX;

#[repr(C, align(4096))]
pub struct HostStackLayout {
    pub stack_contents: [u8; STACK_CONTENTS_SIZE],

    /// HostRsp
    pub guest_vmcb_pa: PhysicalAddress,
    pub host_vmcb_pa: PhysicalAddress,

    pub self_data: *mut ProcessorData,
    pub shared_data: *mut SharedData,
    pub nested_data: *mut NestedData,

    pub reserved_1: u64,
}
const_assert_eq!(core::mem::size_of::<HostStackLayout>(), KERNEL_STACK_SIZE);

impl HostStackLayout {
    pub fn is_intact(&self) -> bool {
        self.reserved_1 == STACK_SENTINEL
    }
}

/// The data for a single **virtual** processor.
#[repr(C, align(4096))]
pub struct ProcessorData {
    /// Taken from SimpleSvm.
    ///
    /// ```text
    ///  Low     HostStackLimit[0]                        StackLimit
    ///  ^       ...
    ///  ^       HostStackLimit[KERNEL_STACK_SIZE - 2]    StackBase
    ///  High    HostStackLimit[KERNEL_STACK_SIZE - 1]    StackBase
    /// ```
    pub host_stack_layout: HostStackLayout,
    pub guest_vmcb: Vmcb,
    pub host_vmcb: Vmcb,
    pub(crate) host_state_area: [u8; BASE_PAGE_SIZE],
}
const_assert_eq!(
    core::mem::size_of::<ProcessorData>(),
    KERNEL_STACK_SIZE + 3 * BASE_PAGE_SIZE
);

impl ProcessorData {
    pub fn prepare_for_virtualization<P: Platform>(
        &mut self, platform: &P, shared_data: &SharedData, nested_data: NonNull<NestedData>,
        context: &Context,
    ) {
        // Based on this: https://github.com/tandasat/SimpleSvm/blob/master/SimpleSvm/SimpleSvm.cpp#L982

        // Get physical addresses of important data structures
        //
        let guest_vmcb_pa = physical_address(platform, &self.guest_vmcb);
        let host_vmcb_pa = physical_address(platform, &self.host_vmcb);
        let host_state_area_pa = physical_address(platform, self.host_state_area.as_ptr());
        let config = &shared_data.config;

        log::trace!("Physical addresses:");
        log::trace!("guest_vmcb_pa: {:x}", guest_vmcb_pa);
        log::trace!("host_vmcb_pa: {:x}", host_vmcb_pa);
        log::trace!("host_state_area_pa: {:x}", host_state_area_pa);

        // Configure which instructions to intercept.
        //
        log::info!("Configuring instructions to intercept");
        let control_area = &mut self.guest_vmcb.control_area;

        if config.intercept_breakpoints {
            log::info!("Intercepting breakpoint");
            control_area
                .intercept_exception
                .insert(ExceptionVector::BREAKPOINT);
        }

        control_area
            .intercept_misc1
            .insert(InterceptMisc1::INTERCEPT_CPUID);
        control_area
            .intercept_misc2
            .insert(InterceptMisc2::INTERCEPT_VMRUN | InterceptMisc2::INTERCEPT_VMMCALL);

        // Trigger #VMEXIT on MSR exit as defined in msr permission map.
        //
        control_area
            .intercept_misc1
            .insert(InterceptMisc1::INTERCEPT_MSR_PROT);
        control_area.msrpm_base_pa = shared_data.msr_bitmap_pa.as_u64();

        // Specify guest's address space ID (ASID). TLB is maintained by the ID for
        // guests. Use the same value for all processors since all of them run a
        // single guest in our case. Zero of ASID is reserved and illegal.
        //
        // See this for explanation of what an ASID is: https://stackoverflow.com/a/52725044
        //
        control_area.guest_asid = config.guest_asid;

        // Enable nested page tables.
        //
        log::info!("Configuring nested page tables");
        control_area.np_enable.insert(NpEnable::NESTED_PAGING);
        control_area.ncr3 = shared_data.pml4_pa.as_u64();

        // Let a hypervisor in the guest use vmsave/vmload and stgi/clgi without
        // exiting, if the processor can do it.
        //
        let features = support::optional_features(platform);
        if features.virtual_vmsave_vmload {
            control_area
                .lbr_virtualization_enable
                .insert(LbrVirtualization::VIRTUALIZED_VMSAVE_VMLOAD);
        }
        if features.virtual_gif {
            control_area.vintr |= V_GIF_ENABLE;
        }

        // Setup guest state based on current system state.
        //
        log::info!("Configuring guest state save area");
        let efer = platform.read_msr(IA32_EFER);
        self.guest_vmcb.save_area.build(platform, context, efer);

        // Save some of the current state on VMCB.
        //
        // See:
        // - https://docs.microsoft.com/en-us/cpp/intrinsics/svm-vmsave?view=msvc-170
        // - 15.5.2 VMSAVE and VMLOAD Instructions
        //
        log::info!("Saving current guest state on VMCB");
        platform.vmsave(guest_vmcb_pa);

        // Store data to stack so that the host (hypervisor) can use those values.
        //
        log::info!("Setting up the stack layout");
        self.host_stack_layout.reserved_1 = STACK_SENTINEL;
        self.host_stack_layout.shared_data = shared_data as *const _ as *mut _;
        self.host_stack_layout.nested_data = nested_data.as_ptr();
        self.host_stack_layout.self_data = self as *mut _;
        self.host_stack_layout.host_vmcb_pa = host_vmcb_pa;
        self.host_stack_layout.guest_vmcb_pa = guest_vmcb_pa;

        // Set the physical address for the `vmrun` instruction, which will save
        // the current host state.
        //
        log::info!("Setting the host state area in SVM_MSR_VM_HSAVE_PA");
        platform.write_msr(SVM_MSR_VM_HSAVE_PA, host_state_area_pa.as_u64());

        // Also save current state for the host.
        //
        log::info!("Saving current host state on VMCB");
        platform.vmsave(host_vmcb_pa);
    }

    /// The host stack pointer for the trampoline. It points to the first field
    /// after the stack contents.
    pub fn host_rsp(&mut self) -> NonNull<u64> {
        NonNull::from(&mut self.host_stack_layout.guest_vmcb_pa).cast()
    }
}

/// The address of a [`ProcessorData`], split into the two 32-bit registers the
/// unload path returns it in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnloadHandle(NonNull<ProcessorData>);

impl UnloadHandle {
    pub fn new(data: NonNull<ProcessorData>) -> Self {
        Self(data)
    }

    /// Returns the low and high half of the address (`eax`, `edx`).
    pub fn encode(self) -> (u32, u32) {
        let address = self.0.as_ptr() as u64;

        (address as u32, (address >> 32) as u32)
    }

    pub fn decode(low: u32, high: u32) -> Option<Self> {
        let address = ((high as u64) << 32) | low as u64;

        NonNull::new(address as *mut ProcessorData).map(Self)
    }

    pub fn data(self) -> NonNull<ProcessorData> {
        self.0
    }
}

/// Checks the sentinel of the processor data at `data` without creating a
/// reference to it first.
///
/// # Safety
///
/// `data` must point to readable memory of the size of a [`ProcessorData`].
pub unsafe fn check_sentinel(data: NonNull<ProcessorData>) -> Result<()> {
    let sentinel = core::ptr::addr_of!((*data.as_ptr()).host_stack_layout.reserved_1).read();

    snafu::ensure!(
        sentinel == STACK_SENTINEL,
        crate::error::CorruptedSentinelSnafu
    );

    Ok(())
}
