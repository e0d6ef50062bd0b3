//! The per-processor state of the nested virtualization support.
//!
//! Three views of a guest exist while a hypervisor runs inside the guest:
//!
//! - `01`: the outer guest as set up by this hypervisor.
//! - `12`: the guest of the inner hypervisor, as that hypervisor configured it
//!   in its own VMCB.
//! - `02`: what the hardware actually runs while nested. Built from `01` and
//!   `12`.

use crate::{svm::vmcb::Vmcb, utils::addresses::PhysicalAddress};

/// The state the inner hypervisor runs with, captured when it executes
/// `vmrun`. Restored into `02` whenever an exit of its guest is reflected to
/// it, like hardware restores the host state on #VMEXIT.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct L1HostState {
    /// The instruction after `vmrun`.
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub efer: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cpl: u8,
    pub gdtr_base: u64,
    pub gdtr_limit: u32,
    pub idtr_base: u64,
    pub idtr_limit: u32,
    pub es: SegmentState,
    pub cs: SegmentState,
    pub ss: SegmentState,
    pub ds: SegmentState,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentState {
    pub selector: u16,
    pub attrib: u16,
    pub limit: u32,
    pub base: u64,
}

impl L1HostState {
    /// Captures the state of the inner hypervisor from the VMCB it executed
    /// `vmrun` in.
    pub fn capture(vmcb: &Vmcb) -> Self {
        let save = &vmcb.save_area;

        Self {
            rip: vmcb.control_area.nrip,
            rsp: save.rsp,
            rflags: save.rflags,
            efer: save.efer,
            cr0: save.cr0,
            cr3: save.cr3,
            cr4: save.cr4,
            cpl: save.cpl,
            gdtr_base: save.gdtr_base,
            gdtr_limit: save.gdtr_limit,
            idtr_base: save.idtr_base,
            idtr_limit: save.idtr_limit,
            es: SegmentState::new(save.es_selector, save.es_attrib, save.es_limit, save.es_base),
            cs: SegmentState::new(save.cs_selector, save.cs_attrib, save.cs_limit, save.cs_base),
            ss: SegmentState::new(save.ss_selector, save.ss_attrib, save.ss_limit, save.ss_base),
            ds: SegmentState::new(save.ds_selector, save.ds_attrib, save.ds_limit, save.ds_base),
        }
    }

    /// Makes `vmcb` resume the inner hypervisor where it executed `vmrun`.
    pub fn restore(&self, vmcb: &mut Vmcb) {
        let save = &mut vmcb.save_area;

        save.rip = self.rip;
        save.rsp = self.rsp;
        save.rflags = self.rflags;
        save.efer = self.efer;
        save.cr0 = self.cr0;
        save.cr3 = self.cr3;
        save.cr4 = self.cr4;
        save.cpl = self.cpl;
        save.gdtr_base = self.gdtr_base;
        save.gdtr_limit = self.gdtr_limit;
        save.idtr_base = self.idtr_base;
        save.idtr_limit = self.idtr_limit;

        macro_rules! restore_segment {
            ($segment:ident, $selector:ident, $attrib:ident, $limit:ident, $base:ident) => {
                save.$selector = self.$segment.selector;
                save.$attrib = self.$segment.attrib;
                save.$limit = self.$segment.limit;
                save.$base = self.$segment.base;
            };
        }

        restore_segment!(es, es_selector, es_attrib, es_limit, es_base);
        restore_segment!(cs, cs_selector, cs_attrib, cs_limit, cs_base);
        restore_segment!(ss, ss_selector, ss_attrib, ss_limit, ss_base);
        restore_segment!(ds, ds_selector, ds_attrib, ds_limit, ds_base);
    }
}

impl SegmentState {
    const fn new(selector: u16, attrib: u16, limit: u32, base: u64) -> Self {
        Self {
            selector,
            attrib,
            limit,
            base,
        }
    }
}

/// Who is executing on `02`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedMode {
    /// The inner hypervisor itself.
    Root,
    /// The guest of the inner hypervisor.
    Guest,
}

/// The MSRs whose guest view differs from what the hardware uses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VirtualMsrs {
    /// The EFER value the guest believes is set. `SVME` is forced on in the
    /// VMCB but reported as written.
    pub efer: u64,

    /// The value the guest wrote to `VM_HSAVE_PA`. Never written to hardware.
    pub hsave_pa: u64,

    /// The EFER the guest started with. The processor supports every bit set
    /// in it, including the ones [`crate::svm::msr::EFER_VALID_BITS`] does
    /// not list.
    pub initial_efer: u64,
}

impl VirtualMsrs {
    pub fn new(efer: u64) -> Self {
        Self {
            efer,
            hsave_pa: 0,
            initial_efer: efer,
        }
    }
}

/// The bookkeeping of an inner hypervisor that has executed `vmrun` at least
/// once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerVcpu {
    pub vmcb_guest_02_pa: PhysicalAddress,
    pub vmcb_host_02_pa: PhysicalAddress,
    pub vmcb_guest_12_pa: PhysicalAddress,
    /// The value of `VM_HSAVE_PA` the inner hypervisor has configured.
    pub host_state_area_12_pa: PhysicalAddress,
    pub mode: NestedMode,
    pub l1_host: L1HostState,
    /// The MSRs as seen by the guest of the inner hypervisor.
    pub l2_msrs: VirtualMsrs,
}

/// The zeroed representation is `Flat`, so freshly allocated memory starts
/// out without a nested hypervisor.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    /// No nested hypervisor, the hardware runs `01`.
    Flat = 0,
    /// The hardware runs `02`.
    Nested(InnerVcpu) = 1,
}

impl CpuMode {
    pub fn is_nested(&self) -> bool {
        matches!(self, Self::Nested(_))
    }
}

/// The per-processor state of the nested virtualization.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NestedState {
    pub mode: CpuMode,

    /// The MSRs as seen by the outer guest.
    pub msrs: VirtualMsrs,
}

/// The nested context of a single processor, allocated next to the
/// processor data. The `02` control blocks live here, so nothing has to be
/// allocated on the #VMEXIT path.
#[repr(C, align(4096))]
pub struct NestedData {
    pub vmcb_guest_02: Vmcb,
    pub vmcb_host_02: Vmcb,
    pub state: NestedState,
}
