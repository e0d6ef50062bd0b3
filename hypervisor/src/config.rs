//! Runtime configuration of the hypervisor.

use log::LevelFilter;

/// The vendor string reported in `CPUID 4000_0000h` (EBX, ECX, EDX).
pub const DEFAULT_VENDOR_ID: [u8; 12] = *b"SvmNest     ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypervisorConfig {
    pub log_level: LevelFilter,

    /// Returned by the hypervisor vendor leaf and used to detect whether a
    /// processor is already virtualized.
    pub vendor_id: [u8; 12],

    /// Intercept `#BP` in the guest.
    pub intercept_breakpoints: bool,

    /// Emulate `vmrun` for a hypervisor running in the guest. Otherwise `vmrun`
    /// raises `#GP`.
    pub nested_virtualization: bool,

    /// The address space id used for the guest. Zero is reserved for the host.
    pub guest_asid: u32,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            vendor_id: DEFAULT_VENDOR_ID,
            intercept_breakpoints: true,
            nested_virtualization: true,
            guest_asid: 1,
        }
    }
}

impl HypervisorConfig {
    #[must_use]
    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub fn with_vendor_id(mut self, vendor_id: [u8; 12]) -> Self {
        self.vendor_id = vendor_id;
        self
    }

    #[must_use]
    pub fn with_breakpoint_intercept(mut self, enabled: bool) -> Self {
        self.intercept_breakpoints = enabled;
        self
    }

    #[must_use]
    pub fn with_nested_virtualization(mut self, enabled: bool) -> Self {
        self.nested_virtualization = enabled;
        self
    }

    #[must_use]
    pub fn with_guest_asid(mut self, asid: u32) -> Self {
        // ASID 0 belongs to the host
        //
        self.guest_asid = asid.max(1);
        self
    }

    /// The vendor string split into the registers of the vendor leaf.
    pub fn vendor_registers(&self) -> (u32, u32, u32) {
        let id = &self.vendor_id;
        let register = |i: usize| u32::from_le_bytes([id[i], id[i + 1], id[i + 2], id[i + 3]]);

        (register(0), register(4), register(8))
    }
}
