use crate::svm::msr::{IA32_EFER, MSR_LSTAR, SVM_MSR_VM_HSAVE_PA};
use x86::bits64::paging::BASE_PAGE_SIZE;

const CHAR_BIT: u32 = 8;
const BITS_PER_MSR: u32 = 2;
const RANGE_SIZE: u32 = 0x800 * CHAR_BIT;

/// The MSR permission map. See `15.11 MSR Intercepts`.
///
/// Every MSR of the three supported ranges owns two consecutive bits: the
/// lower one intercepts `rdmsr`, the upper one `wrmsr`.
#[repr(C, align(4096))]
pub struct MsrBitmap {
    /// 0000_0000 to 0000_1FFF
    pub msr_bitmap_0: [u8; 0x800],
    /// C000_0000 to C000_1FFF
    pub msr_bitmap_1: [u8; 0x800],
    /// C001_0000 to C001_1FFF
    pub msr_bitmap_2: [u8; 0x800],
    /// Reserved
    pub msr_bitmap_3: [u8; 0x800],
}
const_assert_eq!(core::mem::size_of::<MsrBitmap>(), 2 * BASE_PAGE_SIZE);

impl MsrBitmap {
    /// Clears the bitmap and intercepts the MSRs the hypervisor virtualizes:
    /// `EFER`, `LSTAR` and `VM_HSAVE_PA`, reads and writes.
    pub fn build(&mut self) {
        log::info!("Building msr bitmap");

        self.clear();

        self.hook_msr(IA32_EFER);
        self.hook_msr(MSR_LSTAR);
        self.hook_msr(SVM_MSR_VM_HSAVE_PA);
    }

    pub fn clear(&mut self) {
        self.as_bytes_mut().fill(0);
    }

    pub fn hook_msr(&mut self, msr: u32) {
        self.hook_wrmsr(msr);
        self.hook_rdmsr(msr);
    }

    pub fn hook_rdmsr(&mut self, msr: u32) {
        if let Some(offset) = Self::bit_offset(msr) {
            self.set_bit(offset);
        }
    }

    pub fn hook_wrmsr(&mut self, msr: u32) {
        if let Some(offset) = Self::bit_offset(msr) {
            self.set_bit(offset + 1);
        }
    }

    /// Whether a `rdmsr` (`write == false`) or `wrmsr` of `msr` is intercepted.
    pub fn is_hooked(&self, msr: u32, write: bool) -> bool {
        match Self::bit_offset(msr) {
            Some(offset) => self.bit(offset + write as u32),
            // Accesses outside of the ranges are always intercepted
            None => true,
        }
    }

    /// The number of set bits.
    pub fn count_hooked(&self) -> u32 {
        self.as_bytes().iter().map(|byte| byte.count_ones()).sum()
    }

    /// Returns the bit offset of the read bit of `msr`, or `None` if the MSR is
    /// not covered by the bitmap.
    fn bit_offset(msr: u32) -> Option<u32> {
        Some(Self::msr_range(msr)? + Self::msr_offset(msr))
    }

    fn msr_offset(msr: u32) -> u32 {
        (msr & 0x1fff) * BITS_PER_MSR
    }

    /// Returns the offset to the range for the specified MSR.
    #[allow(clippy::identity_op)]
    fn msr_range(msr: u32) -> Option<u32> {
        if (0x0000_0000..=0x0000_1FFF).contains(&msr) {
            Some(0)
        } else if (0xC000_0000..=0xC000_1FFF).contains(&msr) {
            Some(1 * RANGE_SIZE)
        } else if (0xC001_0000..=0xC001_1FFF).contains(&msr) {
            Some(2 * RANGE_SIZE)
        } else {
            None
        }
    }

    fn set_bit(&mut self, offset: u32) {
        let (byte, bit) = ((offset / CHAR_BIT) as usize, offset % CHAR_BIT);
        self.as_bytes_mut()[byte] |= 1 << bit;
    }

    fn bit(&self, offset: u32) -> bool {
        let (byte, bit) = ((offset / CHAR_BIT) as usize, offset % CHAR_BIT);
        self.as_bytes()[byte] & (1 << bit) != 0
    }

    fn as_bytes(&self) -> &[u8; 2 * BASE_PAGE_SIZE] {
        unsafe { &*(self as *const Self as *const [u8; 2 * BASE_PAGE_SIZE]) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8; 2 * BASE_PAGE_SIZE] {
        unsafe { &mut *(self as *mut Self as *mut [u8; 2 * BASE_PAGE_SIZE]) }
    }
}
