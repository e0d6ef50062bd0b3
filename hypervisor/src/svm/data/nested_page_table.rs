use crate::{platform::Platform, utils::addresses::physical_address};
use x86::bits64::paging::{
    PAddr, PDEntry, PDFlags, PDPTEntry, PDPTFlags, PML4Entry, PML4Flags, BASE_PAGE_SIZE,
    LARGE_PAGE_SIZE,
};

/// Identity mapping of the first 512 GB of guest physical memory with 2 MB
/// pages.
///
/// Only the first PML4 entry is used. It points to the page directory pointer
/// table whose 512 entries each point to a page directory of 512 large pages.
#[repr(C, align(4096))]
pub struct NestedPageTable {
    pub pml4: [PML4Entry; 512],
    pub pdpt: [PDPTEntry; 512],
    pub pd: [[PDEntry; 512]; 512],
}
const_assert_eq!(
    core::mem::size_of::<NestedPageTable>(),
    (2 + 512) * BASE_PAGE_SIZE
);

impl NestedPageTable {
    pub fn build<P: Platform>(&mut self, platform: &P) {
        log::info!("Building nested page tables");

        let pdpt_pa = physical_address(platform, self.pdpt.as_ptr());
        self.pml4[0] = PML4Entry::new(
            pdpt_pa.into(),
            PML4Flags::P | PML4Flags::RW | PML4Flags::US,
        );

        // One PML4 entry controls 512 page directory pointer entries.
        //
        for i in 0..512 {
            let pd_pa = physical_address(platform, self.pd[i].as_ptr());
            self.pdpt[i] = PDPTEntry::new(pd_pa.into(), PDPTFlags::P | PDPTFlags::RW | PDPTFlags::US);

            for j in 0..512 {
                let translation_pa = ((i * 512) + j) * LARGE_PAGE_SIZE;

                self.pd[i][j] = PDEntry::new(
                    PAddr::from(translation_pa as u64),
                    PDFlags::P | PDFlags::RW | PDFlags::US | PDFlags::PS,
                );
            }
        }
    }

    /// Translates a guest physical address. Returns `None` for addresses
    /// outside of the mapped range.
    pub fn translate(&self, guest_pa: u64) -> Option<u64> {
        let pml4_index = (guest_pa >> 39) as usize;
        let pdpt_index = ((guest_pa >> 30) & 0x1ff) as usize;
        let pd_index = ((guest_pa >> 21) & 0x1ff) as usize;

        if pml4_index != 0 || !self.pml4[0].is_present() {
            return None;
        }

        let entry = self.pd[pdpt_index][pd_index];
        if !entry.is_present() || !entry.is_page() {
            return None;
        }

        Some(entry.address().as_u64() + (guest_pa & (LARGE_PAGE_SIZE as u64 - 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{memory::AllocatedMemory, testing::MockPlatform};

    fn build_table(platform: &MockPlatform) -> AllocatedMemory<'_, NestedPageTable, MockPlatform> {
        let mut npt = AllocatedMemory::<NestedPageTable, _>::alloc_aligned(platform).unwrap();
        npt.build(platform);
        npt
    }

    #[test]
    fn test_every_leaf_is_an_identity_mapping() {
        let platform = MockPlatform::new(1);
        let npt = build_table(&platform);

        for i in 0..512 {
            for j in 0..512 {
                let entry = npt.pd[i][j];
                let frame = (i * 512 + j) as u64;

                assert!(entry.is_present());
                assert!(entry.is_page());
                assert!(entry.flags().contains(PDFlags::RW | PDFlags::US));
                assert_eq!(entry.address().as_u64() / LARGE_PAGE_SIZE as u64, frame);
            }
        }
    }

    #[test]
    fn test_upper_levels_point_to_the_next_table() {
        let platform = MockPlatform::new(1);
        let npt = build_table(&platform);

        assert_eq!(npt.pml4[0].address().as_u64(), npt.pdpt.as_ptr() as u64);
        assert!(npt.pml4[1..].iter().all(|entry| !entry.is_present()));

        for i in 0..512 {
            assert_eq!(npt.pdpt[i].address().as_u64(), npt.pd[i].as_ptr() as u64);
            assert!(npt.pdpt[i]
                .flags()
                .contains(PDPTFlags::P | PDPTFlags::RW | PDPTFlags::US));
        }
    }

    #[test]
    fn test_translate() {
        let platform = MockPlatform::new(1);
        let npt = build_table(&platform);

        assert_eq!(npt.translate(0x1234_5678), Some(0x1234_5678));
        assert_eq!(npt.translate(0x7f_ffff_ffff), Some(0x7f_ffff_ffff));
        assert_eq!(npt.translate(0x80_0000_0000), None);
    }
}
