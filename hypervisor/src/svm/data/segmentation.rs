use bitfield::bitfield;

bitfield! {
    /// A legacy code/data segment descriptor as stored in the GDT.
    ///
    /// See `4.7 Legacy Segment Descriptors`.
    pub struct SegmentDescriptor(u64);
    impl Debug;
    pub get_limit_low, _: 15, 0;        // [0-15]
    pub get_base_low, _: 39, 16;        // [16-39]
    pub get_type, _: 43, 40;            // [40-43]
    pub get_system, _: 44, 44;          // [44]
    pub get_dpl, _: 46, 45;             // [45-46]
    pub get_present, _: 47, 47;         // [47]
    pub get_limit_high, _: 51, 48;      // [48-51]
    pub get_avl, _: 52, 52;             // [52]
    pub get_long_mode, _: 53, 53;       // [53]
    pub get_default_bit, _: 54, 54;     // [54]
    pub get_granularity, _: 55, 55;     // [55]
    pub get_base_high, _: 63, 56;       // [56-63]
}

bitfield! {
    /// The packed segment attribute format of the VMCB save area.
    ///
    /// See `15.5.1 Basic Operation > Segment State in the VMCB`.
    #[derive(Clone, Copy)]
    pub struct SegmentAttribute(u16);
    impl Debug;
    pub get_type, set_type: 3, 0;                   // [0-3]
    pub get_system, set_system: 4, 4;               // [4]
    pub get_dpl, set_dpl: 6, 5;                     // [5-6]
    pub get_present, set_present: 7, 7;             // [7]
    pub get_avl, set_avl: 8, 8;                     // [8]
    pub get_long_mode, set_long_mode: 9, 9;         // [9]
    pub get_default_bit, set_default_bit: 10, 10;   // [10]
    pub get_granularity, set_granularity: 11, 11;   // [11]
}

impl From<SegmentDescriptor> for SegmentAttribute {
    fn from(descriptor: SegmentDescriptor) -> Self {
        let mut attribute = SegmentAttribute(0);
        attribute.set_type(descriptor.get_type() as u16);
        attribute.set_system(descriptor.get_system() as u16);
        attribute.set_dpl(descriptor.get_dpl() as u16);
        attribute.set_present(descriptor.get_present() as u16);
        attribute.set_avl(descriptor.get_avl() as u16);
        attribute.set_long_mode(descriptor.get_long_mode() as u16);
        attribute.set_default_bit(descriptor.get_default_bit() as u16);
        attribute.set_granularity(descriptor.get_granularity() as u16);

        attribute
    }
}

/// Reads the descriptor of `selector` out of the GDT at `gdt_base` and
/// converts it to the VMCB attribute format.
///
/// # Safety
///
/// `gdt_base` must point to a readable descriptor table that covers the
/// selector.
pub unsafe fn segment_access_right(selector: u16, gdt_base: u64) -> u16 {
    const RPL_MASK: u16 = 3;
    const TI_MASK: u16 = 4;

    let descriptor = gdt_base + (selector & !(RPL_MASK | TI_MASK)) as u64;
    let descriptor = (descriptor as *const u64).read_volatile();

    SegmentAttribute::from(SegmentDescriptor(descriptor)).0
}
