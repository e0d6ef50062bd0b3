pub mod guest;
pub mod msr_bitmap;
pub mod nested_data;
pub mod nested_page_table;
pub mod processor_data;
pub mod segmentation;
pub mod shared_data;
