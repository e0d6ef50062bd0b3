pub mod addresses;
pub mod memory;
pub mod processor;

cfg_if::cfg_if! {
    if #[cfg(target_os = "windows")] {
        pub mod alloc;
        pub mod logger;
        pub mod nt;
    }
}

#[cfg(test)]
pub mod testing;
