#![cfg_attr(not(test), no_std)]

pub mod sdmmc;
pub mod sdmmc_os;

// Re-exported so the logging macros resolve from downstream crates
#[doc(hidden)]
pub use log;
#[cfg(feature = "sel4-microkit")]
#[doc(hidden)]
pub use sel4_microkit;
