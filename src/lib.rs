//! SD/MMC host driver for the DesignWare controller of the ESP32-P4.
//!
//! `sdmmc_protocol` carries the controller independent vocabulary (commands,
//! requests, errors, time services) and `sdmmc_hal` the host itself.

#![no_std]

pub use sdmmc_hal;
pub use sdmmc_protocol;

pub use sdmmc_hal::{
    ClockSource, DwMmc, HostConfig, HostPlatform, SdMode, SdmmcHost, SlotCallbacks, SlotConfig,
    SlotInfo, SlotInitConfig,
};
pub use sdmmc_protocol::sdmmc::{SdmmcCmd, SdmmcError, SdmmcRequest};
pub use sdmmc_protocol::sdmmc_os::Sleep;

/// Host over the memory mapped controller, with the default descriptor ring
pub type DwMmcHost<P> = SdmmcHost<DwMmc, P>;
