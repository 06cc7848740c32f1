//! Host driver for the Synopsys DesignWare mobile storage controller on the
//! ESP32-P4.
//!
//! One [`SdmmcHost`] owns a controller and up to two card slots. Requests are
//! issued with [`SdmmcHost::do_transaction`]; the SoC glue (interrupt routing,
//! clock tree, pins, power management) plugs in through [`HostPlatform`].

#![cfg_attr(not(test), no_std)]

pub mod clock;
pub mod cmd;
pub mod dma;
pub mod event;
pub mod host;
pub mod hw;
pub mod platform;
pub mod regs;
pub mod transaction;

#[cfg(test)]
mod mock;

pub use host::{HostConfig, SdMode, SdmmcHost, SlotCallbacks, SlotConfig, SlotInfo, SlotInitConfig};
pub use hw::{DelayLine, DelayPhase, SdmmcHardware, SDMMC_NUM_SLOTS};
pub use platform::{ClockSource, HostPlatform};
pub use regs::DwMmc;
