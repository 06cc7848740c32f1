use sdmmc_protocol::sdmmc::SdmmcError;
use sdmmc_protocol::sdmmc_os::Sleep;

use crate::host::SlotInitConfig;

/// Clock tree inputs the controller can run from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Pll160M,
    /// Only used for UHS speeds above 40 MHz
    Pll200M,
}

impl ClockSource {
    /// Frequency the divider tables are computed for
    pub const fn expected_hz(self) -> u32 {
        match self {
            ClockSource::Pll160M => 160_000_000,
            ClockSource::Pll200M => 200_000_000,
        }
    }
}

/// Everything the host needs from the SoC around it.
///
/// Only the clock tree query is mandatory. Boards that route pins in their
/// startup code, or never power gate the controller, can keep the defaults.
pub trait HostPlatform: Sleep {
    /// Frequency of `src` as configured in the clock tree
    fn source_clock_hz(&self, src: ClockSource) -> Result<u32, SdmmcError>;

    fn enable_clock_source(&self, _src: ClockSource) -> Result<(), SdmmcError> {
        Ok(())
    }

    /// Route and bias CLK/CMD/DAT, card-detect and write-protect for a slot
    fn configure_slot_io(&self, _slot: usize, _config: &SlotInitConfig) -> Result<(), SdmmcError> {
        Ok(())
    }

    fn release_slot_io(&self, _slot: usize) {}

    /// Hand DAT1 to the controller so card interrupts reach it
    fn route_d1_to_host(&self, _slot: usize) -> Result<(), SdmmcError> {
        Ok(())
    }

    /// Level of DAT1, `false` while a card interrupt is asserted
    fn d1_level(&self, _slot: usize) -> Result<bool, SdmmcError> {
        Err(SdmmcError::ENOTIMPLEMENTED)
    }

    /// Keep clocks up while a transaction runs
    fn pm_lock_acquire(&self) {}

    fn pm_lock_release(&self) {}
}
