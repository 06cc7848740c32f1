//! Card clock divider selection and programming.
//!
//! The controller derives the card clock in two stages: a host divider
//! (1..=16) shared by both slots, followed by a per slot card divider that
//! divides by `2 * card_div` (0 bypasses it).

use sdmmc_protocol::sdmmc::sdmmc_constant::{
    SDMMC_FREQ_DEFAULT, SDMMC_FREQ_HIGHSPEED, SDMMC_FREQ_PROBING, SDMMC_FREQ_SDR104,
    SDMMC_FREQ_SDR50,
};
use sdmmc_protocol::sdmmc::SdmmcError;
use sdmmc_protocol::{debug_log, error_log};

use crate::host::SdmmcHost;
use crate::hw::SdmmcHardware;
use crate::platform::{ClockSource, HostPlatform};

pub const MAX_HOST_DIV: u32 = 16;
pub const MAX_CARD_DIV: u32 = 255;

// Data timeout programmed after every clock change, in milliseconds
const DATA_TIMEOUT_MS: u32 = 100;
const MAX_DATA_TIMEOUT_CYCLES: u32 = 0x00FF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockDividers {
    pub host_div: u32,
    /// Half of the card stage divider, 0 means no division
    pub card_div: u32,
}

impl ClockDividers {
    /// Card clock produced from `src_hz` by these dividers
    pub fn freq_hz(&self, src_hz: u32) -> u32 {
        let card_stage = if self.card_div == 0 {
            1
        } else {
            self.card_div * 2
        };
        src_hz / self.host_div / card_stage
    }
}

/// Anything above high speed needs the 200 MHz PLL
pub fn select_clock_source(freq_khz: u32) -> ClockSource {
    if freq_khz > SDMMC_FREQ_HIGHSPEED {
        ClockSource::Pll200M
    } else {
        ClockSource::Pll160M
    }
}

/// Pick dividers for `freq_khz` from a source running at `src_hz`.
///
/// The canonical speeds map to fixed pairs so they come out exact. Any other
/// target gets the smallest host divider that does not overshoot, and falls
/// back to the card divider once the host divider would exceed its range.
pub fn calc_dividers(src_hz: u32, freq_khz: u32) -> Result<ClockDividers, SdmmcError> {
    if freq_khz == 0 || src_hz == 0 {
        return Err(SdmmcError::EINVAL);
    }

    let uhs_src = src_hz == ClockSource::Pll200M.expected_hz();
    let (host_div, card_div) = if uhs_src && freq_khz == SDMMC_FREQ_SDR104 {
        (1, 0) // 200 MHz / 1 = 200 MHz
    } else if uhs_src && freq_khz == SDMMC_FREQ_SDR50 {
        (2, 0) // 200 MHz / 2 = 100 MHz
    } else if freq_khz >= SDMMC_FREQ_HIGHSPEED {
        (4, 0) // 160 MHz / 4 = 40 MHz
    } else if freq_khz == SDMMC_FREQ_DEFAULT {
        (8, 0) // 160 MHz / 8 = 20 MHz
    } else if freq_khz == SDMMC_FREQ_PROBING {
        (10, 20) // 160 MHz / 10 / (20 * 2) = 400 kHz
    } else {
        let freq_hz = freq_khz as u64 * 1000;
        let host_div = (src_hz as u64).div_ceil(freq_hz);
        if host_div > MAX_HOST_DIV as u64 {
            let card_div = (src_hz as u64 / 2).div_ceil(2 * freq_hz);
            (2, card_div)
        } else {
            (host_div, 0)
        }
    };

    if card_div > MAX_CARD_DIV as u64 {
        debug_log!("sdmmc: {} kHz is below the lowest reachable card clock", freq_khz);
        return Err(SdmmcError::EINVAL);
    }

    Ok(ClockDividers {
        host_div: host_div as u32,
        card_div: card_div as u32,
    })
}

/// Data timeout in card clock cycles for a card clock of `freq_khz`
pub fn data_timeout_cycles(freq_khz: u32) -> u32 {
    DATA_TIMEOUT_MS
        .saturating_mul(freq_khz)
        .min(MAX_DATA_TIMEOUT_CYCLES)
}

impl<H: SdmmcHardware, P: HostPlatform, const N: usize> SdmmcHost<H, P, N> {
    /// Query the clock tree for `src`, enabling it first
    pub(crate) fn source_clock_hz(&self, src: ClockSource) -> Result<u32, SdmmcError> {
        self.platform.enable_clock_source(src)?;
        let src_hz = self.platform.source_clock_hz(src)?;
        if src_hz != src.expected_hz() {
            error_log!(
                "sdmmc: clock source {:?} runs at {} Hz, expected {} Hz",
                src,
                src_hz,
                src.expected_hz()
            );
        }
        Ok(src_hz)
    }

    pub(crate) fn set_host_clock_div(&self, src: ClockSource, div: u32) -> Result<(), SdmmcError> {
        self.source_clock_hz(src)?;
        self.hw.set_clock_div(div);
        // Let the divided clock settle before anything is latched with it
        self.platform.usleep(10);
        Ok(())
    }

    /// Program the card clock of `slot` for `freq_khz`.
    ///
    /// Returns the frequency the written dividers actually produce.
    pub(crate) fn set_card_clk(&self, slot: usize, freq_khz: u32) -> Result<u32, SdmmcError> {
        let src = select_clock_source(freq_khz);
        let src_hz = self.source_clock_hz(src)?;
        let div = calc_dividers(src_hz, freq_khz)?;

        // Disable clock first
        self.hw.enable_card_clock(slot, false);
        self.clock_update_command(slot, false).inspect_err(|e| {
            error_log!("sdmmc: failed to stop card clock: {}", e);
        })?;

        self.hw.set_card_clock_div(slot, div.card_div);
        self.set_host_clock_div(src, div.host_div)?;
        self.clock_update_command(slot, false).inspect_err(|e| {
            error_log!("sdmmc: setting clk div failed: {}", e);
        })?;

        // Re-enable clocks
        self.hw.enable_card_clock(slot, true);
        self.hw.enable_card_clock_low_power(slot, true);
        self.clock_update_command(slot, false).inspect_err(|e| {
            error_log!("sdmmc: re-enabling clk failed: {}", e);
        })?;

        self.hw.set_data_timeout(data_timeout_cycles(freq_khz));
        // Always the highest value, it is short enough anyway
        self.hw.set_response_timeout(255);

        let real_freq_hz = div.freq_hz(src_hz);
        debug_log!(
            "sdmmc: slot {} src {:?} host_div {} card_div {} freq {} Hz (asked {} kHz)",
            slot,
            src,
            div.host_div,
            div.card_div,
            real_freq_hz,
            freq_khz
        );
        Ok(real_freq_hz)
    }

    /// Gate the card clock for a CMD11 voltage switch
    pub(crate) fn enable_clk_cmd11(&self, slot: usize, enable: bool) -> Result<(), SdmmcError> {
        self.hw.enable_card_clock(slot, enable);
        self.clock_update_command(slot, true)?;
        self.hw.enable_1v8_mode(slot, enable);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: u32 = 160_000_000;

    #[test]
    fn canonical_speeds_are_exact() {
        let probing = calc_dividers(SRC, SDMMC_FREQ_PROBING).unwrap();
        assert_eq!(probing, ClockDividers { host_div: 10, card_div: 20 });
        assert_eq!(probing.freq_hz(SRC), 400_000);

        let default = calc_dividers(SRC, SDMMC_FREQ_DEFAULT).unwrap();
        assert_eq!(default, ClockDividers { host_div: 8, card_div: 0 });
        assert_eq!(default.freq_hz(SRC), 20_000_000);

        let hs = calc_dividers(SRC, SDMMC_FREQ_HIGHSPEED).unwrap();
        assert_eq!(hs, ClockDividers { host_div: 4, card_div: 0 });
        assert_eq!(hs.freq_hz(SRC), 40_000_000);
    }

    #[test]
    fn uhs_speeds_use_the_fast_source() {
        assert_eq!(select_clock_source(SDMMC_FREQ_HIGHSPEED), ClockSource::Pll160M);
        assert_eq!(select_clock_source(SDMMC_FREQ_SDR50), ClockSource::Pll200M);

        let src = ClockSource::Pll200M.expected_hz();
        let sdr104 = calc_dividers(src, SDMMC_FREQ_SDR104).unwrap();
        assert_eq!(sdr104.freq_hz(src), 200_000_000);
        let sdr50 = calc_dividers(src, SDMMC_FREQ_SDR50).unwrap();
        assert_eq!(sdr50.freq_hz(src), 100_000_000);
    }

    #[test]
    fn host_divider_only_gives_closest_lower_frequency() {
        // Every target whose host divider fits, outside the fixed bands
        for freq_khz in (10_000..SDMMC_FREQ_HIGHSPEED).step_by(250) {
            if freq_khz == SDMMC_FREQ_DEFAULT {
                continue;
            }
            let div = calc_dividers(SRC, freq_khz).unwrap();
            assert_eq!(div.card_div, 0, "freq {}", freq_khz);
            assert!(div.host_div <= MAX_HOST_DIV);

            let achieved = div.freq_hz(SRC);
            let target = freq_khz * 1000;
            assert!(achieved <= target, "freq {} overshoots", freq_khz);
            // One step smaller divider would overshoot
            if div.host_div > 1 {
                assert!(SRC / (div.host_div - 1) > target, "freq {} not closest", freq_khz);
            }
        }
    }

    #[test]
    fn low_frequencies_fall_back_to_card_divider() {
        let div = calc_dividers(SRC, 1_000).unwrap();
        assert_eq!(div.host_div, 2);
        assert_eq!(div.card_div, 40);
        assert_eq!(div.freq_hz(SRC), 1_000_000);

        let div = calc_dividers(SRC, 300).unwrap();
        assert_eq!(div.host_div, 2);
        assert!(div.freq_hz(SRC) <= 300_000);
    }

    #[test]
    fn unreachable_frequencies_are_rejected() {
        assert_eq!(calc_dividers(SRC, 0), Err(SdmmcError::EINVAL));
        // 160 MHz / 2 / 510 is the floor
        assert_eq!(calc_dividers(SRC, 100), Err(SdmmcError::EINVAL));
    }

    #[test]
    fn data_timeout_saturates() {
        assert_eq!(data_timeout_cycles(400), 40_000);
        assert_eq!(data_timeout_cycles(200_000), MAX_DATA_TIMEOUT_CYCLES);
    }
}
