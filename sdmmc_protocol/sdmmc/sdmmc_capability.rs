use bitflags::bitflags;

// Linux protocol layer use two u32 to represent all capabilities.
// A single u32 is enough for what a DesignWare host can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdmmcHostCapability(pub u32);

bitflags! {
    /// Represents the host capabilities for SD/MMC controllers
    impl SdmmcHostCapability: u32 {
        // Timing modes
        const MMC_TIMING_LEGACY       = MMC_TIMING_LEGACY;
        const MMC_TIMING_MMC_HS       = MMC_TIMING_MMC_HS;
        const MMC_TIMING_SD_HS        = MMC_TIMING_SD_HS;
        const MMC_TIMING_UHS_SDR12    = MMC_TIMING_UHS_SDR12;
        const MMC_TIMING_UHS_SDR25    = MMC_TIMING_UHS_SDR25;
        const MMC_TIMING_UHS_SDR50    = MMC_TIMING_UHS_SDR50;
        const MMC_TIMING_UHS_SDR104   = MMC_TIMING_UHS_SDR104;
        const MMC_TIMING_UHS_DDR50    = MMC_TIMING_UHS_DDR50;
        const MMC_TIMING_MMC_DDR52    = MMC_TIMING_MMC_DDR52;

        // Capabilities
        const MMC_CAP_4_BIT_DATA      = MMC_CAP_4_BIT_DATA;
        const MMC_CAP_8_BIT_DATA      = MMC_CAP_8_BIT_DATA;
        const MMC_CAP_VOLTAGE_TUNE    = MMC_CAP_VOLTAGE_TUNE;
        const MMC_CAP_AUTO_STOP       = MMC_CAP_AUTO_STOP;
    }
}

// Timing modes (starting from bit 0)
pub const MMC_TIMING_LEGACY: u32 = 1 << 0;
pub const MMC_TIMING_MMC_HS: u32 = 1 << 1;
pub const MMC_TIMING_SD_HS: u32 = 1 << 2;
pub const MMC_TIMING_UHS_SDR12: u32 = 1 << 3;
pub const MMC_TIMING_UHS_SDR25: u32 = 1 << 4;
pub const MMC_TIMING_UHS_SDR50: u32 = 1 << 5;
pub const MMC_TIMING_UHS_DDR50: u32 = 1 << 6;
pub const MMC_TIMING_UHS_SDR104: u32 = 1 << 7;
pub const MMC_TIMING_MMC_DDR52: u32 = 1 << 8;

// Capabilities
pub const MMC_CAP_4_BIT_DATA: u32 = 1 << 16;
pub const MMC_CAP_8_BIT_DATA: u32 = 1 << 17;

pub const MMC_CAP_VOLTAGE_TUNE: u32 = 1 << 29;
pub const MMC_CAP_AUTO_STOP: u32 = 1 << 31;

impl SdmmcHostCapability {
    /// Any double data rate timing
    pub fn supports_ddr(&self) -> bool {
        self.intersects(Self::MMC_TIMING_UHS_DDR50 | Self::MMC_TIMING_MMC_DDR52)
    }
}
