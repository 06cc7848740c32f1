// Command opcodes the host layer has to know about
pub const MMC_CMD_GO_IDLE_STATE: u32 = 0;
pub const SD_CMD_SWITCH_VOLTAGE: u32 = 11;
pub const MMC_CMD_STOP_TRANSMISSION: u32 = 12;
pub const MMC_CMD_READ_MULTIPLE_BLOCK: u32 = 18;
pub const MMC_CMD_WRITE_MULTIPLE_BLOCK: u32 = 25;
pub const SD_CMD_APP_SEND_SCR: u32 = 51;
pub const MMC_CMD_APP_CMD: u32 = 55;

// Card clock frequencies in kHz
pub const SDMMC_FREQ_PROBING: u32 = 400;
pub const SDMMC_FREQ_DEFAULT: u32 = 20_000;
pub const SDMMC_FREQ_HIGHSPEED: u32 = 40_000;
pub const SDMMC_FREQ_SDR50: u32 = 100_000;
pub const SDMMC_FREQ_SDR104: u32 = 200_000;

pub const DEFAULT_CMD_TIMEOUT_MS: u32 = 1000;
