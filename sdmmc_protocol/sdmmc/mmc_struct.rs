// Enums for bus_width
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmcBusWidth {
    Width1 = 0,
    // One is skipped because for SD_ACMD_SET_BUS_WIDTH, setting cmdargs to 2 indicate 4 datalanes
    Width4 = 2,
    Width8 = 3,
}

impl MmcBusWidth {
    /// Number of data lines
    pub const fn lanes(self) -> u8 {
        match self {
            MmcBusWidth::Width1 => 1,
            MmcBusWidth::Width4 => 4,
            MmcBusWidth::Width8 => 8,
        }
    }
}

/// Whether data is latched on one or both clock edges
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum MmcSamplingMode {
    #[default]
    Sdr,
    Ddr,
}
