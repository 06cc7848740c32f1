use core::fmt;

use bitflags::bitflags;

pub mod mmc_struct;
pub mod sdmmc_capability;
pub mod sdmmc_constant;

use sdmmc_constant::DEFAULT_CMD_TIMEOUT_MS;

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdmmcError {
    // Bad slot, width, buffer or request layout
    EINVAL,
    // Operation not allowed in the current state, e.g. writing a protected card
    // or deleting a host that still has slots attached
    EINVALSTATE,
    // Card-detect reports no card
    ENOCARD,
    ETIMEDOUT,
    // Response or data CRC mismatch
    ECRC,
    // The card answered with a malformed or error response
    EBADRESP,
    // Generic data path failure
    EIO,
    ENOMEM,
    // The hardware cannot do what was asked, e.g. DDR on an 8 bit bus
    ENOTSUPPORTED,
    ENOTIMPLEMENTED,
}

impl fmt::Display for SdmmcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SdmmcError::EINVAL => "invalid argument",
            SdmmcError::EINVALSTATE => "invalid state",
            SdmmcError::ENOCARD => "no card present",
            SdmmcError::ETIMEDOUT => "timed out",
            SdmmcError::ECRC => "crc mismatch",
            SdmmcError::EBADRESP => "invalid response",
            SdmmcError::EIO => "io failure",
            SdmmcError::ENOMEM => "out of memory",
            SdmmcError::ENOTSUPPORTED => "not supported",
            SdmmcError::ENOTIMPLEMENTED => "not implemented",
        };
        f.write_str(msg)
    }
}

bitflags! {
    /// Shape of the response a command expects back from the card.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmcRsp: u32 {
        const PRESENT = 1 << 0;
        const LONG = 1 << 1; // 136-bit response
        const CRC = 1 << 2; // Expect valid CRC
        const BUSY = 1 << 3; // Card may send busy
        const OPCODE = 1 << 4; // Response contains opcode
    }
}

// Define the MMC response types
pub const MMC_RSP_NONE: MmcRsp = MmcRsp::empty();
pub const MMC_RSP_R1: MmcRsp = MmcRsp::PRESENT.union(MmcRsp::CRC).union(MmcRsp::OPCODE);
pub const MMC_RSP_R1B: MmcRsp = MMC_RSP_R1.union(MmcRsp::BUSY);
pub const MMC_RSP_R2: MmcRsp = MmcRsp::PRESENT.union(MmcRsp::LONG).union(MmcRsp::CRC);
pub const MMC_RSP_R3: MmcRsp = MmcRsp::PRESENT;
pub const MMC_RSP_R4: MmcRsp = MmcRsp::PRESENT;
pub const MMC_RSP_R5: MmcRsp = MMC_RSP_R1;
pub const MMC_RSP_R6: MmcRsp = MMC_RSP_R1;
pub const MMC_RSP_R7: MmcRsp = MMC_RSP_R1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdmmcCmd {
    pub cmdidx: u32,
    pub resp_type: MmcRsp,
    pub cmdarg: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcDataFlag {
    SdmmcDataRead,
    SdmmcDataWrite,
}

#[derive(Debug)]
pub struct MmcData<'a> {
    /// Source or destination of the transfer. The DMA engine reads and writes
    /// it directly, so it must be word aligned.
    pub buf: &'a mut [u8],
    // The size of the block(sector size), for sdcard should almost always be 512
    pub blocksize: u32,
    pub flags: MmcDataFlag,
}

impl MmcData<'_> {
    pub fn blockcnt(&self) -> u32 {
        if self.blocksize == 0 {
            return 0;
        }
        (self.buf.len() / self.blocksize as usize) as u32
    }
}

// Signal voltage
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmcSignalVoltage {
    Voltage330 = 0,
    Voltage180 = 1,
    Voltage120 = 2,
}

impl MmcSignalVoltage {
    pub const fn millivolts(self) -> u32 {
        match self {
            MmcSignalVoltage::Voltage330 => 3300,
            MmcSignalVoltage::Voltage180 => 1800,
            MmcSignalVoltage::Voltage120 => 1200,
        }
    }
}

/// Called with the target signalling voltage in millivolts while the card
/// clock is stopped during a CMD11 voltage switch.
pub type VoltageSwitchFn<'a> = &'a mut dyn FnMut(u32) -> Result<(), SdmmcError>;

/// One command, optionally with a data phase, as handed to the host.
///
/// The host fills in `response` and `error`. A request that reaches the card
/// always comes back with `Ok(())` from the host; what went wrong on the bus is
/// reported through `error`.
pub struct SdmmcRequest<'a> {
    pub cmd: SdmmcCmd,
    pub data: Option<MmcData<'a>>,
    pub response: [u32; 4],
    /// Poll the busy line after the command until the card releases it
    pub wait_busy: bool,
    /// `None` waits forever
    pub timeout_ms: Option<u32>,
    pub error: Option<SdmmcError>,
    pub volt_switch_cb: Option<VoltageSwitchFn<'a>>,
}

impl<'a> SdmmcRequest<'a> {
    pub fn new(cmd: SdmmcCmd) -> Self {
        SdmmcRequest {
            cmd,
            data: None,
            response: [0; 4],
            wait_busy: false,
            timeout_ms: Some(DEFAULT_CMD_TIMEOUT_MS),
            error: None,
            volt_switch_cb: None,
        }
    }

    pub fn with_data(mut self, data: MmcData<'a>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: Option<u32>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_wait_busy(mut self) -> Self {
        self.wait_busy = true;
        self
    }

    pub fn with_voltage_switch(mut self, cb: VoltageSwitchFn<'a>) -> Self {
        self.volt_switch_cb = Some(cb);
        self
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self.data,
            Some(MmcData {
                flags: MmcDataFlag::SdmmcDataWrite,
                ..
            })
        )
    }

    pub fn data_len(&self) -> usize {
        self.data.as_ref().map_or(0, |data| data.buf.len())
    }
}
