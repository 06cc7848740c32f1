//! Typed view of the DesignWare MMC register block.
//!
//! The host logic never touches raw register values. It talks to an
//! implementation of [`SdmmcHardware`], which is either the memory mapped
//! controller in [`crate::regs`] or a software model in the unit tests.

use bitflags::bitflags;
use sdmmc_protocol::sdmmc::{mmc_struct::MmcBusWidth, sdmmc_capability::SdmmcHostCapability};

/// Number of card slots a controller drives
pub const SDMMC_NUM_SLOTS: usize = 2;

bitflags! {
    /// Bits of the raw/masked interrupt status registers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IntStatus: u32 {
        const CD = 1 << 0; // Card detect
        const RESP_ERR = 1 << 1;
        const CMD_DONE = 1 << 2;
        const DATA_OVER = 1 << 3;
        const TXDR = 1 << 4;
        const RXDR = 1 << 5;
        const RCRC = 1 << 6;
        const DCRC = 1 << 7;
        const RTO = 1 << 8; // Response timeout
        const DTO = 1 << 9; // Data read timeout
        const HTO = 1 << 10; // Host starvation timeout, doubles as voltage switch ack
        const FRUN = 1 << 11;
        const HLE = 1 << 12; // Hardware locked write error
        const SBE = 1 << 13; // Start bit error
        const ACD = 1 << 14; // Auto command done
        const EBE = 1 << 15; // End bit error
        const IO_SLOT0 = 1 << 16;
        const IO_SLOT1 = 1 << 17;
    }
}

impl IntStatus {
    pub const VOLT_SW: IntStatus = IntStatus::HTO;

    pub const CMD_ERR_MASK: IntStatus = IntStatus::RTO
        .union(IntStatus::RCRC)
        .union(IntStatus::RESP_ERR);

    pub const DATA_ERR_MASK: IntStatus = IntStatus::DTO
        .union(IntStatus::DCRC)
        .union(IntStatus::HTO)
        .union(IntStatus::SBE)
        .union(IntStatus::EBE);

    /// Interrupts enabled when the controller comes up
    pub const EVENT_DEFAULT: IntStatus = IntStatus::CD
        .union(IntStatus::RESP_ERR)
        .union(IntStatus::CMD_DONE)
        .union(IntStatus::DATA_OVER)
        .union(IntStatus::RCRC)
        .union(IntStatus::DCRC)
        .union(IntStatus::RTO)
        .union(IntStatus::DTO)
        .union(IntStatus::HTO)
        .union(IntStatus::SBE)
        .union(IntStatus::EBE);

    /// Bits the interrupt handler forwards to the transaction state machine
    pub const SD_EVENT_MASK: IntStatus = IntStatus::EVENT_DEFAULT;

    pub const SDIO_MASK: IntStatus = IntStatus::IO_SLOT0.union(IntStatus::IO_SLOT1);

    /// Card interrupt bit of one slot
    pub fn io_slot(slot: usize) -> IntStatus {
        if slot == 0 {
            IntStatus::IO_SLOT0
        } else {
            IntStatus::IO_SLOT1
        }
    }
}

bitflags! {
    /// Internal DMA controller status bits (IDSTS / IDINTEN)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DmaStatus: u32 {
        const TI = 1 << 0; // Transmit done
        const RI = 1 << 1; // Receive done
        const FBE = 1 << 2; // Fatal bus error
        const DU = 1 << 4; // Descriptor unavailable
        const CES = 1 << 5; // Card error summary
        const NI = 1 << 8; // Normal interrupt summary
        const AI = 1 << 9; // Abnormal interrupt summary
    }
}

impl DmaStatus {
    pub const DONE_MASK: DmaStatus = DmaStatus::RI.union(DmaStatus::TI).union(DmaStatus::NI);

    pub const EVENT_MASK: DmaStatus = DmaStatus::all();
}

/// Card input/output timing phase for low speed modes, 0 is the hardware default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelayPhase {
    #[default]
    Phase0 = 0,
    Phase1 = 1,
    Phase2 = 2,
    Phase3 = 3,
    Phase4 = 4,
    Phase5 = 5,
    Phase6 = 6,
    Phase7 = 7,
}

/// DLL delay line tap, only meaningful at SDR104 speeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelayLine {
    #[default]
    Line0 = 0,
    Line1 = 1,
    Line2 = 2,
    Line3 = 3,
    Line4 = 4,
    Line5 = 5,
    Line6 = 6,
    Line7 = 7,
}

/// Contents of the CMD register for one command.
///
/// `start_command` and `use_hold_reg` are managed by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HwCmd {
    pub cmd_index: u8,
    pub response_expect: bool,
    pub response_long: bool,
    pub check_response_crc: bool,
    pub data_expected: bool,
    /// Set for writes, clear for reads
    pub rw: bool,
    pub send_auto_stop: bool,
    /// Wait for the previous data transfer to complete before sending
    pub wait_complete: bool,
    pub stop_abort_cmd: bool,
    /// Send the 80 clock initialisation sequence first
    pub send_init: bool,
    pub card_num: u8,
    /// Not a bus command, only latches the clock registers into the card clock domain
    pub update_clk_reg: bool,
    pub volt_switch: bool,
    pub use_hold_reg: bool,
    pub start_command: bool,
}

impl HwCmd {
    /// Clock update pseudo command
    pub fn clock_update(is_cmd11: bool) -> Self {
        HwCmd {
            update_clk_reg: true,
            wait_complete: true,
            volt_switch: is_cmd11,
            ..Default::default()
        }
    }
}

/// What a DesignWare controller with both slots wired up can do
pub const DEFAULT_CAPABILITIES: SdmmcHostCapability = SdmmcHostCapability::MMC_TIMING_LEGACY
    .union(SdmmcHostCapability::MMC_TIMING_SD_HS)
    .union(SdmmcHostCapability::MMC_TIMING_UHS_SDR12)
    .union(SdmmcHostCapability::MMC_TIMING_UHS_SDR25)
    .union(SdmmcHostCapability::MMC_TIMING_UHS_SDR50)
    .union(SdmmcHostCapability::MMC_TIMING_UHS_SDR104)
    .union(SdmmcHostCapability::MMC_TIMING_UHS_DDR50)
    .union(SdmmcHostCapability::MMC_CAP_4_BIT_DATA)
    .union(SdmmcHostCapability::MMC_CAP_8_BIT_DATA)
    .union(SdmmcHostCapability::MMC_CAP_VOLTAGE_TUNE)
    .union(SdmmcHostCapability::MMC_CAP_AUTO_STOP);

/// Register level operations on one DesignWare MMC controller.
///
/// All methods take `&self`: register access is volatile, and the host
/// serialises everything except the interrupt status path with its lock.
pub trait SdmmcHardware {
    fn capabilities(&self) -> SdmmcHostCapability {
        DEFAULT_CAPABILITIES
    }

    // Reset
    fn reset_all(&self);
    fn is_reset_done(&self) -> bool;
    fn reset_fifo(&self);

    // Clocking
    fn set_clock_div(&self, div: u32);
    fn clock_div(&self) -> u32;
    fn set_card_clock_div(&self, slot: usize, card_div: u32);
    fn card_clock_div(&self, slot: usize) -> u32;
    fn enable_card_clock(&self, slot: usize, enable: bool);
    fn enable_card_clock_low_power(&self, slot: usize, enable: bool);
    fn set_data_timeout(&self, cycles: u32);
    fn set_response_timeout(&self, cycles: u8);
    fn set_delay_phase(&self, phase: DelayPhase);
    fn set_delay_line(&self, line: DelayLine);

    // Bus
    fn set_card_width(&self, slot: usize, width: MmcBusWidth);
    fn enable_ddr_mode(&self, slot: usize, enable: bool);
    fn enable_1v8_mode(&self, slot: usize, enable: bool);
    fn is_card_detected(&self, slot: usize) -> bool;
    fn is_write_protected(&self, slot: usize) -> bool;
    fn is_card_busy(&self) -> bool;

    // Command path
    /// The previous command has been latched by the card interface unit
    fn is_command_taken(&self) -> bool;
    fn set_command_arg(&self, arg: u32);
    fn set_command(&self, cmd: HwCmd);
    fn response(&self) -> [u32; 4];

    // Interrupts
    fn raw_interrupt_status(&self) -> IntStatus;
    fn masked_interrupt_status(&self) -> IntStatus;
    fn clear_interrupt(&self, mask: IntStatus);
    fn enable_interrupt(&self, mask: IntStatus, enable: bool);
    fn enable_global_interrupt(&self, enable: bool);
    fn dma_status(&self) -> DmaStatus;
    fn clear_dma_status(&self, mask: DmaStatus);

    // Internal DMA controller
    fn init_dma(&self, burst_len: u8);
    /// Point the IDMAC at the first descriptor and start polling the ring
    fn dma_prepare(&self, desc_addr: usize, block_size: u32, data_size: u32);
    fn dma_stop(&self);
    fn dma_resume(&self);
}
