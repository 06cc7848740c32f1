//! DesignWare MMC register block as found on the ESP32-P4.
//!
//! Declared with `tock_registers::register_structs!` so each offset is
//! checked at compile time. [`DwMmc`] maps the generic [`SdmmcHardware`]
//! operations onto these registers.

use core::sync::atomic::{AtomicU32, Ordering};

use sdmmc_protocol::sdmmc::mmc_struct::MmcBusWidth;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};

use crate::hw::{DelayLine, DelayPhase, DmaStatus, HwCmd, IntStatus, SdmmcHardware};

register_bitfields![u32,
    CTRL [
        CONTROLLER_RESET OFFSET(0) NUMBITS(1) [],
        FIFO_RESET OFFSET(1) NUMBITS(1) [],
        DMA_RESET OFFSET(2) NUMBITS(1) [],
        INT_ENABLE OFFSET(4) NUMBITS(1) [],
        DMA_ENABLE OFFSET(5) NUMBITS(1) [],
        READ_WAIT OFFSET(6) NUMBITS(1) [],
        SEND_IRQ_RESPONSE OFFSET(7) NUMBITS(1) [],
        ABORT_READ_DATA OFFSET(8) NUMBITS(1) [],
        USE_INTERNAL_DMAC OFFSET(25) NUMBITS(1) []
    ],
    CLKDIV [
        DIV0 OFFSET(0) NUMBITS(8) [],
        DIV1 OFFSET(8) NUMBITS(8) [],
        DIV2 OFFSET(16) NUMBITS(8) [],
        DIV3 OFFSET(24) NUMBITS(8) []
    ],
    CLKSRC [
        CARD0 OFFSET(0) NUMBITS(2) [],
        CARD1 OFFSET(2) NUMBITS(2) []
    ],
    CLKENA [
        CCLK_ENABLE OFFSET(0) NUMBITS(16) [],
        LP_ENABLE OFFSET(16) NUMBITS(16) []
    ],
    TMOUT [
        RESPONSE_TIMEOUT OFFSET(0) NUMBITS(8) [],
        DATA_TIMEOUT OFFSET(8) NUMBITS(24) []
    ],
    CTYPE [
        CARD_WIDTH4 OFFSET(0) NUMBITS(16) [],
        CARD_WIDTH8 OFFSET(16) NUMBITS(16) []
    ],
    BLKSIZ [
        BLOCK_SIZE OFFSET(0) NUMBITS(16) []
    ],
    CMD [
        INDEX OFFSET(0) NUMBITS(6) [],
        RESPONSE_EXPECT OFFSET(6) NUMBITS(1) [],
        RESPONSE_LENGTH OFFSET(7) NUMBITS(1) [],
        CHECK_RESPONSE_CRC OFFSET(8) NUMBITS(1) [],
        DATA_EXPECTED OFFSET(9) NUMBITS(1) [],
        READ_WRITE OFFSET(10) NUMBITS(1) [],
        TRANSFER_MODE OFFSET(11) NUMBITS(1) [],
        SEND_AUTO_STOP OFFSET(12) NUMBITS(1) [],
        WAIT_PRVDATA_COMPLETE OFFSET(13) NUMBITS(1) [],
        STOP_ABORT_CMD OFFSET(14) NUMBITS(1) [],
        SEND_INITIALIZATION OFFSET(15) NUMBITS(1) [],
        CARD_NUMBER OFFSET(16) NUMBITS(5) [],
        UPDATE_CLOCK_REGISTERS_ONLY OFFSET(21) NUMBITS(1) [],
        VOLT_SWITCH OFFSET(28) NUMBITS(1) [],
        USE_HOLD_REG OFFSET(29) NUMBITS(1) [],
        START_CMD OFFSET(31) NUMBITS(1) []
    ],
    STATUS [
        FIFO_RX_WATERMARK OFFSET(0) NUMBITS(1) [],
        FIFO_TX_WATERMARK OFFSET(1) NUMBITS(1) [],
        FIFO_EMPTY OFFSET(2) NUMBITS(1) [],
        FIFO_FULL OFFSET(3) NUMBITS(1) [],
        COMMAND_FSM_STATES OFFSET(4) NUMBITS(4) [],
        DATA_3_STATUS OFFSET(8) NUMBITS(1) [],
        DATA_BUSY OFFSET(9) NUMBITS(1) [],
        DATA_STATE_MC_BUSY OFFSET(10) NUMBITS(1) [],
        RESPONSE_INDEX OFFSET(11) NUMBITS(6) [],
        FIFO_COUNT OFFSET(17) NUMBITS(13) []
    ],
    CDETECT [
        CARD_DETECT_N OFFSET(0) NUMBITS(2) []
    ],
    WRTPRT [
        WRITE_PROTECT OFFSET(0) NUMBITS(2) []
    ],
    UHS [
        VOLT OFFSET(0) NUMBITS(2) [],
        DDR OFFSET(16) NUMBITS(2) []
    ],
    BMOD [
        SWR OFFSET(0) NUMBITS(1) [],
        FB OFFSET(1) NUMBITS(1) [],
        DE OFFSET(7) NUMBITS(1) [],
        PBL OFFSET(8) NUMBITS(3) []
    ],
    CLK_EDGE_SEL [
        CCLKIN_EDGE_DRV_SEL OFFSET(0) NUMBITS(3) [],
        CCLKIN_EDGE_SAM_SEL OFFSET(3) NUMBITS(3) [],
        CCLKIN_EDGE_SLF_SEL OFFSET(6) NUMBITS(3) [],
        CCLLKIN_EDGE_H OFFSET(9) NUMBITS(4) [],
        CCLLKIN_EDGE_L OFFSET(13) NUMBITS(4) [],
        CCLLKIN_EDGE_N OFFSET(17) NUMBITS(4) [],
        ESDIO_MODE OFFSET(21) NUMBITS(1) [],
        ESD_MODE OFFSET(22) NUMBITS(1) [],
        CCLK_EN OFFSET(23) NUMBITS(1) [],
        ULTRAHIGH_SPEED_MODE OFFSET(24) NUMBITS(1) []
    ],
    DLL_CLK_CONF [
        SLF_EN OFFSET(0) NUMBITS(1) [],
        DRV_EN OFFSET(1) NUMBITS(1) [],
        SAM_EN OFFSET(2) NUMBITS(1) [],
        SLF_PHASE OFFSET(3) NUMBITS(6) [],
        DRV_PHASE OFFSET(9) NUMBITS(6) [],
        SAM_PHASE OFFSET(15) NUMBITS(6) []
    ]
];

tock_registers::register_structs! {
    /// DesignWare MMC register map
    pub DwMmcRegisters {
        (0x000 => ctrl: ReadWrite<u32, CTRL::Register>),
        (0x004 => _reserved0),
        (0x008 => clkdiv: ReadWrite<u32, CLKDIV::Register>),
        (0x00C => clksrc: ReadWrite<u32, CLKSRC::Register>),
        (0x010 => clkena: ReadWrite<u32, CLKENA::Register>),
        (0x014 => tmout: ReadWrite<u32, TMOUT::Register>),
        (0x018 => ctype: ReadWrite<u32, CTYPE::Register>),
        (0x01C => blksiz: ReadWrite<u32, BLKSIZ::Register>),
        (0x020 => bytcnt: ReadWrite<u32>),
        (0x024 => intmask: ReadWrite<u32>),
        (0x028 => cmdarg: ReadWrite<u32>),
        (0x02C => cmd: ReadWrite<u32, CMD::Register>),
        (0x030 => resp: [ReadOnly<u32>; 4]),
        (0x040 => mintsts: ReadOnly<u32>),
        (0x044 => rintsts: ReadWrite<u32>),
        (0x048 => status: ReadOnly<u32, STATUS::Register>),
        (0x04C => _reserved1),
        (0x050 => cdetect: ReadOnly<u32, CDETECT::Register>),
        (0x054 => wrtprt: ReadOnly<u32, WRTPRT::Register>),
        (0x058 => _reserved2),
        (0x074 => uhs: ReadWrite<u32, UHS::Register>),
        (0x078 => _reserved3),
        (0x080 => bmod: ReadWrite<u32, BMOD::Register>),
        (0x084 => pldmnd: WriteOnly<u32>),
        (0x088 => dbaddr: ReadWrite<u32>),
        (0x08C => idsts: ReadWrite<u32>),
        (0x090 => idinten: ReadWrite<u32>),
        (0x094 => _reserved4),
        (0x800 => clk_edge_sel: ReadWrite<u32, CLK_EDGE_SEL::Register>),
        (0x804 => _reserved5),
        (0x808 => dll_clk_conf: ReadWrite<u32, DLL_CLK_CONF::Register>),
        (0x80C => _reserved6),
        (0x810 => @END),
    }
}

/// Edge counters `(n, h, l)` that divide the source clock by `div`
fn clock_edges(div: u32) -> (u32, u32, u32) {
    if div > 1 {
        (div - 1, div / 2 - 1, div - 1)
    } else {
        (0, 0, 0)
    }
}

fn with_slot_bit(value: u32, slot: usize, set: bool) -> u32 {
    if set {
        value | (1 << slot)
    } else {
        value & !(1 << slot)
    }
}

/// Memory mapped DesignWare MMC controller
pub struct DwMmc {
    regs: &'static DwMmcRegisters,
    // INTMASK as last requested. The interrupt handler and the task both
    // change it, so bits are flipped here atomically and then published.
    intmask: AtomicU32,
}

// SAFETY: every access is a volatile load or store of a device register.
// INTMASK goes through the atomic shadow; every other read-modify-write runs
// under the host's transaction lock.
unsafe impl Send for DwMmc {}
unsafe impl Sync for DwMmc {}

impl DwMmc {
    /// # Safety
    ///
    /// `register_base` must be the mapped base of a DesignWare MMC block that
    /// stays mapped for the rest of the program and has no other owner.
    pub unsafe fn new(register_base: usize) -> Self {
        let regs: &'static DwMmcRegisters = unsafe { &*(register_base as *const DwMmcRegisters) };
        DwMmc {
            regs,
            intmask: AtomicU32::new(regs.intmask.get()),
        }
    }

    fn poll_demand(&self) {
        self.regs.pldmnd.set(1);
    }
}

impl SdmmcHardware for DwMmc {
    fn reset_all(&self) {
        self.regs
            .ctrl
            .modify(CTRL::CONTROLLER_RESET::SET + CTRL::FIFO_RESET::SET + CTRL::DMA_RESET::SET);
    }

    fn is_reset_done(&self) -> bool {
        !self.regs.ctrl.is_set(CTRL::CONTROLLER_RESET)
            && !self.regs.ctrl.is_set(CTRL::FIFO_RESET)
            && !self.regs.ctrl.is_set(CTRL::DMA_RESET)
    }

    fn reset_fifo(&self) {
        self.regs.ctrl.modify(CTRL::FIFO_RESET::SET);
    }

    fn set_clock_div(&self, div: u32) {
        let (n, h, l) = clock_edges(div);
        self.regs.clk_edge_sel.modify(
            CLK_EDGE_SEL::CCLLKIN_EDGE_N.val(n)
                + CLK_EDGE_SEL::CCLLKIN_EDGE_H.val(h)
                + CLK_EDGE_SEL::CCLLKIN_EDGE_L.val(l),
        );
    }

    fn clock_div(&self) -> u32 {
        self.regs.clk_edge_sel.read(CLK_EDGE_SEL::CCLLKIN_EDGE_N) + 1
    }

    fn set_card_clock_div(&self, slot: usize, card_div: u32) {
        // Each slot owns the divider with its own index
        if slot == 0 {
            self.regs.clksrc.modify(CLKSRC::CARD0.val(0));
            self.regs.clkdiv.modify(CLKDIV::DIV0.val(card_div));
        } else {
            self.regs.clksrc.modify(CLKSRC::CARD1.val(1));
            self.regs.clkdiv.modify(CLKDIV::DIV1.val(card_div));
        }
    }

    fn card_clock_div(&self, slot: usize) -> u32 {
        if slot == 0 {
            self.regs.clkdiv.read(CLKDIV::DIV0)
        } else {
            self.regs.clkdiv.read(CLKDIV::DIV1)
        }
    }

    fn enable_card_clock(&self, slot: usize, enable: bool) {
        let bits = self.regs.clkena.read(CLKENA::CCLK_ENABLE);
        self.regs
            .clkena
            .modify(CLKENA::CCLK_ENABLE.val(with_slot_bit(bits, slot, enable)));
    }

    fn enable_card_clock_low_power(&self, slot: usize, enable: bool) {
        let bits = self.regs.clkena.read(CLKENA::LP_ENABLE);
        self.regs
            .clkena
            .modify(CLKENA::LP_ENABLE.val(with_slot_bit(bits, slot, enable)));
    }

    fn set_data_timeout(&self, cycles: u32) {
        self.regs
            .tmout
            .modify(TMOUT::DATA_TIMEOUT.val(cycles.min(0xFF_FFFF)));
    }

    fn set_response_timeout(&self, cycles: u8) {
        self.regs
            .tmout
            .modify(TMOUT::RESPONSE_TIMEOUT.val(cycles as u32));
    }

    fn set_delay_phase(&self, phase: DelayPhase) {
        self.regs
            .clk_edge_sel
            .modify(CLK_EDGE_SEL::CCLKIN_EDGE_SAM_SEL.val(phase as u32));
    }

    fn set_delay_line(&self, line: DelayLine) {
        self.regs
            .dll_clk_conf
            .modify(DLL_CLK_CONF::SAM_EN::SET + DLL_CLK_CONF::SAM_PHASE.val(line as u32));
    }

    fn set_card_width(&self, slot: usize, width: MmcBusWidth) {
        let w4 = self.regs.ctype.read(CTYPE::CARD_WIDTH4);
        let w8 = self.regs.ctype.read(CTYPE::CARD_WIDTH8);
        let (four, eight) = match width {
            MmcBusWidth::Width1 => (false, false),
            MmcBusWidth::Width4 => (true, false),
            MmcBusWidth::Width8 => (false, true),
        };
        self.regs.ctype.write(
            CTYPE::CARD_WIDTH4.val(with_slot_bit(w4, slot, four))
                + CTYPE::CARD_WIDTH8.val(with_slot_bit(w8, slot, eight)),
        );
    }

    fn enable_ddr_mode(&self, slot: usize, enable: bool) {
        let bits = self.regs.uhs.read(UHS::DDR);
        self.regs
            .uhs
            .modify(UHS::DDR.val(with_slot_bit(bits, slot, enable)));
    }

    fn enable_1v8_mode(&self, slot: usize, enable: bool) {
        let bits = self.regs.uhs.read(UHS::VOLT);
        self.regs
            .uhs
            .modify(UHS::VOLT.val(with_slot_bit(bits, slot, enable)));
    }

    fn is_card_detected(&self, slot: usize) -> bool {
        // Active low
        self.regs.cdetect.read(CDETECT::CARD_DETECT_N) & (1 << slot) == 0
    }

    fn is_write_protected(&self, slot: usize) -> bool {
        self.regs.wrtprt.read(WRTPRT::WRITE_PROTECT) & (1 << slot) != 0
    }

    fn is_card_busy(&self) -> bool {
        self.regs.status.is_set(STATUS::DATA_BUSY)
    }

    fn is_command_taken(&self) -> bool {
        !self.regs.cmd.is_set(CMD::START_CMD)
    }

    fn set_command_arg(&self, arg: u32) {
        self.regs.cmdarg.set(arg);
    }

    fn set_command(&self, cmd: HwCmd) {
        let bit = |b: bool| b as u32;
        self.regs.cmd.write(
            CMD::INDEX.val(cmd.cmd_index as u32)
                + CMD::RESPONSE_EXPECT.val(bit(cmd.response_expect))
                + CMD::RESPONSE_LENGTH.val(bit(cmd.response_long))
                + CMD::CHECK_RESPONSE_CRC.val(bit(cmd.check_response_crc))
                + CMD::DATA_EXPECTED.val(bit(cmd.data_expected))
                + CMD::READ_WRITE.val(bit(cmd.rw))
                + CMD::SEND_AUTO_STOP.val(bit(cmd.send_auto_stop))
                + CMD::WAIT_PRVDATA_COMPLETE.val(bit(cmd.wait_complete))
                + CMD::STOP_ABORT_CMD.val(bit(cmd.stop_abort_cmd))
                + CMD::SEND_INITIALIZATION.val(bit(cmd.send_init))
                + CMD::CARD_NUMBER.val(cmd.card_num as u32)
                + CMD::UPDATE_CLOCK_REGISTERS_ONLY.val(bit(cmd.update_clk_reg))
                + CMD::VOLT_SWITCH.val(bit(cmd.volt_switch))
                + CMD::USE_HOLD_REG.val(bit(cmd.use_hold_reg))
                + CMD::START_CMD.val(bit(cmd.start_command)),
        );
    }

    fn response(&self) -> [u32; 4] {
        core::array::from_fn(|i| self.regs.resp[i].get())
    }

    fn raw_interrupt_status(&self) -> IntStatus {
        IntStatus::from_bits_truncate(self.regs.rintsts.get())
    }

    fn masked_interrupt_status(&self) -> IntStatus {
        IntStatus::from_bits_truncate(self.regs.mintsts.get())
    }

    fn clear_interrupt(&self, mask: IntStatus) {
        // Write one to clear
        self.regs.rintsts.set(mask.bits());
    }

    fn enable_interrupt(&self, mask: IntStatus, enable: bool) {
        if enable {
            self.intmask.fetch_or(mask.bits(), Ordering::AcqRel);
        } else {
            self.intmask.fetch_and(!mask.bits(), Ordering::AcqRel);
        }
        // Whoever preempted us between the load and the store published a
        // newer mask; the register must end up holding the latest one
        loop {
            let value = self.intmask.load(Ordering::Acquire);
            self.regs.intmask.set(value);
            if self.intmask.load(Ordering::Acquire) == value {
                break;
            }
        }
    }

    fn enable_global_interrupt(&self, enable: bool) {
        if enable {
            self.regs.ctrl.modify(CTRL::INT_ENABLE::SET);
        } else {
            self.regs.ctrl.modify(CTRL::INT_ENABLE::CLEAR);
        }
    }

    fn dma_status(&self) -> DmaStatus {
        DmaStatus::from_bits_truncate(self.regs.idsts.get())
    }

    fn clear_dma_status(&self, mask: DmaStatus) {
        self.regs.idsts.set(mask.bits());
    }

    fn init_dma(&self, burst_len: u8) {
        self.regs
            .ctrl
            .modify(CTRL::DMA_ENABLE::SET + CTRL::USE_INTERNAL_DMAC::SET);
        self.regs
            .bmod
            .write(BMOD::SWR::SET + BMOD::PBL.val(burst_len as u32));
        self.regs.idinten.set(DmaStatus::EVENT_MASK.bits());
    }

    fn dma_prepare(&self, desc_addr: usize, block_size: u32, data_size: u32) {
        self.regs.bytcnt.set(data_size);
        self.regs.blksiz.write(BLKSIZ::BLOCK_SIZE.val(block_size));
        self.regs.dbaddr.set(desc_addr as u32);
        self.regs
            .ctrl
            .modify(CTRL::DMA_ENABLE::SET + CTRL::USE_INTERNAL_DMAC::SET);
        self.regs.bmod.modify(BMOD::DE::SET + BMOD::FB::SET);
        self.poll_demand();
    }

    fn dma_stop(&self) {
        self.regs
            .ctrl
            .modify(CTRL::USE_INTERNAL_DMAC::CLEAR + CTRL::DMA_RESET::SET);
        self.regs.bmod.modify(BMOD::FB::CLEAR + BMOD::DE::CLEAR);
    }

    fn dma_resume(&self) {
        self.poll_demand();
    }
}
