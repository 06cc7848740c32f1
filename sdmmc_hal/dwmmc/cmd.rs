//! Command dispatch onto the card interface unit.

use sdmmc_protocol::debug_log;
use sdmmc_protocol::sdmmc::sdmmc_constant::{
    MMC_CMD_GO_IDLE_STATE, MMC_CMD_STOP_TRANSMISSION, SD_CMD_APP_SEND_SCR, SD_CMD_SWITCH_VOLTAGE,
};
use sdmmc_protocol::sdmmc::{MmcRsp, SdmmcError, SdmmcRequest};
use sdmmc_protocol::sdmmc_os::{poll_until, Backoff};

use crate::host::SdmmcHost;
use crate::hw::{HwCmd, IntStatus, SdmmcHardware};
use crate::platform::HostPlatform;

pub const START_CMD_TIMEOUT_US: u64 = 1_000_000;
pub const CLOCK_UPDATE_CMD_TIMEOUT_US: u64 = 1_000_000;

/// Translate a request into the CMD register layout.
///
/// `after_app_cmd` is set when the previous command was APP_CMD, which turns
/// opcode 51 into SEND_SCR; that one must not be followed by an auto stop.
pub fn make_hw_cmd(req: &SdmmcRequest<'_>, after_app_cmd: bool) -> HwCmd {
    let opcode = req.cmd.cmdidx;
    let rsp = req.cmd.resp_type;

    let mut cmd = HwCmd {
        cmd_index: (opcode & 0x3F) as u8,
        ..Default::default()
    };

    match opcode {
        MMC_CMD_STOP_TRANSMISSION => cmd.stop_abort_cmd = true,
        MMC_CMD_GO_IDLE_STATE => cmd.send_init = true,
        SD_CMD_SWITCH_VOLTAGE => cmd.volt_switch = true,
        _ => cmd.wait_complete = true,
    }

    if rsp.contains(MmcRsp::PRESENT) {
        cmd.response_expect = true;
        cmd.response_long = rsp.contains(MmcRsp::LONG);
    }
    cmd.check_response_crc = rsp.contains(MmcRsp::CRC);

    if req.data.is_some() {
        cmd.data_expected = true;
        cmd.rw = req.is_write();
        cmd.send_auto_stop = !(after_app_cmd && opcode == SD_CMD_APP_SEND_SCR);
    }

    cmd
}

impl<H: SdmmcHardware, P: HostPlatform, const N: usize> SdmmcHost<H, P, N> {
    /// Wait until the card interface unit has latched the previous command
    fn wait_command_taken(&self) -> Result<(), SdmmcError> {
        poll_until(
            &self.platform,
            Some(START_CMD_TIMEOUT_US),
            Backoff::REGISTER,
            || self.hw.is_command_taken().then_some(()),
        )
        .inspect_err(|_| {
            debug_log!("sdmmc: timed out waiting for command to be taken");
        })
    }

    /// Put `cmd` with `arg` on the bus of `slot`.
    ///
    /// The caller holds the transaction lock.
    pub(crate) fn start_command(&self, slot: usize, mut cmd: HwCmd, arg: u32) -> Result<(), SdmmcError> {
        if !cmd.update_clk_reg && !self.hw.is_card_detected(slot) {
            return Err(SdmmcError::ENOCARD);
        }
        if cmd.data_expected && cmd.rw && self.hw.is_write_protected(slot) {
            return Err(SdmmcError::EINVALSTATE);
        }

        // Outputs must be driven on the hold register edge
        cmd.use_hold_reg = true;

        // The clock update of a CMD11 sequence goes out while the previous
        // command is still in flight.
        let skip_wait = cmd.volt_switch && cmd.update_clk_reg;
        if !skip_wait {
            self.wait_command_taken()?;
        }

        self.hw.set_command_arg(arg);
        cmd.card_num = slot as u8;
        cmd.start_command = true;
        self.hw.set_command(cmd);

        self.wait_command_taken()
    }

    /// Latch the clock registers into the card clock domain.
    ///
    /// The CIU may answer with a hardware locked error when it is busy; in that
    /// case the update is simply sent again.
    pub(crate) fn clock_update_command(&self, slot: usize, is_cmd11: bool) -> Result<(), SdmmcError> {
        let cmd = HwCmd::clock_update(is_cmd11);
        loop {
            self.start_command(slot, cmd, 0)?;

            let resend = poll_until(
                &self.platform,
                Some(CLOCK_UPDATE_CMD_TIMEOUT_US),
                Backoff::REGISTER,
                || {
                    if self.hw.raw_interrupt_status().contains(IntStatus::HLE) {
                        self.hw.clear_interrupt(IntStatus::HLE);
                        return Some(true);
                    }
                    self.hw.is_command_taken().then_some(false)
                },
            )?;

            if !resend {
                return Ok(());
            }
            debug_log!("sdmmc: clock update raised HLE, resending");
        }
    }
}
