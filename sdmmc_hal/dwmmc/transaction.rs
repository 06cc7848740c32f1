//! Request state machine.
//!
//! A request moves Idle -> SendingCmd -> (SendingData -> Busy) -> Idle, or
//! through the two voltage switch states for CMD11. Every event from the
//! interrupt handler is folded into the current state until no further
//! transition fires, so one event may advance the request several steps.

use core::sync::atomic::Ordering;

use sdmmc_protocol::sdmmc::sdmmc_constant::{MMC_CMD_APP_CMD, SD_CMD_SWITCH_VOLTAGE};
use sdmmc_protocol::sdmmc::{MmcRsp, MmcSignalVoltage, SdmmcError, SdmmcRequest};
use sdmmc_protocol::sdmmc_os::{poll_until, Backoff};
use sdmmc_protocol::{debug_log, error_log};

use crate::cmd::make_hw_cmd;
use crate::dma::DMA_ALIGNMENT;
use crate::event::SdmmcEvent;
use crate::host::{HostInner, SdmmcHost};
use crate::hw::{DmaStatus, IntStatus, SdmmcHardware};
use crate::platform::HostPlatform;

const CMD_INDEX_MAX: u32 = 63;
const BLOCK_SIZE_MAX: u32 = 0xFFFF;
const VOLTAGE_SWITCH_MV: u32 = MmcSignalVoltage::Voltage180.millivolts();
// Card clock off before the regulator is touched
const VOLTAGE_SWITCH_CLK_OFF_US: u32 = 100;
// Regulator settle time before the clock comes back
const VOLTAGE_SWITCH_SETTLE_US: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
    Idle,
    SendingCmd,
    SendingData,
    Busy,
    SendingVoltageSwitch,
    WaitingVoltageSwitch,
}

/// Take `mask` out of `bits`, returning whether any of it was set
fn take_bits<T>(bits: &mut T, mask: T) -> bool
where
    T: bitflags::Flags + Copy,
{
    let hit = bits.intersects(mask);
    bits.remove(mask);
    hit
}

/// Reject requests the DMA engine cannot carry out
fn validate_request(req: &SdmmcRequest<'_>) -> Result<(), SdmmcError> {
    if req.cmd.cmdidx > CMD_INDEX_MAX {
        debug_log!("sdmmc: opcode {} does not fit the command index field", req.cmd.cmdidx);
        return Err(SdmmcError::EINVAL);
    }
    if req.cmd.cmdidx == SD_CMD_SWITCH_VOLTAGE && req.volt_switch_cb.is_none() {
        debug_log!("sdmmc: voltage switch requested without a callback");
        return Err(SdmmcError::EINVAL);
    }

    let Some(data) = req.data.as_ref() else {
        return Ok(());
    };
    let len = data.buf.len();
    let blocksize = data.blocksize as usize;
    if len == 0 || blocksize == 0 || len % blocksize != 0 {
        return Err(SdmmcError::EINVAL);
    }
    // The IDMAC moves whole words, anything shorter would be overrun
    if len % DMA_ALIGNMENT != 0 || data.buf.as_ptr() as usize % DMA_ALIGNMENT != 0 {
        debug_log!("sdmmc: data buffer must be word sized and word aligned");
        return Err(SdmmcError::EINVAL);
    }
    // BLKSIZ is 16 bits wide and BYTCNT 32
    if data.blocksize > BLOCK_SIZE_MAX || u32::try_from(len).is_err() {
        return Err(SdmmcError::EINVAL);
    }
    Ok(())
}

/// One request being driven through the state machine.
///
/// Lives only while the transaction lock is held.
pub(crate) struct Transaction<'r, 'a, H: SdmmcHardware, P: HostPlatform, const N: usize> {
    host: &'r SdmmcHost<H, P, N>,
    inner: &'r mut HostInner<N>,
    req: &'r mut SdmmcRequest<'a>,
    slot: usize,
    state: ReqState,
    // Bits no state consumed yet, merged into the next event
    unhandled: SdmmcEvent,
}

impl<'r, 'a, H: SdmmcHardware, P: HostPlatform, const N: usize> Transaction<'r, 'a, H, P, N> {
    pub(crate) fn new(
        host: &'r SdmmcHost<H, P, N>,
        inner: &'r mut HostInner<N>,
        req: &'r mut SdmmcRequest<'a>,
        slot: usize,
        state: ReqState,
    ) -> Self {
        Transaction {
            host,
            inner,
            req,
            slot,
            state,
            unhandled: SdmmcEvent::default(),
        }
    }

    pub(crate) fn state(&self) -> ReqState {
        self.state
    }

    /// Fold one event into the state, running transitions until it settles
    pub(crate) fn process_event(&mut self, event: SdmmcEvent) {
        let orig = SdmmcEvent {
            sdmmc_status: event.sdmmc_status | self.unhandled.sdmmc_status,
            dma_status: event.dma_status | self.unhandled.dma_status,
        };
        let mut evt = orig;

        let mut next = self.state;
        let mut state = None;
        while state != Some(next) {
            let cur = next;
            state = Some(cur);
            next = self.step(cur, &mut evt, orig.sdmmc_status);
            if next != cur {
                debug_log!("sdmmc: {:?} -> {:?}", cur, next);
            }
        }

        self.state = next;
        self.unhandled = evt;
    }

    fn step(&mut self, state: ReqState, evt: &mut SdmmcEvent, status: IntStatus) -> ReqState {
        match state {
            ReqState::Idle => ReqState::Idle,

            ReqState::SendingCmd => {
                // Error bits wait in `unhandled` until the done bit shows up,
                // the response is then read once with all of them
                if !evt.sdmmc_status.contains(IntStatus::CMD_DONE) {
                    return state;
                }
                evt.sdmmc_status.remove(IntStatus::CMD_DONE | IntStatus::CMD_ERR_MASK);
                self.process_command_response(status);
                if self.req.error.is_some() || self.req.data.is_none() {
                    ReqState::Idle
                } else {
                    ReqState::SendingData
                }
            }

            ReqState::SendingVoltageSwitch => {
                let mut next = state;
                if take_bits(&mut evt.sdmmc_status, IntStatus::CMD_ERR_MASK) {
                    self.process_command_response(status);
                    next = ReqState::Idle;
                }
                if take_bits(&mut evt.sdmmc_status, IntStatus::VOLT_SW) {
                    self.voltage_switch_stage2();
                    next = if self.req.error.is_some() {
                        ReqState::Idle
                    } else {
                        ReqState::WaitingVoltageSwitch
                    };
                }
                next
            }

            ReqState::WaitingVoltageSwitch => {
                let mut next = state;
                if take_bits(&mut evt.sdmmc_status, IntStatus::CMD_ERR_MASK) {
                    self.process_command_response(status);
                    next = ReqState::Idle;
                }
                if take_bits(&mut evt.sdmmc_status, IntStatus::VOLT_SW) {
                    next = ReqState::Idle;
                }
                next
            }

            ReqState::SendingData => {
                let mut next = state;
                if take_bits(&mut evt.sdmmc_status, IntStatus::DATA_ERR_MASK) {
                    self.process_data_status(status);
                }
                if take_bits(&mut evt.dma_status, DmaStatus::DONE_MASK) {
                    let ring = &mut self.inner.ring;
                    if ring.size_remaining() > 0 {
                        let free = ring.free_count();
                        ring.fill(free);
                        ring.resume(&self.host.hw);
                    } else {
                        next = ReqState::Busy;
                    }
                }
                // No data complete follows a start bit error, and one arriving
                // before the ring is drained ends the transfer early
                if status.contains(IntStatus::SBE)
                    || (next != ReqState::Busy && evt.sdmmc_status.contains(IntStatus::DATA_OVER))
                {
                    evt.sdmmc_status.remove(IntStatus::DATA_OVER);
                    next = ReqState::Idle;
                }
                next
            }

            ReqState::Busy => {
                if !take_bits(&mut evt.sdmmc_status, IntStatus::DATA_OVER) {
                    return state;
                }
                self.process_data_status(status);
                ReqState::Idle
            }
        }
    }

    fn process_command_response(&mut self, status: IntStatus) {
        let flags = self.req.cmd.resp_type;
        if flags.contains(MmcRsp::PRESENT) {
            let resp = self.host.hw.response();
            self.req.response = if flags.contains(MmcRsp::LONG) {
                resp
            } else {
                [resp[0], 0, 0, 0]
            };
        }

        let err = if status.contains(IntStatus::RTO) {
            Some(SdmmcError::ETIMEDOUT)
        } else if flags.contains(MmcRsp::CRC) && status.contains(IntStatus::RCRC) {
            Some(SdmmcError::ECRC)
        } else if status.contains(IntStatus::RESP_ERR) {
            Some(SdmmcError::EBADRESP)
        } else {
            None
        };

        if let Some(err) = err {
            self.req.error = Some(err);
            if self.req.data.is_some() {
                self.inner.ring.stop(&self.host.hw);
            }
            debug_log!("sdmmc: command {} failed: {} (status {:?})", self.req.cmd.cmdidx, err, status);
        }
    }

    fn process_data_status(&mut self, status: IntStatus) {
        if status.intersects(IntStatus::DATA_ERR_MASK) {
            let err = if status.contains(IntStatus::DTO) {
                SdmmcError::ETIMEDOUT
            } else if status.contains(IntStatus::DCRC) {
                SdmmcError::ECRC
            } else if status.contains(IntStatus::EBE) && self.req.is_write() {
                SdmmcError::ETIMEDOUT
            } else {
                SdmmcError::EIO
            };
            self.req.error = Some(err);
            self.host.hw.reset_fifo();
        }

        if let Some(err) = self.req.error {
            if self.req.data.is_some() {
                self.inner.ring.stop(&self.host.hw);
            }
            debug_log!("sdmmc: data phase failed: {} (status {:?})", err, status);
        }
    }

    /// Stop the card clock, let the caller switch the regulator to 1.8 V,
    /// then restart the clock in 1.8 V mode.
    fn voltage_switch_stage2(&mut self) {
        let slot = self.slot;
        let platform = &self.host.platform;

        let mut result = self.host.enable_clk_cmd11(slot, false);
        if result.is_ok() {
            platform.usleep(VOLTAGE_SWITCH_CLK_OFF_US);
            result = match self.req.volt_switch_cb.as_deref_mut() {
                Some(cb) => cb(VOLTAGE_SWITCH_MV),
                None => Err(SdmmcError::EINVAL),
            };
            platform.usleep(VOLTAGE_SWITCH_SETTLE_US);
        }
        // Restart the clock even when the regulator failed
        let restart = self.host.enable_clk_cmd11(slot, true);

        if let Err(e) = result.and(restart) {
            error_log!("sdmmc: voltage switch on slot {} failed: {}", slot, e);
            self.req.error = Some(e);
        }
    }
}

impl<H: SdmmcHardware, P: HostPlatform, const N: usize> SdmmcHost<H, P, N> {
    /// Run `req` on `slot` and block until it completes.
    ///
    /// An `Err` means the request never made it onto the bus, or the
    /// controller went silent. Once the card has been addressed the call
    /// returns `Ok` and any bus error is left in `req.error`.
    pub fn do_transaction(&self, slot: usize, req: &mut SdmmcRequest<'_>) -> Result<(), SdmmcError> {
        self.slot(slot)?;
        validate_request(req)?;
        req.error = None;
        req.response = [0; 4];

        let mut inner = self.inner.lock();
        self.platform.pm_lock_acquire();
        let ret = self.run_transaction(&mut inner, slot, req);
        self.platform.pm_lock_release();
        ret
    }

    fn run_transaction(
        &self,
        inner: &mut HostInner<N>,
        slot: usize,
        req: &mut SdmmcRequest<'_>,
    ) -> Result<(), SdmmcError> {
        let ret = self.run_command(inner, slot, req);
        // Only a CMD55 that completed makes the next opcode an ACMD
        inner.is_app_cmd = ret.is_ok() && req.error.is_none() && req.cmd.cmdidx == MMC_CMD_APP_CMD;
        ret
    }

    fn run_command(
        &self,
        inner: &mut HostInner<N>,
        slot: usize,
        req: &mut SdmmcRequest<'_>,
    ) -> Result<(), SdmmcError> {
        if !self.hw.is_card_detected(slot) {
            return Err(SdmmcError::ENOCARD);
        }
        if req.is_write() && self.hw.is_write_protected(slot) {
            return Err(SdmmcError::EINVALSTATE);
        }

        self.drain_idle_events(inner);
        self.apply_slot_config(inner, slot)?;
        self.irq_slot.store(slot, Ordering::Release);

        if req.cmd.cmdidx == SD_CMD_SWITCH_VOLTAGE {
            // Stage 1: the card must see a free running clock
            self.set_cclk_always_on_locked(slot, true)?;
            let ret = self.issue_command(inner, slot, req, ReqState::SendingVoltageSwitch);
            // Stage 3: back to gating the clock between commands, also when
            // the switch failed
            let restore = self.set_cclk_always_on_locked(slot, false).inspect_err(|e| {
                error_log!("sdmmc: failed to restore clock gating on slot {}: {}", slot, e);
            });
            ret.and(restore)?;
        } else {
            self.issue_command(inner, slot, req, ReqState::SendingCmd)?;
        }

        if req.wait_busy {
            let timeout_us = req.timeout_ms.map(|ms| ms as u64 * 1000);
            poll_until(&self.platform, timeout_us, Backoff::Tick, || {
                (!self.hw.is_card_busy()).then_some(())
            })
            .inspect_err(|_| {
                debug_log!("sdmmc: card still busy after command {}", req.cmd.cmdidx);
            })?;
        }
        Ok(())
    }

    /// Start the command and feed events to the state machine until it is idle
    fn issue_command(
        &self,
        inner: &mut HostInner<N>,
        slot: usize,
        req: &mut SdmmcRequest<'_>,
        initial: ReqState,
    ) -> Result<(), SdmmcError> {
        let hw_cmd = make_hw_cmd(req, inner.is_app_cmd);
        if let Some(data) = req.data.as_mut() {
            let len = data.buf.len();
            inner.ring.prepare(data.buf.as_mut_ptr() as usize, len);
            self.hw
                .dma_prepare(inner.ring.base_addr(), data.blocksize, len as u32);
        }

        if let Err(e) = self.start_command(slot, hw_cmd, req.cmd.cmdarg) {
            error_log!("sdmmc: failed to start command {}: {}", req.cmd.cmdidx, e);
            if req.data.is_some() {
                inner.ring.stop(&self.hw);
            }
            return Err(e);
        }

        let has_data = req.data.is_some();
        let timeout_ms = req.timeout_ms;
        let mut txn = Transaction::new(self, inner, req, slot, initial);
        while txn.state() != ReqState::Idle {
            let event = match self.events.recv_timeout(&self.platform, timeout_ms) {
                Ok(event) => event,
                Err(e) => {
                    error_log!("sdmmc: no event in {:?} state: {}", txn.state(), e);
                    if has_data {
                        txn.inner.ring.stop(&self.hw);
                    }
                    return Err(e);
                }
            };
            txn.process_event(event);
        }
        Ok(())
    }

    /// Throw away whatever the interrupt handler queued between transactions
    fn drain_idle_events(&self, inner: &mut HostInner<N>) {
        while let Some(event) = self.events.try_recv() {
            let only_cd = event.sdmmc_status == IntStatus::CD && event.dma_status.is_empty();
            if !only_cd {
                debug_log!("sdmmc: discarding stale event {:?}", event);
            }
        }

        let dropped = self.events.dropped();
        if dropped != inner.reported_drops {
            debug_log!("sdmmc: {} events lost to a full queue", dropped - inner.reported_drops);
            inner.reported_drops = dropped;
        }
    }
}
