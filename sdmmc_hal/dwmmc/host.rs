//! Controller object and slot registry.
//!
//! One [`SdmmcHost`] owns the register block and drives up to
//! [`SDMMC_NUM_SLOTS`] card slots. Slot settings are stored by
//! [`SdmmcHost::configure`] and reach the hardware at the start of the next
//! transaction on that slot.

use core::sync::atomic::{AtomicUsize, Ordering};

use sdmmc_protocol::sdmmc::mmc_struct::{MmcBusWidth, MmcSamplingMode};
use sdmmc_protocol::sdmmc::sdmmc_capability::SdmmcHostCapability;
use sdmmc_protocol::sdmmc::sdmmc_constant::{SDMMC_FREQ_HIGHSPEED, SDMMC_FREQ_PROBING, SDMMC_FREQ_SDR104};
use sdmmc_protocol::sdmmc::SdmmcError;
use sdmmc_protocol::sdmmc_os::{poll_until, Backoff};
use sdmmc_protocol::{debug_log, error_log};
use spin::{Mutex, RwLock};

use crate::clock::{calc_dividers, select_clock_source};
use crate::dma::{DmaRing, DMA_DESC_CNT};
use crate::event::EventChannel;
use crate::hw::{DelayLine, DelayPhase, IntStatus, SdmmcHardware, SDMMC_NUM_SLOTS};
use crate::platform::{ClockSource, HostPlatform};

pub const RESET_TIMEOUT_US: u64 = 5_000_000;

// `irq_slot` before any transaction ran
const NO_SLOT: usize = usize::MAX;

// Host divider programmed at creation, before any slot picks its own
const DEFAULT_HOST_DIV: u32 = 2;

/// Controller wide settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    /// Interrupt priority, kept for the platform that installs the handler
    pub intr_priority: u8,
    /// IDMAC programmable burst length field, 0 is a single transfer
    pub dma_burst: u8,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            intr_priority: 1,
            dma_burst: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SdMode {
    #[default]
    Normal,
    /// UHS-I signalling, needed for the 1.8 V switch and speeds above 50 MHz
    Uhs1,
}

/// How a slot is wired on the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInitConfig {
    pub slot_id: usize,
    /// Data lines routed to the card, the slot maximum when `None`
    pub width: Option<MmcBusWidth>,
    pub sd_mode: SdMode,
    pub wp_active_high: bool,
    pub internal_pullup: bool,
}

impl SlotInitConfig {
    pub fn new(slot_id: usize) -> Self {
        SlotInitConfig {
            slot_id,
            width: None,
            sd_mode: SdMode::Normal,
            wp_active_high: false,
            internal_pullup: false,
        }
    }
}

/// Partial update of the bus settings of a slot, `None` keeps the current value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotConfig {
    pub width: Option<MmcBusWidth>,
    pub freq_hz: Option<u32>,
    pub sampling_mode: Option<MmcSamplingMode>,
    pub delay_phase: Option<DelayPhase>,
    pub delay_line: Option<DelayLine>,
}

/// Hooks [`SdmmcHost::handle_interrupt`] calls with the slot number.
///
/// Both run in interrupt context. Returning `true` asks the interrupt entry
/// to yield to a woken task on the way out.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotCallbacks {
    /// The handler queued an event for the transaction on this slot
    pub on_trans_done: Option<fn(usize) -> bool>,
    /// The card raised an SDIO interrupt
    pub on_io_interrupt: Option<fn(usize) -> bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    /// Card clock the programmed dividers produce
    pub freq_hz: u32,
    pub width: MmcBusWidth,
    pub sd_mode: SdMode,
    pub sampling_mode: MmcSamplingMode,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Slot {
    pub(crate) init: SlotInitConfig,
    max_width: MmcBusWidth,
    pub(crate) width: MmcBusWidth,
    pub(crate) freq_khz: u32,
    pub(crate) sampling_mode: MmcSamplingMode,
    pub(crate) delay_phase: DelayPhase,
    pub(crate) delay_line: DelayLine,
    real_freq_hz: u32,
    applied_freq_khz: Option<u32>,
    // Bumped by every configure, compared against what was last written
    generation: u32,
    applied_generation: u32,
}

impl Slot {
    fn new(init: SlotInitConfig, max_width: MmcBusWidth) -> Self {
        Slot {
            init,
            max_width,
            width: MmcBusWidth::Width1,
            freq_khz: SDMMC_FREQ_PROBING,
            sampling_mode: MmcSamplingMode::Sdr,
            delay_phase: DelayPhase::Phase0,
            delay_line: DelayLine::Line0,
            real_freq_hz: 0,
            applied_freq_khz: None,
            generation: 0,
            applied_generation: 0,
        }
    }

    fn is_dirty(&self) -> bool {
        self.generation != self.applied_generation
    }
}

/// Widest bus each slot is wired for
fn slot_max_width(slot: usize) -> MmcBusWidth {
    if slot == 0 {
        MmcBusWidth::Width8
    } else {
        MmcBusWidth::Width4
    }
}

fn width_supported(caps: SdmmcHostCapability, width: MmcBusWidth) -> bool {
    match width {
        MmcBusWidth::Width1 => true,
        MmcBusWidth::Width4 => caps.contains(SdmmcHostCapability::MMC_CAP_4_BIT_DATA),
        MmcBusWidth::Width8 => caps.contains(SdmmcHostCapability::MMC_CAP_8_BIT_DATA),
    }
}

/// State owned by whoever holds the transaction lock
pub(crate) struct HostInner<const N: usize> {
    pub(crate) ring: DmaRing<N>,
    /// Slot whose settings are currently in the registers
    pub(crate) cur_slot: Option<usize>,
    /// The previous command was APP_CMD
    pub(crate) is_app_cmd: bool,
    /// Dropped event count already reported in the log
    pub(crate) reported_drops: u32,
}

impl<const N: usize> HostInner<N> {
    fn new() -> Self {
        HostInner {
            ring: DmaRing::new(),
            cur_slot: None,
            is_app_cmd: false,
            reported_drops: 0,
        }
    }
}

/// One DesignWare MMC controller and its slots.
///
/// `N` is the number of IDMAC descriptors. Share the host between tasks by
/// reference; transactions and clock changes serialise on an internal lock
/// while [`SdmmcHost::handle_interrupt`] stays lock free.
pub struct SdmmcHost<H: SdmmcHardware, P: HostPlatform, const N: usize = DMA_DESC_CNT> {
    pub(crate) hw: H,
    pub(crate) platform: P,
    pub(crate) events: EventChannel,
    pub(crate) slots: Mutex<[Option<Slot>; SDMMC_NUM_SLOTS]>,
    pub(crate) inner: Mutex<HostInner<N>>,
    pub(crate) callbacks: RwLock<[SlotCallbacks; SDMMC_NUM_SLOTS]>,
    /// Slot of the latest transaction, read by the interrupt handler
    pub(crate) irq_slot: AtomicUsize,
    config: HostConfig,
}

impl<H: SdmmcHardware, P: HostPlatform, const N: usize> SdmmcHost<H, P, N> {
    /// Bring the controller out of reset and leave it ready for slots.
    pub fn new(hw: H, platform: P, config: HostConfig) -> Result<Self, SdmmcError> {
        if N == 0 {
            return Err(SdmmcError::EINVAL);
        }

        let host = SdmmcHost {
            hw,
            platform,
            events: EventChannel::new(),
            slots: Mutex::new([None; SDMMC_NUM_SLOTS]),
            inner: Mutex::new(HostInner::new()),
            callbacks: RwLock::new([SlotCallbacks::default(); SDMMC_NUM_SLOTS]),
            irq_slot: AtomicUsize::new(NO_SLOT),
            config,
        };

        host.set_host_clock_div(ClockSource::Pll160M, DEFAULT_HOST_DIV)?;
        host.reset().inspect_err(|e| {
            error_log!("sdmmc: controller reset failed: {}", e);
        })?;

        host.hw.clear_interrupt(IntStatus::all());
        host.hw.enable_interrupt(IntStatus::all(), false);
        host.hw.enable_global_interrupt(false);
        host.hw.enable_interrupt(IntStatus::EVENT_DEFAULT, true);
        host.hw.enable_global_interrupt(true);
        host.hw.init_dma(host.config.dma_burst);

        debug_log!("sdmmc: controller up with {} DMA descriptors", N);
        Ok(host)
    }

    /// Reset controller, DMA and FIFO and wait for the bits to self clear
    fn reset(&self) -> Result<(), SdmmcError> {
        self.hw.reset_all();
        poll_until(
            &self.platform,
            Some(RESET_TIMEOUT_US),
            Backoff::REGISTER,
            || self.hw.is_reset_done().then_some(()),
        )
    }

    /// Tear the controller down and hand the register block back.
    ///
    /// Fails with `EINVALSTATE` while any slot is registered; the host is
    /// returned untouched in that case.
    pub fn delete(self) -> Result<H, (SdmmcError, Self)> {
        let registered = self.slots.lock().iter().any(Option::is_some);
        if registered {
            error_log!("sdmmc: cannot delete controller with slots registered");
            return Err((SdmmcError::EINVALSTATE, self));
        }

        self.hw.enable_global_interrupt(false);
        self.hw.enable_interrupt(IntStatus::all(), false);
        self.hw.clear_interrupt(IntStatus::all());

        let SdmmcHost { hw, .. } = self;
        Ok(hw)
    }

    pub fn capabilities(&self) -> SdmmcHostCapability {
        self.hw.capabilities()
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    /// Snapshot of a registered slot
    pub(crate) fn slot(&self, slot: usize) -> Result<Slot, SdmmcError> {
        self.slots
            .lock()
            .get(slot)
            .copied()
            .flatten()
            .ok_or(SdmmcError::EINVAL)
    }

    /// Register a slot, route its pins, and start it at 1 bit and 400 kHz.
    pub fn add_slot(&self, config: SlotInitConfig) -> Result<(), SdmmcError> {
        let slot = config.slot_id;
        if slot >= SDMMC_NUM_SLOTS {
            return Err(SdmmcError::EINVAL);
        }

        let max_width = config.width.unwrap_or_else(|| slot_max_width(slot));
        if max_width.lanes() > slot_max_width(slot).lanes()
            || !width_supported(self.capabilities(), max_width)
        {
            return Err(SdmmcError::EINVAL);
        }

        {
            let mut slots = self.slots.lock();
            if slots[slot].is_some() {
                return Err(SdmmcError::EINVALSTATE);
            }
            slots[slot] = Some(Slot::new(config, max_width));
        }

        let setup = self
            .platform
            .configure_slot_io(slot, &config)
            .and_then(|_| self.program_initial_bus(slot));
        if let Err(e) = setup {
            error_log!("sdmmc: failed to set up slot {}: {}", slot, e);
            self.slots.lock()[slot] = None;
            return Err(e);
        }

        debug_log!("sdmmc: slot {} registered, {} data lines", slot, max_width.lanes());
        Ok(())
    }

    fn program_initial_bus(&self, slot: usize) -> Result<(), SdmmcError> {
        let mut inner = self.inner.lock();
        self.hw.set_card_width(slot, MmcBusWidth::Width1);
        let real_freq_hz = self.set_card_clk(slot, SDMMC_FREQ_PROBING)?;
        inner.cur_slot = Some(slot);

        if let Some(state) = self.slots.lock()[slot].as_mut() {
            state.real_freq_hz = real_freq_hz;
            state.applied_freq_khz = Some(SDMMC_FREQ_PROBING);
        }
        Ok(())
    }

    /// Unregister a slot and release its pins
    pub fn remove_slot(&self, slot: usize) -> Result<(), SdmmcError> {
        if slot >= SDMMC_NUM_SLOTS {
            return Err(SdmmcError::EINVAL);
        }
        let removed = self.slots.lock()[slot].take();
        if removed.is_none() {
            return Err(SdmmcError::EINVALSTATE);
        }

        {
            let mut inner = self.inner.lock();
            if inner.cur_slot == Some(slot) {
                inner.cur_slot = None;
            }
        }
        self.callbacks.write()[slot] = SlotCallbacks::default();
        let _ = self
            .irq_slot
            .compare_exchange(slot, NO_SLOT, Ordering::AcqRel, Ordering::Acquire);
        self.platform.release_slot_io(slot);
        debug_log!("sdmmc: slot {} removed", slot);
        Ok(())
    }

    /// Install the interrupt context hooks of a registered slot, replacing
    /// any set before. Removing the slot clears them.
    pub fn register_event_callbacks(&self, slot: usize, callbacks: SlotCallbacks) -> Result<(), SdmmcError> {
        self.slot(slot)?;
        self.callbacks.write()[slot] = callbacks;
        Ok(())
    }

    /// Validate and store new bus settings for `slot`.
    ///
    /// Nothing is written to the controller here; the next transaction on
    /// the slot applies the settings under the transaction lock.
    pub fn configure(&self, slot: usize, config: &SlotConfig) -> Result<(), SdmmcError> {
        let caps = self.capabilities();
        let mut slots = self.slots.lock();
        let current = slots
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or(SdmmcError::EINVAL)?;

        let mut next = *current;
        if let Some(width) = config.width {
            if width.lanes() > next.max_width.lanes() || !width_supported(caps, width) {
                return Err(SdmmcError::EINVAL);
            }
            next.width = width;
        }
        if let Some(freq_hz) = config.freq_hz {
            let freq_khz = freq_hz / 1000;
            calc_dividers(select_clock_source(freq_khz).expected_hz(), freq_khz)?;
            let uhs = SdmmcHostCapability::MMC_TIMING_UHS_SDR50
                | SdmmcHostCapability::MMC_TIMING_UHS_SDR104
                | SdmmcHostCapability::MMC_TIMING_UHS_DDR50;
            if freq_khz > SDMMC_FREQ_HIGHSPEED && !caps.intersects(uhs) {
                return Err(SdmmcError::ENOTSUPPORTED);
            }
            next.freq_khz = freq_khz;
        }
        if let Some(mode) = config.sampling_mode {
            next.sampling_mode = mode;
        }
        if let Some(phase) = config.delay_phase {
            next.delay_phase = phase;
        }
        if let Some(line) = config.delay_line {
            next.delay_line = line;
        }

        if next.sampling_mode == MmcSamplingMode::Ddr {
            if next.width == MmcBusWidth::Width8 {
                debug_log!("sdmmc: DDR with an 8 bit bus is not supported");
                return Err(SdmmcError::ENOTSUPPORTED);
            }
            if !caps.supports_ddr() {
                return Err(SdmmcError::ENOTSUPPORTED);
            }
        }

        next.generation = next.generation.wrapping_add(1);
        *current = next;
        Ok(())
    }

    pub fn get_info(&self, slot: usize) -> Result<SlotInfo, SdmmcError> {
        let state = self.slot(slot)?;
        Ok(SlotInfo {
            freq_hz: state.real_freq_hz,
            width: state.width,
            sd_mode: state.init.sd_mode,
            sampling_mode: state.sampling_mode,
        })
    }

    /// Write stored settings of `slot` to the controller if they changed or
    /// another slot was driven last. Caller holds the transaction lock.
    pub(crate) fn apply_slot_config(&self, inner: &mut HostInner<N>, slot: usize) -> Result<(), SdmmcError> {
        let state = self.slot(slot)?;
        let switched = inner.cur_slot != Some(slot);
        if !switched && !state.is_dirty() {
            return Ok(());
        }

        // The host divider is shared, a slot switch always reprograms it
        let real_freq_hz = if switched || state.applied_freq_khz != Some(state.freq_khz) {
            Some(self.set_card_clk(slot, state.freq_khz)?)
        } else {
            None
        };
        self.hw.set_card_width(slot, state.width);
        self.hw
            .enable_ddr_mode(slot, state.sampling_mode == MmcSamplingMode::Ddr);
        self.hw.set_delay_phase(state.delay_phase);
        if state.freq_khz == SDMMC_FREQ_SDR104 {
            self.hw.set_delay_line(state.delay_line);
        }
        inner.cur_slot = Some(slot);

        if let Some(current) = self.slots.lock()[slot].as_mut() {
            if let Some(real) = real_freq_hz {
                current.real_freq_hz = real;
                current.applied_freq_khz = Some(state.freq_khz);
            }
            current.applied_generation = state.generation;
        }

        debug_log!(
            "sdmmc: slot {} applied {} lines, {:?}, {} kHz",
            slot,
            state.width.lanes(),
            state.sampling_mode,
            state.freq_khz
        );
        Ok(())
    }

    /// Keep the card clock running between commands instead of gating it
    pub fn set_cclk_always_on(&self, slot: usize, always_on: bool) -> Result<(), SdmmcError> {
        self.slot(slot)?;
        let _inner = self.inner.lock();
        self.set_cclk_always_on_locked(slot, always_on)
    }

    pub(crate) fn set_cclk_always_on_locked(&self, slot: usize, always_on: bool) -> Result<(), SdmmcError> {
        self.hw.enable_card_clock_low_power(slot, !always_on);
        self.clock_update_command(slot, false)
    }

    /// Route DAT1 to the controller so card interrupts can be seen
    pub fn enable_io_interrupt(&self, slot: usize) -> Result<(), SdmmcError> {
        self.slot(slot)?;
        self.platform.route_d1_to_host(slot)
    }

    /// Wait for a card interrupt on `slot`, `None` waits forever.
    ///
    /// The interrupt is edge triggered, so a DAT1 line already held low
    /// counts as pending and returns at once.
    pub fn wait_io_interrupt(&self, slot: usize, timeout_ms: Option<u32>) -> Result<(), SdmmcError> {
        self.slot(slot)?;
        let mask = IntStatus::io_slot(slot);
        self.hw.enable_interrupt(mask, false);
        self.hw.clear_interrupt(mask);

        match self.platform.d1_level(slot) {
            Ok(false) => return Ok(()),
            Ok(true) | Err(SdmmcError::ENOTIMPLEMENTED) => {}
            Err(e) => return Err(e),
        }

        // Drop a stale signal, then wait for the next falling edge
        self.events.take_io();
        self.hw.enable_interrupt(mask, true);
        self.events.wait_io(&self.platform, timeout_ms)
    }
}
