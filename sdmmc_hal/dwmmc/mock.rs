//! Software model of the controller for unit tests.
//!
//! `MockHardware` keeps the register state behind a mutex, answers bus
//! commands with scripted interrupt batches and runs a small IDMAC that walks
//! the real descriptor ring. `TestPlatform` runs on a virtual clock and fires
//! the interrupt handler every time the driver sleeps.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use sdmmc_protocol::sdmmc::mmc_struct::MmcBusWidth;
use sdmmc_protocol::sdmmc::sdmmc_capability::SdmmcHostCapability;
use sdmmc_protocol::sdmmc::SdmmcError;
use sdmmc_protocol::sdmmc_os::Sleep;

use crate::dma::{DescOwner, DmaDescriptor};
use crate::host::{HostConfig, SdmmcHost, SlotInitConfig};
use crate::hw::{
    DelayLine, DelayPhase, DmaStatus, HwCmd, IntStatus, SdmmcHardware, DEFAULT_CAPABILITIES,
    SDMMC_NUM_SLOTS,
};
use crate::platform::{ClockSource, HostPlatform};

const CARD_SIZE: usize = 64 * 1024;
// Descriptors the model IDMAC moves per interrupt
const IDMAC_BURST: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub reset_all: u32,
    pub reset_fifo: u32,
    pub clock_updates: u32,
    /// Bus commands, clock updates excluded
    pub commands: u32,
    pub dma_prepare: u32,
    pub dma_stop: u32,
    pub dma_resume: u32,
    pub response_reads: u32,
}

struct Idmac {
    desc_addr: usize,
    remaining: usize,
    card_pos: usize,
    write: bool,
    active: bool,
    stalled: bool,
}

struct MockState {
    caps: SdmmcHostCapability,
    counters: Counters,
    writes: u32,
    reset_stuck: bool,

    clock_div: u32,
    card_div: [u32; SDMMC_NUM_SLOTS],
    clk_enabled: [bool; SDMMC_NUM_SLOTS],
    low_power: [bool; SDMMC_NUM_SLOTS],
    width: [MmcBusWidth; SDMMC_NUM_SLOTS],
    ddr: [bool; SDMMC_NUM_SLOTS],
    v18: [bool; SDMMC_NUM_SLOTS],
    delay_phase: DelayPhase,
    delay_line: DelayLine,

    card_present: [bool; SDMMC_NUM_SLOTS],
    write_protected: [bool; SDMMC_NUM_SLOTS],
    busy_polls: u32,

    raw: IntStatus,
    enabled: IntStatus,
    global: bool,
    dma: DmaStatus,

    cmd_arg: u32,
    last_cmd: HwCmd,
    response: [u32; 4],
    script: VecDeque<(IntStatus, DmaStatus)>,
    hle_inject: u32,
    rto_opcodes: Vec<u8>,
    data_error: Option<IntStatus>,
    silent: bool,

    idmac: Option<Idmac>,
    descriptors_consumed: usize,
    card: Vec<u8>,
}

pub struct MockHardware {
    state: Mutex<MockState>,
}

impl MockHardware {
    pub fn new() -> Self {
        MockHardware {
            state: Mutex::new(MockState {
                caps: DEFAULT_CAPABILITIES,
                counters: Counters::default(),
                writes: 0,
                reset_stuck: false,
                clock_div: 0,
                card_div: [0; SDMMC_NUM_SLOTS],
                clk_enabled: [false; SDMMC_NUM_SLOTS],
                low_power: [false; SDMMC_NUM_SLOTS],
                width: [MmcBusWidth::Width1; SDMMC_NUM_SLOTS],
                ddr: [false; SDMMC_NUM_SLOTS],
                v18: [false; SDMMC_NUM_SLOTS],
                delay_phase: DelayPhase::Phase0,
                delay_line: DelayLine::Line0,
                card_present: [true; SDMMC_NUM_SLOTS],
                write_protected: [false; SDMMC_NUM_SLOTS],
                busy_polls: 0,
                raw: IntStatus::empty(),
                enabled: IntStatus::empty(),
                global: false,
                dma: DmaStatus::empty(),
                cmd_arg: 0,
                last_cmd: HwCmd::default(),
                response: [0x0000_0900, 0, 0, 0],
                script: VecDeque::new(),
                hle_inject: 0,
                rto_opcodes: Vec::new(),
                data_error: None,
                silent: false,
                idmac: None,
                descriptors_consumed: 0,
                card: (0..CARD_SIZE).map(MockHardware::pattern).collect(),
            }),
        }
    }

    /// Byte the card holds at `offset` before anything is written
    pub fn pattern(offset: usize) -> u8 {
        (offset % 251) as u8
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    // Every register write goes through here
    fn write(&self) -> MutexGuard<'_, MockState> {
        let mut state = self.state();
        state.writes += 1;
        state
    }

    pub fn counters(&self) -> Counters {
        self.state().counters
    }

    pub fn write_count(&self) -> u32 {
        self.state().writes
    }

    pub fn set_capabilities(&self, caps: SdmmcHostCapability) {
        self.state().caps = caps;
    }

    pub fn set_reset_stuck(&self, stuck: bool) {
        self.state().reset_stuck = stuck;
    }

    pub fn set_card_present(&self, slot: usize, present: bool) {
        self.state().card_present[slot] = present;
    }

    pub fn set_write_protected(&self, slot: usize, protected: bool) {
        self.state().write_protected[slot] = protected;
    }

    /// Report the card busy for the next `polls` reads of the busy line
    pub fn set_busy_polls(&self, polls: u32) {
        self.state().busy_polls = polls;
    }

    pub fn set_response(&self, response: [u32; 4]) {
        self.state().response = response;
    }

    /// Answer `opcode` with a response timeout
    pub fn respond_with_timeout(&self, opcode: u8) {
        self.state().rto_opcodes.push(opcode);
    }

    /// Raise HLE on the next `count` clock updates
    pub fn inject_hle(&self, count: u32) {
        self.state().hle_inject = count;
    }

    /// Fail the data phase of the next data command with `bits`
    pub fn inject_data_error(&self, bits: IntStatus) {
        self.state().data_error = Some(bits);
    }

    /// Accept commands but never raise an interrupt for them
    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    pub fn push_batch(&self, sdmmc_status: IntStatus, dma_status: DmaStatus) {
        self.state().script.push_back((sdmmc_status, dma_status));
    }

    pub fn interrupt_enabled(&self) -> IntStatus {
        self.state().enabled
    }

    pub fn global_interrupt_enabled(&self) -> bool {
        self.state().global
    }

    pub fn card_width(&self, slot: usize) -> MmcBusWidth {
        self.state().width[slot]
    }

    pub fn card_clock_enabled(&self, slot: usize) -> bool {
        self.state().clk_enabled[slot]
    }

    pub fn card_clock_low_power(&self, slot: usize) -> bool {
        self.state().low_power[slot]
    }

    pub fn ddr_enabled(&self, slot: usize) -> bool {
        self.state().ddr[slot]
    }

    pub fn delays(&self) -> (DelayPhase, DelayLine) {
        let state = self.state();
        (state.delay_phase, state.delay_line)
    }

    pub fn is_1v8(&self, slot: usize) -> bool {
        self.state().v18[slot]
    }

    pub fn last_command(&self) -> HwCmd {
        self.state().last_cmd
    }

    pub fn last_command_arg(&self) -> u32 {
        self.state().cmd_arg
    }

    pub fn descriptors_consumed(&self) -> usize {
        self.state().descriptors_consumed
    }

    pub fn card_contents(&self, offset: usize, len: usize) -> Vec<u8> {
        self.state().card[offset..offset + len].to_vec()
    }

    /// Let the hardware make progress: deliver the next scripted batch, or
    /// move data through the IDMAC if nothing is scripted.
    pub fn fire_next(&self) {
        let mut state = self.state();
        if let Some((ints, dma)) = state.script.pop_front() {
            state.raw |= ints;
            state.dma |= dma;
            return;
        }
        Self::run_idmac(&mut state);
    }

    fn run_idmac(state: &mut MockState) {
        let Some(mut idmac) = state.idmac.take() else {
            return;
        };
        if !idmac.active || idmac.stalled {
            state.idmac = Some(idmac);
            return;
        }

        let mut moved = 0;
        let mut completion_irq = false;
        let mut finished = false;
        while moved < IDMAC_BURST {
            // SAFETY: the driver keeps the ring alive while the IDMAC runs, as
            // it would for the real engine
            let desc = unsafe { &*(idmac.desc_addr as *const DmaDescriptor) };
            if desc.owner() != DescOwner::Dma {
                idmac.stalled = true;
                state.dma |= DmaStatus::DU | DmaStatus::AI;
                break;
            }

            let (buf, len) = desc.buffer();
            let n = len.min(idmac.remaining);
            let card = &mut state.card[idmac.card_pos..idmac.card_pos + n];
            // SAFETY: the descriptor points into the caller's request buffer,
            // which outlives the transaction
            unsafe {
                if idmac.write {
                    core::ptr::copy_nonoverlapping(buf as *const u8, card.as_mut_ptr(), n);
                } else {
                    core::ptr::copy_nonoverlapping(card.as_ptr(), buf as *mut u8, n);
                }
            }
            idmac.card_pos += n;
            idmac.remaining -= n;

            let last = desc.is_last();
            completion_irq |= desc.interrupts_on_completion();
            idmac.desc_addr = desc.next_addr();
            desc.release();
            state.descriptors_consumed += 1;
            moved += 1;

            if last || idmac.remaining == 0 {
                finished = true;
                break;
            }
        }

        if completion_irq {
            let done = if idmac.write { DmaStatus::TI } else { DmaStatus::RI };
            state.dma |= done | DmaStatus::NI;
        }
        if finished {
            idmac.active = false;
            state.script.push_back((IntStatus::DATA_OVER, DmaStatus::empty()));
        }
        state.idmac = Some(idmac);
    }
}

impl Default for MockHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl SdmmcHardware for MockHardware {
    fn capabilities(&self) -> SdmmcHostCapability {
        self.state().caps
    }

    fn reset_all(&self) {
        self.write().counters.reset_all += 1;
    }

    fn is_reset_done(&self) -> bool {
        !self.state().reset_stuck
    }

    fn reset_fifo(&self) {
        self.write().counters.reset_fifo += 1;
    }

    fn set_clock_div(&self, div: u32) {
        self.write().clock_div = div;
    }

    fn clock_div(&self) -> u32 {
        self.state().clock_div
    }

    fn set_card_clock_div(&self, slot: usize, card_div: u32) {
        self.write().card_div[slot] = card_div;
    }

    fn card_clock_div(&self, slot: usize) -> u32 {
        self.state().card_div[slot]
    }

    fn enable_card_clock(&self, slot: usize, enable: bool) {
        self.write().clk_enabled[slot] = enable;
    }

    fn enable_card_clock_low_power(&self, slot: usize, enable: bool) {
        self.write().low_power[slot] = enable;
    }

    fn set_data_timeout(&self, _cycles: u32) {
        self.write();
    }

    fn set_response_timeout(&self, _cycles: u8) {
        self.write();
    }

    fn set_delay_phase(&self, phase: DelayPhase) {
        self.write().delay_phase = phase;
    }

    fn set_delay_line(&self, line: DelayLine) {
        self.write().delay_line = line;
    }

    fn set_card_width(&self, slot: usize, width: MmcBusWidth) {
        self.write().width[slot] = width;
    }

    fn enable_ddr_mode(&self, slot: usize, enable: bool) {
        self.write().ddr[slot] = enable;
    }

    fn enable_1v8_mode(&self, slot: usize, enable: bool) {
        self.write().v18[slot] = enable;
    }

    fn is_card_detected(&self, slot: usize) -> bool {
        self.state().card_present[slot]
    }

    fn is_write_protected(&self, slot: usize) -> bool {
        self.state().write_protected[slot]
    }

    fn is_card_busy(&self) -> bool {
        let mut state = self.state();
        match state.busy_polls {
            0 => false,
            u32::MAX => true,
            _ => {
                state.busy_polls -= 1;
                true
            }
        }
    }

    fn is_command_taken(&self) -> bool {
        true
    }

    fn set_command_arg(&self, arg: u32) {
        self.write().cmd_arg = arg;
    }

    fn set_command(&self, cmd: HwCmd) {
        let mut state = self.write();
        if !cmd.start_command {
            return;
        }

        if cmd.update_clk_reg {
            state.counters.clock_updates += 1;
            if state.hle_inject > 0 {
                state.hle_inject -= 1;
                state.raw |= IntStatus::HLE;
            }
            return;
        }

        state.counters.commands += 1;
        state.last_cmd = cmd;
        state.script.clear();
        if state.silent {
            return;
        }

        if state.rto_opcodes.contains(&cmd.cmd_index) {
            state.script.push_back((IntStatus::RTO | IntStatus::CMD_DONE, DmaStatus::empty()));
            return;
        }
        if cmd.volt_switch {
            state.script.push_back((IntStatus::CMD_DONE | IntStatus::VOLT_SW, DmaStatus::empty()));
            state.script.push_back((IntStatus::VOLT_SW, DmaStatus::empty()));
            return;
        }

        state.script.push_back((IntStatus::CMD_DONE, DmaStatus::empty()));
        if !cmd.data_expected {
            return;
        }
        if let Some(bits) = state.data_error.take() {
            state.script.push_back((bits, DmaStatus::empty()));
            state.script.push_back((IntStatus::DATA_OVER, DmaStatus::empty()));
            if let Some(idmac) = state.idmac.as_mut() {
                idmac.active = false;
            }
            return;
        }
        if let Some(idmac) = state.idmac.as_mut() {
            idmac.write = cmd.rw;
            idmac.active = true;
        }
    }

    fn response(&self) -> [u32; 4] {
        let mut state = self.state();
        state.counters.response_reads += 1;
        state.response
    }

    fn raw_interrupt_status(&self) -> IntStatus {
        self.state().raw
    }

    fn masked_interrupt_status(&self) -> IntStatus {
        let state = self.state();
        if state.global {
            state.raw & state.enabled
        } else {
            IntStatus::empty()
        }
    }

    fn clear_interrupt(&self, mask: IntStatus) {
        self.write().raw.remove(mask);
    }

    fn enable_interrupt(&self, mask: IntStatus, enable: bool) {
        self.write().enabled.set(mask, enable);
    }

    fn enable_global_interrupt(&self, enable: bool) {
        self.write().global = enable;
    }

    fn dma_status(&self) -> DmaStatus {
        self.state().dma
    }

    fn clear_dma_status(&self, mask: DmaStatus) {
        self.write().dma.remove(mask);
    }

    fn init_dma(&self, _burst_len: u8) {
        self.write();
    }

    fn dma_prepare(&self, desc_addr: usize, _block_size: u32, data_size: u32) {
        let mut state = self.write();
        state.counters.dma_prepare += 1;
        state.idmac = Some(Idmac {
            desc_addr,
            remaining: data_size as usize,
            card_pos: 0,
            write: false,
            // Starts moving once the data command is on the bus
            active: false,
            stalled: false,
        });
    }

    fn dma_stop(&self) {
        let mut state = self.write();
        state.counters.dma_stop += 1;
        state.idmac = None;
    }

    fn dma_resume(&self) {
        let mut state = self.write();
        state.counters.dma_resume += 1;
        if let Some(idmac) = state.idmac.as_mut() {
            idmac.stalled = false;
        }
    }
}

type IsrHook = Arc<dyn Fn() + Send + Sync>;

/// Platform on a virtual clock.
///
/// Sleeping advances time and runs the installed interrupt hook; every read
/// of the clock advances it by a microsecond so spin loops terminate.
pub struct TestPlatform {
    now: AtomicU64,
    isr: Mutex<Option<IsrHook>>,
    fail_slot_io: AtomicBool,
    d1_level: Mutex<Option<bool>>,
    d1_routed: Mutex<Option<usize>>,
    pm_active: AtomicU32,
    pm_max_active: AtomicU32,
}

impl TestPlatform {
    pub fn new() -> Self {
        TestPlatform {
            now: AtomicU64::new(0),
            isr: Mutex::new(None),
            fail_slot_io: AtomicBool::new(false),
            d1_level: Mutex::new(None),
            d1_routed: Mutex::new(None),
            pm_active: AtomicU32::new(0),
            pm_max_active: AtomicU32::new(0),
        }
    }

    pub fn set_isr(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.isr.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn fail_slot_io(&self, fail: bool) {
        self.fail_slot_io.store(fail, Ordering::Relaxed);
    }

    pub fn set_d1_level(&self, high: bool) {
        *self.d1_level.lock().unwrap() = Some(high);
    }

    pub fn d1_routed(&self) -> Option<usize> {
        *self.d1_routed.lock().unwrap()
    }

    pub fn pm_active(&self) -> u32 {
        self.pm_active.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping power locks seen
    pub fn pm_max_active(&self) -> u32 {
        self.pm_max_active.load(Ordering::SeqCst)
    }
}

impl Default for TestPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Sleep for TestPlatform {
    fn usleep(&self, time_us: u32) {
        self.now.fetch_add(time_us as u64, Ordering::SeqCst);
        let hook = self.isr.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
        thread::yield_now();
    }

    fn now_us(&self) -> u64 {
        self.now.fetch_add(1, Ordering::SeqCst)
    }
}

impl HostPlatform for TestPlatform {
    fn source_clock_hz(&self, src: ClockSource) -> Result<u32, SdmmcError> {
        Ok(src.expected_hz())
    }

    fn configure_slot_io(&self, _slot: usize, _config: &SlotInitConfig) -> Result<(), SdmmcError> {
        if self.fail_slot_io.load(Ordering::Relaxed) {
            return Err(SdmmcError::EIO);
        }
        Ok(())
    }

    fn route_d1_to_host(&self, slot: usize) -> Result<(), SdmmcError> {
        *self.d1_routed.lock().unwrap() = Some(slot);
        Ok(())
    }

    fn d1_level(&self, _slot: usize) -> Result<bool, SdmmcError> {
        self.d1_level
            .lock()
            .unwrap()
            .ok_or(SdmmcError::ENOTIMPLEMENTED)
    }

    fn pm_lock_acquire(&self) {
        let active = self.pm_active.fetch_add(1, Ordering::SeqCst) + 1;
        self.pm_max_active.fetch_max(active, Ordering::SeqCst);
    }

    fn pm_lock_release(&self) {
        self.pm_active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub type TestHost = SdmmcHost<MockHardware, TestPlatform>;

/// Host whose interrupt handler runs whenever the driver sleeps
pub fn test_host() -> Arc<TestHost> {
    let host = Arc::new(
        SdmmcHost::new(MockHardware::new(), TestPlatform::new(), HostConfig::default()).unwrap(),
    );
    let weak = Arc::downgrade(&host);
    host.platform().set_isr(move || {
        if let Some(host) = weak.upgrade() {
            host.hw().fire_next();
            host.handle_interrupt();
        }
    });
    host
}
