//! Hand-off between the interrupt handler and the task running a transaction.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use heapless::mpmc::MpMcQueue;
use sdmmc_protocol::sdmmc::SdmmcError;
use sdmmc_protocol::sdmmc_os::{poll_until, Backoff, Sleep};

use crate::host::SdmmcHost;
use crate::hw::{DmaStatus, IntStatus, SdmmcHardware, SDMMC_NUM_SLOTS};
use crate::platform::HostPlatform;

pub const EVENT_QUEUE_DEPTH: usize = 32;

/// Status bits collected by one run of the interrupt handler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SdmmcEvent {
    pub sdmmc_status: IntStatus,
    pub dma_status: DmaStatus,
}

impl SdmmcEvent {
    pub fn is_empty(&self) -> bool {
        self.sdmmc_status.is_empty() && self.dma_status.is_empty()
    }
}

/// Bounded event queue plus the card interrupt flag.
///
/// Both sides are lock free. When the queue is full the interrupt handler
/// drops the event and bumps `dropped`; it never waits for the consumer.
pub struct EventChannel {
    queue: MpMcQueue<SdmmcEvent, EVENT_QUEUE_DEPTH>,
    dropped: AtomicU32,
    io_pending: AtomicBool,
}

impl EventChannel {
    pub fn new() -> Self {
        EventChannel {
            queue: MpMcQueue::new(),
            dropped: AtomicU32::new(0),
            io_pending: AtomicBool::new(false),
        }
    }

    /// Producer side, callable from interrupt context
    pub fn post(&self, event: SdmmcEvent) -> bool {
        if self.queue.enqueue(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn try_recv(&self) -> Option<SdmmcEvent> {
        self.queue.dequeue()
    }

    /// Wait for the next event, `None` waits forever
    pub fn recv_timeout<S: Sleep + ?Sized>(
        &self,
        sleep: &S,
        timeout_ms: Option<u32>,
    ) -> Result<SdmmcEvent, SdmmcError> {
        let timeout_us = timeout_ms.map(|ms| ms as u64 * 1000);
        poll_until(sleep, timeout_us, Backoff::Tick, || self.try_recv())
    }

    /// Events lost to a full queue since the channel was created
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn raise_io(&self) {
        self.io_pending.store(true, Ordering::Release);
    }

    /// Consume a pending card interrupt
    pub fn take_io(&self) -> bool {
        self.io_pending.swap(false, Ordering::AcqRel)
    }

    pub fn wait_io<S: Sleep + ?Sized>(
        &self,
        sleep: &S,
        timeout_ms: Option<u32>,
    ) -> Result<(), SdmmcError> {
        let timeout_us = timeout_ms.map(|ms| ms as u64 * 1000);
        poll_until(sleep, timeout_us, Backoff::Tick, || self.take_io().then_some(()))
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: SdmmcHardware, P: HostPlatform, const N: usize> SdmmcHost<H, P, N> {
    /// Interrupt handler body.
    ///
    /// Acknowledges the controller and IDMAC status, forwards what the state
    /// machine cares about, and masks card interrupts until a waiter re-arms
    /// them. Registered [`SlotCallbacks`](crate::host::SlotCallbacks) run
    /// from here, and the return value is `true` when one of them asked for
    /// a yield. Never blocks and never touches the transaction lock.
    pub fn handle_interrupt(&self) -> bool {
        let masked = self.hw.masked_interrupt_status();
        let pending = masked & IntStatus::SD_EVENT_MASK;
        self.hw.clear_interrupt(pending);

        let dma_pending = self.hw.dma_status() & DmaStatus::EVENT_MASK;
        self.hw.clear_dma_status(dma_pending);

        // Skipped for this run if a task is replacing the hooks
        let callbacks = self.callbacks.try_read();
        let mut need_yield = false;

        let event = SdmmcEvent {
            sdmmc_status: pending,
            dma_status: dma_pending,
        };
        if !event.is_empty() {
            self.events.post(event);
            let slot = self.irq_slot.load(Ordering::Acquire);
            let hook = callbacks
                .as_ref()
                .and_then(|cbs| cbs.get(slot))
                .and_then(|cbs| cbs.on_trans_done);
            if let Some(hook) = hook {
                need_yield |= hook(slot);
            }
        }

        // Card interrupts are cleared by the waiter, only silence them here
        let sdio_pending = masked & IntStatus::SDIO_MASK;
        if !sdio_pending.is_empty() {
            self.hw.enable_interrupt(sdio_pending, false);
            self.events.raise_io();
            for slot in 0..SDMMC_NUM_SLOTS {
                if !sdio_pending.intersects(IntStatus::io_slot(slot)) {
                    continue;
                }
                if let Some(hook) = callbacks.as_ref().and_then(|cbs| cbs[slot].on_io_interrupt) {
                    need_yield |= hook(slot);
                }
            }
        }
        need_yield
    }

    /// Events lost because the queue was full
    pub fn dropped_events(&self) -> u32 {
        self.events.dropped()
    }
}
