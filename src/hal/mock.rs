//! Mock implementations for testing without hardware.
//!
//! This module provides test doubles for all hardware traits, so the whole
//! track engine can be driven step by step on a desktop.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockChannel`] | [`OutputChannel`] | Two-deep transmit queue, records sent frames |
//! | [`MockAlarm`] | [`AlarmTimer`] | Manually advanced clock walking the alarm chain |
//! | [`MockPins`] | [`TrackPins`] | Line levels and write counts |
//! | [`MockDelay`] | [`DelayNs`] | Accumulates requested delay |
//!
//! Each mock can be told to fail a number of times to exercise the init
//! rollback and retry paths.
//!
//! # Example
//!
//! ```rust
//! use dcc_track::hal::{MockAlarm, MockChannel, MockDelay, MockPins};
//! use dcc_track::{TrackConfig, TrackController, TrackState};
//!
//! let mut track: TrackController<_, _, _, _, 8> = TrackController::new(
//!     MockChannel::new(),
//!     MockAlarm::new(),
//!     MockPins::new(),
//!     MockDelay::new(),
//! );
//! track.init(TrackConfig::default(), Default::default()).unwrap();
//! assert_eq!(track.state(), TrackState::Running);
//!
//! // The idle packet is on the rails straight away
//! assert_eq!(track.channel().queued.len(), 2);
//! ```
//!
//! [`OutputChannel`]: crate::traits::OutputChannel
//! [`AlarmTimer`]: crate::traits::AlarmTimer
//! [`TrackPins`]: crate::traits::TrackPins
//! [`DelayNs`]: embedded_hal::delay::DelayNs

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::cell::Cell;

use embedded_hal::delay::DelayNs;

use crate::cutout::{AlarmChain, StepFired};
use crate::encoder::SymbolBuffer;
use crate::traits::{AlarmTimer, IsrCallback, LineHandle, OutputChannel, TrackPins};

/// Depth of the mock's hardware transmit queue.
pub const MOCK_QUEUE_DEPTH: usize = 2;

/// Mock output channel.
///
/// `transmit` appends to [`queued`](Self::queued); [`complete`](Self::complete)
/// plays the role of the hardware finishing the oldest buffer.
/// [`complete_at`](Self::complete_at) also records the finishing time, the
/// way a done interrupt stamps it.
///
/// # Example
///
/// ```rust
/// use dcc_track::hal::MockChannel;
/// use dcc_track::traits::OutputChannel;
/// use dcc_track::{EncoderConfig, Packet, PacketEncoder};
///
/// let encoder = PacketEncoder::new(&EncoderConfig::default()).unwrap();
/// let idle = encoder.encode(&Packet::idle()).unwrap();
///
/// let mut channel = MockChannel::new();
/// channel.enable(None).unwrap();
/// channel.transmit(&idle).unwrap();
/// channel.transmit(&idle).unwrap();
/// assert!(channel.transmit(&idle).is_err()); // two deep
///
/// assert_eq!(channel.complete(), Some(idle));
/// assert_eq!(channel.sent.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MockChannel {
    /// True between `enable` and `disable`.
    pub enabled: bool,
    /// Buffers accepted by the hardware, oldest first.
    pub queued: VecDeque<SymbolBuffer>,
    /// Buffers that finished transmitting, in order.
    pub sent: Vec<SymbolBuffer>,
    /// Number of upcoming `enable` calls that fail.
    pub fail_enable: u8,
    /// Fail every `transmit` while set.
    pub fail_transmit: bool,
    /// Number of `enable` calls, failed ones included.
    pub enable_calls: usize,
    /// Number of `disable` calls.
    pub disable_calls: usize,
    /// Completion times not yet taken, oldest first.
    pub done_at: VecDeque<u64>,
    on_done: Option<IsrCallback>,
}

impl MockChannel {
    /// Creates an idle, disabled channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` enable calls fail.
    pub fn failing_enable(mut self, count: u8) -> Self {
        self.fail_enable = count;
        self
    }

    /// Finishes the oldest queued buffer and fires the done callback.
    pub fn complete(&mut self) -> Option<SymbolBuffer> {
        let done = self.queued.pop_front()?;
        self.sent.push(done.clone());
        if let Some(callback) = self.on_done {
            callback();
        }
        Some(done)
    }

    /// Like [`complete`](Self::complete), stamping the finish at `at_us`.
    pub fn complete_at(&mut self, at_us: u64) -> Option<SymbolBuffer> {
        if self.queued.is_empty() {
            return None;
        }
        self.done_at.push_back(at_us);
        self.complete()
    }

    /// Most recently finished buffer.
    pub fn last_sent(&self) -> Option<&SymbolBuffer> {
        self.sent.last()
    }
}

impl OutputChannel for MockChannel {
    type Error = ();

    fn enable(&mut self, on_done: Option<IsrCallback>) -> Result<(), ()> {
        self.enable_calls += 1;
        if self.fail_enable > 0 {
            self.fail_enable -= 1;
            return Err(());
        }
        self.enabled = true;
        self.on_done = on_done;
        self.done_at.clear();
        Ok(())
    }

    fn disable(&mut self) -> Result<(), ()> {
        self.disable_calls += 1;
        self.enabled = false;
        self.on_done = None;
        Ok(())
    }

    fn transmit(&mut self, symbols: &SymbolBuffer) -> Result<(), ()> {
        if !self.enabled || self.fail_transmit || self.queued.len() >= MOCK_QUEUE_DEPTH {
            return Err(());
        }
        self.queued.push_back(symbols.clone());
        Ok(())
    }

    fn wait_all_done(&mut self, _timeout_us: u32) -> Result<(), ()> {
        // Drains without firing callbacks, like a blocking wait in task context
        while let Some(done) = self.queued.pop_front() {
            self.sent.push(done);
        }
        Ok(())
    }

    fn take_done_us(&mut self) -> Option<u64> {
        self.done_at.pop_front()
    }
}

/// Mock alarm timer.
///
/// Time only moves when [`advance`](Self::advance) or
/// [`advance_to`](Self::advance_to) is called. Each chain step that falls due
/// is handled exactly at its deadline, as the interrupt would: the line is
/// switched, the following deadline programmed and the callback called.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use dcc_track::cutout::{AlarmChain, AlarmStep, LineAction};
/// use dcc_track::hal::{MockAlarm, MockPins};
/// use dcc_track::traits::AlarmTimer;
/// use dcc_track::GpioDriver;
///
/// let mut alarm = MockAlarm::new();
/// alarm.start(None, Arc::new(GpioDriver::new(MockPins::new()))).unwrap();
/// alarm
///     .schedule(AlarmChain::new(&[AlarmStep::new(100, LineAction::Hold)]))
///     .unwrap();
///
/// alarm.advance(99);
/// assert!(alarm.take_fired().is_none());
/// alarm.advance(1);
/// assert!(alarm.take_fired().is_some());
/// assert_eq!(alarm.deadline, None);
/// ```
#[derive(Default)]
pub struct MockAlarm {
    /// Current counter value in microseconds.
    pub now: u64,
    /// True between `start` and `stop`.
    pub running: bool,
    /// Deadline programmed into the hardware.
    pub deadline: Option<u64>,
    /// Every deadline ever programmed, by `schedule` or the interrupt.
    pub scheduled: Vec<u64>,
    /// Number of upcoming `start` calls that fail.
    pub fail_start: u8,
    /// Programming the following deadline from the interrupt fails while set.
    pub fail_rearm: bool,
    /// Delay between a deadline and its interrupt running.
    pub isr_latency_us: u64,
    chain: AlarmChain,
    fired: VecDeque<StepFired>,
    line: Option<LineHandle>,
    on_alarm: Option<IsrCallback>,
}

impl MockAlarm {
    /// Creates a stopped timer at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` start calls fail.
    pub fn failing_start(mut self, count: u8) -> Self {
        self.fail_start = count;
        self
    }

    /// Moves time forward by `us`.
    pub fn advance(&mut self, us: u64) {
        self.advance_to(self.now + us);
    }

    /// Moves time forward to `at_us`, running every step that falls due.
    pub fn advance_to(&mut self, at_us: u64) {
        let target = self.now.max(at_us);
        while self.running {
            let Some(due) = self
                .deadline
                .map(|deadline| deadline + self.isr_latency_us)
                .filter(|due| *due <= target)
            else {
                break;
            };
            let Some(line) = self.line.clone() else {
                break;
            };
            self.now = self.now.max(due);

            let fail_rearm = self.fail_rearm;
            let deadline = &mut self.deadline;
            let scheduled = &mut self.scheduled;
            *deadline = None;
            let fired = self.chain.fire(self.now, &*line, |at| {
                if fail_rearm {
                    return Err(());
                }
                *deadline = Some(at);
                scheduled.push(at);
                Ok(())
            });
            if let Some(fired) = fired {
                self.fired.push_back(fired);
            }
            if let Some(callback) = self.on_alarm {
                callback();
            }
        }
        self.now = target;
    }
}

impl AlarmTimer for MockAlarm {
    type Error = ();

    fn start(&mut self, on_alarm: Option<IsrCallback>, line: LineHandle) -> Result<(), ()> {
        if self.fail_start > 0 {
            self.fail_start -= 1;
            return Err(());
        }
        self.running = true;
        self.on_alarm = on_alarm;
        self.line = Some(line);
        self.chain.clear();
        self.fired.clear();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ()> {
        self.running = false;
        self.deadline = None;
        self.chain.clear();
        self.on_alarm = None;
        self.line = None;
        Ok(())
    }

    fn now_us(&self) -> u64 {
        self.now
    }

    fn schedule(&mut self, chain: AlarmChain) -> Result<(), ()> {
        if !self.running {
            return Err(());
        }
        let first = chain.next_deadline();
        self.chain = chain;
        self.deadline = first;
        if let Some(at) = first {
            self.scheduled.push(at);
        }
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), ()> {
        self.chain.clear();
        self.deadline = None;
        Ok(())
    }

    fn pending(&self) -> bool {
        self.chain.is_pending()
    }

    fn take_fired(&mut self) -> Option<StepFired> {
        self.fired.pop_front()
    }
}

/// Mock booster control lines.
///
/// State sits in [`Cell`]s because every [`TrackPins`] method takes `&self`.
///
/// # Example
///
/// ```rust
/// use dcc_track::hal::MockPins;
/// use dcc_track::traits::TrackPins;
///
/// let pins = MockPins::new();
/// pins.set_cutout(true);
/// assert!(pins.cutout.get());
/// assert_eq!(pins.writes.get(), 1);
/// assert_eq!(pins.cutout_edges.get(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MockPins {
    /// Booster enable level.
    pub enable: Cell<bool>,
    /// Force-low level.
    pub force_low: Cell<bool>,
    /// Cutout line level.
    pub cutout: Cell<bool>,
    /// Total level writes.
    pub writes: Cell<u32>,
    /// Cutout line level changes.
    pub cutout_edges: Cell<u32>,
    /// True between `configure` and `release`.
    pub configured: Cell<bool>,
    /// Number of upcoming `configure` calls that fail.
    pub fail_configure: Cell<u8>,
}

impl MockPins {
    /// Creates unconfigured pins, all lines low.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` configure calls fail.
    pub fn failing_configure(self, count: u8) -> Self {
        self.fail_configure.set(count);
        self
    }

    fn write(&self, line: &Cell<bool>, on: bool) {
        line.set(on);
        self.writes.set(self.writes.get() + 1);
    }
}

impl TrackPins for MockPins {
    type Error = ();

    fn configure(&self) -> Result<(), ()> {
        let failures = self.fail_configure.get();
        if failures > 0 {
            self.fail_configure.set(failures - 1);
            return Err(());
        }
        self.configured.set(true);
        Ok(())
    }

    fn release(&self) -> Result<(), ()> {
        self.configured.set(false);
        Ok(())
    }

    fn set_enable(&self, on: bool) {
        self.write(&self.enable, on);
    }

    fn set_force_low(&self, on: bool) {
        self.write(&self.force_low, on);
    }

    fn set_cutout(&self, on: bool) {
        if self.cutout.get() != on {
            self.cutout_edges.set(self.cutout_edges.get() + 1);
        }
        self.write(&self.cutout, on);
    }
}

/// Mock delay that only records how long it was asked to wait.
#[derive(Debug, Default)]
pub struct MockDelay {
    /// Sum of all requested delays in nanoseconds.
    pub total_ns: u64,
    /// Number of delay calls.
    pub calls: usize,
}

impl MockDelay {
    /// Creates a delay with nothing recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total requested delay in milliseconds.
    pub fn total_ms(&self) -> u64 {
        self.total_ns / 1_000_000
    }
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns += u64::from(ns);
        self.calls += 1;
    }
}

// ============================================================================
// Tests
// ============================================================================
