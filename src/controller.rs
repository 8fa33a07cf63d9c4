//! Track controller: the state machine that ties the signal path together.
//!
//! This module provides [`TrackController`], which owns the packet queue, the
//! encoder, the transmitter, the cutout timer and the booster lines, and moves
//! them through their lifecycle:
//!
//! ```text
//! Uninitialized --init--> Running --pause--> Pausing --> Paused
//!                            ^                              |
//!                            +------------resume------------+
//! ```
//!
//! # Execution contexts
//!
//! The edges that must land on the microsecond are produced by the hardware
//! interrupts themselves. The transmit-done interrupt stamps when each frame
//! ended ([`OutputChannel::take_done_us`]); the alarm interrupt switches the
//! cutout line and programs the next deadline of the window's chain. The
//! interrupts then post a notification and nothing else.
//!
//! [`on_tx_done`](TrackController::on_tx_done) and
//! [`on_alarm`](TrackController::on_alarm) run when the notification is
//! handled. They promote the next frame, anchor its cutout window at the
//! stamped start time, collect what the alarm interrupt did, record it in
//! [`TrackSignals`], and return. [`service`](TrackController::service) then
//! refills the free transmit slot from the queue (or with the idle packet)
//! and logs any anomalies the handlers counted. How late the task gets to
//! these calls does not move the cutout, as long as it arms the window
//! before the open deadline.
//!
//! # Example
//!
//! ```rust
//! use dcc_track::hal::{MockAlarm, MockChannel, MockDelay, MockPins};
//! use dcc_track::{Address, Packet, TrackConfig, TrackController, TrackState};
//!
//! let mut track: TrackController<_, _, _, _, 8> = TrackController::new(
//!     MockChannel::new(),
//!     MockAlarm::new(),
//!     MockPins::new(),
//!     MockDelay::new(),
//! );
//! track.init(TrackConfig::default(), Default::default()).unwrap();
//!
//! let packet = Packet::new(Address::short(3).unwrap(), &[0x3F, 0x90]).unwrap();
//! track.enqueue(packet).unwrap();
//!
//! // Hardware finishes a frame; the task refills the free slot
//! track.channel_mut().complete();
//! track.on_tx_done();
//! track.service();
//!
//! assert_eq!(track.queue_len(), 0);
//! assert_eq!(track.stats().frames_sent, 1);
//!
//! track.pause().unwrap();
//! assert_eq!(track.state(), TrackState::Paused);
//! ```

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use embedded_hal::delay::DelayNs;
use heapless::Vec;
use log::{debug, error, info, warn};

use crate::config::TrackConfig;
use crate::cutout::{CutoutPhase, CutoutTimer};
use crate::encoder::PacketEncoder;
use crate::error::{HardwareInitError, InitStage, TrackError};
use crate::gpio::{GpioDriver, LineState};
use crate::packet::Packet;
use crate::queue::{PendingQueue, QueuePolicy};
use crate::traits::{AlarmTimer, IsrCallback, LineHandle, OutputChannel, TrackPins};
use crate::transmitter::{Enqueued, Frame, Rejected, SymbolTransmitter};

/// Acquisition order. Release runs it backwards.
const STAGES: [InitStage; 4] = [
    InitStage::Encoder,
    InitStage::Transmitter,
    InitStage::CutoutTimer,
    InitStage::Gpio,
];

/// Lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TrackState {
    /// `init` has not succeeded yet.
    Uninitialized,
    /// Hardware owned, signal on the rails.
    Running,
    /// Draining the channel and releasing hardware.
    Pausing,
    /// Hardware released; the queue is still there.
    Paused,
}

impl TrackState {
    /// Returns the state as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TrackState::Uninitialized => "uninitialized",
            TrackState::Running => "running",
            TrackState::Pausing => "pausing",
            TrackState::Paused => "paused",
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            TrackState::Uninitialized => 0,
            TrackState::Running => 1,
            TrackState::Pausing => 2,
            TrackState::Paused => 3,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => TrackState::Running,
            2 => TrackState::Pausing,
            3 => TrackState::Paused,
            _ => TrackState::Uninitialized,
        }
    }
}

/// Callbacks handed to the hardware on `init` and `resume`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrackCallbacks {
    /// Invoked by the output channel when a frame has gone out.
    pub on_tx_done: Option<IsrCallback>,
    /// Invoked by the alarm timer when a deadline is reached.
    pub on_alarm: Option<IsrCallback>,
}

// ============================================================================
// Signals
// ============================================================================

/// A frame finished since the last `service`.
pub const EVENT_TX_DONE: u8 = 1 << 0;
/// An alarm fired since the last `service`.
pub const EVENT_ALARM: u8 = 1 << 1;

/// State, event bits and counters shared between the handlers and the task.
///
/// Everything is atomic; the handlers only ever increment or set bits.
#[derive(Debug)]
pub struct TrackSignals {
    state: AtomicU8,
    events: AtomicU8,
    frames_sent: AtomicU32,
    underruns: AtomicU32,
    channel_faults: AtomicU32,
    cutouts: AtomicU32,
    missed_alarms: AtomicU32,
    encoding_errors: AtomicU32,
    max_alarm_latency_us: AtomicU32,
}

impl TrackSignals {
    /// All counters zero, state `Uninitialized`.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(TrackState::Uninitialized.to_u8()),
            events: AtomicU8::new(0),
            frames_sent: AtomicU32::new(0),
            underruns: AtomicU32::new(0),
            channel_faults: AtomicU32::new(0),
            cutouts: AtomicU32::new(0),
            missed_alarms: AtomicU32::new(0),
            encoding_errors: AtomicU32::new(0),
            max_alarm_latency_us: AtomicU32::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TrackState {
        TrackState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sets event bits.
    pub fn raise(&self, events: u8) {
        self.events.fetch_or(events, Ordering::AcqRel);
    }

    /// Returns and clears the event bits.
    pub fn take_events(&self) -> u8 {
        self.events.swap(0, Ordering::AcqRel)
    }

    /// Frames that finished transmitting.
    pub fn frames_sent(&self) -> u32 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Times the idle frame had to be substituted by the transmitter.
    pub fn underruns(&self) -> u32 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Buffers the channel refused.
    pub fn channel_faults(&self) -> u32 {
        self.channel_faults.load(Ordering::Relaxed)
    }

    /// Cutout windows closed on schedule.
    pub fn cutouts(&self) -> u32 {
        self.cutouts.load(Ordering::Relaxed)
    }

    /// Windows that could not be armed, rescheduled or closed in time.
    pub fn missed_alarms(&self) -> u32 {
        self.missed_alarms.load(Ordering::Relaxed)
    }

    /// Queued packets dropped because they failed to encode.
    pub fn encoding_errors(&self) -> u32 {
        self.encoding_errors.load(Ordering::Relaxed)
    }

    /// Worst observed alarm latency.
    pub fn max_alarm_latency_us(&self) -> u32 {
        self.max_alarm_latency_us.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: TrackState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, late_us: u64) {
        let late = u32::try_from(late_us).unwrap_or(u32::MAX);
        self.max_alarm_latency_us.fetch_max(late, Ordering::Relaxed);
    }
}

impl Default for TrackSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the controller for telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackStats {
    /// Lifecycle state
    pub state: TrackState,
    /// Booster line state
    pub line: LineState,
    /// Packets waiting
    pub queued: usize,
    /// Urgent packets waiting
    pub urgent_queued: usize,
    /// Frames that finished transmitting
    pub frames_sent: u32,
    /// Idle substitutions by the transmitter
    pub underruns: u32,
    /// Buffers the channel refused
    pub channel_faults: u32,
    /// Cutout windows completed
    pub cutouts: u32,
    /// Windows armed, rescheduled or closed late
    pub missed_alarms: u32,
    /// Packets dropped at encode time
    pub encoding_errors: u32,
    /// Worst alarm latency in microseconds
    pub max_alarm_latency_us: u32,
}

#[derive(Clone, Copy, Default)]
struct Reported {
    underruns: u32,
    channel_faults: u32,
    missed_alarms: u32,
}

// ============================================================================
// Controller
// ============================================================================

/// The track signal engine.
///
/// # Type Parameters
///
/// - `C`: output channel ([`OutputChannel`])
/// - `A`: alarm timer ([`AlarmTimer`])
/// - `P`: booster lines ([`TrackPins`])
/// - `D`: delay provider for settle time and retry backoff
/// - `N`: pending queue capacity
///
/// # Thread Safety
///
/// Methods take `&mut self`; whoever owns the controller serializes calls.
/// On hardware that is the track task, fed by interrupt notifications. The
/// booster lines are shared with the alarm interrupt through an `Arc`, which
/// is why `P` must be `'static`.
pub struct TrackController<C, A, P, D, const N: usize>
where
    C: OutputChannel,
    A: AlarmTimer,
    P: TrackPins + 'static,
    D: DelayNs,
{
    encoder: Option<PacketEncoder>,
    transmitter: SymbolTransmitter<C>,
    cutout: CutoutTimer<A>,
    gpio: Arc<GpioDriver<P>>,
    delay: D,
    queue: PendingQueue<N>,
    config: TrackConfig,
    callbacks: TrackCallbacks,
    signals: TrackSignals,
    reported: Reported,
}

impl<C, A, P, D, const N: usize> TrackController<C, A, P, D, N>
where
    C: OutputChannel,
    A: AlarmTimer,
    P: TrackPins + 'static,
    D: DelayNs,
{
    /// Creates an uninitialized controller. No hardware is touched.
    pub fn new(channel: C, alarm: A, pins: P, delay: D) -> Self {
        Self {
            encoder: None,
            transmitter: SymbolTransmitter::new(channel),
            cutout: CutoutTimer::new(alarm),
            gpio: Arc::new(GpioDriver::new(pins)),
            delay,
            queue: PendingQueue::new(),
            config: TrackConfig::default(),
            callbacks: TrackCallbacks::default(),
            signals: TrackSignals::new(),
            reported: Reported::default(),
        }
    }

    /// Validates the configuration, acquires the hardware and starts the
    /// idle signal.
    ///
    /// # Errors
    ///
    /// - [`TrackError::AlreadyInitialized`] unless `Uninitialized`
    /// - [`TrackError::Encoding`] / [`TrackError::TimingViolation`] for a bad
    ///   configuration; nothing is acquired in that case
    /// - [`TrackError::HardwareInit`] naming the stage that kept failing
    pub fn init(&mut self, config: TrackConfig, callbacks: TrackCallbacks) -> Result<(), TrackError> {
        let state = self.state();
        if state != TrackState::Uninitialized {
            return Err(TrackError::AlreadyInitialized(state));
        }
        config.validate()?;
        self.config = config;
        self.callbacks = callbacks;
        self.start()?;
        info!(
            "track running ({} mode, preamble {} bits, cutout {})",
            self.config.mode.as_str(),
            self.config.effective_encoder().preamble_bits,
            if self.config.effective_cutout().enabled { "on" } else { "off" }
        );
        Ok(())
    }

    /// Queues a packet for transmission.
    ///
    /// Accepted in every state; while paused the packet waits for `resume`.
    pub fn enqueue(&mut self, packet: Packet) -> Result<(), TrackError> {
        packet.address().validate()?;
        self.queue.push(packet)?;
        Ok(())
    }

    /// Transmit-done handler, run once per finished frame.
    ///
    /// Promotes the queued frame, or lets the transmitter fall back to idle,
    /// and arms the cutout timer if the frame now on the rails carries one.
    /// The promoted frame started when the done interrupt fired, so its
    /// window is anchored at the channel's completion stamp rather than at
    /// the time this runs. Refilling is left to [`service`](Self::service).
    pub fn on_tx_done(&mut self) {
        let state = self.state();
        if state != TrackState::Running && state != TrackState::Pausing {
            return;
        }
        TrackSignals::bump(&self.signals.frames_sent);

        let now = self.cutout.now_us();
        let done_us = self.transmitter.channel_mut().take_done_us().unwrap_or(now);

        // A window still open when its frame ends would run into the preamble
        if self.cutout.pending() {
            TrackSignals::bump(&self.signals.missed_alarms);
            let _ = self.cutout.disarm();
            self.gpio.assert_drive();
        }

        let completion = self.transmitter.on_complete(done_us, now);
        if completion.underrun {
            TrackSignals::bump(&self.signals.underruns);
        }
        if completion.channel_fault {
            TrackSignals::bump(&self.signals.channel_faults);
        }
        if let Some(reference) = completion.cutout_reference_us {
            self.arm_cutout(reference);
        }
        self.signals.raise(EVENT_TX_DONE);
    }

    /// Alarm handler: accounts for the steps the alarm interrupt ran.
    ///
    /// The line was already switched at each deadline; this records the
    /// latency, counts completed windows and dropped chains.
    pub fn on_alarm(&mut self) {
        let mut fired_any = false;
        while let Some(fired) = self.cutout.take_fired() {
            fired_any = true;
            self.signals.record_latency(fired.late_us);
            if fired.phase == CutoutPhase::Close {
                TrackSignals::bump(&self.signals.cutouts);
            }
            if fired.rearm_failed {
                TrackSignals::bump(&self.signals.missed_alarms);
            }
        }
        if fired_any {
            self.signals.raise(EVENT_ALARM);
        }
    }

    /// Task-context tick: logs anomalies and refills free transmit slots.
    ///
    /// Returns the number of frames handed to the transmitter.
    pub fn service(&mut self) -> usize {
        let events = self.signals.take_events();
        self.report_anomalies();
        if self.state() != TrackState::Running {
            return 0;
        }
        if events & EVENT_ALARM != 0 {
            debug!("cutout alarm, line {}", self.gpio.state().as_str());
        }
        self.refill()
    }

    /// Drains the channel and releases all hardware.
    ///
    /// A no-op while already pausing or paused. Queued packets are kept or
    /// dropped according to [`TrackConfig::queue_policy`].
    pub fn pause(&mut self) -> Result<(), TrackError> {
        match self.state() {
            TrackState::Uninitialized => return Err(TrackError::NotInitialized),
            TrackState::Pausing | TrackState::Paused => {
                debug!("pause ignored, already {}", self.state().as_str());
                return Ok(());
            }
            TrackState::Running => {}
        }
        self.signals.set_state(TrackState::Pausing);

        self.transmitter.begin_drain();
        if let Err(e) = self.transmitter.wait_drained(self.config.drain_timeout_us) {
            warn!("channel did not drain: {:?}", e);
        }
        if let Err(e) = self.cutout.disarm() {
            warn!("cutout disarm failed: {:?}", e);
        }
        self.gpio.release();
        for stage in STAGES.iter().rev() {
            self.release_stage(*stage);
        }

        if self.config.queue_policy == QueuePolicy::Discard && !self.queue.is_empty() {
            info!("discarding {} queued packet(s)", self.queue.len());
            self.queue.clear();
        }
        self.signals.set_state(TrackState::Paused);
        info!("track paused, {} packet(s) retained", self.queue.len());
        Ok(())
    }

    /// Re-acquires the hardware with a (possibly new) configuration.
    ///
    /// A no-op while running.
    ///
    /// # Errors
    ///
    /// - [`TrackError::NotInitialized`] before a successful `init`
    /// - the same configuration and hardware errors as `init`; the
    ///   controller stays `Paused`
    pub fn resume(&mut self, config: TrackConfig, callbacks: TrackCallbacks) -> Result<(), TrackError> {
        match self.state() {
            TrackState::Uninitialized => return Err(TrackError::NotInitialized),
            TrackState::Running => {
                debug!("resume ignored, already running");
                return Ok(());
            }
            TrackState::Pausing | TrackState::Paused => {}
        }
        config.validate()?;
        self.config = config;
        self.callbacks = callbacks;
        self.start()?;
        info!("track resumed, {} packet(s) pending", self.queue.len());
        Ok(())
    }

    /// Snapshot of state and counters.
    pub fn stats(&self) -> TrackStats {
        TrackStats {
            state: self.state(),
            line: self.gpio.state(),
            queued: self.queue.len(),
            urgent_queued: self.queue.urgent_len(),
            frames_sent: self.signals.frames_sent(),
            underruns: self.signals.underruns(),
            channel_faults: self.signals.channel_faults(),
            cutouts: self.signals.cutouts(),
            missed_alarms: self.signals.missed_alarms(),
            encoding_errors: self.signals.encoding_errors(),
            max_alarm_latency_us: self.signals.max_alarm_latency_us(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TrackState {
        self.signals.state()
    }

    /// Shared signals.
    pub fn signals(&self) -> &TrackSignals {
        &self.signals
    }

    /// Active configuration.
    pub fn config(&self) -> &TrackConfig {
        &self.config
    }

    /// Packets waiting.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Drops every queued packet.
    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Booster line state.
    pub fn line_state(&self) -> LineState {
        self.gpio.state()
    }

    /// True while alarms of an armed cutout remain.
    pub fn cutout_pending(&self) -> bool {
        self.cutout.pending()
    }

    /// The active encoder, present while the hardware is held.
    pub fn encoder(&self) -> Option<&PacketEncoder> {
        self.encoder.as_ref()
    }

    /// The transmitter.
    pub fn transmitter(&self) -> &SymbolTransmitter<C> {
        &self.transmitter
    }

    /// The cutout timer.
    pub fn cutout_timer(&self) -> &CutoutTimer<A> {
        &self.cutout
    }

    /// The output channel.
    pub fn channel(&self) -> &C {
        self.transmitter.channel()
    }

    /// The output channel, mutably.
    pub fn channel_mut(&mut self) -> &mut C {
        self.transmitter.channel_mut()
    }

    /// The alarm timer.
    pub fn alarm(&self) -> &A {
        self.cutout.alarm()
    }

    /// The alarm timer, mutably.
    pub fn alarm_mut(&mut self) -> &mut A {
        self.cutout.alarm_mut()
    }

    /// The booster pins.
    pub fn pins(&self) -> &P {
        self.gpio.pins()
    }

    /// The delay provider.
    pub fn delay(&self) -> &D {
        &self.delay
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn start(&mut self) -> Result<(), HardwareInitError> {
        self.acquire_with_retry()?;
        self.signals.set_state(TrackState::Running);

        let now = self.cutout.now_us();
        match self.transmitter.enqueue(Frame::Idle, now) {
            Ok(_) => {}
            Err(Rejected::Channel(e)) => {
                TrackSignals::bump(&self.signals.channel_faults);
                warn!("idle frame refused at start: {:?}", e);
            }
            Err(_) => {}
        }
        self.refill();
        Ok(())
    }

    fn refill(&mut self) -> usize {
        let Some(encoder) = self.encoder.as_ref() else {
            return 0;
        };
        let mut handed = 0;
        while self.transmitter.has_free_slot() {
            // The packet leaves the queue only once the hardware took it
            let frame = match self.queue.peek() {
                Some(packet) => match encoder.encode(packet) {
                    Ok(buffer) => Frame::Packet(buffer),
                    Err(e) => {
                        TrackSignals::bump(&self.signals.encoding_errors);
                        warn!("dropping packet for {}: {}", packet.address().number(), e);
                        let _ = self.queue.pop();
                        continue;
                    }
                },
                None => Frame::Idle,
            };
            let from_queue = !frame.is_idle();

            let now = self.cutout.now_us();
            match self.transmitter.enqueue(frame, now) {
                Ok(enqueued) => {
                    if from_queue {
                        let _ = self.queue.pop();
                    }
                    if let Enqueued::Started {
                        cutout_reference_us: Some(reference),
                    } = enqueued
                    {
                        Self::arm(&mut self.cutout, &self.gpio, &self.signals, reference);
                    }
                }
                Err(Rejected::Channel(e)) => {
                    TrackSignals::bump(&self.signals.channel_faults);
                    warn!("channel refused frame, packet kept: {:?}", e);
                    break;
                }
                Err(Rejected::Full(_)) | Err(Rejected::Inactive(_)) => break,
            }
            handed += 1;
        }
        handed
    }

    fn arm_cutout(&mut self, reference_us: u64) {
        Self::arm(&mut self.cutout, &self.gpio, &self.signals, reference_us);
    }

    fn arm(cutout: &mut CutoutTimer<A>, gpio: &GpioDriver<P>, signals: &TrackSignals, reference_us: u64) {
        if !cutout.config().enabled {
            return;
        }
        // Too late to open on time; skip the window
        let open_at = reference_us + u64::from(cutout.config().open_us);
        if cutout.now_us() >= open_at {
            TrackSignals::bump(&signals.missed_alarms);
            return;
        }
        if cutout.arm(reference_us).is_err() {
            TrackSignals::bump(&signals.missed_alarms);
            gpio.assert_drive();
        }
    }

    fn report_anomalies(&mut self) {
        let now = Reported {
            underruns: self.signals.underruns(),
            channel_faults: self.signals.channel_faults(),
            missed_alarms: self.signals.missed_alarms(),
        };
        if now.underruns != self.reported.underruns {
            warn!(
                "{} transmit underrun(s), idle substituted",
                now.underruns.wrapping_sub(self.reported.underruns)
            );
        }
        if now.channel_faults != self.reported.channel_faults {
            error!(
                "{} channel fault(s)",
                now.channel_faults.wrapping_sub(self.reported.channel_faults)
            );
        }
        if now.missed_alarms != self.reported.missed_alarms {
            warn!(
                "{} cutout alarm(s) missed",
                now.missed_alarms.wrapping_sub(self.reported.missed_alarms)
            );
        }
        self.reported = now;
    }

    fn acquire_with_retry(&mut self) -> Result<(), HardwareInitError> {
        let attempts = self.config.init_attempts.max(1);
        let mut failed = InitStage::Encoder;
        for attempt in 1..=attempts {
            match self.acquire() {
                Ok(()) => {
                    if attempt > 1 {
                        info!("hardware acquired on attempt {}", attempt);
                    }
                    return Ok(());
                }
                Err(stage) => {
                    warn!(
                        "{} stage failed (attempt {}/{})",
                        stage.as_str(),
                        attempt,
                        attempts
                    );
                    failed = stage;
                    if attempt < attempts {
                        let backoff = self
                            .config
                            .init_backoff_ms
                            .saturating_mul(1 << (attempt - 1).min(16));
                        self.delay.delay_ms(backoff);
                    }
                }
            }
        }
        error!("giving up on {} stage after {} attempt(s)", failed.as_str(), attempts);
        Err(HardwareInitError {
            stage: failed,
            attempts,
        })
    }

    // One pass through all stages. On failure the guard releases what was
    // acquired, newest first.
    fn acquire(&mut self) -> Result<(), InitStage> {
        let mut guard = StageGuard::new(self);
        for stage in STAGES {
            guard.acquire(stage)?;
        }
        guard.commit();
        Ok(())
    }

    fn acquire_stage(&mut self, stage: InitStage) -> bool {
        match stage {
            InitStage::Encoder => {
                let cutout = self.config.effective_cutout();
                match PacketEncoder::new(&self.config.effective_encoder()) {
                    Ok(encoder) => {
                        self.encoder = Some(if cutout.enabled {
                            encoder.with_cutout_tail(cutout.close_us)
                        } else {
                            encoder
                        });
                        true
                    }
                    Err(e) => {
                        warn!("encoder rejected configuration: {}", e);
                        false
                    }
                }
            }
            InitStage::Transmitter => {
                let idle = match self.encoder.as_ref().map(|enc| enc.encode(&Packet::idle())) {
                    Some(Ok(idle)) => idle,
                    _ => return false,
                };
                match self.transmitter.enable(idle, self.callbacks.on_tx_done) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("output channel: {:?}", e);
                        false
                    }
                }
            }
            InitStage::CutoutTimer => {
                let config = self.config.effective_cutout();
                let line: LineHandle = self.gpio.clone();
                match self.cutout.start(config, self.callbacks.on_alarm, line) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("alarm timer: {:?}", e);
                        false
                    }
                }
            }
            InitStage::Gpio => match self.gpio.acquire(&mut self.delay, self.config.settle_ms) {
                Ok(()) => true,
                Err(e) => {
                    debug!("track pins: {:?}", e);
                    false
                }
            },
        }
    }

    fn release_stage(&mut self, stage: InitStage) {
        match stage {
            InitStage::Encoder => self.encoder = None,
            InitStage::Transmitter => {
                if let Err(e) = self.transmitter.disable() {
                    warn!("output channel release failed: {:?}", e);
                }
            }
            InitStage::CutoutTimer => {
                if let Err(e) = self.cutout.stop() {
                    warn!("alarm timer release failed: {:?}", e);
                }
            }
            InitStage::Gpio => {
                if let Err(e) = self.gpio.deconfigure() {
                    warn!("track pin release failed: {:?}", e);
                }
            }
        }
    }
}

/// Tracks acquired stages and releases them in reverse unless committed.
struct StageGuard<'a, C, A, P, D, const N: usize>
where
    C: OutputChannel,
    A: AlarmTimer,
    P: TrackPins + 'static,
    D: DelayNs,
{
    track: &'a mut TrackController<C, A, P, D, N>,
    acquired: Vec<InitStage, 4>,
    committed: bool,
}

impl<'a, C, A, P, D, const N: usize> StageGuard<'a, C, A, P, D, N>
where
    C: OutputChannel,
    A: AlarmTimer,
    P: TrackPins + 'static,
    D: DelayNs,
{
    fn new(track: &'a mut TrackController<C, A, P, D, N>) -> Self {
        Self {
            track,
            acquired: Vec::new(),
            committed: false,
        }
    }

    fn acquire(&mut self, stage: InitStage) -> Result<(), InitStage> {
        if !self.track.acquire_stage(stage) {
            return Err(stage);
        }
        let _ = self.acquired.push(stage);
        Ok(())
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl<C, A, P, D, const N: usize> Drop for StageGuard<'_, C, A, P, D, N>
where
    C: OutputChannel,
    A: AlarmTimer,
    P: TrackPins + 'static,
    D: DelayNs,
{
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        while let Some(stage) = self.acquired.pop() {
            self.track.release_stage(stage);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
