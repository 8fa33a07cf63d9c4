//! Cutout (bidirectional listening window) timing.
//!
//! Offsets are measured from the reference edge, the start of a flagged
//! frame's packet end bit. Each window is a three-step alarm chain:
//!
//! ```text
//!  end bit   open            channel 1 end                    close
//!    |--------|---------------------|------------------------------|
//!    0      open_us         channel1_end_us                   close_us
//!             <- channel 1 ->       <--------- channel 2 -------->
//! ```
//!
//! Offsets are checked once by [`CutoutConfig::validate`]. [`CutoutTimer::arm`]
//! hands the whole chain to the [`AlarmTimer`]; its interrupt switches the
//! line and programs each following deadline, and the task only collects
//! what fired through [`CutoutTimer::take_fired`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use dcc_track::{CutoutConfig, CutoutPhase, CutoutTimer, GpioDriver};
//! use dcc_track::hal::{MockAlarm, MockDelay, MockPins};
//!
//! let gpio = Arc::new(GpioDriver::new(MockPins::new()));
//! gpio.acquire(&mut MockDelay::new(), 20).unwrap();
//!
//! let mut timer = CutoutTimer::new(MockAlarm::new());
//! timer.start(CutoutConfig::default(), None, gpio.clone()).unwrap();
//! timer.arm(1_000).unwrap();
//!
//! timer.alarm_mut().advance_to(1_029);
//! assert!(gpio.pins().cutout.get());
//! assert_eq!(timer.take_fired().unwrap().phase, CutoutPhase::Open);
//! assert!(timer.pending());
//! ```

use heapless::Vec;

use crate::error::TimingViolationError;
use crate::traits::{AlarmTimer, CutoutLine, IsrCallback, LineHandle};

/// Allowed window open offset in microseconds.
pub const OPEN_RANGE_US: core::ops::RangeInclusive<u16> = 26..=32;

/// Longest a window may stay open.
pub const MAX_CUTOUT_US: u16 = 488;

/// Window offsets relative to the reference edge.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CutoutConfig {
    /// Arm windows at all
    pub enabled: bool,
    /// Window opens (TCS)
    pub open_us: u16,
    /// Boundary between channel 1 and channel 2
    pub channel1_end_us: u16,
    /// Window closes (TCE)
    pub close_us: u16,
}

impl Default for CutoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            open_us: 29,
            channel1_end_us: 177,
            close_us: 454,
        }
    }
}

impl CutoutConfig {
    /// Config with windows switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Enable or disable windows
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the open offset
    pub fn with_open_us(mut self, us: u16) -> Self {
        self.open_us = us;
        self
    }

    /// Set the channel 1 end offset
    pub fn with_channel1_end_us(mut self, us: u16) -> Self {
        self.channel1_end_us = us;
        self
    }

    /// Set the close offset
    pub fn with_close_us(mut self, us: u16) -> Self {
        self.close_us = us;
        self
    }

    /// Time between open and close.
    pub fn duration_us(&self) -> u16 {
        self.close_us.saturating_sub(self.open_us)
    }

    /// Checks the offsets against protocol tolerance.
    ///
    /// A disabled config always passes.
    pub fn validate(&self) -> Result<(), TimingViolationError> {
        if !self.enabled {
            return Ok(());
        }
        if !OPEN_RANGE_US.contains(&self.open_us) {
            return Err(TimingViolationError::OpenOffset(self.open_us));
        }
        if !(self.open_us < self.channel1_end_us && self.channel1_end_us < self.close_us) {
            return Err(TimingViolationError::Ordering {
                open_us: self.open_us,
                channel1_end_us: self.channel1_end_us,
                close_us: self.close_us,
            });
        }
        if self.duration_us() > MAX_CUTOUT_US {
            return Err(TimingViolationError::Duration(self.duration_us()));
        }
        Ok(())
    }
}

/// Absolute deadlines of one armed window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CutoutWindow {
    /// Reference edge.
    pub reference_us: u64,
    /// Window opens.
    pub open_at_us: u64,
    /// Channel 1 ends.
    pub channel1_end_at_us: u64,
    /// Window closes.
    pub close_at_us: u64,
}

impl CutoutWindow {
    /// Deadlines for a window anchored at `reference_us`.
    pub fn new(config: &CutoutConfig, reference_us: u64) -> Self {
        Self {
            reference_us,
            open_at_us: reference_us + u64::from(config.open_us),
            channel1_end_at_us: reference_us + u64::from(config.channel1_end_us),
            close_at_us: reference_us + u64::from(config.close_us),
        }
    }

    /// Alarm chain that opens, splits and closes this window.
    pub fn chain(&self) -> AlarmChain {
        AlarmChain::new(&[
            AlarmStep::new(self.open_at_us, LineAction::Open),
            AlarmStep::new(self.channel1_end_at_us, LineAction::Hold),
            AlarmStep::new(self.close_at_us, LineAction::Close),
        ])
    }

    /// Deadline of a phase.
    pub fn deadline(&self, phase: CutoutPhase) -> u64 {
        match phase {
            CutoutPhase::Open => self.open_at_us,
            CutoutPhase::Channel1End => self.channel1_end_at_us,
            CutoutPhase::Close => self.close_at_us,
        }
    }
}

/// Steps of the alarm chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CutoutPhase {
    /// Booster stops driving.
    Open,
    /// Channel 1 is over; nothing to toggle.
    Channel1End,
    /// Booster drives again.
    Close,
}

impl CutoutPhase {
    const fn from_step(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Open),
            1 => Some(Self::Channel1End),
            2 => Some(Self::Close),
            _ => None,
        }
    }
}

// ============================================================================
// Alarm Chain
// ============================================================================

/// Most steps one chain holds.
pub const MAX_ALARM_STEPS: usize = 3;

/// Line change applied when a step fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineAction {
    /// Leave the line alone.
    Hold,
    /// Switch to cutout.
    Open,
    /// Switch back to drive.
    Close,
}

/// One deadline of a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlarmStep {
    /// Absolute deadline.
    pub at_us: u64,
    /// What the interrupt does to the line.
    pub action: LineAction,
}

impl AlarmStep {
    /// Step at `at_us`.
    pub const fn new(at_us: u64, action: LineAction) -> Self {
        Self { at_us, action }
    }
}

/// Record of a step handled by the alarm interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepFired {
    /// Position of the step in its chain.
    pub index: usize,
    /// How far past its deadline the interrupt ran.
    pub late_us: u64,
    /// The following deadline could not be programmed; the line was closed
    /// and the rest of the chain dropped.
    pub aborted: bool,
}

/// Deadlines handed to an [`AlarmTimer`] and walked from its interrupt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlarmChain {
    steps: Vec<AlarmStep, MAX_ALARM_STEPS>,
    next: usize,
}

impl AlarmChain {
    /// Chain over `steps`, in order. Steps past [`MAX_ALARM_STEPS`] are dropped.
    pub fn new(steps: &[AlarmStep]) -> Self {
        let mut chain = Self::default();
        for step in steps.iter().take(MAX_ALARM_STEPS) {
            let _ = chain.steps.push(*step);
        }
        chain
    }

    /// Deadline of the next step.
    pub fn next_deadline(&self) -> Option<u64> {
        self.steps.get(self.next).map(|step| step.at_us)
    }

    /// True while steps remain.
    pub fn is_pending(&self) -> bool {
        self.next < self.steps.len()
    }

    /// Drops the remaining steps.
    pub fn clear(&mut self) {
        self.steps.clear();
        self.next = 0;
    }

    /// Runs the due step. Called from the alarm interrupt.
    ///
    /// Applies the step's [`LineAction`] to `line`, then hands the following
    /// deadline to `program`. If `program` fails the line is closed and the
    /// chain cleared. Returns `None` when no step is due at `now_us`.
    pub fn fire<E>(
        &mut self,
        now_us: u64,
        line: &dyn CutoutLine,
        program: impl FnOnce(u64) -> Result<(), E>,
    ) -> Option<StepFired> {
        let index = self.next;
        let step = *self.steps.get(index)?;
        if now_us < step.at_us {
            return None;
        }

        match step.action {
            LineAction::Open => line.open(),
            LineAction::Close => line.close(),
            LineAction::Hold => {}
        }
        self.next += 1;

        let mut aborted = false;
        if let Some(following) = self.next_deadline() {
            if program(following).is_err() {
                line.close();
                self.clear();
                aborted = true;
            }
        }

        Some(StepFired {
            index,
            late_us: now_us - step.at_us,
            aborted,
        })
    }
}

// ============================================================================
// Cutout Timer
// ============================================================================

/// What an alarm reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fired {
    /// The step that fired.
    pub phase: CutoutPhase,
    /// How far past its deadline the interrupt ran.
    pub late_us: u64,
    /// The following step could not be scheduled; the window was dropped.
    pub rearm_failed: bool,
}

/// Arms cutout windows on an [`AlarmTimer`].
pub struct CutoutTimer<A: AlarmTimer> {
    alarm: A,
    config: CutoutConfig,
    window: Option<CutoutWindow>,
    running: bool,
}

impl<A: AlarmTimer> CutoutTimer<A> {
    /// Wraps a stopped timer.
    pub fn new(alarm: A) -> Self {
        Self {
            alarm,
            config: CutoutConfig::default(),
            window: None,
            running: false,
        }
    }

    /// Starts the time base and registers the alarm callback and line.
    pub fn start(
        &mut self,
        config: CutoutConfig,
        on_alarm: Option<IsrCallback>,
        line: LineHandle,
    ) -> Result<(), A::Error> {
        self.alarm.start(on_alarm, line)?;
        self.config = config;
        self.window = None;
        self.running = true;
        Ok(())
    }

    /// Cancels any window and stops the time base.
    pub fn stop(&mut self) -> Result<(), A::Error> {
        self.window = None;
        self.running = false;
        self.alarm.stop()
    }

    /// Computes the deadlines for a window and hands its chain to the alarm.
    ///
    /// A window still pending is replaced.
    pub fn arm(&mut self, reference_us: u64) -> Result<CutoutWindow, A::Error> {
        let window = CutoutWindow::new(&self.config, reference_us);
        self.window = None;
        self.alarm.schedule(window.chain())?;
        self.window = Some(window);
        Ok(window)
    }

    /// Cancels pending alarms. The time base keeps running.
    pub fn disarm(&mut self) -> Result<(), A::Error> {
        self.window = None;
        self.alarm.cancel()
    }

    /// Oldest step the alarm interrupt handled, if any.
    pub fn take_fired(&mut self) -> Option<Fired> {
        let step = self.alarm.take_fired()?;
        if !self.alarm.pending() {
            self.window = None;
        }
        Some(Fired {
            phase: CutoutPhase::from_step(step.index)?,
            late_us: step.late_us,
            rearm_failed: step.aborted,
        })
    }

    /// True while alarms of an armed window remain.
    pub fn pending(&self) -> bool {
        self.alarm.pending()
    }

    /// The armed window.
    pub fn window(&self) -> Option<CutoutWindow> {
        self.window
    }

    /// Active configuration.
    pub fn config(&self) -> &CutoutConfig {
        &self.config
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current time of the underlying counter.
    pub fn now_us(&self) -> u64 {
        self.alarm.now_us()
    }

    /// The wrapped alarm.
    pub fn alarm(&self) -> &A {
        &self.alarm
    }

    /// The wrapped alarm, mutably.
    pub fn alarm_mut(&mut self) -> &mut A {
        &mut self.alarm
    }
}

// ============================================================================
// Tests
// ============================================================================
