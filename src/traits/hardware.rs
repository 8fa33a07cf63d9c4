//! Hardware abstraction traits for the track signal path.
//!
//! The engine owns three pieces of hardware while it is running:
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`OutputChannel`] | Clocks symbol buffers out to the booster input |
//! | [`AlarmTimer`] | Free-running microsecond counter walking an alarm chain |
//! | [`TrackPins`] | Booster enable, force-low and cutout lines |
//!
//! Delays (GPIO settle time, init backoff) come from
//! [`embedded_hal::delay::DelayNs`] rather than a trait of our own.
//!
//! For tests and desktop development use the mocks in [`crate::hal::mock`].
//! ESP32 implementations live in `hal::esp32` (requires the `esp32` feature).
//!
//! # Interrupt context
//!
//! Timing-critical work happens inside the implementations' interrupt
//! handlers:
//!
//! - the transmit-done interrupt records when the finished frame ended
//!   ([`OutputChannel::take_done_us`]), which is also when the next queued
//!   frame started
//! - the alarm interrupt walks an [`AlarmChain`], switching the cutout line
//!   through a [`LineHandle`] and programming the following deadline
//!
//! Both then invoke an [`IsrCallback`], which must only post a notification.
//! The owning task picks up the timestamps and fired steps afterwards, so its
//! wake-up latency never moves a line edge.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use dcc_track::cutout::{AlarmChain, AlarmStep, LineAction};
//! use dcc_track::hal::{MockAlarm, MockDelay, MockPins};
//! use dcc_track::traits::AlarmTimer;
//! use dcc_track::GpioDriver;
//!
//! let gpio = Arc::new(GpioDriver::new(MockPins::new()));
//! gpio.acquire(&mut MockDelay::new(), 20).unwrap();
//!
//! let mut alarm = MockAlarm::new();
//! alarm.start(None, gpio.clone()).unwrap();
//! alarm
//!     .schedule(AlarmChain::new(&[
//!         AlarmStep::new(150, LineAction::Open),
//!         AlarmStep::new(300, LineAction::Close),
//!     ]))
//!     .unwrap();
//!
//! alarm.advance(150);
//! assert!(gpio.pins().cutout.get());
//! assert_eq!(alarm.take_fired().unwrap().index, 0);
//!
//! alarm.advance(150);
//! assert!(!gpio.pins().cutout.get());
//! assert!(!alarm.pending());
//! ```

use alloc::sync::Arc;
use core::fmt::Debug;

use crate::cutout::{AlarmChain, StepFired};
use crate::encoder::SymbolBuffer;

/// Plain function pointer invoked from interrupt context.
///
/// No captures and no return value, so it can be stored in a static and
/// handed to C drivers.
pub type IsrCallback = fn();

/// Cutout line switching, called from the alarm interrupt.
///
/// Implementations must be a few register writes at most.
pub trait CutoutLine {
    /// Booster stops driving so decoders can answer.
    fn open(&self);

    /// Booster drives again.
    fn close(&self);
}

/// Shared handle to the cutout line, held by the alarm while it runs.
pub type LineHandle = Arc<dyn CutoutLine>;

/// Hardware channel that turns symbols into pulses.
///
/// Implementations keep a hardware queue at least two buffers deep so the
/// next frame can be handed over while the current one is still going out.
///
/// # Example Implementation
///
/// ```rust,ignore
/// use dcc_track::traits::{IsrCallback, OutputChannel};
/// use dcc_track::SymbolBuffer;
///
/// struct MyChannel { /* peripheral handle */ }
///
/// impl OutputChannel for MyChannel {
///     type Error = ();
///
///     fn enable(&mut self, on_done: Option<IsrCallback>) -> Result<(), ()> {
///         // Claim the peripheral, hook the transmit-done interrupt...
///         Ok(())
///     }
///
///     fn disable(&mut self) -> Result<(), ()> { Ok(()) }
///
///     fn transmit(&mut self, symbols: &SymbolBuffer) -> Result<(), ()> {
///         // Copy phase durations into the peripheral's item memory...
///         Ok(())
///     }
///
///     fn wait_all_done(&mut self, timeout_us: u32) -> Result<(), ()> { Ok(()) }
///
///     fn take_done_us(&mut self) -> Option<u64> {
///         // Pop a timestamp the done interrupt stored
///         None
///     }
/// }
/// ```
pub trait OutputChannel {
    /// Error type for channel operations.
    type Error: Debug;

    /// Claims the peripheral and registers the transmit-done callback.
    fn enable(&mut self, on_done: Option<IsrCallback>) -> Result<(), Self::Error>;

    /// Releases the peripheral. The output idles low afterwards.
    fn disable(&mut self) -> Result<(), Self::Error>;

    /// Appends a buffer to the hardware transmit queue without blocking.
    fn transmit(&mut self, symbols: &SymbolBuffer) -> Result<(), Self::Error>;

    /// Blocks until every queued buffer has gone out, or the timeout expires.
    fn wait_all_done(&mut self, timeout_us: u32) -> Result<(), Self::Error>;

    /// Oldest completion time recorded by the transmit-done interrupt.
    ///
    /// Times use the [`AlarmTimer`] time base. `None` when the
    /// implementation does not record them, or none are left.
    fn take_done_us(&mut self) -> Option<u64>;
}

/// Microsecond time base whose interrupt walks an [`AlarmChain`].
///
/// Deadlines are absolute values of [`now_us`](Self::now_us). At each one the
/// interrupt handler calls [`AlarmChain::fire`] with the line handed to
/// `start`, keeps the returned [`StepFired`] for
/// [`take_fired`](Self::take_fired), then invokes the callback.
pub trait AlarmTimer {
    /// Error type for timer operations.
    type Error: Debug;

    /// Starts the counter, registers the callback and the cutout line.
    fn start(&mut self, on_alarm: Option<IsrCallback>, line: LineHandle) -> Result<(), Self::Error>;

    /// Stops the counter and drops any pending steps.
    fn stop(&mut self) -> Result<(), Self::Error>;

    /// Current counter value in microseconds.
    fn now_us(&self) -> u64;

    /// Replaces the pending chain and arms its first deadline.
    fn schedule(&mut self, chain: AlarmChain) -> Result<(), Self::Error>;

    /// Drops the pending chain, if any.
    fn cancel(&mut self) -> Result<(), Self::Error>;

    /// True while steps of the chain remain.
    fn pending(&self) -> bool;

    /// Oldest step the interrupt handled since the last call.
    fn take_fired(&mut self) -> Option<StepFired>;
}

/// The booster control lines.
///
/// Every method takes `&self`: the pins are shared with the alarm interrupt
/// through [`GpioDriver`](crate::GpioDriver). Level changes cannot fail; on
/// real hardware they are single register writes. Only configuration and
/// release, which run in task context, may report errors.
pub trait TrackPins {
    /// Error type for pin configuration.
    type Error: Debug;

    /// Sets pin directions and pulls, all lines inactive.
    fn configure(&self) -> Result<(), Self::Error>;

    /// Returns the pins to their reset state.
    fn release(&self) -> Result<(), Self::Error>;

    /// Booster enable.
    fn set_enable(&self, on: bool);

    /// Holds the booster's low-side drivers on, shorting the rails together.
    fn set_force_low(&self, on: bool);

    /// Cutout line: booster stops driving so decoders can answer.
    fn set_cutout(&self, on: bool);
}
