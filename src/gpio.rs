//! Booster line control.
//!
//! [`GpioDriver`] keeps the current [`LineState`] in an atomic and only writes
//! pins when a transition actually changes it, so calling the same operation
//! twice, from task or interrupt context, is harmless.
//!
//! Every method takes `&self`. The controller keeps the driver in an `Arc`
//! and hands a clone to the alarm timer as its [`CutoutLine`].

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use embedded_hal::delay::DelayNs;

use crate::traits::{CutoutLine, TrackPins};

/// Electrical state of the track output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum LineState {
    /// Booster disabled, rails clamped low.
    Released,
    /// Booster follows the output channel.
    Drive,
    /// Booster stops driving so decoders can answer.
    Cutout,
}

impl LineState {
    /// Returns the state as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            LineState::Released => "released",
            LineState::Drive => "drive",
            LineState::Cutout => "cutout",
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            LineState::Released => 0,
            LineState::Drive => 1,
            LineState::Cutout => 2,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => LineState::Drive,
            2 => LineState::Cutout,
            _ => LineState::Released,
        }
    }
}

/// Owns the booster control lines.
pub struct GpioDriver<P: TrackPins> {
    pins: P,
    state: AtomicU8,
    configured: AtomicBool,
}

impl<P: TrackPins> GpioDriver<P> {
    /// Wraps unconfigured pins.
    pub fn new(pins: P) -> Self {
        Self {
            pins,
            state: AtomicU8::new(LineState::Released.to_u8()),
            configured: AtomicBool::new(false),
        }
    }

    /// Configures the pins (once) and brings the booster up.
    ///
    /// Enable goes high first, then force-low is lifted after `settle_ms`.
    pub fn acquire<D: DelayNs>(&self, delay: &mut D, settle_ms: u32) -> Result<(), P::Error> {
        if !self.is_configured() {
            self.pins.configure()?;
            self.configured.store(true, Ordering::Release);
            self.pins.set_force_low(true);
            self.pins.set_cutout(false);
        }
        self.pins.set_enable(true);
        delay.delay_ms(settle_ms);
        self.pins.set_force_low(false);
        self.state.store(LineState::Drive.to_u8(), Ordering::Release);
        Ok(())
    }

    /// Booster drives the rails. Closes a cutout.
    pub fn assert_drive(&self) {
        match self.transition(LineState::Drive) {
            Some(LineState::Cutout) => self.pins.set_cutout(false),
            Some(LineState::Released) => {
                self.pins.set_enable(true);
                self.pins.set_force_low(false);
            }
            _ => {}
        }
    }

    /// Booster stops driving. Ignored unless currently driving.
    pub fn assert_cutout(&self) {
        if self
            .state
            .compare_exchange(
                LineState::Drive.to_u8(),
                LineState::Cutout.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.pins.set_cutout(true);
        }
    }

    /// Disables the booster and clamps the rails.
    pub fn release(&self) {
        if let Some(previous) = self.transition(LineState::Released) {
            if previous == LineState::Cutout {
                self.pins.set_cutout(false);
            }
            self.pins.set_force_low(true);
            self.pins.set_enable(false);
        }
    }

    /// Releases the lines and hands the pins back to their reset state.
    pub fn deconfigure(&self) -> Result<(), P::Error> {
        self.release();
        if self.configured.swap(false, Ordering::AcqRel) {
            self.pins.release()?;
        }
        Ok(())
    }

    /// Current line state.
    pub fn state(&self) -> LineState {
        LineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once `acquire` configured the pins.
    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    /// The wrapped pins.
    pub fn pins(&self) -> &P {
        &self.pins
    }

    // Swaps in the new state; returns the old one if it differed.
    fn transition(&self, to: LineState) -> Option<LineState> {
        let previous = LineState::from_u8(self.state.swap(to.to_u8(), Ordering::AcqRel));
        (previous != to).then_some(previous)
    }
}

impl<P: TrackPins> CutoutLine for GpioDriver<P> {
    fn open(&self) {
        self.assert_cutout();
    }

    fn close(&self) {
        self.assert_drive();
    }
}

// ============================================================================
// Tests
// ============================================================================
