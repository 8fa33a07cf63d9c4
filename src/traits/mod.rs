//! Trait definitions for hardware abstraction.
//!
//! These traits let the track engine run on different hardware (ESP32, desktop
//! mock) without changing the controller.
//!
//! - [`OutputChannel`]: Symbol output peripheral (RMT on ESP32)
//! - [`AlarmTimer`]: Microsecond counter walking the cutout alarm chain (timer group)
//! - [`CutoutLine`]: Cutout line switching from the alarm interrupt
//! - [`TrackPins`]: Booster control lines

pub mod hardware;

pub use hardware::*;
