//! ESP32-S3 hardware abstraction layer for DCC track output.
//!
//! This module provides hardware implementations for an ESP32-S3 driving a
//! DCC booster with cutout support.
//!
//! # Hardware Configuration
//!
//! - **MCU**: ESP32-S3 (ESP-IDF 5.x drivers)
//! - **Signal output**: RMT TX channel, 1 MHz resolution, two transactions deep
//! - **Cutout timing**: Timer group timer (`TimerDriver`), 1 MHz, alarm chain walked in its interrupt
//! - **Booster control**: Enable, force-low and cutout lines as `PinDriver` outputs
//!
//! Only the RMT channel goes through the ESP-IDF C driver in `esp_idf_hal::sys`;
//! see [`Esp32Channel`] for why.
//!
//! # Pin Assignments
//!
//! See the [`pins`] module for the default GPIO assignments.

mod alarm;
mod channel;
mod lines;

pub use alarm::Esp32Alarm;
pub use channel::Esp32Channel;
pub use lines::Esp32Pins;

/// Default pin assignments.
///
/// These match [`PinConfig::default`](crate::config::PinConfig):
/// - Track signal on GPIO11
/// - Booster control on GPIO9, 12, 13
pub mod pins {
    // =========================================================================
    // Signal
    // =========================================================================

    /// RMT output into the booster's signal input
    pub const TRACK_OUT: i32 = 11;

    // =========================================================================
    // Booster Control
    // =========================================================================

    /// Force-low (high clamps both rails low)
    pub const FORCE_LOW: i32 = 9;

    /// Booster enable (active high)
    pub const ENABLE: i32 = 12;

    /// Cutout / BiDi enable (high while decoders may answer)
    pub const CUTOUT: i32 = 13;
}
