//! Shared configuration for desktop and ESP32.
//!
//! Plain data with `with_*` builders and no heap use, so the same types
//! serve `no_std` targets.
//!
//! # Example
//!
//! ```rust
//! use dcc_track::config::{Config, TrackConfig, TrackMode};
//! use dcc_track::{CutoutConfig, EncoderConfig};
//!
//! // Use defaults
//! let config = Config::default();
//! assert!(config.track.validate().is_ok());
//!
//! // Or customize
//! let config = Config::default().with_track(
//!     TrackConfig::default()
//!         .with_encoder(EncoderConfig::default().with_preamble_bits(21))
//!         .with_cutout(CutoutConfig::default().with_open_us(30))
//!         .with_mode(TrackMode::Operations),
//! );
//! ```

use crate::cutout::CutoutConfig;
use crate::encoder::EncoderConfig;
use crate::error::{TimingViolationError, TrackError};
use crate::queue::QueuePolicy;

/// Shortest preamble in service (programming) mode.
pub const SERVICE_MIN_PREAMBLE_BITS: u8 = 20;

/// Default drain timeout. Covers two of the longest frames any valid
/// encoder configuration produces (2 x 21112 us).
pub const DEFAULT_DRAIN_TIMEOUT_US: u32 = 50_000;

// ============================================================================
// Main Config
// ============================================================================

/// Complete application configuration
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Track signal configuration
    pub track: TrackConfig,
}

impl Config {
    /// Set track configuration
    pub fn with_track(mut self, track: TrackConfig) -> Self {
        self.track = track;
        self
    }
}

// ============================================================================
// Track Config
// ============================================================================

/// What the track output is used for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TrackMode {
    /// Main track, normal operation.
    #[default]
    Operations,
    /// Programming track: longer preamble, no cutouts.
    Service,
}

impl TrackMode {
    /// Returns the mode as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TrackMode::Operations => "operations",
            TrackMode::Service => "service",
        }
    }
}

/// GPIO assignments.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PinConfig {
    /// Symbol output into the booster
    pub output: i32,
    /// Booster enable
    pub enable: i32,
    /// Booster force-low (rails clamped while active)
    pub force_low: i32,
    /// Cutout enable
    pub cutout: i32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            output: 11,
            enable: 12,
            force_low: 9,
            cutout: 13,
        }
    }
}

/// Track signal engine configuration
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackConfig {
    /// Operations or service mode
    pub mode: TrackMode,
    /// Bit timing and preamble
    pub encoder: EncoderConfig,
    /// Cutout window offsets
    pub cutout: CutoutConfig,
    /// GPIO assignments
    pub pins: PinConfig,
    /// Fate of queued packets on pause
    pub queue_policy: QueuePolicy,
    /// Attempts per init/resume before giving up
    pub init_attempts: u8,
    /// Delay between attempts in milliseconds
    pub init_backoff_ms: u32,
    /// Delay between enabling the booster and lifting force-low
    pub settle_ms: u32,
    /// Longest wait for the channel to drain on pause, in microseconds.
    /// Must cover the two frames the channel may hold.
    pub drain_timeout_us: u32,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            mode: TrackMode::Operations,
            encoder: EncoderConfig::default(),
            cutout: CutoutConfig::default(),
            pins: PinConfig::default(),
            queue_policy: QueuePolicy::Retain,
            init_attempts: 3,
            init_backoff_ms: 2,
            settle_ms: 20,
            drain_timeout_us: DEFAULT_DRAIN_TIMEOUT_US,
        }
    }
}

impl TrackConfig {
    /// Set the mode
    pub fn with_mode(mut self, mode: TrackMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the encoder configuration
    pub fn with_encoder(mut self, encoder: EncoderConfig) -> Self {
        self.encoder = encoder;
        self
    }

    /// Set the cutout configuration
    pub fn with_cutout(mut self, cutout: CutoutConfig) -> Self {
        self.cutout = cutout;
        self
    }

    /// Set the pin assignments
    pub fn with_pins(mut self, pins: PinConfig) -> Self {
        self.pins = pins;
        self
    }

    /// Set the queue policy applied on pause
    pub fn with_queue_policy(mut self, policy: QueuePolicy) -> Self {
        self.queue_policy = policy;
        self
    }

    /// Set init attempts (at least one)
    pub fn with_init_attempts(mut self, attempts: u8) -> Self {
        self.init_attempts = attempts.max(1);
        self
    }

    /// Set the backoff between init attempts
    pub fn with_init_backoff_ms(mut self, ms: u32) -> Self {
        self.init_backoff_ms = ms;
        self
    }

    /// Set the booster settle delay
    pub fn with_settle_ms(mut self, ms: u32) -> Self {
        self.settle_ms = ms;
        self
    }

    /// Set the drain timeout
    pub fn with_drain_timeout_us(mut self, us: u32) -> Self {
        self.drain_timeout_us = us;
        self
    }

    /// Encoder settings after mode adjustments.
    ///
    /// Service mode forces a preamble of at least
    /// [`SERVICE_MIN_PREAMBLE_BITS`].
    pub fn effective_encoder(&self) -> EncoderConfig {
        let mut encoder = self.encoder.clone();
        if self.mode == TrackMode::Service {
            encoder.preamble_bits = encoder.preamble_bits.max(SERVICE_MIN_PREAMBLE_BITS);
        }
        encoder
    }

    /// Cutout settings after mode adjustments.
    ///
    /// Service mode and a zero cutout symbol duration both disable windows.
    pub fn effective_cutout(&self) -> CutoutConfig {
        let off = self.mode == TrackMode::Service || !self.encoder.cutout_capable();
        let mut cutout = self.cutout.clone();
        if off {
            cutout.enabled = false;
        }
        cutout
    }

    /// Drain timeout `pause` needs: two worst-case frames, one in flight
    /// and one queued behind it.
    pub fn min_drain_timeout_us(&self) -> u32 {
        2 * self.effective_encoder().max_frame_us()
    }

    /// Validates the effective encoder and cutout settings and the drain
    /// timeout.
    pub fn validate(&self) -> Result<(), TrackError> {
        self.effective_encoder().validate()?;
        self.effective_cutout().validate()?;
        let needed_us = self.min_drain_timeout_us();
        if self.drain_timeout_us < needed_us {
            return Err(TimingViolationError::DrainTimeout {
                timeout_us: self.drain_timeout_us,
                needed_us,
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{BIT0_RANGE_US, BIT1_RANGE_US, CUTOUT_SYMBOL_RANGE_US, MAX_PREAMBLE_BITS};
    use crate::error::EncodingError;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.track.mode, TrackMode::Operations);
        assert_eq!(config.track.encoder.preamble_bits, 17);
        assert_eq!(config.track.cutout.open_us, 29);
        assert_eq!(config.track.init_attempts, 3);
        assert!(config.track.validate().is_ok());
    }

    #[test]
    fn default_pins() {
        let pins = PinConfig::default();
        assert_eq!(pins.output, 11);
        assert_eq!(pins.force_low, 9);
        assert_eq!(pins.enable, 12);
        assert_eq!(pins.cutout, 13);
    }

    #[test]
    fn service_mode_adjustments() {
        let config = TrackConfig::default().with_mode(TrackMode::Service);
        assert_eq!(config.effective_encoder().preamble_bits, SERVICE_MIN_PREAMBLE_BITS);
        assert!(!config.effective_cutout().enabled);

        let long = config.with_encoder(EncoderConfig::default().with_preamble_bits(25));
        assert_eq!(long.effective_encoder().preamble_bits, 25);
    }

    #[test]
    fn zero_cutout_symbol_disables_window() {
        let config = TrackConfig::default()
            .with_encoder(EncoderConfig::default().with_cutout_symbol_us(0));
        assert!(!config.effective_cutout().enabled);
        // bad offsets are irrelevant once the window is off
        let config = config.with_cutout(CutoutConfig::default().with_open_us(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_reports_first_problem() {
        let config = TrackConfig::default()
            .with_encoder(EncoderConfig::default().with_preamble_bits(10))
            .with_cutout(CutoutConfig::default().with_open_us(50));
        assert!(matches!(
            config.validate(),
            Err(TrackError::Encoding(EncodingError::PreambleTooShort { .. }))
        ));

        let config = TrackConfig::default().with_cutout(CutoutConfig::default().with_open_us(50));
        assert_eq!(
            config.validate(),
            Err(TrackError::TimingViolation(TimingViolationError::OpenOffset(50)))
        );
    }

    #[test]
    fn default_drain_timeout_covers_slowest_frames() {
        let slowest = EncoderConfig::default()
            .with_preamble_bits(MAX_PREAMBLE_BITS)
            .with_bit1_us(*BIT1_RANGE_US.end())
            .with_bit0_us(*BIT0_RANGE_US.end())
            .with_cutout_symbol_us(*CUTOUT_SYMBOL_RANGE_US.end());
        assert_eq!(slowest.max_frame_us(), 21_112);

        let config = TrackConfig::default().with_encoder(slowest);
        assert_eq!(config.min_drain_timeout_us(), 42_224);
        assert!(config.drain_timeout_us >= config.min_drain_timeout_us());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn short_drain_timeout_rejected() {
        let config = TrackConfig::default().with_drain_timeout_us(30_000);
        assert_eq!(
            config.validate(),
            Err(TrackError::TimingViolation(TimingViolationError::DrainTimeout {
                timeout_us: 30_000,
                needed_us: 34_896,
            }))
        );

        // service mode lengthens the preamble, and with it the frame
        let service = TrackConfig::default()
            .with_mode(TrackMode::Service)
            .with_drain_timeout_us(34_896);
        assert!(matches!(
            service.validate(),
            Err(TrackError::TimingViolation(TimingViolationError::DrainTimeout { .. }))
        ));
    }

    #[test]
    fn builder_pattern() {
        let config = TrackConfig::default()
            .with_queue_policy(QueuePolicy::Discard)
            .with_init_attempts(0)
            .with_init_backoff_ms(5)
            .with_settle_ms(10)
            .with_drain_timeout_us(1_000);
        assert_eq!(config.queue_policy, QueuePolicy::Discard);
        assert_eq!(config.init_attempts, 1);
        assert_eq!(config.init_backoff_ms, 5);
        assert_eq!(config.settle_ms, 10);
        assert_eq!(config.drain_timeout_us, 1_000);
    }

    #[test]
    fn mode_names() {
        assert_eq!(TrackMode::Operations.as_str(), "operations");
        assert_eq!(TrackMode::Service.as_str(), "service");
    }
}
