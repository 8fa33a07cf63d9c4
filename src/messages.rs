//! Track settings document.
//!
//! Command station front ends store and exchange the track timing as a flat
//! JSON object. The key names are the ones the configuration store uses:
//!
//! ```json
//! {"dcc_preamble": 17, "dcc_bit1_dur": 58, "dcc_bit0_dur": 100, "dcc_bidibit_dur": 60}
//! ```
//!
//! Missing keys take their defaults. `dcc_bidibit_dur` of 0 switches cutouts
//! off.
//!
//! These types are `no_std` compatible and are parsed with `serde-json-core`.
//!
//! # Example
//!
//! ```
//! use dcc_track::messages::TrackSettings;
//! use dcc_track::TrackConfig;
//!
//! let settings = TrackSettings {
//!     dcc_preamble: 21,
//!     dcc_bidibit_dur: 0,
//!     ..TrackSettings::default()
//! };
//! assert!(settings.validate().is_ok());
//!
//! let track = TrackConfig::default().with_encoder(settings.to_encoder_config());
//! assert!(!track.effective_cutout().enabled);
//! ```

use serde::{Deserialize, Serialize};

use crate::encoder::EncoderConfig;
use crate::error::TrackError;

/// Persisted track timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackSettings {
    /// Preamble length in bits
    pub dcc_preamble: u8,
    /// '1' bit half period in microseconds
    pub dcc_bit1_dur: u16,
    /// '0' bit half period in microseconds
    pub dcc_bit0_dur: u16,
    /// Cutout symbol half period in microseconds (0 = cutouts off)
    pub dcc_bidibit_dur: u16,
}

impl Default for TrackSettings {
    fn default() -> Self {
        Self::from_encoder_config(&EncoderConfig::default())
    }
}

impl TrackSettings {
    /// Settings mirroring an encoder configuration.
    pub fn from_encoder_config(config: &EncoderConfig) -> Self {
        Self {
            dcc_preamble: config.preamble_bits,
            dcc_bit1_dur: config.bit1_us,
            dcc_bit0_dur: config.bit0_us,
            dcc_bidibit_dur: config.cutout_symbol_us,
        }
    }

    /// Applies the settings on top of an encoder configuration.
    ///
    /// Fields the document does not cover, such as the preamble minimum, are
    /// kept from `base`.
    pub fn apply(&self, base: EncoderConfig) -> EncoderConfig {
        base.with_preamble_bits(self.dcc_preamble)
            .with_bit1_us(self.dcc_bit1_dur)
            .with_bit0_us(self.dcc_bit0_dur)
            .with_cutout_symbol_us(self.dcc_bidibit_dur)
    }

    /// Encoder configuration with these settings and default limits.
    pub fn to_encoder_config(&self) -> EncoderConfig {
        self.apply(EncoderConfig::default())
    }

    /// Checks every value against its allowed range.
    pub fn validate(&self) -> Result<(), TrackError> {
        self.to_encoder_config().validate()
    }
}

/// Parse track settings from JSON bytes.
///
/// Returns `None` for malformed JSON. Values are not range checked; call
/// [`TrackSettings::validate`] before applying them.
///
/// # Example
///
/// ```
/// use dcc_track::messages::parse_track_settings;
///
/// let json = br#"{"dcc_preamble": 20, "dcc_bit1_dur": 56, "dcc_bit0_dur": 110, "dcc_bidibit_dur": 58}"#;
/// let settings = parse_track_settings(json).unwrap();
/// assert_eq!(settings.dcc_bit0_dur, 110);
/// assert!(settings.validate().is_ok());
/// ```
#[cfg(feature = "serde-json-core")]
pub fn parse_track_settings(json: &[u8]) -> Option<TrackSettings> {
    serde_json_core::from_slice(json).ok().map(|(settings, _)| settings)
}
