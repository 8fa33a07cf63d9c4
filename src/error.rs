//! Error taxonomy for the track signal engine.
//!
//! Each failure class has its own type so callers can match on exactly what
//! went wrong:
//!
//! | Error | Raised by | Handling |
//! |-------|-----------|----------|
//! | [`EncodingError`] | packet construction, encoder config | packet dropped, reported to the enqueuer |
//! | [`QueueFullError`] | [`TrackController::enqueue`] | caller decides to retry or drop |
//! | [`HardwareInitError`] | `init` / `resume` | fatal for that call, hardware released again |
//! | [`TimingViolationError`] | configuration validation | rejected before any hardware is touched |
//!
//! [`TrackError`] wraps all of them so `?` works across the controller API.
//! Interrupt-context handlers never return these; they record anomalies in
//! [`TrackSignals`] instead.
//!
//! [`TrackController::enqueue`]: crate::TrackController::enqueue
//! [`TrackSignals`]: crate::TrackSignals

use core::fmt;

use crate::controller::TrackState;

/// A packet or encoder configuration that cannot be framed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodingError {
    /// More instruction bytes than a single packet may carry.
    TooManyBytes {
        /// Number of instruction bytes supplied.
        len: usize,
        /// Protocol maximum.
        max: usize,
    },
    /// Packet carries no instruction bytes.
    Empty,
    /// Address is outside the range of its declared type.
    AddressOutOfRange(u16),
    /// Preamble shorter than the configured minimum.
    PreambleTooShort {
        /// Requested preamble length in bits.
        bits: u8,
        /// Configured minimum.
        min: u8,
    },
    /// Preamble longer than a symbol buffer can hold.
    PreambleTooLong {
        /// Requested preamble length in bits.
        bits: u8,
        /// Supported maximum.
        max: u8,
    },
    /// Repeat count of zero; every packet is sent at least once.
    ZeroRepeat,
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyBytes { len, max } => {
                write!(f, "{} instruction bytes exceed maximum of {}", len, max)
            }
            Self::Empty => write!(f, "packet has no instruction bytes"),
            Self::AddressOutOfRange(addr) => write!(f, "address {} out of range", addr),
            Self::PreambleTooShort { bits, min } => {
                write!(f, "preamble of {} bits below minimum of {}", bits, min)
            }
            Self::PreambleTooLong { bits, max } => {
                write!(f, "preamble of {} bits above maximum of {}", bits, max)
            }
            Self::ZeroRepeat => write!(f, "repeat count must be at least 1"),
        }
    }
}

/// The pending queue is at capacity.
///
/// The rejected packet is not kept; the caller still owns its copy and may
/// retry once a transmission frees a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFullError {
    /// Queue capacity at the time of rejection.
    pub capacity: usize,
}

impl fmt::Display for QueueFullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pending queue full ({} packets)", self.capacity)
    }
}

/// Acquisition stage, in dependency order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum InitStage {
    /// Packet encoder and idle frame.
    Encoder,
    /// Output channel and transmit-done callback.
    Transmitter,
    /// Alarm timer and alarm callback.
    CutoutTimer,
    /// Track enable, force-low and cutout lines.
    Gpio,
}

impl InitStage {
    /// Returns the stage as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            InitStage::Encoder => "encoder",
            InitStage::Transmitter => "transmitter",
            InitStage::CutoutTimer => "cutout_timer",
            InitStage::Gpio => "gpio",
        }
    }
}

/// A hardware stage could not be acquired during `init` or `resume`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HardwareInitError {
    /// Stage that failed. All earlier stages were released again.
    pub stage: InitStage,
    /// Number of attempts made before giving up.
    pub attempts: u8,
}

impl fmt::Display for HardwareInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stage failed after {} attempt(s)",
            self.stage.as_str(),
            self.attempts
        )
    }
}

/// Configured timings fall outside the protocol tolerance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimingViolationError {
    /// '1' bit half-period outside the allowed band.
    Bit1Duration(u16),
    /// '0' bit half-period outside the allowed band.
    Bit0Duration(u16),
    /// Cutout symbol duration outside the allowed band.
    CutoutSymbolDuration(u16),
    /// Window opens outside the allowed offset range.
    OpenOffset(u16),
    /// Window steps are not strictly increasing.
    Ordering {
        /// Open offset in microseconds.
        open_us: u16,
        /// Channel 1 end offset in microseconds.
        channel1_end_us: u16,
        /// Close offset in microseconds.
        close_us: u16,
    },
    /// Window stays open longer than the protocol allows.
    Duration(u16),
    /// Drain timeout too short for the frames the channel may hold.
    DrainTimeout {
        /// Configured timeout in microseconds.
        timeout_us: u32,
        /// Two worst-case frames in microseconds.
        needed_us: u32,
    },
}

impl fmt::Display for TimingViolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bit1Duration(us) => write!(f, "'1' bit half-period of {}us out of band", us),
            Self::Bit0Duration(us) => write!(f, "'0' bit half-period of {}us out of band", us),
            Self::CutoutSymbolDuration(us) => {
                write!(f, "cutout symbol of {}us out of band", us)
            }
            Self::OpenOffset(us) => write!(f, "cutout opens {}us after reference edge", us),
            Self::Ordering {
                open_us,
                channel1_end_us,
                close_us,
            } => write!(
                f,
                "cutout steps out of order: open {}us, channel 1 end {}us, close {}us",
                open_us, channel1_end_us, close_us
            ),
            Self::Duration(us) => write!(f, "cutout lasts {}us", us),
            Self::DrainTimeout {
                timeout_us,
                needed_us,
            } => write!(
                f,
                "drain timeout of {}us shorter than two frames ({}us)",
                timeout_us, needed_us
            ),
        }
    }
}

/// Any error surfaced by the track controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackError {
    /// Malformed packet or encoder configuration.
    Encoding(EncodingError),
    /// Pending queue at capacity.
    QueueFull(QueueFullError),
    /// Hardware acquisition failed.
    HardwareInit(HardwareInitError),
    /// Timing configuration out of tolerance.
    TimingViolation(TimingViolationError),
    /// `resume` or `pause` called before `init`.
    NotInitialized,
    /// `init` called on a controller that already left `Uninitialized`.
    AlreadyInitialized(TrackState),
}

impl fmt::Display for TrackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encoding(e) => write!(f, "encoding error: {}", e),
            Self::QueueFull(e) => write!(f, "{}", e),
            Self::HardwareInit(e) => write!(f, "hardware init error: {}", e),
            Self::TimingViolation(e) => write!(f, "timing violation: {}", e),
            Self::NotInitialized => write!(f, "track not initialized"),
            Self::AlreadyInitialized(state) => {
                write!(f, "track already initialized ({})", state.as_str())
            }
        }
    }
}

impl From<EncodingError> for TrackError {
    fn from(e: EncodingError) -> Self {
        Self::Encoding(e)
    }
}

impl From<QueueFullError> for TrackError {
    fn from(e: QueueFullError) -> Self {
        Self::QueueFull(e)
    }
}

impl From<HardwareInitError> for TrackError {
    fn from(e: HardwareInitError) -> Self {
        Self::HardwareInit(e)
    }
}

impl From<TimingViolationError> for TrackError {
    fn from(e: TimingViolationError) -> Self {
        Self::TimingViolation(e)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EncodingError {}
#[cfg(feature = "std")]
impl std::error::Error for QueueFullError {}
#[cfg(feature = "std")]
impl std::error::Error for HardwareInitError {}
#[cfg(feature = "std")]
impl std::error::Error for TimingViolationError {}
#[cfg(feature = "std")]
impl std::error::Error for TrackError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_ordered_by_dependency() {
        assert!(InitStage::Encoder < InitStage::Transmitter);
        assert!(InitStage::Transmitter < InitStage::CutoutTimer);
        assert!(InitStage::CutoutTimer < InitStage::Gpio);
    }

    #[test]
    fn track_error_from_conversions() {
        let e: TrackError = EncodingError::Empty.into();
        assert_eq!(e, TrackError::Encoding(EncodingError::Empty));

        let e: TrackError = QueueFullError { capacity: 4 }.into();
        assert!(matches!(e, TrackError::QueueFull(QueueFullError { capacity: 4 })));

        let e: TrackError = TimingViolationError::OpenOffset(40).into();
        assert!(matches!(e, TrackError::TimingViolation(_)));
    }

    #[test]
    fn display_names_failed_stage() {
        let e = HardwareInitError {
            stage: InitStage::CutoutTimer,
            attempts: 3,
        };
        assert_eq!(e.to_string(), "cutout_timer stage failed after 3 attempt(s)");
    }
}
