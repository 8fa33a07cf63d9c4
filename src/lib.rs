//! # dcc-track
//!
//! DCC track signal generation for model railway command stations, with
//! bidirectional (cutout) listening windows.
//!
//! ## Features
//!
//! - **Hardware abstraction**: Traits for the symbol output channel, the alarm timer and the booster lines
//! - **Gap-free output**: Two frames always held by the hardware; idle packets fill every gap
//! - **Urgent preemption**: Emergency stops jump the queue on the next refill
//! - **Cutout timing**: Three-step alarm chain anchored to each flagged packet's end bit
//! - **Safe lifecycle**: Init with staged rollback and retry, drain-then-release pause, resume
//!
//! ## Architecture
//!
//! The crate is structured to allow testing on desktop without hardware:
//!
//! - `packet` - Logical DCC packets and addresses
//! - `encoder` - Packet to symbol framing (preamble, start bits, checksum, end bit, cutout tail)
//! - `queue` - Bounded two-lane pending queue
//! - `transmitter` - Double-buffered hand-off to the output channel
//! - `cutout` - Cutout window deadlines and alarm chain
//! - `gpio` - Booster enable, force-low and cutout lines
//! - `controller` - State machine that ties everything together
//! - `hal` - Concrete implementations (mock for testing, esp32 for hardware)
//!
//! ## Example
//!
//! ```rust
//! use dcc_track::{
//!     Address, Packet, TrackConfig, TrackController, TrackState,
//!     hal::{MockAlarm, MockChannel, MockDelay, MockPins},
//! };
//!
//! let mut track: TrackController<_, _, _, _, 16> = TrackController::new(
//!     MockChannel::new(),
//!     MockAlarm::new(),
//!     MockPins::new(),
//!     MockDelay::new(),
//! );
//! track.init(TrackConfig::default(), Default::default()).unwrap();
//!
//! // Loco 3, forward speed step 16, with a cutout after it
//! let speed = Packet::new(Address::short(3).unwrap(), &[0x3F, 0x90])
//!     .unwrap()
//!     .with_cutout(true);
//! track.enqueue(speed).unwrap();
//!
//! // Broadcast emergency stop overtakes anything still waiting
//! let estop = Packet::new(Address::Broadcast, &[0x41]).unwrap().urgent();
//! track.enqueue(estop).unwrap();
//!
//! // Each transmit-done event frees a slot, service() fills it
//! for _ in 0..4 {
//!     track.channel_mut().complete();
//!     track.on_tx_done();
//!     track.service();
//! }
//! assert_eq!(track.queue_len(), 0);
//!
//! track.pause().unwrap();
//! assert_eq!(track.state(), TrackState::Paused);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

extern crate alloc;

/// Main track controller that coordinates queue, transmitter, cutouts and lines.
pub mod controller;
/// Cutout window deadlines and alarm chain.
pub mod cutout;
/// Packet to symbol encoding.
pub mod encoder;
/// Error types.
pub mod error;
/// Booster line control.
pub mod gpio;
/// Hardware abstraction layer with mock implementations for testing.
pub mod hal;
/// DCC packets and addresses.
pub mod packet;
/// Bounded pending queue with urgent preemption.
pub mod queue;
/// Core traits for hardware abstraction.
pub mod traits;
/// Double-buffered symbol output.
pub mod transmitter;

/// Shared configuration system for desktop and ESP32.
pub mod config;

/// Track settings documents (serde-based).
#[cfg(feature = "serde")]
pub mod messages;

// Re-exports for convenience
pub use controller::{TrackCallbacks, TrackController, TrackSignals, TrackState, TrackStats};
pub use cutout::{
    AlarmChain, AlarmStep, CutoutConfig, CutoutPhase, CutoutTimer, CutoutWindow, Fired,
    LineAction, StepFired,
};
pub use encoder::{EncoderConfig, PacketEncoder, Symbol, SymbolBuffer, SymbolKind};
pub use error::{
    EncodingError, HardwareInitError, InitStage, QueueFullError, TimingViolationError, TrackError,
};
pub use gpio::{GpioDriver, LineState};
pub use packet::{Address, Packet, Priority};
pub use queue::{PendingQueue, QueuePolicy};
pub use traits::{AlarmTimer, CutoutLine, IsrCallback, LineHandle, OutputChannel, TrackPins};
pub use transmitter::{Completion, Enqueued, Frame, Rejected, SymbolTransmitter};

// Config re-exports
pub use config::{Config, PinConfig, TrackConfig, TrackMode};

// Message re-exports
#[cfg(feature = "serde")]
pub use messages::TrackSettings;

#[cfg(feature = "serde-json-core")]
pub use messages::parse_track_settings;
