//! ESP32-S3 DCC track signal generator.
//!
//! This is the main entry point for the booster hardware. It:
//! - Brings up the RMT output, the cutout alarm timer and the booster lines
//! - Sends a burst of decoder resets, then keeps the rails alive with idle packets
//! - Refreshes a speed packet for a test locomotive, each followed by a cutout
//! - Logs the engine counters periodically
//!
//! The RMT interrupt stamps each completion and the timer interrupt switches
//! the cutout line itself. Both then bump a counter and notify this task,
//! which runs the controller's handlers and `service()`.
//!
//! # Build
//!
//! ```bash
//! cargo build --release --features esp32 --bin esp32_main
//!
//! # With a settings document (see `messages::TrackSettings`)
//! DCC_TRACK_SETTINGS='{"dcc_preamble":20}' \
//!     cargo build --release --features esp32,serde-json-core --bin esp32_main
//! ```

use core::num::NonZeroU32;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dcc_track::hal::esp32::{Esp32Alarm, Esp32Channel, Esp32Pins};
use dcc_track::{Address, Config, Packet, TrackCallbacks, TrackController, TrackState};
use esp_idf_hal::delay::Delay;
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_hal::sys::{tskTaskControlBlock, TickType_t};
use esp_idf_hal::task;
use log::{info, warn};

/// Pending packet capacity.
const QUEUE_CAPACITY: usize = 32;

/// Longest wait for an interrupt notification, in ticks.
const WAIT_TICKS: TickType_t = 2;

/// Decoder resets sent after power-up.
const RESET_BURST: u8 = 20;

/// Address of the test locomotive.
const TEST_LOCO: u8 = 3;

/// Speed packet refresh interval.
const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// Stats log interval.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

static TRACK_TASK: AtomicPtr<tskTaskControlBlock> = AtomicPtr::new(ptr::null_mut());
static TX_DONE: AtomicU32 = AtomicU32::new(0);
static ALARMS: AtomicU32 = AtomicU32::new(0);

const NOTIFY_TX_DONE: u32 = 1 << 0;
const NOTIFY_ALARM: u32 = 1 << 1;

fn notify(bits: u32) {
    let handle = TRACK_TASK.load(Ordering::Acquire);
    if handle.is_null() {
        return;
    }
    if let Some(bits) = NonZeroU32::new(bits) {
        // The handle belongs to the track task, which never exits
        unsafe {
            task::notify_and_yield(handle, bits);
        }
    }
}

fn on_tx_done_isr() {
    TX_DONE.fetch_add(1, Ordering::AcqRel);
    notify(NOTIFY_TX_DONE);
}

fn on_alarm_isr() {
    ALARMS.fetch_add(1, Ordering::AcqRel);
    notify(NOTIFY_ALARM);
}

fn main() -> anyhow::Result<()> {
    // Initialize ESP-IDF
    esp_idf_hal::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("================================");
    info!("  dcc-track booster");
    info!("================================");

    // =========================================================================
    // Configuration
    // =========================================================================
    let config = load_config();
    info!(
        "{} mode, preamble {} bits, bit1 {} us, bit0 {} us",
        config.track.mode.as_str(),
        config.track.encoder.preamble_bits,
        config.track.encoder.bit1_us,
        config.track.encoder.bit0_us
    );

    // =========================================================================
    // Track Engine
    // =========================================================================
    let handle = task::current().ok_or_else(|| anyhow::anyhow!("no current task"))?;
    TRACK_TASK.store(handle, Ordering::Release);

    let callbacks = TrackCallbacks {
        on_tx_done: Some(on_tx_done_isr),
        on_alarm: Some(on_alarm_isr),
    };

    let peripherals = Peripherals::take()?;
    let alarm = Esp32Alarm::new(peripherals.timer00)?;
    let pins = Esp32Pins::new(
        peripherals.pins.gpio12, // enable
        peripherals.pins.gpio9,  // force-low
        peripherals.pins.gpio13, // cutout
    )?;
    let wired = pins.gpio_numbers();
    let configured = (
        config.track.pins.enable,
        config.track.pins.force_low,
        config.track.pins.cutout,
    );
    if wired != configured {
        warn!(
            "booster lines are wired to {:?}, configuration names {:?}",
            wired, configured
        );
    }

    let mut track: TrackController<_, _, _, _, QUEUE_CAPACITY> = TrackController::new(
        Esp32Channel::new(config.track.pins.output),
        alarm,
        pins,
        Delay::new_default(),
    );
    track
        .init(config.track.clone(), callbacks)
        .map_err(|e| anyhow::anyhow!("track init failed: {}", e))?;
    info!("[OK] Track running (GPIO{})", config.track.pins.output);

    let reset = Packet::reset()
        .with_repeat(RESET_BURST)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    track
        .enqueue(reset)
        .map_err(|e| anyhow::anyhow!("reset burst rejected: {}", e))?;

    let loco = Address::short(TEST_LOCO).map_err(|e| anyhow::anyhow!("{}", e))?;
    // 128-step speed, forward, step 0
    let speed = Packet::new(loco, &[0x3F, 0x80])
        .map_err(|e| anyhow::anyhow!("{}", e))?
        .with_cutout(true);

    // =========================================================================
    // Main Loop
    // =========================================================================
    let mut next_refresh = Instant::now();
    let mut next_stats = Instant::now() + STATS_INTERVAL;

    loop {
        let _ = task::wait_notification(WAIT_TICKS);

        // Alarms first: they belong to the window of the frame that just ended
        if ALARMS.swap(0, Ordering::AcqRel) > 0 {
            track.on_alarm();
        }
        for _ in 0..TX_DONE.swap(0, Ordering::AcqRel) {
            track.on_tx_done();
        }
        track.service();

        let now = Instant::now();
        if now >= next_refresh {
            next_refresh = now + REFRESH_INTERVAL;
            if let Err(e) = track.enqueue(speed.clone()) {
                warn!("speed refresh dropped: {}", e);
            }
        }

        if now >= next_stats {
            next_stats = now + STATS_INTERVAL;
            let stats = track.stats();
            info!(
                "frames {} cutouts {} underruns {} missed alarms {} worst latency {} us",
                stats.frames_sent,
                stats.cutouts,
                stats.underruns,
                stats.missed_alarms,
                stats.max_alarm_latency_us
            );
        }

        if track.state() != TrackState::Running {
            warn!("track left running state: {}", track.state().as_str());
            track
                .resume(config.track.clone(), callbacks)
                .map_err(|e| anyhow::anyhow!("track resume failed: {}", e))?;
        }
    }
}

/// Default configuration, overridden by a compile-time settings document.
fn load_config() -> Config {
    let config = Config::default();

    #[cfg(feature = "serde-json-core")]
    if let Some(json) = option_env!("DCC_TRACK_SETTINGS") {
        match dcc_track::parse_track_settings(json.as_bytes()) {
            Some(settings) if settings.validate().is_ok() => {
                let encoder = settings.apply(config.track.encoder.clone());
                let track = config.track.clone().with_encoder(encoder);
                return config.with_track(track);
            }
            Some(settings) => warn!("settings out of range, using defaults: {:?}", settings),
            None => warn!("settings document malformed, using defaults"),
        }
    }

    config
}
