//! RMT output channel.
//!
//! Each symbol maps to one RMT word: phase A high, phase B low, durations in
//! microseconds at a 1 MHz channel resolution. A copy encoder streams the
//! words, so the payload must stay put until its transaction is done; the
//! channel keeps one payload slot per queued transaction for that reason.
//!
//! This goes through the ESP-IDF 5 RMT TX driver in `esp_idf_hal::sys`:
//! `esp_idf_hal::rmt::TxRmtDriver` wraps the legacy driver, which has no
//! transaction queue and no per-transaction done callback.
//!
//! The transmit-done interrupt stamps `esp_timer_get_time()` into a small
//! ring. That is the moment the next queued frame started.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use esp_idf_hal::sys::{
    esp, rmt_channel_handle_t, rmt_copy_encoder_config_t, rmt_del_channel, rmt_del_encoder,
    rmt_disable, rmt_enable, rmt_encoder_handle_t, rmt_new_copy_encoder, rmt_new_tx_channel,
    rmt_transmit, rmt_transmit_config_t, rmt_tx_channel_config_t, rmt_tx_done_event_data_t,
    esp_timer_get_time, rmt_tx_event_callbacks_t, rmt_tx_register_event_callbacks,
    rmt_tx_wait_all_done, soc_periph_rmt_clk_src_t_RMT_CLK_SRC_DEFAULT, EspError,
    ESP_ERR_INVALID_STATE,
};

use crate::encoder::{Symbol, SymbolBuffer, MAX_SYMBOLS};
use crate::traits::{IsrCallback, OutputChannel};

/// Transactions the driver holds: one in flight, one queued.
const QUEUE_DEPTH: usize = 2;

/// Channel tick rate; one tick per microsecond.
const RESOLUTION_HZ: u32 = 1_000_000;

/// RMT memory words per channel on the S3.
const MEM_BLOCK_SYMBOLS: usize = 48;

/// Completion stamps the task may lag behind by.
const STAMP_DEPTH: usize = 4;

// Touched from the transmit-done interrupt.
struct Shared {
    pending: AtomicU8,
    on_done: Option<IsrCallback>,
    // Low 32 bits of esp_timer time; written by the interrupt only
    stamps: [AtomicU32; STAMP_DEPTH],
    head: AtomicU8,
    tail: AtomicU8,
}

impl Shared {
    fn new() -> Self {
        Self {
            pending: AtomicU8::new(0),
            on_done: None,
            stamps: Default::default(),
            head: AtomicU8::new(0),
            tail: AtomicU8::new(0),
        }
    }

    // Interrupt side. Drops the stamp when the task is too far behind.
    fn push_stamp(&self, at: u32) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if usize::from(head.wrapping_sub(tail)) >= STAMP_DEPTH {
            return;
        }
        self.stamps[usize::from(head) % STAMP_DEPTH].store(at, Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
    }

    fn pop_stamp(&self) -> Option<u32> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let at = self.stamps[usize::from(tail) % STAMP_DEPTH].load(Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(at)
    }

    fn reset(&self) {
        self.pending.store(0, Ordering::Release);
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
    }
}

/// Widens a 32-bit stamp taken at most ~71 minutes before `now`.
fn widen(stamp: u32, now: u64) -> u64 {
    now - u64::from((now as u32).wrapping_sub(stamp))
}

/// DCC signal output on an RMT TX channel.
///
/// No hardware is touched until [`enable`](OutputChannel::enable); `disable`
/// deletes the channel again so the pin can be reused.
///
/// # Example
///
/// ```ignore
/// use dcc_track::hal::esp32::{pins, Esp32Channel};
/// use dcc_track::traits::OutputChannel;
///
/// let mut channel = Esp32Channel::new(pins::TRACK_OUT);
/// channel.enable(None)?;
/// channel.transmit(&idle)?;
/// ```
pub struct Esp32Channel {
    gpio: i32,
    channel: rmt_channel_handle_t,
    encoder: rmt_encoder_handle_t,
    shared: Box<Shared>,
    slots: Box<[[u32; MAX_SYMBOLS]; QUEUE_DEPTH]>,
    next_slot: usize,
}

// The raw handles are only used from the owning task.
unsafe impl Send for Esp32Channel {}

impl Esp32Channel {
    /// Creates a channel for `gpio`.
    pub fn new(gpio: i32) -> Self {
        Self {
            gpio,
            channel: ptr::null_mut(),
            encoder: ptr::null_mut(),
            shared: Box::new(Shared::new()),
            slots: Box::new([[0; MAX_SYMBOLS]; QUEUE_DEPTH]),
            next_slot: 0,
        }
    }

    /// Output GPIO number.
    pub fn gpio(&self) -> i32 {
        self.gpio
    }

    /// Transactions handed to the driver and not yet done.
    pub fn pending(&self) -> u8 {
        self.shared.pending.load(Ordering::Acquire)
    }

    fn create(&mut self) -> Result<(), EspError> {
        let config = rmt_tx_channel_config_t {
            gpio_num: self.gpio,
            clk_src: soc_periph_rmt_clk_src_t_RMT_CLK_SRC_DEFAULT,
            resolution_hz: RESOLUTION_HZ,
            mem_block_symbols: MEM_BLOCK_SYMBOLS,
            trans_queue_depth: QUEUE_DEPTH,
            ..Default::default()
        };
        esp!(unsafe { rmt_new_tx_channel(&config, &mut self.channel) })?;

        let encoder_config = rmt_copy_encoder_config_t::default();
        esp!(unsafe { rmt_new_copy_encoder(&encoder_config, &mut self.encoder) })?;

        let callbacks = rmt_tx_event_callbacks_t {
            on_trans_done: Some(on_trans_done),
        };
        let ctx = &*self.shared as *const Shared as *mut c_void;
        esp!(unsafe { rmt_tx_register_event_callbacks(self.channel, &callbacks, ctx) })?;
        esp!(unsafe { rmt_enable(self.channel) })?;
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), EspError> {
        let mut result = Ok(());
        if !self.channel.is_null() {
            // Fails harmlessly if the channel never got enabled
            let _ = unsafe { rmt_disable(self.channel) };
            result = esp!(unsafe { rmt_del_channel(self.channel) });
            self.channel = ptr::null_mut();
        }
        if !self.encoder.is_null() {
            let deleted = esp!(unsafe { rmt_del_encoder(self.encoder) });
            result = result.and(deleted);
            self.encoder = ptr::null_mut();
        }
        self.shared.reset();
        result
    }
}

impl OutputChannel for Esp32Channel {
    type Error = EspError;

    fn enable(&mut self, on_done: Option<IsrCallback>) -> Result<(), EspError> {
        self.destroy()?;
        // No interrupt can reach `shared` while the channel does not exist
        self.shared.on_done = on_done;
        self.next_slot = 0;
        if let Err(e) = self.create() {
            let _ = self.destroy();
            return Err(e);
        }
        Ok(())
    }

    fn disable(&mut self) -> Result<(), EspError> {
        self.destroy()
    }

    fn transmit(&mut self, symbols: &SymbolBuffer) -> Result<(), EspError> {
        if self.channel.is_null()
            || usize::from(self.shared.pending.load(Ordering::Acquire)) >= QUEUE_DEPTH
        {
            return Err(EspError::from_infallible::<ESP_ERR_INVALID_STATE>());
        }

        let slot = &mut self.slots[self.next_slot];
        for (word, symbol) in slot.iter_mut().zip(symbols.symbols()) {
            *word = rmt_word(symbol);
        }
        let len = symbols.len().min(MAX_SYMBOLS);

        let config = rmt_transmit_config_t::default();
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let sent = esp!(unsafe {
            rmt_transmit(
                self.channel,
                self.encoder,
                slot.as_ptr() as *const c_void,
                len * core::mem::size_of::<u32>(),
                &config,
            )
        });
        if let Err(e) = sent {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        self.next_slot = (self.next_slot + 1) % QUEUE_DEPTH;
        Ok(())
    }

    fn wait_all_done(&mut self, timeout_us: u32) -> Result<(), EspError> {
        if self.channel.is_null() {
            return Ok(());
        }
        let timeout_ms = timeout_us.div_ceil(1_000).max(1) as i32;
        esp!(unsafe { rmt_tx_wait_all_done(self.channel, timeout_ms) })
    }

    fn take_done_us(&mut self) -> Option<u64> {
        let stamp = self.shared.pop_stamp()?;
        let now = unsafe { esp_timer_get_time() } as u64;
        Some(widen(stamp, now))
    }
}

impl Drop for Esp32Channel {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}

/// Packs a symbol into an RMT word: level 1 for phase A, level 0 for phase B.
fn rmt_word(symbol: &Symbol) -> u32 {
    let a = u32::from(symbol.phase_a_us) & 0x7FFF;
    let b = u32::from(symbol.phase_b_us) & 0x7FFF;
    a | (1 << 15) | (b << 16)
}

unsafe extern "C" fn on_trans_done(
    _channel: rmt_channel_handle_t,
    _event: *const rmt_tx_done_event_data_t,
    ctx: *mut c_void,
) -> bool {
    let shared = &*(ctx as *const Shared);
    shared.push_stamp(esp_timer_get_time() as u32);
    let _ = shared
        .pending
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    if let Some(callback) = shared.on_done {
        callback();
    }
    // Any yield is done by the callback itself
    false
}
