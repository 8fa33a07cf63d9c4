//! Cutout alarm on a timer group timer.
//!
//! The alarm interrupt walks the [`AlarmChain`] itself: it switches the
//! cutout line and programs the following deadline before returning, so line
//! edges never wait for the owning task. Chain, fired steps and line live
//! behind an [`IsrCriticalSection`] shared by the task and the interrupt.

use core::cell::UnsafeCell;

use esp_idf_hal::interrupt::IsrCriticalSection;
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::sys::{
    esp_timer_get_time, timer_group_enable_alarm_in_isr, timer_group_get_counter_value_in_isr,
    timer_group_set_alarm_value_in_isr, timer_group_t, timer_idx_t, EspError,
    ESP_ERR_INVALID_STATE,
};
use esp_idf_hal::timer::{config::Config as TimerConfig, Timer, TimerDriver};
use heapless::Deque;

use crate::cutout::{AlarmChain, StepFired};
use crate::traits::{AlarmTimer, IsrCallback, LineHandle};

/// APB clock divider for one tick per microsecond.
const DIVIDER: u32 = 80;

/// Fired steps held for the task, one chain's worth plus slack.
const FIRED_DEPTH: usize = 4;

struct IsrState {
    chain: AlarmChain,
    fired: Deque<StepFired, FIRED_DEPTH>,
    line: Option<LineHandle>,
    on_alarm: Option<IsrCallback>,
}

struct AlarmIsr {
    lock: IsrCriticalSection,
    group: timer_group_t,
    index: timer_idx_t,
    state: UnsafeCell<IsrState>,
}

impl AlarmIsr {
    fn with<R>(&self, f: impl FnOnce(&mut IsrState) -> R) -> R {
        let _guard = self.lock.enter();
        // Every access goes through the lock
        f(unsafe { &mut *self.state.get() })
    }

    fn on_interrupt(&self) {
        let (group, index) = (self.group, self.index);
        let callback = self.with(|state| {
            let IsrState {
                chain,
                fired,
                line,
                on_alarm,
            } = state;
            let Some(line) = line.as_deref() else {
                return None;
            };
            // Also runs steps whose deadline passed while this one was handled
            loop {
                let now = unsafe { timer_group_get_counter_value_in_isr(group, index) };
                let step = chain.fire(now, line, |at| {
                    unsafe {
                        timer_group_set_alarm_value_in_isr(group, index, at);
                        timer_group_enable_alarm_in_isr(group, index);
                    }
                    Ok::<(), EspError>(())
                });
                match step {
                    Some(step) => {
                        let _ = fired.push_back(step);
                    }
                    None => break,
                }
            }
            *on_alarm
        });
        if let Some(callback) = callback {
            callback();
        }
    }
}

// Moves the interrupt context pointer into the subscribed closure.
struct IsrRef(*const AlarmIsr);

unsafe impl Send for IsrRef {}

impl IsrRef {
    fn fire(&self) {
        unsafe { (*self.0).on_interrupt() }
    }
}

/// One-shot alarms on a 1 MHz timer group counter.
///
/// The counter is loaded with `esp_timer_get_time()` on
/// [`start`](AlarmTimer::start), so deadlines share a time base with the
/// channel's completion stamps.
///
/// # Example
///
/// ```ignore
/// use dcc_track::hal::esp32::Esp32Alarm;
///
/// let peripherals = Peripherals::take()?;
/// let alarm = Esp32Alarm::new(peripherals.timer00)?;
/// ```
pub struct Esp32Alarm<'d> {
    driver: TimerDriver<'d>,
    // Boxed so the interrupt context pointer survives moves
    isr: Box<AlarmIsr>,
    running: bool,
}

// The interrupt only reaches `isr` through its lock.
unsafe impl Send for Esp32Alarm<'_> {}

impl<'d> Esp32Alarm<'d> {
    /// Claims `timer` with a non-reloading 1 MHz counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer driver cannot be installed.
    pub fn new<T: Timer>(timer: impl Peripheral<P = T> + 'd) -> Result<Self, EspError> {
        let config = TimerConfig::new().divider(DIVIDER).auto_reload(false);
        let driver = TimerDriver::new(timer, &config)?;
        Ok(Self {
            driver,
            isr: Box::new(AlarmIsr {
                lock: IsrCriticalSection::new(),
                group: T::group(),
                index: T::index(),
                state: UnsafeCell::new(IsrState {
                    chain: AlarmChain::default(),
                    fired: Deque::new(),
                    line: None,
                    on_alarm: None,
                }),
            }),
            running: false,
        })
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running
    }

    fn stopped() -> EspError {
        EspError::from_infallible::<ESP_ERR_INVALID_STATE>()
    }
}

impl AlarmTimer for Esp32Alarm<'_> {
    type Error = EspError;

    fn start(&mut self, on_alarm: Option<IsrCallback>, line: LineHandle) -> Result<(), EspError> {
        self.stop()?;
        self.isr.with(|state| {
            state.chain.clear();
            state.fired.clear();
            state.line = Some(line);
            state.on_alarm = on_alarm;
        });

        let isr = IsrRef(&*self.isr);
        // `isr` outlives the subscription: stop and drop unsubscribe first
        unsafe { self.driver.subscribe(move || isr.fire())? };
        self.driver.set_counter(unsafe { esp_timer_get_time() } as u64)?;
        self.driver.enable_interrupt()?;
        self.driver.enable(true)?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EspError> {
        self.running = false;
        self.driver.enable_alarm(false)?;
        self.driver.disable_interrupt()?;
        self.driver.enable(false)?;
        self.driver.unsubscribe()?;
        self.isr.with(|state| {
            state.chain.clear();
            state.line = None;
            state.on_alarm = None;
        });
        Ok(())
    }

    fn now_us(&self) -> u64 {
        self.driver.counter().unwrap_or_default()
    }

    fn schedule(&mut self, chain: AlarmChain) -> Result<(), EspError> {
        if !self.running {
            return Err(Self::stopped());
        }
        self.driver.enable_alarm(false)?;
        let first = chain.next_deadline();
        self.isr.with(|state| state.chain = chain);
        if let Some(at) = first {
            self.driver.set_alarm(at)?;
            self.driver.enable_alarm(true)?;
        }
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), EspError> {
        self.driver.enable_alarm(false)?;
        self.isr.with(|state| state.chain.clear());
        Ok(())
    }

    fn pending(&self) -> bool {
        self.isr.with(|state| state.chain.is_pending())
    }

    fn take_fired(&mut self) -> Option<StepFired> {
        self.isr.with(|state| state.fired.pop_front())
    }
}

impl Drop for Esp32Alarm<'_> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
