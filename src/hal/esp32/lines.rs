//! Booster control lines on typed GPIO output drivers.
//!
//! The pins are claimed as [`PinDriver`] outputs when [`Esp32Pins`] is built.
//! Level changes then go to `gpio_set_level` on the driver's pin number: a
//! single register write that is safe from the alarm interrupt, which lets
//! every [`TrackPins`] method take `&self`.

use esp_idf_hal::gpio::{Output, OutputPin, PinDriver};
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::sys::{esp, gpio_set_level, EspError};

use crate::traits::TrackPins;

/// Enable, force-low and cutout outputs.
///
/// # Wiring
///
/// - enable → booster EN (active high)
/// - force_low → booster low-side clamp (high clamps the rails)
/// - cutout → BiDi enable (high while decoders may answer)
///
/// # Example
///
/// ```ignore
/// use dcc_track::hal::esp32::Esp32Pins;
/// use dcc_track::traits::TrackPins;
///
/// let peripherals = Peripherals::take()?;
/// let pins = Esp32Pins::new(
///     peripherals.pins.gpio12, // enable
///     peripherals.pins.gpio9,  // force-low
///     peripherals.pins.gpio13, // cutout
/// )?;
/// pins.configure()?;
/// pins.set_enable(true);
/// ```
pub struct Esp32Pins<'d, EN, FL, CO>
where
    EN: OutputPin,
    FL: OutputPin,
    CO: OutputPin,
{
    enable: PinDriver<'d, EN, Output>,
    force_low: PinDriver<'d, FL, Output>,
    cutout: PinDriver<'d, CO, Output>,
}

impl<'d, EN, FL, CO> Esp32Pins<'d, EN, FL, CO>
where
    EN: OutputPin,
    FL: OutputPin,
    CO: OutputPin,
{
    /// Claims the three pins as push-pull outputs.
    ///
    /// # Errors
    ///
    /// Returns an error if a pin cannot be switched to output mode.
    pub fn new(
        enable: impl Peripheral<P = EN> + 'd,
        force_low: impl Peripheral<P = FL> + 'd,
        cutout: impl Peripheral<P = CO> + 'd,
    ) -> Result<Self, EspError> {
        let pins = Self {
            enable: PinDriver::output(enable)?,
            force_low: PinDriver::output(force_low)?,
            cutout: PinDriver::output(cutout)?,
        };
        pins.safe_levels()?;
        Ok(pins)
    }

    /// GPIO numbers as (enable, force-low, cutout).
    pub fn gpio_numbers(&self) -> (i32, i32, i32) {
        (self.enable.pin(), self.force_low.pin(), self.cutout.pin())
    }

    // Booster off with the rails clamped.
    fn safe_levels(&self) -> Result<(), EspError> {
        esp!(unsafe { gpio_set_level(self.cutout.pin(), 0) })?;
        esp!(unsafe { gpio_set_level(self.force_low.pin(), 1) })?;
        esp!(unsafe { gpio_set_level(self.enable.pin(), 0) })?;
        Ok(())
    }

    fn write(pin: i32, on: bool) {
        // Only fails for an invalid pin number, which the driver ruled out
        let _ = unsafe { gpio_set_level(pin, u32::from(on)) };
    }
}

impl<EN, FL, CO> TrackPins for Esp32Pins<'_, EN, FL, CO>
where
    EN: OutputPin,
    FL: OutputPin,
    CO: OutputPin,
{
    type Error = EspError;

    fn configure(&self) -> Result<(), EspError> {
        self.safe_levels()
    }

    fn release(&self) -> Result<(), EspError> {
        self.safe_levels()
    }

    fn set_enable(&self, on: bool) {
        Self::write(self.enable.pin(), on);
    }

    fn set_force_low(&self, on: bool) {
        Self::write(self.force_low.pin(), on);
    }

    fn set_cutout(&self, on: bool) {
        Self::write(self.cutout.pin(), on);
    }
}
