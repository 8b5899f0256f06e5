//! Direct libpigpio bindings for the real GPIO peripheral.
//!
//! Thin zero-overhead wrappers: every [`GpioPort`] method is one call into
//! the pigpio C API. Only compiled with the `pigpio` feature, which links
//! `libpigpio`; the binary then needs root and requires that no pigpiod
//! daemon is holding the peripheral.

use std::os::raw::{c_int, c_uint, c_void};

use thiserror::Error;

use crate::traits::gpio::{GpioPort, PinMode, Pulse, WaveId};

/// Failure reported by the pigpio library (its APIs return negative
/// status codes).
#[derive(Debug, Error)]
pub enum PigpioError {
    /// `gpioInitialise` refused, usually because pigpiod is running or
    /// the process lacks the privilege to map the peripheral.
    #[error("gpioInitialise failed (code {0}); is pigpiod running?")]
    Init(i32),
    /// Opening the bit-banged serial receiver failed.
    #[error("gpioSerialReadOpen failed on pin {pin} (code {code})")]
    SerialOpen {
        /// Pin the open targeted.
        pin: u32,
        /// pigpio status code.
        code: i32,
    },
    /// Creating a waveform out of the queued pulses failed.
    #[error("gpioWaveCreate failed (code {0})")]
    WaveCreate(i32),
}

// Matches pigpio's gpioPulse_t layout.
#[repr(C)]
struct RawPulse {
    gpio_on: u32,
    gpio_off: u32,
    us_delay: u32,
}

const PI_INPUT: c_uint = 0;
const PI_OUTPUT: c_uint = 1;
const PI_WAVE_MODE_ONE_SHOT: c_uint = 0;

#[link(name = "pigpio")]
extern "C" {
    fn gpioInitialise() -> c_int;
    fn gpioTerminate();
    fn gpioSetMode(gpio: c_uint, mode: c_uint) -> c_int;
    fn gpioWrite(gpio: c_uint, level: c_uint) -> c_int;
    fn gpioSerialReadOpen(gpio: c_uint, baud: c_uint, data_bits: c_uint) -> c_int;
    fn gpioSerialReadInvert(gpio: c_uint, invert: c_uint) -> c_int;
    fn gpioSerialRead(gpio: c_uint, buf: *mut c_void, buf_size: usize) -> c_int;
    fn gpioSerialReadClose(gpio: c_uint) -> c_int;
    fn gpioWaveTxBusy() -> c_int;
    fn gpioWaveClear() -> c_int;
    fn gpioWaveAddGeneric(num_pulses: c_uint, pulses: *mut RawPulse) -> c_int;
    fn gpioWaveCreate() -> c_int;
    fn gpioWaveTxSend(wave_id: c_uint, wave_mode: c_uint) -> c_int;
    fn gpioWaveDelete(wave_id: c_uint) -> c_int;
}

/// [`GpioPort`] backed by libpigpio. The library is process-global, so
/// this type is a zero-sized handle; pigpio performs its own internal
/// locking for the wave and serial APIs.
pub struct PigpioPort;

impl PigpioPort {
    /// Create the (stateless) port handle. Call
    /// [`initialise`](GpioPort::initialise) before anything else.
    pub fn new() -> Self {
        Self
    }
}

impl Default for PigpioPort {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioPort for PigpioPort {
    type Error = PigpioError;

    fn initialise(&self) -> Result<(), PigpioError> {
        let rc = unsafe { gpioInitialise() };
        if rc < 0 {
            return Err(PigpioError::Init(rc));
        }
        Ok(())
    }

    fn terminate(&self) {
        unsafe { gpioTerminate() };
    }

    fn set_mode(&self, pin: u32, mode: PinMode) {
        let raw = match mode {
            PinMode::Input => PI_INPUT,
            PinMode::Output => PI_OUTPUT,
        };
        unsafe { gpioSetMode(pin, raw) };
    }

    fn write(&self, pin: u32, level: bool) {
        unsafe { gpioWrite(pin, level as c_uint) };
    }

    fn serial_read_open(&self, pin: u32, baud: u32, data_bits: u32) -> Result<(), PigpioError> {
        let rc = unsafe { gpioSerialReadOpen(pin, baud, data_bits) };
        if rc < 0 {
            return Err(PigpioError::SerialOpen { pin, code: rc });
        }
        Ok(())
    }

    fn serial_read_invert(&self, pin: u32, invert: bool) {
        unsafe { gpioSerialReadInvert(pin, invert as c_uint) };
    }

    fn serial_read(&self, pin: u32, buf: &mut [u8]) -> usize {
        let rc = unsafe { gpioSerialRead(pin, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if rc < 0 {
            return 0;
        }
        rc as usize
    }

    fn serial_read_close(&self, pin: u32) {
        unsafe { gpioSerialReadClose(pin) };
    }

    fn wave_tx_busy(&self) -> bool {
        unsafe { gpioWaveTxBusy() > 0 }
    }

    fn wave_clear(&self) {
        unsafe { gpioWaveClear() };
    }

    fn wave_add_generic(&self, pulses: &[Pulse]) {
        // Pulse and RawPulse are field-for-field identical; build the C
        // array on the stack of this call only.
        let mut raw: Vec<RawPulse> = pulses
            .iter()
            .map(|p| RawPulse {
                gpio_on: p.gpio_on,
                gpio_off: p.gpio_off,
                us_delay: p.us_delay,
            })
            .collect();
        unsafe { gpioWaveAddGeneric(raw.len() as c_uint, raw.as_mut_ptr()) };
    }

    fn wave_create(&self) -> Result<WaveId, PigpioError> {
        let rc = unsafe { gpioWaveCreate() };
        if rc < 0 {
            return Err(PigpioError::WaveCreate(rc));
        }
        Ok(WaveId(rc))
    }

    fn wave_tx_send(&self, wave: WaveId) {
        unsafe { gpioWaveTxSend(wave.0 as c_uint, PI_WAVE_MODE_ONE_SHOT) };
    }

    fn wave_delete(&self, wave: WaveId) {
        unsafe { gpioWaveDelete(wave.0 as c_uint) };
    }
}
