//! GPIO port abstraction for the bit-banged serial bus.
//!
//! This module defines the capability set the daemon needs from the GPIO
//! peripheral: pin setup, a bit-banged serial read primitive, and a
//! DMA-timed pulse-train transmitter. Implementations:
//!
//! | Implementation | Purpose |
//! |----------------|---------|
//! | [`MockGpio`] | Recording test double with per-pin read injection |
//! | `PigpioPort` | Direct libpigpio bindings (requires the `pigpio` feature) |
//!
//! All methods take `&self`: the port is shared between the reader threads
//! and the writer, so implementations provide their own interior
//! synchronisation (libpigpio is process-global; the mock uses a mutex).
//!
//! [`MockGpio`]: crate::hal::MockGpio

use core::fmt;

/// Bus baud rate. Both directions of the treadmill bus run at 9600.
pub const BAUD: u32 = 9600;

/// Microseconds per bit at [`BAUD`] (~104 us).
pub const BIT_US: u32 = 1_000_000 / BAUD;

/// Highest valid BCM GPIO number.
pub const MAX_GPIO: u32 = 53;

/// Direction of a GPIO pin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinMode {
    /// High-impedance input.
    Input,
    /// Driven output.
    Output,
}

/// One step of a DMA waveform: set the `gpio_on` bits, clear the
/// `gpio_off` bits, then hold for `us_delay` microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pulse {
    /// Bitmask of GPIOs to drive high.
    pub gpio_on: u32,
    /// Bitmask of GPIOs to drive low.
    pub gpio_off: u32,
    /// Hold time in microseconds.
    pub us_delay: u32,
}

impl Pulse {
    /// Pulse driving `pin` high for `us` microseconds.
    pub const fn high(pin: u32, us: u32) -> Self {
        Self {
            gpio_on: 1 << pin,
            gpio_off: 0,
            us_delay: us,
        }
    }

    /// Pulse driving `pin` low for `us` microseconds.
    pub const fn low(pin: u32, us: u32) -> Self {
        Self {
            gpio_on: 0,
            gpio_off: 1 << pin,
            us_delay: us,
        }
    }
}

/// Handle for a created waveform, valid until `wave_delete`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaveId(pub i32);

impl fmt::Display for WaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability interface over the GPIO peripheral.
///
/// Mirrors the subset of the underlying C library the daemon uses. The
/// serial-read block implements a polled bit-banged UART receiver on an
/// input pin; the wave block queues microsecond-timed pulse trains on
/// output pins (the transmit half of the inverted bus).
///
/// # Implementation notes
///
/// - `serial_read` must never block; it drains whatever the receiver has
///   buffered and returns `0` when idle.
/// - `wave_tx_send` starts a one-shot transmission; callers poll
///   `wave_tx_busy` to wait for completion before deleting the wave.
pub trait GpioPort: Send + Sync {
    /// Error type for fallible port operations.
    type Error: fmt::Debug + fmt::Display;

    /// Initialise the GPIO system. Must be called before any other method.
    fn initialise(&self) -> Result<(), Self::Error>;

    /// Release the GPIO system.
    fn terminate(&self);

    /// Configure a pin as input or output.
    fn set_mode(&self, pin: u32, mode: PinMode);

    /// Drive an output pin high (`true`) or low (`false`).
    fn write(&self, pin: u32, level: bool);

    /// Open a bit-banged serial receiver on an input pin.
    fn serial_read_open(&self, pin: u32, baud: u32, data_bits: u32) -> Result<(), Self::Error>;

    /// Invert the receiver's polarity (the treadmill line idles low).
    fn serial_read_invert(&self, pin: u32, invert: bool);

    /// Drain buffered receive bytes into `buf`. Returns the byte count,
    /// `0` when nothing is pending.
    fn serial_read(&self, pin: u32, buf: &mut [u8]) -> usize;

    /// Close the serial receiver on a pin.
    fn serial_read_close(&self, pin: u32);

    /// Whether a waveform transmission is in progress.
    fn wave_tx_busy(&self) -> bool;

    /// Discard all queued waveform data.
    fn wave_clear(&self);

    /// Append pulses to the waveform under construction.
    fn wave_add_generic(&self, pulses: &[Pulse]);

    /// Finalise the pending pulses into a transmittable wave.
    fn wave_create(&self) -> Result<WaveId, Self::Error>;

    /// Transmit a created wave once.
    fn wave_tx_send(&self, wave: WaveId);

    /// Delete a wave, freeing its DMA resources.
    fn wave_delete(&self, wave: WaveId);
}
