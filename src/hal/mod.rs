//! Concrete [`GpioPort`](crate::traits::GpioPort) implementations.
//!
//! - [`MockGpio`]: recording test double, always available
//! - [`PigpioPort`]: libpigpio bindings (feature `pigpio`)

pub mod mock;

#[cfg(feature = "pigpio")]
pub mod pigpio;

pub use mock::{MockGpio, WaveRecord};

#[cfg(feature = "pigpio")]
pub use pigpio::{PigpioError, PigpioPort};
