//! GPIO pin configuration loader.
//!
//! The daemon needs exactly three pin numbers, read at startup from a
//! small JSON document (`gpio.json` by default):
//!
//! ```json
//! {
//!     "console_read": { "gpio": 23 },
//!     "motor_write":  { "gpio": 18 },
//!     "motor_read":   { "gpio": 24 }
//! }
//! ```
//!
//! Every entry is required and must name a BCM GPIO in `0..=53`; anything
//! missing or out of range is a startup-fatal [`ConfigError`].
//!
//! # Example
//!
//! ```rust
//! use treadmill_io::config::parse_config;
//!
//! let cfg = parse_config(
//!     r#"{"console_read":{"gpio":23},"motor_write":{"gpio":18},"motor_read":{"gpio":24}}"#,
//! )
//! .unwrap();
//! assert_eq!(cfg.console_read, 23);
//! assert_eq!(cfg.motor_write, 18);
//! assert_eq!(cfg.motor_read, 24);
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::traits::gpio::MAX_GPIO;

/// Largest accepted config file, in bytes.
pub const MAX_CONFIG_SIZE: usize = 4096;

/// Why the configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read at all.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Path that failed to open.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The document is larger than [`MAX_CONFIG_SIZE`].
    #[error("config exceeds maximum size of {MAX_CONFIG_SIZE} bytes")]
    TooLarge,
    /// The document is not valid JSON of the expected shape.
    #[error("invalid config: {0}")]
    Invalid(#[from] serde_json::Error),
    /// A pin number is outside `0..=53`.
    #[error("gpio {gpio} out of range [0-{MAX_GPIO}] in \"{section}\"")]
    PinOutOfRange {
        /// Offending section name.
        section: &'static str,
        /// Offending pin number.
        gpio: i64,
    },
}

#[derive(Deserialize)]
struct PinEntry {
    gpio: i64,
}

#[derive(Deserialize)]
struct RawConfig {
    console_read: PinEntry,
    motor_write: PinEntry,
    motor_read: PinEntry,
}

/// Validated pin assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpioConfig {
    /// Input pin tapping the console's transmit wire.
    pub console_read: u32,
    /// Output pin driving the motor's receive wire.
    pub motor_write: u32,
    /// Input pin tapping the motor's transmit wire.
    pub motor_read: u32,
}

fn check_pin(section: &'static str, entry: &PinEntry) -> Result<u32, ConfigError> {
    if entry.gpio < 0 || entry.gpio > MAX_GPIO as i64 {
        return Err(ConfigError::PinOutOfRange {
            section,
            gpio: entry.gpio,
        });
    }
    Ok(entry.gpio as u32)
}

/// Parse and validate a config document. Pure function, no I/O.
pub fn parse_config(json: &str) -> Result<GpioConfig, ConfigError> {
    if json.len() > MAX_CONFIG_SIZE {
        return Err(ConfigError::TooLarge);
    }
    let raw: RawConfig = serde_json::from_str(json)?;
    Ok(GpioConfig {
        console_read: check_pin("console_read", &raw.console_read)?,
        motor_write: check_pin("motor_write", &raw.motor_write)?,
        motor_read: check_pin("motor_read", &raw.motor_read)?,
    })
}

/// Load and validate a config file. Thin I/O wrapper over
/// [`parse_config`].
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<GpioConfig, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&text)
}
