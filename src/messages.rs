//! Typed control-plane commands and events (serde-based).
//!
//! The control socket speaks newline-delimited JSON in both directions.
//! Inbound lines deserialize into [`Command`]; outbound events serialize
//! from [`Event`] with a trailing newline. Anything malformed, unknown,
//! or oversized is rejected silently: the bus keeps running and the
//! client keeps its connection.
//!
//! # Example
//!
//! ```rust
//! use treadmill_io::messages::{parse_command, Command, Event, Source};
//!
//! let cmd = parse_command(br#"{"cmd":"speed","value":1.2}"#).unwrap();
//! assert_eq!(cmd, Command::Speed { value: 1.2 });
//!
//! let line = Event::Kv {
//!     ts: 1.5,
//!     source: Source::Console,
//!     key: "hmph".into(),
//!     value: "78".into(),
//! }
//! .to_line();
//! assert_eq!(
//!     line,
//!     br#"{"type":"kv","ts":1.5,"source":"console","key":"hmph","value":"78"}
//! "#
//! );
//! ```

use serde::{Deserialize, Serialize};

/// Longest accepted command line in bytes.
pub const MAX_COMMAND_LEN: usize = 1024;

/// One inbound control command.
///
/// `speed` and `incline` imply emulation: dispatching either while not
/// Emulating arms it first (see [`ModeMachine`](crate::mode::ModeMachine)).
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Command {
    /// Set the belt speed in mph: `{"cmd":"speed","value":1.2}`.
    Speed {
        /// Target speed in mph.
        value: f64,
    },
    /// Set the incline in whole percent: `{"cmd":"incline","value":7}`.
    Incline {
        /// Target incline in percent (fractions are truncated).
        value: f64,
    },
    /// Enable or disable emulate mode.
    Emulate {
        /// `true` arms the synthesized cycle at zero set-points.
        enabled: bool,
    },
    /// Enable or disable proxy mode.
    Proxy {
        /// `true` forwards console traffic; `false` goes idle.
        enabled: bool,
    },
    /// Request an immediate status event.
    Status,
    /// Keep-alive; refreshes the watchdog timestamp and nothing else.
    Heartbeat,
    /// Ask the daemon to shut down cleanly.
    Quit,
}

/// Where a bus field was observed.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Parsed from the physical console's output.
    Console,
    /// Parsed from the motor controller's replies.
    Motor,
    /// Synthesized by the emulation cycle.
    Emulate,
}

/// One outbound event, serialized as a single JSON line.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    /// A `[key:value]` field seen on (or written to) the bus.
    Kv {
        /// Seconds since daemon start.
        ts: f64,
        /// Which side of the bus produced it.
        source: Source,
        /// Field key.
        key: String,
        /// Field value (empty for bare fields).
        value: String,
    },
    /// Daemon state summary.
    Status {
        /// Proxy mode active.
        proxy: bool,
        /// Emulate mode active.
        emulate: bool,
        /// Emulation speed set-point in tenths of mph.
        emu_speed: i32,
        /// Emulation incline set-point in percent.
        emu_incline: i32,
        /// Total bytes seen from the console.
        console_bytes: u32,
        /// Total bytes seen from the motor.
        motor_bytes: u32,
    },
    /// Something the client should know about.
    Error {
        /// Human-readable description.
        msg: String,
    },
}

impl Event {
    /// Serialize to a JSON line with trailing newline.
    pub fn to_line(&self) -> Vec<u8> {
        // Serializing these variants cannot fail; an empty line would
        // only ever surface a serde_json regression.
        let mut line = serde_json::to_vec(self).unwrap_or_default();
        line.push(b'\n');
        line
    }
}

/// Parse one newline-stripped command line. Returns `None` (silent
/// rejection) for empty, oversized, malformed, or unknown input.
pub fn parse_command(line: &[u8]) -> Option<Command> {
    if line.is_empty() || line.len() > MAX_COMMAND_LEN {
        return None;
    }
    serde_json::from_slice(line).ok()
}
