//! # treadmill-io
//!
//! In-line intercept daemon for a treadmill's RS-485 serial bus. The
//! board sits on a cut wire between the treadmill's console and its
//! motor controller and either:
//!
//! - **proxies**: forwards console commands to the motor byte-for-byte, or
//! - **emulates**: replaces the console entirely, synthesizing the full
//!   wire-level command cycle from software set-points.
//!
//! Local client processes drive the daemon and consume parsed bus events
//! as newline-delimited JSON over a Unix socket.
//!
//! ## Features
//!
//! - **Hardware abstraction**: the [`GpioPort`] trait covers the
//!   bit-banged serial receiver and the DMA waveform transmitter, with a
//!   recording mock for desktop testing and libpigpio bindings behind the
//!   `pigpio` feature
//! - **Single mode authority**: proxy/emulate transitions, set-point
//!   clamping, and zero-on-emulate-entry live in one state machine
//! - **Safety watchdogs**: client-present and heartbeat watchdogs drop
//!   emulation back to proxy; a 3-hour cut-off zeroes the set-points
//! - **Bounded fan-out**: a fixed ring of pre-serialized events keeps
//!   slow clients from ever blocking the serial threads
//!
//! ## Architecture
//!
//! The crate is structured so everything runs on a desktop against mocks:
//!
//! - `traits` / `hal` - the hardware seam and its implementations
//! - `wire` - parser/builder for the `[key:value]` bus framing
//! - `mode` - the proxy/emulate state machine
//! - `ring` - the bounded event queue
//! - `serial` - bit-banged reader and inverted-UART waveform writer
//! - `emulation` - the synthesized 14-field console cycle
//! - `messages` / `services` - the JSON control plane
//! - `controller` - wiring, threads, and watchdogs
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use treadmill_io::{config::GpioConfig, hal::MockGpio, Controller};
//!
//! let gpio = Arc::new(MockGpio::new());
//! let cfg = GpioConfig {
//!     console_read: 23,
//!     motor_write: 18,
//!     motor_read: 24,
//! };
//!
//! let socket = std::env::temp_dir().join("treadmill_doc_example.sock");
//! let mut controller = Controller::new(Arc::clone(&gpio), cfg).with_socket_path(socket);
//! controller.start().unwrap();
//!
//! // Set-points imply emulation: the cycle starts on its own thread
//! controller.mode().set_speed(12);
//! assert!(controller.mode().is_emulating());
//!
//! controller.stop();
//! ```

#![warn(missing_docs)]

/// GPIO pin configuration loader.
pub mod config;
/// Top-level wiring: threads, callbacks, and watchdogs.
pub mod controller;
/// The synthesized console command cycle.
pub mod emulation;
/// Concrete GPIO port implementations (mock, libpigpio).
pub mod hal;
/// Typed control-plane commands and events.
pub mod messages;
/// The proxy/emulate mode state machine.
pub mod mode;
/// Bounded, overwriting event fan-out queue.
pub mod ring;
/// Bit-banged serial reader and writer.
pub mod serial;
/// Socket-facing services (control plane).
pub mod services;
/// Hardware abstraction traits.
pub mod traits;
/// Wire protocol parser and numeric codecs.
pub mod wire;

// Re-exports for convenience
pub use config::{load_config, parse_config, ConfigError, GpioConfig};
pub use controller::{Controller, StartError, HEARTBEAT_TIMEOUT};
pub use emulation::{EmulationDriver, SAFETY_TIMEOUT};
pub use messages::{parse_command, Command, Event, Source};
pub use mode::{Mode, ModeMachine, ModeSnapshot, TransitionResult, MAX_INCLINE, MAX_SPEED_TENTHS};
pub use ring::{EventRing, RingSnapshot, RING_MSG_SIZE, RING_SLOTS};
pub use serial::{SerialReader, SerialWriter};
pub use services::control::{ControlServer, MAX_CLIENTS, SOCKET_PATH};
pub use traits::gpio::{GpioPort, PinMode, Pulse, WaveId, BAUD, BIT_US};
pub use wire::{
    build_kv, decode_incline_hex, decode_speed_hex, encode_incline_hex, encode_speed_hex,
    parse_kv, KvPair,
};
