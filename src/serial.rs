//! Bit-banged serial reader and writer over a [`GpioPort`].
//!
//! [`SerialReader`] polls one input pin, hands the raw bytes to a
//! low-latency callback (the proxy forwarding path), then runs the wire
//! parser over an internal reassembly buffer and delivers each parsed
//! field to a second callback.
//!
//! [`SerialWriter`] turns byte sequences into inverted-UART DMA pulse
//! trains on one output pin. It is shared by the proxy path and the
//! emulation driver, so transmissions are serialized by an internal
//! mutex; the pulse scratch vector lives under the same mutex and is
//! reused across writes.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::traits::gpio::{GpioPort, Pulse, BAUD, BIT_US};
use crate::wire::{self, KvPair};

/// Bytes drained from the port per poll.
const READ_CHUNK: usize = 512;

/// Reassembly buffer size; older partial frames win over fresh overflow.
const PARSE_BUF_SIZE: usize = 4096;

/// Most fields one poll will deliver.
const MAX_PAIRS_PER_POLL: usize = 32;

/// Callback receiving the raw bytes of one poll, before parsing.
pub type RawCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Callback receiving each parsed `[key:value]` field.
pub type KvCallback = Box<dyn FnMut(&KvPair) + Send>;

/// Polled reader of one serial input pin. See the [module docs](self).
pub struct SerialReader<P: GpioPort> {
    port: Arc<P>,
    pin: u32,
    parse_buf: Vec<u8>,
    opened: bool,
    raw_cb: Option<RawCallback>,
    kv_cb: Option<KvCallback>,
}

impl<P: GpioPort> SerialReader<P> {
    /// Create a reader for `pin`. Call [`open`](Self::open) before
    /// polling.
    pub fn new(port: Arc<P>, pin: u32) -> Self {
        Self {
            port,
            pin,
            parse_buf: Vec::with_capacity(PARSE_BUF_SIZE),
            opened: false,
            raw_cb: None,
            kv_cb: None,
        }
    }

    /// Set the raw-bytes callback (fired before parsing, for the
    /// lowest-latency forwarding path).
    pub fn on_raw(&mut self, cb: RawCallback) {
        self.raw_cb = Some(cb);
    }

    /// Set the parsed-field callback.
    pub fn on_kv(&mut self, cb: KvCallback) {
        self.kv_cb = Some(cb);
    }

    /// Open the bit-banged receiver: 9600 baud, 8 data bits, inverted
    /// polarity (the bus idles low).
    pub fn open(&mut self) -> Result<(), P::Error> {
        self.port.serial_read_open(self.pin, BAUD, 8)?;
        self.port.serial_read_invert(self.pin, true);
        self.opened = true;
        Ok(())
    }

    /// Drain pending bytes, fire callbacks, and return the raw byte
    /// count. `0` means nothing arrived and the caller should back off.
    pub fn poll(&mut self) -> usize {
        let mut raw = [0u8; READ_CHUNK];
        let count = self.port.serial_read(self.pin, &mut raw);
        if count == 0 {
            return 0;
        }
        let fresh = &raw[..count];

        if let Some(cb) = self.raw_cb.as_mut() {
            cb(fresh);
        }

        // Append to the reassembly buffer; on overflow drop the newest
        // bytes so an in-progress frame at the front stays intact.
        let space = PARSE_BUF_SIZE - self.parse_buf.len();
        let take = fresh.len().min(space);
        if take < fresh.len() {
            warn!(
                "serial pin {}: parse buffer full, dropping {} bytes",
                self.pin,
                fresh.len() - take
            );
        }
        self.parse_buf.extend_from_slice(&fresh[..take]);

        let (pairs, consumed) = wire::parse_kv(&self.parse_buf, MAX_PAIRS_PER_POLL);
        if let Some(cb) = self.kv_cb.as_mut() {
            for pair in &pairs {
                cb(pair);
            }
        }
        self.parse_buf.drain(..consumed);

        count
    }
}

impl<P: GpioPort> Drop for SerialReader<P> {
    fn drop(&mut self) {
        if self.opened {
            self.port.serial_read_close(self.pin);
        }
    }
}

/// Thread-safe inverted-UART transmitter on one output pin.
///
/// Each byte becomes 10 pulses of 104 us: a HIGH start bit, the data bits
/// LSB first with logical 1 driven LOW, and a LOW stop bit. That is the
/// electrical inverse of standard 8N1, matching the bus's idle-low line.
pub struct SerialWriter<P: GpioPort> {
    port: Arc<P>,
    pin: u32,
    // Scratch pulse vector, reused across writes under the lock.
    scratch: Mutex<Vec<Pulse>>,
}

impl<P: GpioPort> SerialWriter<P> {
    /// Create a writer for `pin`.
    pub fn new(port: Arc<P>, pin: u32) -> Self {
        Self {
            port,
            pin,
            scratch: Mutex::new(Vec::new()),
        }
    }

    /// Transmit `data` as one contiguous waveform. Blocks (with 1 ms
    /// sleeps) while a previous transmission is still on the wire, then
    /// again until this one completes.
    pub fn write_bytes(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut pulses = self.scratch.lock().unwrap();
        pulses.clear();
        pulses.reserve(data.len() * 10);

        for &byte in data {
            pulses.push(Pulse::high(self.pin, BIT_US)); // start bit
            for bit in 0..8 {
                if (byte >> bit) & 1 == 1 {
                    pulses.push(Pulse::low(self.pin, BIT_US));
                } else {
                    pulses.push(Pulse::high(self.pin, BIT_US));
                }
            }
            pulses.push(Pulse::low(self.pin, BIT_US)); // stop bit
        }

        while self.port.wave_tx_busy() {
            thread::sleep(Duration::from_millis(1));
        }

        self.port.wave_clear();
        self.port.wave_add_generic(&pulses);
        match self.port.wave_create() {
            Ok(wave) => {
                self.port.wave_tx_send(wave);
                while self.port.wave_tx_busy() {
                    thread::sleep(Duration::from_millis(1));
                }
                self.port.wave_delete(wave);
            }
            Err(e) => warn!("serial pin {}: wave create failed: {}", self.pin, e),
        }
    }

    /// Build a framed field (terminator included) and transmit it.
    pub fn write_kv(&self, key: &str, value: &str) {
        self.write_bytes(&wire::build_kv(key, value));
    }
}
