//! Recording GPIO mock for testing without hardware.
//!
//! [`MockGpio`] implements [`GpioPort`] entirely in memory:
//!
//! - serial reads are fed from **per-pin** injection queues, so a test can
//!   target the console reader and the motor reader independently,
//! - transmitted waveforms are decoded back from inverted-UART pulses
//!   into the original bytes and recorded per transmission,
//! - pin modes, levels, and serial-open state are tracked for assertions.
//!
//! # Example
//!
//! ```rust
//! use treadmill_io::hal::MockGpio;
//! use treadmill_io::traits::GpioPort;
//!
//! let gpio = MockGpio::new();
//! gpio.inject_serial(23, b"[hmph:78]\xff");
//!
//! let mut buf = [0u8; 512];
//! let n = gpio.serial_read(23, &mut buf);
//! assert_eq!(&buf[..n], b"[hmph:78]\xff");
//!
//! // Other pins see nothing
//! assert_eq!(gpio.serial_read(24, &mut buf), 0);
//! ```

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Mutex;

use crate::traits::gpio::{GpioPort, PinMode, Pulse, WaveId};

const NUM_PINS: usize = 64;

/// Tracked state of one mock pin.
#[derive(Clone, Copy, Debug, Default)]
pub struct PinState {
    /// Last mode set, if any.
    pub mode: Option<PinMode>,
    /// Last level written.
    pub level: bool,
    /// Whether a serial receiver is open on this pin.
    pub serial_open: bool,
    /// Baud rate the receiver was opened with.
    pub serial_baud: u32,
    /// Whether receive polarity inversion is enabled.
    pub serial_invert: bool,
}

/// One recorded transmission: the target pin and the bytes decoded from
/// the inverted-UART pulse train.
#[derive(Clone, Debug)]
pub struct WaveRecord {
    /// GPIO the pulses targeted.
    pub gpio: u32,
    /// Decoded payload bytes.
    pub bytes: Vec<u8>,
}

struct MockState {
    initialised: bool,
    pins: [PinState; NUM_PINS],
    inject: Vec<VecDeque<Vec<u8>>>,
    pending_pulses: Vec<Pulse>,
    last_wave_gpio: u32,
    next_wave_id: i32,
    wave_writes: Vec<WaveRecord>,
}

/// In-memory [`GpioPort`] implementation. See the [module docs](self).
pub struct MockGpio {
    state: Mutex<MockState>,
}

impl MockGpio {
    /// Create a mock with all pins untouched and no injected data.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                initialised: false,
                pins: [PinState::default(); NUM_PINS],
                inject: (0..NUM_PINS).map(|_| VecDeque::new()).collect(),
                pending_pulses: Vec::new(),
                last_wave_gpio: 0,
                next_wave_id: 0,
                wave_writes: Vec::new(),
            }),
        }
    }

    // --- Test helpers: serial injection ---

    /// Queue bytes that only `serial_read(pin, ..)` will return. Each
    /// injection is handed out as one chunk, mimicking the bursty arrival
    /// of real bus traffic.
    pub fn inject_serial(&self, pin: u32, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.inject[pin as usize].push_back(data.to_vec());
    }

    /// String convenience over [`inject_serial`](Self::inject_serial).
    pub fn inject_serial_str(&self, pin: u32, data: &str) {
        self.inject_serial(pin, data.as_bytes());
    }

    // --- Test helpers: transmit inspection ---

    /// All recorded transmissions, in order.
    pub fn wave_writes(&self) -> Vec<WaveRecord> {
        self.state.lock().unwrap().wave_writes.clone()
    }

    /// Every byte transmitted so far, across all waves, concatenated.
    pub fn written_bytes(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state
            .wave_writes
            .iter()
            .flat_map(|w| w.bytes.iter().copied())
            .collect()
    }

    /// [`written_bytes`](Self::written_bytes) lossily decoded as text,
    /// convenient for asserting on `[key:value]` frames.
    pub fn written_string(&self) -> String {
        String::from_utf8_lossy(&self.written_bytes()).into_owned()
    }

    /// Bytes transmitted to one specific pin, concatenated.
    pub fn written_bytes_for(&self, pin: u32) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state
            .wave_writes
            .iter()
            .filter(|w| w.gpio == pin)
            .flat_map(|w| w.bytes.iter().copied())
            .collect()
    }

    /// Discard all recorded transmissions.
    pub fn clear_writes(&self) {
        self.state.lock().unwrap().wave_writes.clear();
    }

    /// Tracked state of a pin.
    pub fn pin_state(&self, pin: u32) -> PinState {
        self.state.lock().unwrap().pins[pin as usize]
    }

    /// Whether `initialise` has been called (and `terminate` has not).
    pub fn is_initialised(&self) -> bool {
        self.state.lock().unwrap().initialised
    }

    // Decode an inverted 8N1 pulse train back into bytes: 10 pulses per
    // byte (start, 8 data LSB-first, stop), a cleared mask meaning "1".
    fn decode_pulses(pulses: &[Pulse]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(pulses.len() / 10);
        let mut i = 0;
        while i + 9 < pulses.len() {
            let mut value = 0u8;
            for bit in 0..8 {
                if pulses[i + 1 + bit].gpio_off != 0 {
                    value |= 1 << bit;
                }
            }
            bytes.push(value);
            i += 10;
        }
        bytes
    }
}

impl Default for MockGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioPort for MockGpio {
    type Error = Infallible;

    fn initialise(&self) -> Result<(), Infallible> {
        self.state.lock().unwrap().initialised = true;
        Ok(())
    }

    fn terminate(&self) {
        self.state.lock().unwrap().initialised = false;
    }

    fn set_mode(&self, pin: u32, mode: PinMode) {
        self.state.lock().unwrap().pins[pin as usize].mode = Some(mode);
    }

    fn write(&self, pin: u32, level: bool) {
        self.state.lock().unwrap().pins[pin as usize].level = level;
    }

    fn serial_read_open(&self, pin: u32, baud: u32, _data_bits: u32) -> Result<(), Infallible> {
        let mut state = self.state.lock().unwrap();
        let p = &mut state.pins[pin as usize];
        p.serial_open = true;
        p.serial_baud = baud;
        Ok(())
    }

    fn serial_read_invert(&self, pin: u32, invert: bool) {
        self.state.lock().unwrap().pins[pin as usize].serial_invert = invert;
    }

    fn serial_read(&self, pin: u32, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock().unwrap();
        let queue = &mut state.inject[pin as usize];
        let Some(chunk) = queue.pop_front() else {
            return 0;
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            // Hand back the remainder for the next poll
            queue.push_front(chunk[n..].to_vec());
        }
        n
    }

    fn serial_read_close(&self, pin: u32) {
        self.state.lock().unwrap().pins[pin as usize].serial_open = false;
    }

    fn wave_tx_busy(&self) -> bool {
        false
    }

    fn wave_clear(&self) {
        self.state.lock().unwrap().pending_pulses.clear();
    }

    fn wave_add_generic(&self, pulses: &[Pulse]) {
        let mut state = self.state.lock().unwrap();
        for p in pulses {
            let mask = p.gpio_on | p.gpio_off;
            if mask != 0 {
                state.last_wave_gpio = mask.trailing_zeros();
            }
        }
        state.pending_pulses.extend_from_slice(pulses);
    }

    fn wave_create(&self) -> Result<WaveId, Infallible> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_wave_id;
        state.next_wave_id += 1;
        Ok(WaveId(id))
    }

    fn wave_tx_send(&self, _wave: WaveId) {
        let mut state = self.state.lock().unwrap();
        if state.pending_pulses.is_empty() {
            return;
        }
        let record = WaveRecord {
            gpio: state.last_wave_gpio,
            bytes: Self::decode_pulses(&state.pending_pulses),
        };
        state.wave_writes.push(record);
    }

    fn wave_delete(&self, _wave: WaveId) {}
}
