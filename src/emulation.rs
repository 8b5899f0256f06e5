//! Synthesized console: the 14-field emulation cycle.
//!
//! When the daemon replaces the console it must keep the motor controller
//! fed with the full command cycle the real console sends: 14 fields in 5
//! bursts, roughly 100 ms apart. Only `inc` and `hmph` carry live
//! set-points; the rest are bare status queries plus three fixed values
//! the motor expects (`part`, `diag`, `loop`).
//!
//! [`EmulationDriver::run`] is the body of the worker thread the
//! controller spawns on emulate-start. The loop re-reads the mode
//! snapshot each full cycle and checks both the shutdown flag and
//! `is_emulating()` between every field and burst, so a watchdog that
//! flips the mode from another thread is honored within one field time.
//!
//! A cumulative 3-hour safety cut-off zeroes the set-points. The mode is
//! left alone: the belt stops, the cycle keeps running at zero.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::mode::{ModeMachine, ModeSnapshot};
use crate::serial::SerialWriter;
use crate::traits::gpio::GpioPort;
use crate::wire::encode_speed_hex;

/// Cumulative run time after which set-points are forced back to zero.
pub const SAFETY_TIMEOUT: Duration = Duration::from_secs(3 * 3600);

/// Pause between bursts.
const BURST_GAP: Duration = Duration::from_millis(100);

/// One field of the cycle; `has_value` selects between `[key:value]` and
/// the bare `[key]` query form.
struct CycleField {
    key: &'static str,
    has_value: bool,
}

/// The full cycle, in wire order.
const CYCLE: [CycleField; 14] = [
    CycleField { key: "inc", has_value: true },   // incline, decimal percent
    CycleField { key: "hmph", has_value: true },  // speed, hundredths in hex
    CycleField { key: "amps", has_value: false },
    CycleField { key: "err", has_value: false },
    CycleField { key: "belt", has_value: false },
    CycleField { key: "vbus", has_value: false },
    CycleField { key: "lift", has_value: false },
    CycleField { key: "lfts", has_value: false },
    CycleField { key: "lftg", has_value: false },
    CycleField { key: "part", has_value: true },  // always "6"
    CycleField { key: "ver", has_value: false },
    CycleField { key: "type", has_value: false },
    CycleField { key: "diag", has_value: true },  // always "0"
    CycleField { key: "loop", has_value: true },  // always "5550"
];

/// Cycle indices per burst.
const BURSTS: [&[usize]; 5] = [
    &[0, 1],       // inc, hmph
    &[2, 3, 4],    // amps, err, belt
    &[5, 6, 7, 8], // vbus, lift, lfts, lftg
    &[9, 10, 11],  // part, ver, type
    &[12, 13],     // diag, loop
];

fn value_for(idx: usize, snap: &ModeSnapshot) -> String {
    match CYCLE[idx].key {
        "inc" => snap.incline.to_string(),
        "hmph" => encode_speed_hex(snap.speed_tenths),
        "part" => "6".to_owned(),
        "diag" => "0".to_owned(),
        "loop" => "5550".to_owned(),
        _ => String::new(),
    }
}

/// Callback fired once per transmitted field so the event ring sees the
/// emulation output.
pub type KvEventCallback = Box<dyn Fn(&str, &str) + Send>;

/// Worker that feeds the motor the synthesized command cycle.
pub struct EmulationDriver<P: GpioPort> {
    writer: Arc<SerialWriter<P>>,
    mode: Arc<ModeMachine>,
    shutdown: Arc<AtomicBool>,
    // Per-worker flag: lets the controller retire THIS worker even when
    // the mode has already re-entered Emulating for a successor.
    active: Arc<AtomicBool>,
    kv_event: Option<KvEventCallback>,
}

impl<P: GpioPort> EmulationDriver<P> {
    /// Create a driver. `shutdown` is the daemon-wide stop flag; the
    /// driver additionally stops as soon as the mode leaves Emulating or
    /// its own [`stop_handle`](Self::stop_handle) is cleared.
    pub fn new(
        writer: Arc<SerialWriter<P>>,
        mode: Arc<ModeMachine>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            writer,
            mode,
            shutdown,
            active: Arc::new(AtomicBool::new(true)),
            kv_event: None,
        }
    }

    /// Set the per-field event callback.
    pub fn on_kv_event(&mut self, cb: KvEventCallback) {
        self.kv_event = Some(cb);
    }

    /// Handle that stops this worker when stored `false`. Grab it before
    /// moving the driver into its thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    fn should_stop(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
            || !self.active.load(Ordering::Relaxed)
            || !self.mode.is_emulating()
    }

    /// Run the cycle until shutdown or emulate-exit. This is the worker
    /// thread body; it returns when the stop condition is observed at a
    /// field or burst boundary.
    pub fn run(&self) {
        let started = Instant::now();
        info!("emulation cycle started");

        'outer: while !self.should_stop() {
            if started.elapsed() >= SAFETY_TIMEOUT {
                let snap = self.mode.snapshot();
                if snap.speed_tenths != 0 || snap.incline != 0 {
                    self.mode.safety_timeout_reset();
                    warn!("3-hour safety timeout, speed and incline reset to 0");
                }
            }

            let snap = self.mode.snapshot();

            for burst in BURSTS {
                for &idx in burst {
                    if self.should_stop() {
                        break 'outer;
                    }
                    let field = &CYCLE[idx];
                    let value = if field.has_value {
                        value_for(idx, &snap)
                    } else {
                        String::new()
                    };

                    self.writer.write_kv(field.key, &value);
                    if let Some(cb) = self.kv_event.as_ref() {
                        cb(field.key, &value);
                    }
                }
                if self.should_stop() {
                    break 'outer;
                }
                thread::sleep(BURST_GAP);
            }
        }

        info!("emulation cycle stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockGpio;
    use std::sync::Mutex;

    fn driver_fixture() -> (
        Arc<MockGpio>,
        Arc<ModeMachine>,
        Arc<AtomicBool>,
        EmulationDriver<MockGpio>,
    ) {
        let gpio = Arc::new(MockGpio::new());
        let writer = Arc::new(SerialWriter::new(Arc::clone(&gpio), 18));
        let mode = Arc::new(ModeMachine::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let driver = EmulationDriver::new(writer, Arc::clone(&mode), Arc::clone(&shutdown));
        (gpio, mode, shutdown, driver)
    }

    #[test]
    fn cycle_covers_all_fourteen_fields_in_burst_order() {
        let flattened: Vec<usize> = BURSTS.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(flattened, (0..14).collect::<Vec<_>>());
    }

    #[test]
    fn does_not_run_unless_emulating() {
        let (gpio, _mode, _shutdown, driver) = driver_fixture();
        // Mode is Proxy: run() must return without writing anything
        driver.run();
        assert!(gpio.wave_writes().is_empty());
    }

    #[test]
    fn one_cycle_emits_expected_frames() {
        let (gpio, mode, shutdown, driver) = driver_fixture();
        mode.request_emulate(true);
        mode.set_speed(50);
        mode.set_incline(7);

        let handle = thread::spawn(move || driver.run());
        // Let at least one full cycle (5 bursts x 100ms) go by
        thread::sleep(Duration::from_millis(700));
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let written = gpio.written_string();
        assert!(written.contains("[inc:7]"), "missing incline: {written}");
        assert!(written.contains("[hmph:1F4]"), "missing speed: {written}");
        assert!(written.contains("[belt]"));
        assert!(written.contains("[part:6]"));
        assert!(written.contains("[diag:0]"));
        assert!(written.contains("[loop:5550]"));
    }

    #[test]
    fn emits_kv_events_matching_writes() {
        let (_gpio, mode, shutdown, mut driver) = driver_fixture();
        mode.request_emulate(true);

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_cb = Arc::clone(&events);
        driver.on_kv_event(Box::new(move |key, value| {
            events_cb.lock().unwrap().push((key.to_owned(), value.to_owned()));
        }));

        let handle = thread::spawn(move || driver.run());
        thread::sleep(Duration::from_millis(250));
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let events = events.lock().unwrap();
        assert!(!events.is_empty());
        assert_eq!(events[0], ("inc".to_owned(), "0".to_owned()));
        assert_eq!(events[1], ("hmph".to_owned(), "0".to_owned()));
    }

    #[test]
    fn stop_handle_retires_the_worker() {
        let (_gpio, mode, _shutdown, driver) = driver_fixture();
        mode.request_emulate(true);

        let stop = driver.stop_handle();
        let handle = thread::spawn(move || driver.run());
        thread::sleep(Duration::from_millis(50));
        stop.store(false, Ordering::Relaxed);
        handle.join().unwrap();
        // Mode untouched: only this worker was asked to stop
        assert!(mode.is_emulating());
    }

    #[test]
    fn stops_when_mode_leaves_emulating() {
        let (_gpio, mode, _shutdown, driver) = driver_fixture();
        mode.request_emulate(true);

        let mode_flip = Arc::clone(&mode);
        let handle = thread::spawn(move || driver.run());
        thread::sleep(Duration::from_millis(120));
        // Watchdog-style transition: no callback, the driver self-observes
        mode_flip.watchdog_reset_to_proxy();

        // The join must complete promptly without touching the shutdown flag
        handle.join().unwrap();
    }
}
