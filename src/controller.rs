//! Top-level wiring: threads, callbacks, and watchdogs.
//!
//! [`Controller`] owns every component and the three long-running worker
//! threads (console reader, motor reader, control plane); the emulation
//! worker is a fourth thread whose lifecycle is driven by the mode
//! machine's emulate callback. All cross-component communication happens
//! through the callbacks wired up in [`start`]:
//!
//! ```text
//! console pin ─ reader ─┬─ raw ──> byte counter + proxy forward ─> motor pin
//!                       └─ kv ───> ring ("console") + physical-override check
//! motor pin ─── reader ─┬─ raw ──> byte counter
//!                       └─ kv ───> observed bus values + ring ("motor")
//! emulation driver ─────── kv ───> motor pin + ring ("emulate")
//! control socket ─ server ─ cmd ─> mode machine ─> ring (status)
//! ```
//!
//! # Watchdogs
//!
//! Emulating without supervision is the one thing this daemon must never
//! do, so two layers push the machine back to Proxy:
//!
//! 1. client-present: the last control client disconnecting while
//!    Emulating,
//! 2. heartbeat: no command for 4 seconds while Emulating.
//!
//! Both run on the control thread and therefore use
//! [`watchdog_reset_to_proxy`], which does not fire the emulate callback:
//! joining the emulation worker from the control thread would race the
//! main thread's [`stop`]. The worker notices `is_emulating() == false`
//! at its next field boundary and exits; [`stop`] joins it later.
//!
//! [`start`]: Controller::start
//! [`stop`]: Controller::stop
//! [`watchdog_reset_to_proxy`]: ModeMachine::watchdog_reset_to_proxy

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};
use thiserror::Error;

use crate::config::GpioConfig;
use crate::emulation::EmulationDriver;
use crate::messages::{Command, Event, Source};
use crate::mode::ModeMachine;
use crate::ring::EventRing;
use crate::serial::{SerialReader, SerialWriter};
use crate::services::control::{ControlServer, SOCKET_PATH};
use crate::traits::gpio::GpioPort;
use crate::wire::{decode_incline_hex, decode_speed_hex};

/// Heartbeat watchdog limit: emulating with no command for this long
/// falls back to Proxy.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(4);

/// Reader back-off when a poll returns nothing.
const READER_IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Control-plane polling cadence.
const CONTROL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Why [`Controller::start`] failed.
#[derive(Debug, Error)]
pub enum StartError<E: std::fmt::Debug + std::fmt::Display> {
    /// The console-side serial receiver would not open.
    #[error("console serial open failed: {0}")]
    ConsoleOpen(E),
    /// The motor-side serial receiver would not open.
    #[error("motor serial open failed: {0}")]
    MotorOpen(E),
    /// The control socket could not be bound.
    #[error("control socket bind failed: {0}")]
    Bind(#[from] io::Error),
}

// Ring producer shared by every event source; owns the common time base.
#[derive(Clone)]
struct EventSink {
    ring: Arc<EventRing>,
    epoch: Instant,
}

impl EventSink {
    fn kv(&self, source: Source, key: &str, value: &str) {
        let event = Event::Kv {
            ts: self.epoch.elapsed().as_secs_f64(),
            source,
            key: key.to_owned(),
            value: value.to_owned(),
        };
        self.ring.push(&event.to_line());
    }

    fn status(&self, mode: &ModeMachine) {
        let snap = mode.snapshot();
        let event = Event::Status {
            proxy: snap.proxy_enabled,
            emulate: snap.emulate_enabled,
            emu_speed: snap.speed_tenths,
            emu_incline: snap.incline,
            console_bytes: mode.console_bytes(),
            motor_bytes: mode.motor_bytes(),
        };
        self.ring.push(&event.to_line());
    }
}

// A running emulation worker: its private stop flag plus the join handle.
struct EmuWorker {
    active: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl EmuWorker {
    fn retire(self) {
        self.active.store(false, Ordering::Relaxed);
        let _ = self.thread.join();
    }
}

/// Owns all components and threads of the daemon. See the
/// [module docs](self).
pub struct Controller<P: GpioPort + 'static> {
    port: Arc<P>,
    cfg: GpioConfig,
    socket_path: PathBuf,

    mode: Arc<ModeMachine>,
    ring: Arc<EventRing>,
    writer: Arc<SerialWriter<P>>,
    shutdown: Arc<AtomicBool>,
    epoch: Instant,

    // Milliseconds since epoch of the last control command (heartbeat)
    last_cmd_ms: Arc<AtomicU64>,
    // Last hmph/inc decoded off the motor bus; -1 = never observed
    bus_speed_tenths: Arc<AtomicI32>,
    bus_incline_pct: Arc<AtomicI32>,

    emu_worker: Arc<Mutex<Option<EmuWorker>>>,
    threads: Vec<JoinHandle<()>>,
}

impl<P: GpioPort + 'static> Controller<P> {
    /// Create a controller over an initialised port. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(port: Arc<P>, cfg: GpioConfig) -> Self {
        let epoch = Instant::now();
        let writer = Arc::new(SerialWriter::new(Arc::clone(&port), cfg.motor_write));
        Self {
            port,
            cfg,
            socket_path: PathBuf::from(SOCKET_PATH),
            mode: Arc::new(ModeMachine::new()),
            ring: Arc::new(EventRing::new()),
            writer,
            shutdown: Arc::new(AtomicBool::new(false)),
            epoch,
            last_cmd_ms: Arc::new(AtomicU64::new(0)),
            bus_speed_tenths: Arc::new(AtomicI32::new(-1)),
            bus_incline_pct: Arc::new(AtomicI32::new(-1)),
            emu_worker: Arc::new(Mutex::new(None)),
            threads: Vec::new(),
        }
    }

    /// Override the control socket path (tests run several daemons side
    /// by side).
    pub fn with_socket_path<T: Into<PathBuf>>(mut self, path: T) -> Self {
        self.socket_path = path.into();
        self
    }

    /// The mode machine, for inspection.
    pub fn mode(&self) -> Arc<ModeMachine> {
        Arc::clone(&self.mode)
    }

    /// The event ring, for inspection.
    pub fn ring(&self) -> Arc<EventRing> {
        Arc::clone(&self.ring)
    }

    /// `false` once shutdown has been requested (signal, `quit` command,
    /// or [`stop`](Self::stop)).
    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed)
    }

    /// Ask every worker to wind down; [`stop`](Self::stop) still has to
    /// run to join them.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Last speed observed on the motor bus, in tenths (-1 before the
    /// first observation).
    pub fn bus_speed_tenths(&self) -> i32 {
        self.bus_speed_tenths.load(Ordering::Relaxed)
    }

    /// Last incline observed on the motor bus, in percent (-1 before the
    /// first observation).
    pub fn bus_incline_pct(&self) -> i32 {
        self.bus_incline_pct.load(Ordering::Relaxed)
    }

    fn sink(&self) -> EventSink {
        EventSink {
            ring: Arc::clone(&self.ring),
            epoch: self.epoch,
        }
    }

    /// Wire all callbacks, open both serial receivers, bind the control
    /// socket, push the initial status event, and launch the worker
    /// threads.
    pub fn start(&mut self) -> Result<(), StartError<P::Error>> {
        self.wire_emulate_callback();

        let mut console_reader = self.build_console_reader();
        let mut motor_reader = self.build_motor_reader();

        console_reader.open().map_err(StartError::ConsoleOpen)?;
        motor_reader.open().map_err(StartError::MotorOpen)?;

        let server = self.build_server()?;

        // Clients connecting late still learn the state immediately
        self.sink().status(&self.mode);

        let shutdown = Arc::clone(&self.shutdown);
        self.threads.push(thread::spawn(move || {
            reader_loop(console_reader, shutdown);
        }));

        let shutdown = Arc::clone(&self.shutdown);
        self.threads.push(thread::spawn(move || {
            reader_loop(motor_reader, shutdown);
        }));

        let shutdown = Arc::clone(&self.shutdown);
        let mode = Arc::clone(&self.mode);
        let sink = self.sink();
        let last_cmd_ms = Arc::clone(&self.last_cmd_ms);
        let epoch = self.epoch;
        self.threads.push(thread::spawn(move || {
            control_loop(server, shutdown, mode, sink, last_cmd_ms, epoch);
        }));

        info!(
            "controller running (console=GPIO{}, motor_write=GPIO{}, motor_read=GPIO{})",
            self.cfg.console_read, self.cfg.motor_write, self.cfg.motor_read
        );
        Ok(())
    }

    /// Signal shutdown and join every thread. The serial receivers close
    /// when their readers drop inside the worker threads; the server
    /// unlinks its socket the same way.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        // Fires the stop callback (joins the worker) when still emulating
        self.mode.request_emulate(false);
        // Watchdog resets bypass the callback, so a worker can outlive it
        if let Some(worker) = self.emu_worker.lock().unwrap().take() {
            worker.retire();
        }

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!("controller stopped");
    }

    // Emulate callback: start a fresh worker thread on `true`, retire the
    // current one on `false`. Runs outside the mode mutex.
    fn wire_emulate_callback(&self) {
        let writer = Arc::clone(&self.writer);
        let mode = Arc::downgrade(&self.mode);
        let shutdown = Arc::clone(&self.shutdown);
        let emu_worker = Arc::clone(&self.emu_worker);
        let sink = self.sink();

        self.mode.set_emulate_callback(Box::new(move |start| {
            let mut slot = emu_worker.lock().unwrap();
            if let Some(worker) = slot.take() {
                worker.retire();
            }
            if !start {
                return;
            }
            let Some(mode) = mode.upgrade() else {
                return;
            };

            let mut driver =
                EmulationDriver::new(Arc::clone(&writer), mode, Arc::clone(&shutdown));
            let sink = sink.clone();
            driver.on_kv_event(Box::new(move |key, value| {
                sink.kv(Source::Emulate, key, value);
            }));

            let active = driver.stop_handle();
            let thread = thread::spawn(move || driver.run());
            *slot = Some(EmuWorker { active, thread });
        }));
    }

    fn build_console_reader(&self) -> SerialReader<P> {
        let mut reader = SerialReader::new(Arc::clone(&self.port), self.cfg.console_read);

        let mode = Arc::clone(&self.mode);
        let writer = Arc::clone(&self.writer);
        reader.on_raw(Box::new(move |bytes| {
            mode.add_console_bytes(bytes.len() as u32);
            // Proxy path: forward untouched, before any parsing happens
            if mode.is_proxy() && !mode.is_emulating() {
                writer.write_bytes(bytes);
            }
        }));

        let mode = Arc::clone(&self.mode);
        let sink = self.sink();
        let mut last_hmph = String::new();
        let mut last_inc = String::new();
        reader.on_kv(Box::new(move |kv| {
            sink.kv(Source::Console, &kv.key, &kv.value);

            // Someone pressing real console buttons overrides emulation
            let last = match kv.key.as_str() {
                "hmph" => &mut last_hmph,
                "inc" => &mut last_inc,
                _ => return,
            };
            let result = mode.auto_proxy_on_console_change(&kv.key, last, &kv.value);
            if result.changed {
                info!(
                    "console {} changed {} -> {}, switching to proxy",
                    kv.key, last, kv.value
                );
                sink.status(&mode);
            }
            *last = kv.value.clone();
        }));

        reader
    }

    fn build_motor_reader(&self) -> SerialReader<P> {
        let mut reader = SerialReader::new(Arc::clone(&self.port), self.cfg.motor_read);

        let mode = Arc::clone(&self.mode);
        reader.on_raw(Box::new(move |bytes| {
            mode.add_motor_bytes(bytes.len() as u32);
        }));

        let sink = self.sink();
        let bus_speed = Arc::clone(&self.bus_speed_tenths);
        let bus_incline = Arc::clone(&self.bus_incline_pct);
        reader.on_kv(Box::new(move |kv| {
            match kv.key.as_str() {
                "hmph" => {
                    if let Some(tenths) = decode_speed_hex(&kv.value) {
                        bus_speed.store(tenths, Ordering::Relaxed);
                    }
                }
                "inc" => {
                    if let Some(pct) = decode_incline_hex(&kv.value) {
                        bus_incline.store(pct, Ordering::Relaxed);
                    }
                }
                _ => {}
            }
            sink.kv(Source::Motor, &kv.key, &kv.value);
        }));

        reader
    }

    fn build_server(&self) -> Result<ControlServer, io::Error> {
        let mut server = ControlServer::bind(&self.socket_path, Arc::clone(&self.ring))?;

        let mode = Arc::clone(&self.mode);
        let sink = self.sink();
        let shutdown = Arc::clone(&self.shutdown);
        let last_cmd_ms = Arc::clone(&self.last_cmd_ms);
        let epoch = self.epoch;
        server.on_command(Box::new(move |cmd| {
            // Every command doubles as a heartbeat
            last_cmd_ms.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);

            match cmd {
                Command::Proxy { enabled } => {
                    mode.request_proxy(enabled);
                    sink.status(&mode);
                }
                Command::Emulate { enabled } => {
                    mode.request_emulate(enabled);
                    sink.status(&mode);
                }
                Command::Speed { value } => {
                    mode.set_speed_mph(value);
                    sink.status(&mode);
                }
                Command::Incline { value } => {
                    mode.set_incline(value as i32);
                    sink.status(&mode);
                }
                Command::Status => sink.status(&mode),
                Command::Heartbeat => {}
                Command::Quit => {
                    info!("quit command received, shutting down");
                    shutdown.store(true, Ordering::Relaxed);
                }
            }
        }));

        let mode = Arc::clone(&self.mode);
        let sink = self.sink();
        server.on_client_disconnect(Box::new(move |remaining| {
            if remaining == 0 && mode.is_emulating() {
                warn!("all clients disconnected while emulating, returning to proxy");
                mode.watchdog_reset_to_proxy();
                sink.status(&mode);
            }
        }));

        Ok(server)
    }
}

fn reader_loop<P: GpioPort>(mut reader: SerialReader<P>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        if reader.poll() == 0 {
            thread::sleep(READER_IDLE_SLEEP);
        }
    }
}

fn control_loop(
    mut server: ControlServer,
    shutdown: Arc<AtomicBool>,
    mode: Arc<ModeMachine>,
    sink: EventSink,
    last_cmd_ms: Arc<AtomicU64>,
    epoch: Instant,
) {
    while !shutdown.load(Ordering::Relaxed) {
        server.poll();

        // Heartbeat watchdog: emulation requires a live, talking client
        if mode.is_emulating() {
            let now_ms = epoch.elapsed().as_millis() as u64;
            let silence = now_ms.saturating_sub(last_cmd_ms.load(Ordering::Relaxed));
            if silence >= HEARTBEAT_TIMEOUT.as_millis() as u64 {
                warn!(
                    "heartbeat timeout ({:.1}s), exiting emulate and returning to proxy",
                    silence as f64 / 1000.0
                );
                mode.watchdog_reset_to_proxy();
                sink.status(&mode);
            }
        }

        thread::sleep(CONTROL_POLL_INTERVAL);
    }
}
