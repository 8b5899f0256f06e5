//! Single authority on proxy/emulate mode transitions.
//!
//! One tagged [`Mode`] value replaces the two booleans an earlier design
//! would suggest, so "proxy and emulate both on" is unrepresentable. All
//! safety invariants live here:
//!
//! - entering Emulating forces speed and incline to zero before the
//!   transition is observable,
//! - set-points are clamped on every write (`speed_tenths` 0-120,
//!   `incline` 0-99),
//! - `speed_raw` always equals `speed_tenths * 10`.
//!
//! Control-plane operations take the state mutex; the data plane (serial
//! threads, emulation driver) reads a relaxed atomic snapshot without
//! locking. A coherent multi-field copy is available via [`snapshot`].
//!
//! The single emulate callback is how the controller learns to start or
//! join the emulation worker thread. It always fires after the mutex is
//! released, so the receiver may join a thread that itself reads this
//! state machine.
//!
//! [`snapshot`]: ModeMachine::snapshot
//!
//! # Example
//!
//! ```rust
//! use treadmill_io::mode::{Mode, ModeMachine};
//!
//! let mode = ModeMachine::new();
//! assert_eq!(mode.snapshot().mode, Mode::Proxy);
//!
//! // A set-point command auto-arms emulation at zero...
//! let result = mode.set_speed(50);
//! assert!(result.emulate_started);
//! assert_eq!(mode.snapshot().speed_tenths, 50);
//!
//! // ...and clamping is applied on write.
//! mode.set_speed(500);
//! assert_eq!(mode.snapshot().speed_tenths, 120);
//! ```

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Mutex;

/// Maximum speed set-point in tenths of mph (12.0 mph).
pub const MAX_SPEED_TENTHS: i32 = 120;

/// Maximum incline set-point in percent.
pub const MAX_INCLINE: i32 = 99;

/// Operating mode of the daemon. Exactly one is active at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Neither forwarding nor synthesizing; the motor hears nothing.
    Idle,
    /// Console traffic is forwarded to the motor byte-for-byte.
    Proxy,
    /// The daemon replaces the console with a synthesized command cycle.
    Emulating,
}

/// Coherent copy of the machine's state, taken under the mutex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeSnapshot {
    /// Active mode.
    pub mode: Mode,
    /// Speed set-point in tenths of mph (0-120).
    pub speed_tenths: i32,
    /// `speed_tenths * 10`, i.e. hundredths for the hex wire encoding.
    pub speed_raw: i32,
    /// Incline set-point in whole percent (0-99).
    pub incline: i32,
    /// Derived projection: `mode == Proxy`.
    pub proxy_enabled: bool,
    /// Derived projection: `mode == Emulating`.
    pub emulate_enabled: bool,
}

/// Outcome of a transition request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransitionResult {
    /// The mode actually changed.
    pub changed: bool,
    /// Emulation was just enabled (the callback fired with `true`).
    pub emulate_started: bool,
    /// Emulation was just disabled (the callback fired with `false`).
    pub emulate_stopped: bool,
}

/// Callback fired with `true` on emulate start and `false` on stop.
pub type EmulateCallback = Box<dyn Fn(bool) + Send + Sync>;

#[derive(Clone, Copy)]
struct State {
    mode: Mode,
    speed_tenths: i32,
    speed_raw: i32,
    incline: i32,
}

// Lock-free mirror of `State`, refreshed under the mutex after every
// change. Individual fields are coherent; multi-field readers use
// snapshot() instead.
struct AtomicSnap {
    proxy_enabled: AtomicBool,
    emulate_enabled: AtomicBool,
    speed_tenths: AtomicI32,
    speed_raw: AtomicI32,
    incline: AtomicI32,
}

/// The proxy/emulate state machine. See the [module docs](self).
pub struct ModeMachine {
    state: Mutex<State>,
    snap: AtomicSnap,
    console_bytes: AtomicU32,
    motor_bytes: AtomicU32,
    emulate_cb: Mutex<Option<EmulateCallback>>,
}

impl ModeMachine {
    /// Create a machine in the initial mode, Proxy, with zero set-points.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                mode: Mode::Proxy,
                speed_tenths: 0,
                speed_raw: 0,
                incline: 0,
            }),
            snap: AtomicSnap {
                proxy_enabled: AtomicBool::new(true),
                emulate_enabled: AtomicBool::new(false),
                speed_tenths: AtomicI32::new(0),
                speed_raw: AtomicI32::new(0),
                incline: AtomicI32::new(0),
            },
            console_bytes: AtomicU32::new(0),
            motor_bytes: AtomicU32::new(0),
            emulate_cb: Mutex::new(None),
        }
    }

    /// Register the emulate start/stop callback. The controller uses this
    /// to manage the emulation worker thread.
    pub fn set_emulate_callback(&self, cb: EmulateCallback) {
        *self.emulate_cb.lock().unwrap() = Some(cb);
    }

    fn refresh_snap(&self, state: &State) {
        self.snap
            .proxy_enabled
            .store(state.mode == Mode::Proxy, Ordering::Relaxed);
        self.snap
            .emulate_enabled
            .store(state.mode == Mode::Emulating, Ordering::Relaxed);
        self.snap
            .speed_tenths
            .store(state.speed_tenths, Ordering::Relaxed);
        self.snap.speed_raw.store(state.speed_raw, Ordering::Relaxed);
        self.snap.incline.store(state.incline, Ordering::Relaxed);
    }

    // Safety: emulation always starts from zero speed and zero incline.
    fn enter_emulate(state: &mut State) {
        state.speed_tenths = 0;
        state.speed_raw = 0;
        state.incline = 0;
        state.mode = Mode::Emulating;
    }

    fn fire_callback(&self, result: TransitionResult) {
        if !result.emulate_started && !result.emulate_stopped {
            return;
        }
        let cb = self.emulate_cb.lock().unwrap();
        if let Some(cb) = cb.as_ref() {
            if result.emulate_started {
                cb(true);
            }
            if result.emulate_stopped {
                cb(false);
            }
        }
    }

    /// Enable or disable proxy mode. Enabling while Emulating exits
    /// emulation first (the stop callback fires). Disabling only has an
    /// effect when currently in Proxy, which becomes Idle.
    pub fn request_proxy(&self, enabled: bool) -> TransitionResult {
        let mut result = TransitionResult::default();
        {
            let mut state = self.state.lock().unwrap();
            if enabled {
                if state.mode == Mode::Emulating {
                    result.emulate_stopped = true;
                }
                state.mode = Mode::Proxy;
                result.changed = true;
            } else if state.mode == Mode::Proxy {
                state.mode = Mode::Idle;
                result.changed = true;
            }
            self.refresh_snap(&state);
        }
        self.fire_callback(result);
        result
    }

    /// Enable or disable emulation. Enabling zeroes the set-points before
    /// the transition is observable; enabling while already Emulating is
    /// a no-op.
    pub fn request_emulate(&self, enabled: bool) -> TransitionResult {
        let mut result = TransitionResult::default();
        {
            let mut state = self.state.lock().unwrap();
            if enabled {
                if state.mode == Mode::Emulating {
                    return result;
                }
                Self::enter_emulate(&mut state);
                result.emulate_started = true;
                result.changed = true;
            } else if state.mode == Mode::Emulating {
                state.mode = Mode::Idle;
                result.emulate_stopped = true;
                result.changed = true;
            }
            self.refresh_snap(&state);
        }
        self.fire_callback(result);
        result
    }

    /// Set the speed set-point in tenths of mph, clamped to 0-120.
    /// A set-point implies emulation: if the machine is not Emulating it
    /// enters that mode first (from zero, then stores the new value).
    pub fn set_speed(&self, tenths: i32) -> TransitionResult {
        let tenths = tenths.clamp(0, MAX_SPEED_TENTHS);
        let mut result = TransitionResult::default();
        {
            let mut state = self.state.lock().unwrap();
            if state.mode != Mode::Emulating {
                Self::enter_emulate(&mut state);
                result.emulate_started = true;
                result.changed = true;
            }
            state.speed_tenths = tenths;
            state.speed_raw = tenths * 10;
            self.refresh_snap(&state);
        }
        self.fire_callback(result);
        result
    }

    /// Set the speed from an mph float as received on the control plane.
    pub fn set_speed_mph(&self, mph: f64) -> TransitionResult {
        self.set_speed((mph * 10.0 + 0.5) as i32)
    }

    /// Set the incline set-point in whole percent, clamped to 0-99.
    /// Auto-arms emulation the same way as [`set_speed`](Self::set_speed).
    pub fn set_incline(&self, percent: i32) -> TransitionResult {
        let percent = percent.clamp(0, MAX_INCLINE);
        let mut result = TransitionResult::default();
        {
            let mut state = self.state.lock().unwrap();
            if state.mode != Mode::Emulating {
                Self::enter_emulate(&mut state);
                result.emulate_started = true;
                result.changed = true;
            }
            state.incline = percent;
            self.refresh_snap(&state);
        }
        self.fire_callback(result);
        result
    }

    /// Physical-override detection: a changed `hmph` or `inc` value from
    /// the real console while Emulating drops the machine back to Proxy
    /// (someone is pressing buttons on the treadmill). First observations
    /// (`old` empty), unchanged values, and other keys are no-ops.
    pub fn auto_proxy_on_console_change(
        &self,
        key: &str,
        old: &str,
        new: &str,
    ) -> TransitionResult {
        let mut result = TransitionResult::default();

        if old.is_empty() || old == new {
            return result;
        }
        if key != "hmph" && key != "inc" {
            return result;
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.mode != Mode::Emulating {
                return result;
            }
            state.mode = Mode::Proxy;
            result.emulate_stopped = true;
            result.changed = true;
            self.refresh_snap(&state);
        }
        self.fire_callback(result);
        result
    }

    /// Zero the set-points without touching the mode. Called by the
    /// emulation driver when the cumulative safety timeout expires.
    pub fn safety_timeout_reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.speed_tenths = 0;
        state.speed_raw = 0;
        state.incline = 0;
        self.refresh_snap(&state);
    }

    /// Zero the set-points and force the mode to Proxy WITHOUT firing the
    /// emulate callback. Used by the watchdogs, which run on the control
    /// thread and must not join the emulation worker from there; the
    /// worker observes `is_emulating() == false` and exits on its own.
    pub fn watchdog_reset_to_proxy(&self) {
        let mut state = self.state.lock().unwrap();
        state.speed_tenths = 0;
        state.speed_raw = 0;
        state.incline = 0;
        state.mode = Mode::Proxy;
        self.refresh_snap(&state);
    }

    // --- Byte counters (shared state, not mode-related) ---

    /// Add to the console-direction byte counter (wraps at `u32::MAX`).
    pub fn add_console_bytes(&self, n: u32) {
        self.console_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Add to the motor-direction byte counter (wraps at `u32::MAX`).
    pub fn add_motor_bytes(&self, n: u32) {
        self.motor_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Total bytes seen from the console.
    pub fn console_bytes(&self) -> u32 {
        self.console_bytes.load(Ordering::Relaxed)
    }

    /// Total bytes seen from the motor.
    pub fn motor_bytes(&self) -> u32 {
        self.motor_bytes.load(Ordering::Relaxed)
    }

    // --- Data plane reads ---

    /// Lock-free: currently forwarding console traffic?
    pub fn is_proxy(&self) -> bool {
        self.snap.proxy_enabled.load(Ordering::Relaxed)
    }

    /// Lock-free: currently emulating the console?
    pub fn is_emulating(&self) -> bool {
        self.snap.emulate_enabled.load(Ordering::Relaxed)
    }

    /// Lock-free read of the speed set-point in tenths.
    pub fn speed_tenths(&self) -> i32 {
        self.snap.speed_tenths.load(Ordering::Relaxed)
    }

    /// Lock-free read of the incline set-point in percent.
    pub fn incline(&self) -> i32 {
        self.snap.incline.load(Ordering::Relaxed)
    }

    /// Coherent multi-field copy, taken under the state mutex.
    pub fn snapshot(&self) -> ModeSnapshot {
        let state = self.state.lock().unwrap();
        ModeSnapshot {
            mode: state.mode,
            speed_tenths: state.speed_tenths,
            speed_raw: state.speed_raw,
            incline: state.incline,
            proxy_enabled: state.mode == Mode::Proxy,
            emulate_enabled: state.mode == Mode::Emulating,
        }
    }
}

impl Default for ModeMachine {
    fn default() -> Self {
        Self::new()
    }
}
