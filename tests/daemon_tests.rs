//! End-to-end daemon scenarios: a full controller over the mock GPIO
//! port, driven through real Unix sockets like a production client.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use treadmill_io::config::GpioConfig;
use treadmill_io::hal::MockGpio;
use treadmill_io::mode::Mode;
use treadmill_io::Controller;

const CFG: GpioConfig = GpioConfig {
    console_read: 23,
    motor_write: 18,
    motor_read: 24,
};

struct Daemon {
    gpio: Arc<MockGpio>,
    controller: Controller<MockGpio>,
    socket_path: PathBuf,
}

impl Daemon {
    fn start(name: &str) -> Self {
        let gpio = Arc::new(MockGpio::new());
        let socket_path = std::env::temp_dir().join(format!(
            "treadmill_e2e_{name}_{}.sock",
            std::process::id()
        ));
        let mut controller =
            Controller::new(Arc::clone(&gpio), CFG).with_socket_path(socket_path.clone());
        controller.start().expect("controller start");
        Self {
            gpio,
            controller,
            socket_path,
        }
    }

    fn connect(&self) -> Client {
        let stream = UnixStream::connect(&self.socket_path).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        // Give the control loop a cycle to register the client
        std::thread::sleep(Duration::from_millis(60));
        Client {
            stream,
            pending: Vec::new(),
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.controller.stop();
    }
}

struct Client {
    stream: UnixStream,
    pending: Vec<u8>,
}

impl Client {
    fn send(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).unwrap();
        self.stream.write_all(b"\n").unwrap();
    }

    /// Read events until one satisfies `pred` or the deadline passes.
    fn wait_for_event(
        &mut self,
        deadline: Duration,
        pred: impl Fn(&serde_json::Value) -> bool,
    ) -> Option<serde_json::Value> {
        let start = Instant::now();
        while start.elapsed() < deadline {
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(_) => {}
            }
            while let Some(nl) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=nl).collect();
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&line) {
                    if pred(&value) {
                        return Some(value);
                    }
                }
            }
        }
        None
    }
}

// ============================================================================
// Scenario: auto-arm emulate by set-point
// ============================================================================

#[test]
fn speed_command_auto_arms_emulation() {
    let daemon = Daemon::start("auto_arm");
    let mut client = daemon.connect();

    client.send(r#"{"cmd":"speed","value":1.2}"#);

    let status = client
        .wait_for_event(Duration::from_millis(300), |v| v["type"] == "status")
        .expect("status event within 300ms");

    assert_eq!(status["emulate"], true);
    assert_eq!(status["proxy"], false);
    assert_eq!(status["emu_speed"], 12);
}

// ============================================================================
// Scenario: hex encoding end-to-end
// ============================================================================

#[test]
fn emulation_cycle_reaches_clients_with_hex_speed() {
    let daemon = Daemon::start("hex_cycle");
    let mut client = daemon.connect();

    client.send(r#"{"cmd":"speed","value":5.0}"#);
    client.send(r#"{"cmd":"incline","value":7}"#);

    let hmph = client
        .wait_for_event(Duration::from_millis(1500), |v| {
            v["type"] == "kv" && v["source"] == "emulate" && v["key"] == "hmph"
        })
        .expect("emulate hmph event");
    assert_eq!(hmph["value"], "1F4");

    let inc = client
        .wait_for_event(Duration::from_millis(1500), |v| {
            v["type"] == "kv" && v["source"] == "emulate" && v["key"] == "inc" && v["value"] == "7"
        })
        .expect("emulate inc event");
    assert_eq!(inc["value"], "7");

    // The same frames went onto the wire
    std::thread::sleep(Duration::from_millis(100));
    let written = daemon.gpio.written_string();
    assert!(written.contains("[hmph:1F4]"), "wire: {written}");
    assert!(written.contains("[inc:7]"), "wire: {written}");
}

// ============================================================================
// Scenario: proxy forwarding
// ============================================================================

#[test]
fn proxy_forwards_console_frames_byte_for_byte() {
    let daemon = Daemon::start("proxy");

    daemon.gpio.inject_serial(CFG.console_read, b"[hmph:78]\xff");
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(
        daemon.gpio.written_bytes_for(CFG.motor_write),
        b"[hmph:78]\xff"
    );
}

// ============================================================================
// Scenario: auto-return to proxy on physical override
// ============================================================================

#[test]
fn physical_console_change_overrides_emulation() {
    let daemon = Daemon::start("override");
    let mut client = daemon.connect();

    // Seed the last-seen console speed while still proxying
    daemon.gpio.inject_serial(CFG.console_read, b"[hmph:78]\xff");
    std::thread::sleep(Duration::from_millis(60));

    client.send(r#"{"cmd":"emulate","enabled":true}"#);
    let armed = client
        .wait_for_event(Duration::from_millis(300), |v| {
            v["type"] == "status" && v["emulate"] == true
        })
        .expect("emulate armed");
    assert_eq!(armed["proxy"], false);

    // Someone presses a speed button on the real console
    daemon.gpio.inject_serial(CFG.console_read, b"[hmph:96]\xff");

    let status = client
        .wait_for_event(Duration::from_millis(300), |v| {
            v["type"] == "status" && v["emulate"] == false
        })
        .expect("status with emulate off within 300ms");
    assert_eq!(status["proxy"], true);
    assert_eq!(daemon.controller.mode().snapshot().mode, Mode::Proxy);
}

// ============================================================================
// Scenario: heartbeat watchdog
// ============================================================================

#[test]
fn heartbeat_watchdog_resets_silent_emulation() {
    let daemon = Daemon::start("heartbeat");
    let mut client = daemon.connect();

    client.send(r#"{"cmd":"emulate","enabled":true}"#);
    client
        .wait_for_event(Duration::from_millis(300), |v| {
            v["type"] == "status" && v["emulate"] == true
        })
        .expect("emulate armed");

    // Say nothing for 5 seconds; the 4-second watchdog must fire
    let status = client
        .wait_for_event(Duration::from_secs(5), |v| {
            v["type"] == "status" && v["emulate"] == false
        })
        .expect("watchdog status event");
    assert_eq!(status["emu_speed"], 0);
    assert_eq!(status["emu_incline"], 0);
    assert_eq!(daemon.controller.mode().snapshot().mode, Mode::Proxy);
}

// ============================================================================
// Scenario: client-present watchdog
// ============================================================================

#[test]
fn last_client_disconnect_resets_emulation() {
    let daemon = Daemon::start("disconnect_watchdog");
    let mut client = daemon.connect();

    client.send(r#"{"cmd":"emulate","enabled":true}"#);
    client
        .wait_for_event(Duration::from_millis(300), |v| {
            v["type"] == "status" && v["emulate"] == true
        })
        .expect("emulate armed");

    drop(client);
    std::thread::sleep(Duration::from_millis(200));

    let snap = daemon.controller.mode().snapshot();
    assert_eq!(snap.mode, Mode::Proxy);
    assert_eq!(snap.speed_tenths, 0);
}

// ============================================================================
// Scenario: client overflow rejection
// ============================================================================

#[test]
fn fifth_client_is_rejected_while_four_keep_service() {
    let daemon = Daemon::start("too_many");

    let mut clients: Vec<Client> = (0..4).map(|_| daemon.connect()).collect();

    let mut fifth = daemon.connect();
    let err = fifth
        .wait_for_event(Duration::from_millis(300), |v| v["type"] == "error")
        .expect("error event for fifth client");
    assert_eq!(err["msg"], "too many clients");

    // The rejected socket is closed
    std::thread::sleep(Duration::from_millis(50));
    let mut probe = [0u8; 8];
    assert_eq!(fifth.stream.read(&mut probe).unwrap_or(0), 0);

    // The four original clients still get events
    clients[0].send(r#"{"cmd":"status"}"#);
    for (i, client) in clients.iter_mut().enumerate() {
        client
            .wait_for_event(Duration::from_millis(300), |v| v["type"] == "status")
            .unwrap_or_else(|| panic!("client {i} missed the status event"));
    }
}

// ============================================================================
// Scenario: quit command
// ============================================================================

#[test]
fn quit_command_requests_shutdown() {
    let daemon = Daemon::start("quit");
    let mut client = daemon.connect();

    assert!(daemon.controller.is_running());
    client.send(r#"{"cmd":"quit"}"#);
    std::thread::sleep(Duration::from_millis(100));
    assert!(!daemon.controller.is_running());
}
