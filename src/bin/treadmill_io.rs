//! Daemon entry point for the target board.
//!
//! Loads `gpio.json`, claims the GPIO peripheral through libpigpio, wires
//! up the controller, and supervises it until a signal or a `quit`
//! command arrives. Requires root (libpigpio maps the peripheral
//! directly) and conflicts with a running pigpiod.
//!
//! Exit codes: 0 on a clean shutdown, 1 on any startup failure
//! (privilege, config, GPIO init, socket bind).

#[cfg(feature = "pigpio")]
fn main() -> anyhow::Result<()> {
    daemon::run()
}

#[cfg(not(feature = "pigpio"))]
fn main() {
    eprintln!("treadmill_io was built without the `pigpio` feature; rebuild with --features pigpio");
    std::process::exit(1);
}

#[cfg(feature = "pigpio")]
mod daemon {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use anyhow::{bail, Context};
    use log::{error, info};

    use treadmill_io::hal::PigpioPort;
    use treadmill_io::traits::gpio::{GpioPort, PinMode, BAUD};
    use treadmill_io::{load_config, Controller};

    const CONFIG_PATH: &str = "gpio.json";

    static SIGNALLED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_signal(_sig: libc::c_int) {
        SIGNALLED.store(true, Ordering::Relaxed);
    }

    fn install_signal_handlers() {
        unsafe {
            libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
            libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
            // A disappearing client must not kill the daemon mid-write
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
    }

    pub fn run() -> anyhow::Result<()> {
        env_logger::init();

        if unsafe { libc::geteuid() } != 0 {
            bail!("must run as root (sudo treadmill_io)");
        }

        let cfg = load_config(CONFIG_PATH)
            .with_context(|| format!("loading {CONFIG_PATH}"))?;

        info!("console read: GPIO {}", cfg.console_read);
        info!("motor write:  GPIO {}", cfg.motor_write);
        info!("motor read:   GPIO {}", cfg.motor_read);
        info!("baud:         {}", BAUD);

        let port = Arc::new(PigpioPort::new());
        port.initialise()
            .context("initialising the GPIO peripheral")?;

        // Motor write pin: output, idle low (the bus line is inverted)
        port.set_mode(cfg.motor_write, PinMode::Output);
        port.write(cfg.motor_write, false);

        install_signal_handlers();

        let mut controller = Controller::new(Arc::clone(&port), cfg);
        if let Err(e) = controller.start() {
            error!("startup failed: {e}");
            port.terminate();
            bail!("startup failed: {e}");
        }

        info!("treadmill_io ready (proxy=on)");

        while !SIGNALLED.load(Ordering::Relaxed) && controller.is_running() {
            thread::sleep(Duration::from_millis(200));
        }

        info!("shutting down");
        controller.stop();

        // Best-effort pin release; the peripheral outlives us either way
        port.write(cfg.motor_write, false);
        port.set_mode(cfg.motor_write, PinMode::Input);
        port.terminate();

        info!("treadmill_io stopped");
        Ok(())
    }
}
