//! Unix-socket control plane: accept, read, dispatch, fan out.
//!
//! One stream socket serves up to [`MAX_CLIENTS`] local clients. Inbound
//! traffic is newline-delimited JSON commands ([`parse_command`]);
//! outbound traffic is the event ring, drained to each client at its own
//! pace through a per-client cursor.
//!
//! The listener and every client socket are nonblocking. [`poll`] runs
//! one accept/read/flush cycle and returns; the control thread calls it
//! on a ~20 ms cadence. A client that stalls (`WouldBlock`) simply
//! retries next cycle; one that falls more than a ring's worth behind is
//! skipped forward and silently loses the oldest events.
//!
//! [`poll`]: ControlServer::poll
//! [`parse_command`]: crate::messages::parse_command

use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};

use log::{debug, info, warn};

use crate::messages::{parse_command, Command, Event};
use crate::ring::{EventRing, RING_SLOTS};

/// Well-known socket path of the production daemon.
pub const SOCKET_PATH: &str = "/tmp/treadmill_io.sock";

/// Maximum simultaneously connected clients.
pub const MAX_CLIENTS: usize = 4;

/// Per-client ingress buffer size; a longer line without a newline is
/// discarded wholesale.
const CLIENT_BUF_SIZE: usize = 1024;

/// Handler for each parsed command.
pub type CommandCallback = Box<dyn FnMut(Command) + Send>;

/// Handler fired after a client is removed, with the remaining count.
pub type DisconnectCallback = Box<dyn FnMut(usize) + Send>;

struct Client {
    stream: UnixStream,
    buf: Vec<u8>,
    cursor: u32,
}

enum ClientState {
    Alive,
    Closed,
}

/// The control-plane socket server. See the [module docs](self).
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    clients: Vec<Client>,
    ring: Arc<EventRing>,
    cmd_cb: Option<CommandCallback>,
    disconnect_cb: Option<DisconnectCallback>,
}

impl ControlServer {
    /// Bind the socket at `path` (replacing any stale file), make it
    /// world-writable so clients under other users can connect, and set
    /// the listener nonblocking.
    pub fn bind<P: AsRef<Path>>(path: P, ring: Arc<EventRing>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = fs::remove_file(&path);

        let listener = UnixListener::bind(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o777))?;
        listener.set_nonblocking(true)?;

        info!("control socket listening on {}", path.display());
        Ok(Self {
            listener,
            path,
            clients: Vec::with_capacity(MAX_CLIENTS),
            ring: Arc::clone(&ring),
            cmd_cb: None,
            disconnect_cb: None,
        })
    }

    /// Set the handler for parsed commands.
    pub fn on_command(&mut self, cb: CommandCallback) {
        self.cmd_cb = Some(cb);
    }

    /// Set the handler fired after each client removal.
    pub fn on_client_disconnect(&mut self, cb: DisconnectCallback) {
        self.disconnect_cb = Some(cb);
    }

    /// Number of currently connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Run one accept/read/dispatch/flush cycle. Nonblocking; the caller
    /// owns the polling cadence.
    pub fn poll(&mut self) {
        self.accept_pending();
        self.read_clients();
        self.flush_ring();
    }

    fn accept_pending(&mut self) {
        match self.listener.accept() {
            Ok((mut stream, _)) => {
                if self.clients.len() >= MAX_CLIENTS {
                    // Best-effort error on the doomed socket, then close
                    let line = Event::Error {
                        msg: "too many clients".into(),
                    }
                    .to_line();
                    let _ = stream.write_all(&line);
                    warn!("rejecting client: {} already connected", MAX_CLIENTS);
                    return;
                }
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!("client setup failed: {e}");
                    return;
                }
                // A fresh client starts at the current ring position;
                // it only sees events from now on.
                let cursor = self.ring.snapshot().count;
                self.clients.push(Client {
                    stream,
                    buf: Vec::with_capacity(CLIENT_BUF_SIZE),
                    cursor,
                });
                info!("client connected (total={})", self.clients.len());
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!("accept failed: {e}"),
        }
    }

    fn read_clients(&mut self) {
        let mut i = 0;
        while i < self.clients.len() {
            let (state, commands) = Self::drain_client(&mut self.clients[i]);

            if let Some(cb) = self.cmd_cb.as_mut() {
                for cmd in commands {
                    cb(cmd);
                }
            }

            match state {
                ClientState::Closed => self.remove_client(i),
                ClientState::Alive => i += 1,
            }
        }
    }

    // Pull bytes off one client and cut complete lines out of its buffer.
    fn drain_client(client: &mut Client) -> (ClientState, Vec<Command>) {
        let mut commands = Vec::new();
        let mut chunk = [0u8; CLIENT_BUF_SIZE];

        match client.stream.read(&mut chunk) {
            Ok(0) => return (ClientState::Closed, commands),
            Ok(n) => client.buf.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                return (ClientState::Alive, commands)
            }
            Err(_) => return (ClientState::Closed, commands),
        }

        while let Some(nl) = client.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = client.buf.drain(..=nl).take(nl).collect();
            if let Some(cmd) = parse_command(&line) {
                commands.push(cmd);
            } else if !line.is_empty() {
                debug!("discarding unparseable command line ({} bytes)", line.len());
            }
        }

        // No newline and the line already exceeds the frame limit:
        // drop it rather than grow without bound
        if client.buf.len() >= CLIENT_BUF_SIZE {
            warn!("client sent {} bytes without newline, discarding", client.buf.len());
            client.buf.clear();
        }

        (ClientState::Alive, commands)
    }

    fn remove_client(&mut self, idx: usize) {
        self.clients.remove(idx);
        let remaining = self.clients.len();
        info!("client removed (remaining={remaining})");
        if let Some(cb) = self.disconnect_cb.as_mut() {
            cb(remaining);
        }
    }

    // Drain the ring to every client from its own cursor.
    fn flush_ring(&mut self) {
        let snap = self.ring.snapshot();

        let mut i = 0;
        while i < self.clients.len() {
            let client = &mut self.clients[i];

            let mut pending = snap.count.wrapping_sub(client.cursor);
            if pending == 0 {
                i += 1;
                continue;
            }
            if pending > RING_SLOTS as u32 {
                // Fell out of the window: skip to the oldest retained
                // event, acknowledging the loss
                client.cursor = snap.count.wrapping_sub(RING_SLOTS as u32);
                pending = RING_SLOTS as u32;
            }

            let start = (snap.head + RING_SLOTS - pending as usize) % RING_SLOTS;
            let mut failed = false;
            let mut stalled = false;

            for k in 0..pending as usize {
                let Some(msg) = self.ring.get((start + k) % RING_SLOTS) else {
                    continue;
                };
                match client.stream.write(&msg) {
                    Ok(_) => {}
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        stalled = true;
                        break;
                    }
                    Err(_) => {
                        failed = true;
                        break;
                    }
                }
            }

            if failed {
                warn!("client write error, dropping client");
                self.remove_client(i);
            } else {
                if !stalled {
                    client.cursor = snap.count;
                }
                i += 1;
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.clients.clear();
        let _ = fs::remove_file(&self.path);
    }
}
