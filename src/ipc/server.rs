//! IPC server: Unix domain socket, NDJSON protocol, single-client.
//!
//! One UI client is served at a time; later connections wait in the backlog
//! until the current one leaves. The client's peer uid must be on the
//! allowlist. Fail-closed: with no UI connected, `notify` reports
//! `Unavailable` and the broker denies.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::id::RequestId;
use super::types::{
    IpcKind, IpcMessage, SuRequestPayload, SuWithdrawnPayload, KNOWN_TYPES, SU_REQUEST,
    SU_WITHDRAWN,
};
use crate::broker::{Notifier, NotifyStatus, WithdrawReason};
use crate::error::{BrokerError, Result};
use crate::identity::{Identity, IdentityResolver};

// ── Constants ───────────────────────────────────────────────

/// Default socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/rootgate/ui.sock";

/// Maximum line size (1 MiB). Lines exceeding this cause disconnect.
const MAX_LINE_BYTES: usize = 1_048_576;

/// Poll interval for accept, event writes and shutdown checks.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

// ── Bounded Line Reader ─────────────────────────────────────

/// Result of reading a bounded line.
#[derive(Debug, PartialEq)]
pub enum ReadLineResult {
    /// A complete line was read (without the trailing newline).
    Line(String),
    /// The stream was closed (EOF).
    Eof,
}

/// Read a single newline-terminated line, enforcing a size cap.
///
/// Returns `Err` if the line exceeds `MAX_LINE_BYTES` before a newline
/// is found, or on I/O error. Empty lines (just `\n`) return
/// `Ok(ReadLineResult::Line(""))`.
pub fn read_line_bounded<R: BufRead>(reader: &mut R) -> io::Result<ReadLineResult> {
    let mut buf = Vec::new();
    let n = reader
        .by_ref()
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(ReadLineResult::Eof);
    }
    if buf.len() > MAX_LINE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("[IPC_OVERSIZE] line exceeds {MAX_LINE_BYTES} bytes"),
        ));
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let s = String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(ReadLineResult::Line(s))
}

/// Parse a JSON line into an IpcMessage. Returns `Ok(None)` for unknown
/// message types (logged but not an error). Returns `Err` for invalid JSON.
pub fn parse_ipc_line(line: &str) -> std::result::Result<Option<IpcMessage>, serde_json::Error> {
    let msg: IpcMessage = serde_json::from_str(line)?;
    if KNOWN_TYPES.contains(&msg.msg_type.as_str()) {
        Ok(Some(msg))
    } else {
        warn!("[IPC_UNKNOWN_TYPE] ignoring message with type: {}", msg.msg_type);
        Ok(None)
    }
}

// ── IPC Server ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IpcConfig {
    pub socket_path: PathBuf,
    /// Peer uids allowed to act as the UI.
    pub allowed_uids: Vec<u32>,
    /// Advertised to the UI in `su.request.timeout_ms`.
    pub prompt_timeout: Duration,
}

/// What the server hands to the daemon side.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// An allowlisted UI client just connected.
    Connected { uid: u32 },
    /// A decision or command from the UI client.
    Message(IpcMessage),
}

/// State shared between the handle and the listener thread.
struct Shared {
    ui_connected: AtomicBool,
    shutdown: AtomicBool,
    /// `su.request` events without a decision yet, replayed to each new client.
    open_prompts: Mutex<BTreeMap<RequestId, IpcMessage>>,
}

impl Shared {
    fn prompts(&self) -> std::sync::MutexGuard<'_, BTreeMap<RequestId, IpcMessage>> {
        self.open_prompts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle for the IPC server. Implements [`Notifier`] for the broker.
pub struct IpcServer {
    event_tx: Sender<IpcMessage>,
    shared: Arc<Shared>,
    socket_path: PathBuf,
    prompt_timeout: Duration,
    listener_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl IpcServer {
    /// Start the IPC server.
    ///
    /// Spawns a background thread that serves a single client at a time.
    /// Returns the handle plus the receiver for everything the UI sends.
    pub fn start(
        config: IpcConfig,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Result<(Self, Receiver<Inbound>)> {
        let path = config.socket_path;
        let bind_err = |reason: String| BrokerError::ListenerBind {
            path: path.clone(),
            reason,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| bind_err(e.to_string()))?;
        }
        if path.exists() {
            info!("[IPC] removing stale socket: {}", path.display());
            std::fs::remove_file(&path).map_err(|e| bind_err(e.to_string()))?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| bind_err(e.to_string()))?;

        // chmod 600: owner-only access.
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms).map_err(|e| bind_err(e.to_string()))?;
        }

        // Non-blocking so the loop can observe shutdown.
        listener
            .set_nonblocking(true)
            .map_err(|e| bind_err(e.to_string()))?;

        info!(
            "[IPC] listening on {} (single-client, uids {:?})",
            path.display(),
            config.allowed_uids
        );

        let (event_tx, event_rx) = mpsc::channel::<IpcMessage>();
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>();
        let shared = Arc::new(Shared {
            ui_connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            open_prompts: Mutex::new(BTreeMap::new()),
        });

        let loop_shared = Arc::clone(&shared);
        let allowed_uids = config.allowed_uids;
        let listener_handle = thread::Builder::new()
            .name("ipc-listener".to_string())
            .spawn(move || {
                Self::listener_loop(
                    listener,
                    event_rx,
                    inbound_tx,
                    loop_shared,
                    resolver,
                    allowed_uids,
                );
            })
            .map_err(|e| BrokerError::Ipc(format!("spawn listener thread: {e}")))?;

        Ok((
            Self {
                event_tx,
                shared,
                socket_path: path,
                prompt_timeout: config.prompt_timeout,
                listener_handle: Mutex::new(Some(listener_handle)),
            },
            inbound_rx,
        ))
    }

    /// Check if a UI client is currently connected.
    pub fn is_ui_connected(&self) -> bool {
        self.shared.ui_connected.load(Ordering::Acquire)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Request IDs the UI has been asked about and not yet answered.
    pub fn open_prompts(&self) -> Vec<RequestId> {
        self.shared.prompts().keys().cloned().collect()
    }

    /// Emit an event to the connected UI client (non-blocking).
    pub fn emit_event(&self, event: IpcMessage) {
        if let Err(e) = self.event_tx.send(event) {
            warn!("[IPC] failed to queue event: {e}");
        }
    }

    /// Stop accepting clients and join the listener thread.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let handle = self
            .listener_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("[IPC] listener thread panicked");
            }
        }
    }

    /// Listener loop: serves one client at a time until shutdown.
    fn listener_loop(
        listener: UnixListener,
        event_rx: Receiver<IpcMessage>,
        inbound_tx: Sender<Inbound>,
        shared: Arc<Shared>,
        resolver: Arc<dyn IdentityResolver>,
        allowed_uids: Vec<u32>,
    ) {
        while !shared.shutdown.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    let uid = match resolver.resolve(&stream) {
                        Ok(identity) => identity.uid,
                        Err(e) => {
                            warn!("[IPC_REJECTED] {e}; dropping client");
                            continue;
                        }
                    };
                    if !allowed_uids.contains(&uid) {
                        warn!(uid, "[IPC_REJECTED] uid {uid} not allowed to act as UI");
                        continue;
                    }

                    info!(uid, "[IPC] client connected");
                    shared.ui_connected.store(true, Ordering::Release);

                    // Drain stale events from the previous session; open
                    // prompts are replayed from the shared table instead.
                    while event_rx.try_recv().is_ok() {}
                    let replay: Vec<IpcMessage> = shared.prompts().values().cloned().collect();
                    let _ = inbound_tx.send(Inbound::Connected { uid });

                    Self::handle_client(stream, &event_rx, &inbound_tx, &shared, replay);

                    shared.ui_connected.store(false, Ordering::Release);
                    info!(uid, "[IPC_CLIENT_DISCONNECTED]");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    warn!("[IPC] accept error: {e}");
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
        debug!("[IPC] listener loop exited");
    }

    /// Handle a single connected client. Returns when the client
    /// disconnects, on protocol violation, or on shutdown.
    fn handle_client(
        stream: UnixStream,
        event_rx: &Receiver<IpcMessage>,
        inbound_tx: &Sender<Inbound>,
        shared: &Arc<Shared>,
        replay: Vec<IpcMessage>,
    ) {
        if let Err(e) = stream.set_nonblocking(false) {
            warn!("[IPC] failed to configure stream: {e}");
            return;
        }

        let read_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!("[IPC] failed to clone stream: {e}");
                return;
            }
        };
        let write_stream = stream;

        // Reader thread: decisions and commands from the client.
        let reader_tx = inbound_tx.clone();
        let reader_shared = Arc::clone(shared);
        let reader_handle = thread::spawn(move || {
            let mut reader = BufReader::new(&read_stream);
            loop {
                match read_line_bounded(&mut reader) {
                    Ok(ReadLineResult::Line(line)) => {
                        if line.is_empty() {
                            continue;
                        }
                        match parse_ipc_line(&line) {
                            Ok(Some(msg)) if msg.kind == IpcKind::Event => {
                                debug!("[IPC] ignoring event {} from client", msg.msg_type);
                            }
                            Ok(Some(msg)) => {
                                if let Some(dp) = msg.as_decision_payload() {
                                    reader_shared.prompts().remove(&dp.request_id);
                                }
                                if let Err(e) = reader_tx.send(Inbound::Message(msg)) {
                                    warn!("[IPC] inbound send error: {e}");
                                    return;
                                }
                            }
                            Ok(None) => {
                                // Unknown type, already logged by parse_ipc_line
                            }
                            Err(e) => {
                                warn!("[IPC_INVALID_JSON] {e}; disconnecting client");
                                return;
                            }
                        }
                    }
                    Ok(ReadLineResult::Eof) => return,
                    Err(e) => {
                        warn!("[IPC] read error: {e}; disconnecting client");
                        return;
                    }
                }
            }
        });

        let mut writer = io::BufWriter::new(&write_stream);
        let mut healthy = replay.iter().all(|msg| write_event(&mut writer, msg));

        // Writer loop: events to the client.
        while healthy {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            match event_rx.recv_timeout(POLL_INTERVAL) {
                Ok(event) => healthy = write_event(&mut writer, &event),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if reader_handle.is_finished() {
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        // Unblock the reader if it is still waiting on the socket.
        let _ = write_stream.shutdown(std::net::Shutdown::Both);
        let _ = reader_handle.join();
    }
}

/// Write one event line; `false` means the client is gone.
fn write_event<W: Write>(writer: &mut W, event: &IpcMessage) -> bool {
    let line = match event.to_ndjson() {
        Ok(line) => line,
        Err(e) => {
            error!("[IPC] serialize error: {e}");
            return true;
        }
    };
    if let Err(e) = writer.write_all(line.as_bytes()).and_then(|()| writer.flush()) {
        warn!("[IPC] write error: {e}");
        return false;
    }
    true
}

impl Notifier for IpcServer {
    fn notify(&self, identity: &Identity, request_id: &RequestId) -> NotifyStatus {
        let timeout_ms = u64::try_from(self.prompt_timeout.as_millis()).unwrap_or(u64::MAX);
        let payload = SuRequestPayload::new(identity, request_id, timeout_ms);
        let msg = match IpcMessage::event(SU_REQUEST, &payload) {
            Ok(msg) => msg,
            Err(e) => {
                error!(request_id = %request_id, "[IPC] cannot encode su.request: {e}");
                return NotifyStatus::Unavailable;
            }
        };

        // Held for replay even with no client, so a UI launched for this
        // request still sees it.
        self.shared.prompts().insert(request_id.clone(), msg.clone());
        if !self.is_ui_connected() {
            debug!(request_id = %request_id, "[IPC] no UI connected");
            return NotifyStatus::Unavailable;
        }
        self.emit_event(msg);
        NotifyStatus::Dispatched
    }

    fn withdraw(&self, request_id: &RequestId, reason: WithdrawReason) {
        let was_open = self.shared.prompts().remove(request_id).is_some();
        if !was_open || !self.is_ui_connected() {
            return;
        }
        let payload = SuWithdrawnPayload {
            request_id: request_id.clone(),
            reason,
        };
        match IpcMessage::event(SU_WITHDRAWN, &payload) {
            Ok(msg) => self.emit_event(msg),
            Err(e) => error!("[IPC] cannot encode su.withdrawn: {e}"),
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown();
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
            debug!("[IPC] cleaned up socket: {}", self.socket_path.display());
        }
    }
}

// ── Tests ───────────────────────────────────────────────────
