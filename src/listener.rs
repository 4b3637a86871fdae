//! Request listener: accepts requester connections on the request socket.
//!
//! Each accepted connection is served by the broker on its own thread.
//! Connections beyond the broker's in-flight budget are denied on the
//! accept thread without prompting.
//!
//! A running daemon holds an exclusive lock on `<socket>.lock` for as long
//! as its listener lives. The socket itself is never probed with a connect:
//! on a live daemon that connect would be a root request.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, error, info, warn};

use crate::broker::DecisionBroker;
use crate::error::{BrokerError, Result};

/// Default request socket path.
pub const DEFAULT_REQUEST_SOCKET: &str = "/run/rootgate/request.sock";

/// Default request socket mode. Any local app may ask; the peer credential
/// decides who it is.
pub const DEFAULT_SOCKET_MODE: u32 = 0o666;

/// Poll interval while no connection is waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Back-off after an accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(500);

/// Mode for the instance lock file.
const LOCK_FILE_MODE: u32 = 0o600;

pub struct RequestListener {
    listener: UnixListener,
    path: PathBuf,
    /// Held (flock LOCK_EX) for the listener's lifetime; released on drop.
    _instance_lock: File,
}

/// `<socket path>.lock`
pub fn lock_path(socket: &Path) -> PathBuf {
    let mut name = OsString::from(socket.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

impl RequestListener {
    /// Bind the request socket and apply `mode`.
    ///
    /// Fails with `ListenerBind` while another instance holds the lock. With
    /// the lock taken, a leftover socket file belongs to a dead daemon and is
    /// removed.
    pub fn bind(path: impl Into<PathBuf>, mode: u32) -> Result<Self> {
        let path = path.into();
        let bind_err = |reason: String| BrokerError::ListenerBind {
            path: path.clone(),
            reason,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| bind_err(e.to_string()))?;
        }

        let lock = lock_path(&path);
        let instance_lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(LOCK_FILE_MODE)
            .open(&lock)
            .map_err(|e| bind_err(format!("open {}: {e}", lock.display())))?;
        instance_lock.try_lock_exclusive().map_err(|e| {
            bind_err(format!(
                "another daemon holds {} ({e})",
                lock.display()
            ))
        })?;

        if path.exists() {
            info!("[LISTENER] removing stale socket: {}", path.display());
            std::fs::remove_file(&path).map_err(|e| bind_err(e.to_string()))?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| bind_err(e.to_string()))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| bind_err(e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| bind_err(e.to_string()))?;

        info!("[LISTENER] listening on {} (mode {mode:04o})", path.display());
        Ok(Self {
            listener,
            path,
            _instance_lock: instance_lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self, broker: Arc<DecisionBroker>) -> Result<ListenerHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let join = thread::Builder::new()
            .name("request-listener".to_string())
            .spawn(move || self.serve(&broker, &flag))
            .map_err(|e| BrokerError::ListenerBind {
                path: PathBuf::new(),
                reason: format!("spawn accept thread: {e}"),
            })?;
        Ok(ListenerHandle {
            shutdown,
            join: Some(join),
        })
    }

    /// Accept until `shutdown` is set. Blocks the calling thread.
    pub fn serve(self, broker: &Arc<DecisionBroker>, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _addr)) => dispatch(stream, broker),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("[LISTENER] accept error: {e}");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }
        debug!("[LISTENER] accept loop exited");
    }
}

fn dispatch(stream: UnixStream, broker: &Arc<DecisionBroker>) {
    if let Err(e) = stream.set_nonblocking(false) {
        warn!("[LISTENER] cannot configure connection: {e}");
        return;
    }
    let Some(slot) = broker.admit() else {
        broker.reject_overloaded(stream);
        return;
    };
    let worker_broker = Arc::clone(broker);
    let spawned = thread::Builder::new()
        .name("su-request".to_string())
        .spawn(move || {
            let _slot = slot;
            worker_broker.handle_connection(stream);
        });
    if let Err(e) = spawned {
        // The connection is dropped unanswered, which the requester reads as deny.
        error!("[LISTENER] cannot spawn worker: {e}");
    }
}

impl Drop for RequestListener {
    fn drop(&mut self) {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
            debug!("[LISTENER] cleaned up socket: {}", self.path.display());
        }
    }
}

/// Handle to a running accept loop.
pub struct ListenerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl ListenerHandle {
    /// Ask the loop to stop. In-flight requests finish on their own threads.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Stop the loop and wait for it; the socket file is removed.
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Block until the accept loop exits.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("[LISTENER] accept thread panicked");
            }
        }
    }

    fn stop(&mut self) {
        self.request_shutdown();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("[LISTENER] accept thread panicked");
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
