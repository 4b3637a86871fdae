//! Error taxonomy for the broker.
//!
//! Only `ListenerBind`, `StoreInsecure` and a `StoreIo` raised while opening
//! the store are fatal, and only at startup. Everything else is contained to
//! the request that produced it and resolves to Deny.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The peer credential of a connection could not be read.
    #[error("peer identity unresolvable: {reason}")]
    IdentityUnresolvable { reason: String },

    /// Reading or writing the trust store failed.
    #[error("trust store I/O error at {path:?}: {source}")]
    StoreIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The trust store file or its directory is writable by other users.
    #[error("trust store {path:?} has mode {mode:04o}; group/world-writable stores are refused")]
    StoreInsecure { path: PathBuf, mode: u32 },

    /// The well-known endpoint could not be bound.
    #[error("cannot bind {path:?}: {reason}")]
    ListenerBind { path: PathBuf, reason: String },

    /// No decision arrived within the configured window.
    #[error("no decision within {0:?}")]
    RequestTimeout(Duration),

    /// The requester hung up before a reply was sent.
    #[error("requester closed the connection early")]
    PeerClosedEarly,

    /// UI IPC channel failure.
    #[error("ipc error: {0}")]
    Ipc(String),
}

impl BrokerError {
    pub fn identity(reason: impl Into<String>) -> Self {
        Self::IdentityUnresolvable {
            reason: reason.into(),
        }
    }

    pub fn store_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::StoreIo {
            path: path.into(),
            source,
        }
    }

    /// True for the errors that must stop the daemon.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ListenerBind { .. } | Self::StoreInsecure { .. } | Self::StoreIo { .. }
        )
    }
}
