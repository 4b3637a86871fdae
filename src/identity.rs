//! Requester identity, resolved from the transport.
//!
//! ## Security invariants
//! - The uid is read from the kernel's peer credential (`SO_PEERCRED`),
//!   never from bytes the caller sends.
//! - A resolver failure is reported as `IdentityUnresolvable`; callers
//!   must deny.
//! - Package names are display data only. They never influence a decision.

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BrokerError, Result};

/// Who is asking, as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
    /// Package names sharing `uid`; empty when no package list is configured.
    #[serde(default)]
    pub packages: Vec<String>,
}

impl Identity {
    pub fn new(uid: u32, gid: u32, pid: i32) -> Self {
        Self {
            uid,
            gid,
            pid,
            packages: Vec::new(),
        }
    }

    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid={} pid={}", self.uid, self.pid)?;
        if let Some(first) = self.packages.first() {
            write!(f, " pkg={first}")?;
        }
        Ok(())
    }
}

/// Resolves the identity behind an accepted connection.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, stream: &UnixStream) -> Result<Identity>;
}

// ── Peer credentials ────────────────────────────────────────

/// Production resolver backed by the socket's peer credential.
#[derive(Debug, Clone, Default)]
pub struct PeerCredResolver {
    packages_list: Option<PathBuf>,
}

impl PeerCredResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also attach package names read from a `packages.list`-format file.
    pub fn with_packages_list(mut self, path: impl Into<PathBuf>) -> Self {
        self.packages_list = Some(path.into());
        self
    }

    fn packages_for(&self, uid: u32) -> Vec<String> {
        let Some(path) = &self.packages_list else {
            return Vec::new();
        };
        match read_packages_for_uid(path, uid) {
            Ok(names) => names,
            Err(e) => {
                debug!(uid, "[IDENTITY] cannot read package list {}: {e}", path.display());
                Vec::new()
            }
        }
    }
}

impl IdentityResolver for PeerCredResolver {
    fn resolve(&self, stream: &UnixStream) -> Result<Identity> {
        let identity = peer_credentials(stream)?;
        let packages = self.packages_for(identity.uid);
        Ok(identity.with_packages(packages))
    }
}

/// Read uid/gid/pid of the connected peer.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn peer_credentials(stream: &UnixStream) -> Result<Identity> {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

    let creds = getsockopt(stream, PeerCredentials)
        .map_err(|e| BrokerError::identity(format!("SO_PEERCRED failed: {e}")))?;
    if creds.pid() <= 0 {
        // The kernel reports pid 0 when the peer was never connected.
        return Err(BrokerError::identity("peer has no credential (pid 0)"));
    }
    Ok(Identity::new(creds.uid(), creds.gid(), creds.pid()))
}

/// Read uid/gid/pid of the connected peer.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn peer_credentials(_stream: &UnixStream) -> Result<Identity> {
    Err(BrokerError::identity(
        "peer credentials are not supported on this platform",
    ))
}

// ── Package list ────────────────────────────────────────────

/// Collect package names for `uid` from `packages.list` contents.
///
/// Each line is `<package> <uid> ...`. Lines that do not parse are skipped.
pub fn packages_for_uid(contents: &str, uid: u32) -> Vec<String> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let line_uid = fields.next()?.parse::<u32>().ok()?;
            (line_uid == uid).then(|| name.to_string())
        })
        .collect()
}

fn read_packages_for_uid(path: &Path, uid: u32) -> io::Result<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    Ok(packages_for_uid(&contents, uid))
}
