//! Request ID generation for prompt/decision correlation.
//!
//! IDs are `req-<boot nonce>-<monotonic counter>`. The nonce is drawn once
//! per process so a decision left over from before a daemon restart cannot
//! match a request issued after it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

static COUNTER: AtomicU64 = AtomicU64::new(0);
static BOOT_NONCE: OnceLock<u32> = OnceLock::new();

fn boot_nonce() -> u32 {
    *BOOT_NONCE.get_or_init(rand::random::<u32>)
}

/// Identifier of one pending root request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh, process-unique request ID.
    pub fn generate() -> Self {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("req-{:08x}-{n}", boot_nonce()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generate a unique message ID for IPC envelopes: `msg-<counter>`.
pub fn generate_message_id() -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("msg-{n}")
}
