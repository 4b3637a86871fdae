//! IPC message types for daemon <-> UI communication.
//!
//! Wire format: NDJSON (one JSON object per line, terminated by `\n`).

use serde::{Deserialize, Serialize};

use super::id::{generate_message_id, RequestId};
use crate::broker::WithdrawReason;
use crate::identity::Identity;
use crate::trust::TrustRecord;
use crate::wire::Outcome;

// ── Message types ───────────────────────────────────────────

pub const SU_REQUEST: &str = "su.request";
pub const SU_WITHDRAWN: &str = "su.withdrawn";
pub const SU_DECISION: &str = "su.decision";
pub const TRUST_SNAPSHOT: &str = "trust.snapshot";
pub const TRUST_LIST: &str = "trust.list";
pub const TRUST_REVOKE: &str = "trust.revoke";
pub const DAEMON_STATUS: &str = "daemon.status";

/// Every `type` value either side understands.
pub const KNOWN_TYPES: &[&str] = &[
    SU_REQUEST,
    SU_WITHDRAWN,
    SU_DECISION,
    TRUST_SNAPSHOT,
    TRUST_LIST,
    TRUST_REVOKE,
    DAEMON_STATUS,
];

// ── Envelope ────────────────────────────────────────────────

/// Top-level IPC message envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IpcMessage {
    pub id: String,
    pub kind: IpcKind,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub ts_ms: u64,
    pub payload: serde_json::Value,
}

/// Message direction.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IpcKind {
    /// daemon -> UI
    Event,
    /// UI -> daemon, answers a prompt
    Decision,
    /// UI -> daemon, trust store management
    Command,
}

/// Decision variants returned by the UI.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AllowOnce,
    AllowAlways,
    DenyOnce,
    DenyAlways,
}

impl Decision {
    pub fn outcome(self) -> Outcome {
        match self {
            Decision::AllowOnce | Decision::AllowAlways => Outcome::Allow,
            Decision::DenyOnce | Decision::DenyAlways => Outcome::Deny,
        }
    }

    /// `*_always` asks for the decision to be remembered.
    pub fn persist(self) -> bool {
        matches!(self, Decision::AllowAlways | Decision::DenyAlways)
    }
}

// ── Event Payloads (daemon -> UI) ───────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SuRequestPayload {
    pub request_id: RequestId,
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
    #[serde(default)]
    pub packages: Vec<String>,
    pub timeout_ms: u64,
}

impl SuRequestPayload {
    pub fn new(identity: &Identity, request_id: &RequestId, timeout_ms: u64) -> Self {
        Self {
            request_id: request_id.clone(),
            uid: identity.uid,
            gid: identity.gid,
            pid: identity.pid,
            packages: identity.packages.clone(),
            timeout_ms,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SuWithdrawnPayload {
    pub request_id: RequestId,
    pub reason: WithdrawReason,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrustSnapshotPayload {
    pub records: Vec<TrustRecord>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DaemonStatusPayload {
    pub version: String,
    pub pending: u32,
    pub ui_connected: bool,
}

// ── Decision / Command Payloads (UI -> daemon) ──────────────

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DecisionPayload {
    pub request_id: RequestId,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrustRevokePayload {
    pub uid: u32,
}

// ── Helpers ─────────────────────────────────────────────────

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl IpcMessage {
    fn new(kind: IpcKind, msg_type: &str, payload: serde_json::Value) -> Self {
        Self {
            id: generate_message_id(),
            kind,
            msg_type: msg_type.to_string(),
            ts_ms: now_ms(),
            payload,
        }
    }

    /// Create a new event message.
    pub fn new_event(msg_type: &str, payload: serde_json::Value) -> Self {
        Self::new(IpcKind::Event, msg_type, payload)
    }

    /// Create a new decision message.
    pub fn new_decision(msg_type: &str, payload: serde_json::Value) -> Self {
        Self::new(IpcKind::Decision, msg_type, payload)
    }

    /// Create a new command message.
    pub fn new_command(msg_type: &str, payload: serde_json::Value) -> Self {
        Self::new(IpcKind::Command, msg_type, payload)
    }

    /// Typed event constructor. Payload structs here always serialize.
    pub fn event<P: Serialize>(msg_type: &str, payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self::new_event(msg_type, serde_json::to_value(payload)?))
    }

    /// Serialize to a single NDJSON line (with trailing newline).
    pub fn to_ndjson(&self) -> Result<String, serde_json::Error> {
        let mut s = serde_json::to_string(self)?;
        s.push('\n');
        Ok(s)
    }

    /// Try to extract a DecisionPayload from this message.
    pub fn as_decision_payload(&self) -> Option<DecisionPayload> {
        if self.kind != IpcKind::Decision || self.msg_type != SU_DECISION {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Try to extract a TrustRevokePayload from this message.
    pub fn as_revoke_payload(&self) -> Option<TrustRevokePayload> {
        if self.kind != IpcKind::Command || self.msg_type != TRUST_REVOKE {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Try to extract an SuRequestPayload from this message.
    pub fn as_su_request(&self) -> Option<SuRequestPayload> {
        if self.kind != IpcKind::Event || self.msg_type != SU_REQUEST {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

// ── Tests ───────────────────────────────────────────────────
