//! Routes UI traffic into the broker and trust store.
//!
//! Decisions go to [`DecisionBroker::resolve`]; commands act on the trust
//! store. Every reply is an event queued back to the UI.

use std::io;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use super::server::{Inbound, IpcServer};
use super::types::{
    DaemonStatusPayload, IpcKind, IpcMessage, TrustSnapshotPayload, DAEMON_STATUS, SU_DECISION,
    TRUST_LIST, TRUST_REVOKE, TRUST_SNAPSHOT,
};
use crate::broker::{DecisionBroker, ResolveStatus};

/// Drain the server's inbound channel on a dedicated thread until the
/// server shuts down.
pub fn spawn_decision_pump(
    inbound: Receiver<Inbound>,
    broker: Arc<DecisionBroker>,
    server: Arc<IpcServer>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("ipc-decisions".to_string())
        .spawn(move || {
            for msg in inbound {
                for reply in handle_inbound(&broker, server.is_ui_connected(), msg) {
                    server.emit_event(reply);
                }
            }
            debug!("[IPC] decision pump exited");
        })
}

/// Apply one inbound item; returns the events to send back.
pub fn handle_inbound(
    broker: &DecisionBroker,
    ui_connected: bool,
    inbound: Inbound,
) -> Vec<IpcMessage> {
    let msg = match inbound {
        Inbound::Connected { .. } => {
            return [status_event(broker, ui_connected), snapshot_event(broker)]
                .into_iter()
                .flatten()
                .collect();
        }
        Inbound::Message(msg) => msg,
    };

    match (msg.kind, msg.msg_type.as_str()) {
        (IpcKind::Decision, SU_DECISION) => {
            let Some(dp) = msg.as_decision_payload() else {
                warn!("[IPC] malformed su.decision payload; ignored");
                return Vec::new();
            };
            let status =
                broker.resolve(&dp.request_id, dp.decision.outcome(), dp.decision.persist());
            match status {
                ResolveStatus::Accepted => {
                    info!(request_id = %dp.request_id, "[IPC] decision {:?} accepted", dp.decision)
                }
                ResolveStatus::Stale => {
                    debug!(request_id = %dp.request_id, "[IPC] decision arrived for a finished request")
                }
            }
            // The store is written by the waiting request thread, after this
            // returns; the UI asks for `trust.list` when it wants a fresh view.
            Vec::new()
        }
        (IpcKind::Command, TRUST_LIST) => snapshot_event(broker).into_iter().collect(),
        (IpcKind::Command, TRUST_REVOKE) => {
            let Some(p) = msg.as_revoke_payload() else {
                warn!("[IPC] malformed trust.revoke payload; ignored");
                return Vec::new();
            };
            match broker.trust().revoke(p.uid) {
                Ok(true) => info!(uid = p.uid, "[TRUST] revoked by UI"),
                Ok(false) => debug!(uid = p.uid, "[TRUST] revoke: no record"),
                Err(e) => error!(uid = p.uid, "[TRUST] revoke failed: {e}"),
            }
            snapshot_event(broker).into_iter().collect()
        }
        (IpcKind::Command, DAEMON_STATUS) => {
            status_event(broker, ui_connected).into_iter().collect()
        }
        (kind, msg_type) => {
            debug!("[IPC] ignoring {kind:?} {msg_type} from UI");
            Vec::new()
        }
    }
}

fn status_event(broker: &DecisionBroker, ui_connected: bool) -> Option<IpcMessage> {
    let payload = DaemonStatusPayload {
        version: env!("CARGO_PKG_VERSION").to_string(),
        pending: u32::try_from(broker.pending_count()).unwrap_or(u32::MAX),
        ui_connected,
    };
    encode(DAEMON_STATUS, &payload)
}

fn snapshot_event(broker: &DecisionBroker) -> Option<IpcMessage> {
    let payload = TrustSnapshotPayload {
        records: broker.trust().records(),
    };
    encode(TRUST_SNAPSHOT, &payload)
}

fn encode<P: serde::Serialize>(msg_type: &str, payload: &P) -> Option<IpcMessage> {
    match IpcMessage::event(msg_type, payload) {
        Ok(msg) => Some(msg),
        Err(e) => {
            error!("[IPC] cannot encode {msg_type}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConfig, Notifier, NotifyStatus};
    use crate::error::Result;
    use crate::identity::{Identity, IdentityResolver};
    use crate::ipc::id::RequestId;
    use crate::trust::TrustStore;
    use crate::wire::Outcome;
    use std::os::unix::net::UnixStream;

    struct NoResolver;

    impl IdentityResolver for NoResolver {
        fn resolve(&self, _stream: &UnixStream) -> Result<Identity> {
            Err(crate::error::BrokerError::identity("unused"))
        }
    }

    struct NoUi;

    impl Notifier for NoUi {
        fn notify(&self, _identity: &Identity, _request_id: &RequestId) -> NotifyStatus {
            NotifyStatus::Unavailable
        }
    }

    fn broker(dir: &tempfile::TempDir) -> DecisionBroker {
        let trust = Arc::new(TrustStore::open(dir.path().join("trusted.txt")).unwrap());
        DecisionBroker::new(
            BrokerConfig::default(),
            trust,
            Arc::new(NoResolver),
            Arc::new(NoUi),
        )
    }

    fn command(msg_type: &str, payload: serde_json::Value) -> Inbound {
        Inbound::Message(IpcMessage::new_command(msg_type, payload))
    }

    #[test]
    fn connect_sends_status_then_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let b = broker(&dir);
        let replies = handle_inbound(&b, true, Inbound::Connected { uid: 0 });
        let types: Vec<&str> = replies.iter().map(|m| m.msg_type.as_str()).collect();
        assert_eq!(types, vec![DAEMON_STATUS, TRUST_SNAPSHOT]);
        assert_eq!(replies[0].payload["ui_connected"], true);
        assert_eq!(replies[0].payload["pending"], 0);
    }

    #[test]
    fn trust_list_returns_sorted_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let b = broker(&dir);
        b.trust().record(10020, Outcome::Allow).unwrap();
        b.trust().record(10010, Outcome::Allow).unwrap();

        let replies = handle_inbound(&b, true, command(TRUST_LIST, serde_json::json!({})));
        assert_eq!(replies.len(), 1);
        let records = replies[0].payload["records"].as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["uid"], 10010);
        assert_eq!(records[1]["uid"], 10020);
    }

    #[test]
    fn trust_revoke_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let b = broker(&dir);
        b.trust().record(10010, Outcome::Allow).unwrap();

        let replies = handle_inbound(&b, true, command(TRUST_REVOKE, serde_json::json!({"uid": 10010})));
        assert!(b.trust().lookup(10010).is_none());
        assert_eq!(replies[0].msg_type, TRUST_SNAPSHOT);
        assert!(replies[0].payload["records"].as_array().unwrap().is_empty());
    }

    #[test]
    fn stale_decision_has_no_effect() {
        let dir = tempfile::tempdir().unwrap();
        let b = broker(&dir);
        let decision = IpcMessage::new_decision(
            SU_DECISION,
            serde_json::json!({"request_id": "req-deadbeef-9", "decision": "allow_always"}),
        );
        let replies = handle_inbound(&b, true, Inbound::Message(decision));
        assert!(replies.is_empty());
        assert!(b.trust().is_empty());
    }

    #[test]
    fn malformed_revoke_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let b = broker(&dir);
        let replies = handle_inbound(&b, true, command(TRUST_REVOKE, serde_json::json!({"uid": "x"})));
        assert!(replies.is_empty());
    }
}
