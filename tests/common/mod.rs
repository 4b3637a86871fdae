//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rootgate::broker::{
    BrokerConfig, DecisionBroker, Notifier, NotifyStatus, RequestOutcome, WithdrawReason,
};
use rootgate::error::{BrokerError, Result};
use rootgate::identity::{Identity, IdentityResolver};
use rootgate::ipc::id::RequestId;
use rootgate::trust::TrustStore;
use rootgate::wire::{self, Outcome};

pub const WAIT: Duration = Duration::from_secs(5);

// ── Resolvers ───────────────────────────────────────────────

/// Maps the daemon-side fd of a connection to a uid. Unknown fds fail.
#[derive(Default)]
pub struct ScriptedResolver {
    by_fd: Mutex<HashMap<RawFd, u32>>,
}

impl ScriptedResolver {
    pub fn assign(&self, stream: &UnixStream, uid: u32) {
        self.by_fd.lock().unwrap().insert(stream.as_raw_fd(), uid);
    }
}

impl IdentityResolver for ScriptedResolver {
    fn resolve(&self, stream: &UnixStream) -> Result<Identity> {
        let uid = self
            .by_fd
            .lock()
            .unwrap()
            .get(&stream.as_raw_fd())
            .copied()
            .ok_or_else(|| BrokerError::identity("no credential scripted for fd"))?;
        Ok(Identity::new(uid, uid, 4242))
    }
}

pub struct FailingResolver;

impl IdentityResolver for FailingResolver {
    fn resolve(&self, _stream: &UnixStream) -> Result<Identity> {
        Err(BrokerError::identity("SO_PEERCRED failed: EINVAL"))
    }
}

// ── Notifier ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Notified { uid: u32, request_id: RequestId },
    Withdrawn { request_id: RequestId, reason: WithdrawReason },
}

/// Records every call; answers `notify` with a fixed status.
pub struct RecordingNotifier {
    status: NotifyStatus,
    events: Mutex<Vec<Event>>,
    changed: Condvar,
}

impl RecordingNotifier {
    pub fn dispatching() -> Self {
        Self::with_status(NotifyStatus::Dispatched)
    }

    pub fn unavailable() -> Self {
        Self::with_status(NotifyStatus::Unavailable)
    }

    fn with_status(status: NotifyStatus) -> Self {
        Self {
            status,
            events: Mutex::new(Vec::new()),
            changed: Condvar::new(),
        }
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_all();
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn notified(&self) -> Vec<(u32, RequestId)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Notified { uid, request_id } => Some((uid, request_id)),
                Event::Withdrawn { .. } => None,
            })
            .collect()
    }

    pub fn withdrawn(&self) -> Vec<(RequestId, WithdrawReason)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Withdrawn { request_id, reason } => Some((request_id, reason)),
                Event::Notified { .. } => None,
            })
            .collect()
    }

    /// Block until at least `n` prompts were issued; returns the n-th ID.
    pub fn wait_for_prompt(&self, n: usize) -> RequestId {
        let deadline = Instant::now() + WAIT;
        let mut events = self.events.lock().unwrap();
        loop {
            let prompts: Vec<RequestId> = events
                .iter()
                .filter_map(|e| match e {
                    Event::Notified { request_id, .. } => Some(request_id.clone()),
                    Event::Withdrawn { .. } => None,
                })
                .collect();
            if prompts.len() >= n {
                return prompts[n - 1].clone();
            }
            let now = Instant::now();
            assert!(now < deadline, "prompt #{n} never issued");
            events = self.changed.wait_timeout(events, deadline - now).unwrap().0;
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, identity: &Identity, request_id: &RequestId) -> NotifyStatus {
        self.push(Event::Notified {
            uid: identity.uid,
            request_id: request_id.clone(),
        });
        self.status
    }

    fn withdraw(&self, request_id: &RequestId, reason: WithdrawReason) {
        self.push(Event::Withdrawn {
            request_id: request_id.clone(),
            reason,
        });
    }
}

// ── Harness ─────────────────────────────────────────────────

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub broker: Arc<DecisionBroker>,
    pub resolver: Arc<ScriptedResolver>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_notifier(config, RecordingNotifier::dispatching())
    }

    pub fn with_notifier(config: BrokerConfig, notifier: RecordingNotifier) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let trust = Arc::new(TrustStore::open(dir.path().join("trusted.txt")).unwrap());
        let resolver = Arc::new(ScriptedResolver::default());
        let notifier = Arc::new(notifier);
        let broker = Arc::new(DecisionBroker::new(
            config,
            trust,
            resolver.clone(),
            notifier.clone(),
        ));
        Self {
            dir,
            broker,
            resolver,
            notifier,
        }
    }

    pub fn trust_path(&self) -> std::path::PathBuf {
        self.dir.path().join("trusted.txt")
    }

    /// Start one request as `uid`; returns the requester end and the
    /// thread serving the daemon end.
    pub fn request(&self, uid: u32) -> (UnixStream, thread::JoinHandle<RequestOutcome>) {
        let (daemon_end, requester_end) = UnixStream::pair().unwrap();
        self.resolver.assign(&daemon_end, uid);
        let broker = Arc::clone(&self.broker);
        let worker = thread::spawn(move || broker.handle_connection(daemon_end));
        (requester_end, worker)
    }
}

/// Read the requester's reply to EOF.
pub fn read_reply(mut stream: UnixStream) -> (Vec<u8>, Outcome) {
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let mut raw = Vec::new();
    let _ = stream.read_to_end(&mut raw);
    let outcome = wire::parse_reply(&raw);
    (raw, outcome)
}

pub fn quick_config() -> BrokerConfig {
    BrokerConfig {
        decision_timeout: Duration::from_secs(10),
        liveness_interval: Duration::from_millis(20),
        ..BrokerConfig::default()
    }
}
