//! Decision broker: arbitrates trust-store hits against human prompts.
//!
//! Per connection:
//!
//! ```text
//! Received → IdentityResolved → CacheHit ───────────────────────→ Replied → Closed
//!                             ↘ CacheMiss → AwaitingDecision → Resolved ↗
//!                                                            ↘ TimedOut / Aborted → Deny
//! ```
//!
//! Policy: deny-by-default. Resolver failure, timeout, a missing UI, and a
//! requester that hangs up all end in Deny. The wait happens outside every
//! lock; the pending table lock only guards insert/remove.

use std::collections::HashMap;
use std::io;
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::socket::{recv, MsgFlags};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::identity::{Identity, IdentityResolver};
use crate::ipc::id::RequestId;
use crate::trust::TrustStore;
use crate::wire::{self, Outcome};

// ── Constants ───────────────────────────────────────────────

/// Default time a human has to answer a prompt.
pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between requester liveness probes while waiting.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_millis(250);

/// Default cap on concurrently handled requester connections.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 100;

/// Upper bound on probe reads per liveness check.
const MAX_DRAIN_READS: usize = 16;

// ── Configuration ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Hard per-request deadline for a human decision.
    pub decision_timeout: Duration,
    /// How often a waiting request checks whether its requester hung up.
    pub liveness_interval: Duration,
    /// Persist `deny_always` decisions. Off: only allows are remembered.
    pub persist_denials: bool,
    /// Connections beyond this many in flight are denied without a prompt.
    pub max_in_flight: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            persist_denials: false,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

// ── UI collaborator contract ────────────────────────────────

/// Whether a prompt could be handed to a UI collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStatus {
    /// The prompt was queued; a `resolve` call is expected later.
    Dispatched,
    /// Nobody can show the prompt. The broker denies immediately.
    Unavailable,
}

/// Why a pending prompt was withdrawn without a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawReason {
    TimedOut,
    PeerClosed,
    /// No collaborator took the prompt; the request was denied at once.
    NoCollaborator,
}

/// Out-of-process prompt surface.
///
/// `notify` must not block: it queues the prompt and returns. The
/// collaborator answers later through [`DecisionBroker::resolve`].
pub trait Notifier: Send + Sync {
    fn notify(&self, identity: &Identity, request_id: &RequestId) -> NotifyStatus;

    /// The request ended without a decision; the prompt can be dismissed.
    fn withdraw(&self, _request_id: &RequestId, _reason: WithdrawReason) {}
}

// ── Decisions and outcomes ──────────────────────────────────

/// A human decision for one pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub request_id: RequestId,
    pub outcome: Outcome,
    pub persist: bool,
}

/// Result of delivering a decision through the response channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    /// The request was still pending and took the decision.
    Accepted,
    /// Unknown or already finished request. No effect.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowSource {
    Cache,
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    IdentityUnresolvable,
    StoredDeny,
    UserDenied,
    Timeout,
    PeerClosed,
    NoCollaborator,
    Overloaded,
    /// The decision sender vanished without a decision.
    ChannelClosed,
}

/// How one requester connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Allowed { source: AllowSource },
    Denied { reason: DenyReason },
}

impl RequestOutcome {
    fn denied(reason: DenyReason) -> Self {
        Self::Denied { reason }
    }

    fn allowed(source: AllowSource) -> Self {
        Self::Allowed { source }
    }

    /// The wire outcome sent to the requester.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Allowed { .. } => Outcome::Allow,
            Self::Denied { .. } => Outcome::Deny,
        }
    }
}

// ── Pending requests ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    AwaitingDecision,
    Resolved,
    TimedOut,
    Aborted,
}

impl PendingState {
    fn is_terminal(self) -> bool {
        !matches!(self, PendingState::AwaitingDecision)
    }
}

/// One in-flight prompt, owned by the thread serving the connection.
#[derive(Debug)]
pub struct PendingRequest {
    pub identity: Identity,
    pub request_id: RequestId,
    pub arrival: Instant,
    state: PendingState,
}

impl PendingRequest {
    pub fn new(identity: Identity, request_id: RequestId) -> Self {
        Self {
            identity,
            request_id,
            arrival: Instant::now(),
            state: PendingState::AwaitingDecision,
        }
    }

    pub fn state(&self) -> PendingState {
        self.state
    }

    /// Move to a terminal state. Transitions never re-enter a state and
    /// never leave a terminal one; a rejected transition returns `false`.
    pub fn advance(&mut self, next: PendingState) -> bool {
        if self.state.is_terminal() || !next.is_terminal() {
            return false;
        }
        debug!(
            request_id = %self.request_id,
            "[SU_STATE] {:?} -> {next:?}",
            self.state
        );
        self.state = next;
        true
    }
}

/// Table entry: how to reach the waiting thread.
struct PendingEntry {
    uid: u32,
    decision_tx: SyncSender<Decision>,
}

/// Slot in the in-flight budget; released on drop.
pub struct InFlight {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Broker ──────────────────────────────────────────────────

pub struct DecisionBroker {
    config: BrokerConfig,
    trust: Arc<TrustStore>,
    resolver: Arc<dyn IdentityResolver>,
    notifier: Arc<dyn Notifier>,
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    in_flight: Arc<AtomicUsize>,
}

impl DecisionBroker {
    pub fn new(
        config: BrokerConfig,
        trust: Arc<TrustStore>,
        resolver: Arc<dyn IdentityResolver>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            trust,
            resolver,
            notifier,
            pending: Mutex::new(HashMap::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    /// IDs of requests currently awaiting a decision, sorted.
    pub fn pending_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.table().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve an in-flight slot, or `None` when the budget is spent.
    pub fn admit(&self) -> Option<InFlight> {
        let prev = self.in_flight.fetch_add(1, Ordering::AcqRel);
        let slot = InFlight {
            counter: Arc::clone(&self.in_flight),
        };
        if prev >= self.config.max_in_flight {
            // Dropping the slot gives the reservation back.
            drop(slot);
            return None;
        }
        Some(slot)
    }

    /// Deny-and-close a connection that did not get an in-flight slot.
    pub fn reject_overloaded(&self, mut stream: UnixStream) -> RequestOutcome {
        warn!(
            "[SU_DENIED] {} request(s) in flight; overloaded, deny-and-close",
            self.config.max_in_flight
        );
        let outcome = RequestOutcome::denied(DenyReason::Overloaded);
        finish(&mut stream, &outcome);
        outcome
    }

    /// Serve one requester connection to completion: decide, reply, close.
    pub fn handle_connection(&self, mut stream: UnixStream) -> RequestOutcome {
        let outcome = self.decide(&stream);
        finish(&mut stream, &outcome);
        outcome
    }

    fn decide(&self, stream: &UnixStream) -> RequestOutcome {
        let identity = match self.resolver.resolve(stream) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("[SU_DENIED] {e}; deny-and-close");
                return RequestOutcome::denied(DenyReason::IdentityUnresolvable);
            }
        };
        let uid = identity.uid;
        info!(uid, pid = identity.pid, "[SU_REQUEST] root requested by {identity}");

        if let Some(record) = self.trust.lookup(uid) {
            info!(uid, "[SU_TRUST_HIT] {} for uid {uid}", record.decision.as_str());
            return match record.decision {
                Outcome::Allow => RequestOutcome::allowed(AllowSource::Cache),
                Outcome::Deny => RequestOutcome::denied(DenyReason::StoredDeny),
            };
        }

        self.prompt(stream, identity)
    }

    /// Cache miss: open a pending slot, notify the UI, and wait.
    fn prompt(&self, stream: &UnixStream, identity: Identity) -> RequestOutcome {
        let request_id = RequestId::generate();
        let (decision_tx, decision_rx) = mpsc::sync_channel(1);
        self.table().insert(
            request_id.clone(),
            PendingEntry {
                uid: identity.uid,
                decision_tx,
            },
        );
        let _unregister = Unregister {
            broker: self,
            request_id: request_id.clone(),
        };

        let mut pending = PendingRequest::new(identity, request_id);
        let uid = pending.identity.uid;
        info!(uid, request_id = %pending.request_id, "[SU_PROMPT] awaiting decision");

        if self.notifier.notify(&pending.identity, &pending.request_id) == NotifyStatus::Unavailable
        {
            pending.advance(PendingState::Aborted);
            warn!(uid, "[SU_DENIED] no UI collaborator available; fail-closed deny");
            self.notifier
                .withdraw(&pending.request_id, WithdrawReason::NoCollaborator);
            return RequestOutcome::denied(DenyReason::NoCollaborator);
        }

        self.await_decision(stream, &mut pending, &decision_rx)
    }

    fn await_decision(
        &self,
        stream: &UnixStream,
        pending: &mut PendingRequest,
        decision_rx: &Receiver<Decision>,
    ) -> RequestOutcome {
        let uid = pending.identity.uid;
        let deadline = pending.arrival + self.config.decision_timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                // Close the table entry first so no decision can land after
                // the last look below.
                self.unregister(&pending.request_id);
                if let Ok(decision) = decision_rx.try_recv() {
                    pending.advance(PendingState::Resolved);
                    return self.apply(pending, decision);
                }
                pending.advance(PendingState::TimedOut);
                if let Some(err) = self.denial_error(DenyReason::Timeout) {
                    info!(uid, request_id = %pending.request_id, "[SU_TIMEOUT] {err}; deny");
                }
                self.notifier
                    .withdraw(&pending.request_id, WithdrawReason::TimedOut);
                return RequestOutcome::denied(DenyReason::Timeout);
            }

            let slice = (deadline - now).min(self.config.liveness_interval);
            match decision_rx.recv_timeout(slice) {
                Ok(decision) => {
                    pending.advance(PendingState::Resolved);
                    return self.apply(pending, decision);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if peer_hung_up(stream) {
                        pending.advance(PendingState::Aborted);
                        if let Some(err) = self.denial_error(DenyReason::PeerClosed) {
                            debug!(uid, request_id = %pending.request_id, "[SU_ABANDONED] {err}");
                        }
                        self.notifier
                            .withdraw(&pending.request_id, WithdrawReason::PeerClosed);
                        return RequestOutcome::denied(DenyReason::PeerClosed);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    pending.advance(PendingState::Aborted);
                    warn!(uid, "[SU_DENIED] decision channel closed; deny");
                    return RequestOutcome::denied(DenyReason::ChannelClosed);
                }
            }
        }
    }

    /// Persist (when asked and eligible) before the reply is sent.
    fn apply(&self, pending: &PendingRequest, decision: Decision) -> RequestOutcome {
        let uid = pending.identity.uid;
        info!(
            uid,
            request_id = %pending.request_id,
            "[SU_DECISION] {} (persist={})",
            decision.outcome.as_str(),
            decision.persist
        );

        if decision.persist {
            let eligible = decision.outcome.is_allow() || self.config.persist_denials;
            if !eligible {
                debug!(uid, "[SU_DECISION] deny not persisted (persist_denials off)");
            } else if let Err(e) = self.trust.record(uid, decision.outcome) {
                error!(uid, "[SU_PERSIST_FAILED] {e}; decision applies to this request only");
            }
        }

        match decision.outcome {
            Outcome::Allow => RequestOutcome::allowed(AllowSource::Prompt),
            Outcome::Deny => RequestOutcome::denied(DenyReason::UserDenied),
        }
    }

    /// Response channel: deliver a decision for `request_id`.
    ///
    /// The first call for a live request is `Accepted`. Later calls, and
    /// calls for unknown IDs, are `Stale` and have no effect.
    pub fn resolve(&self, request_id: &RequestId, outcome: Outcome, persist: bool) -> ResolveStatus {
        let mut table = self.table();
        let Some(entry) = table.remove(request_id) else {
            drop(table);
            debug!(request_id = %request_id, "[SU_RESOLVE_STALE] no pending request; ignored");
            return ResolveStatus::Stale;
        };

        let decision = Decision {
            request_id: request_id.clone(),
            outcome,
            persist,
        };
        // Send under the table lock: a waiter at its deadline unregisters
        // through the same lock before its last `try_recv`.
        let sent = entry.decision_tx.try_send(decision);
        drop(table);
        match sent {
            Ok(()) => {
                debug!(uid = entry.uid, request_id = %request_id, "[SU_RESOLVE] decision delivered");
                ResolveStatus::Accepted
            }
            Err(e) => {
                debug!(request_id = %request_id, "[SU_RESOLVE_STALE] waiter gone: {e}");
                ResolveStatus::Stale
            }
        }
    }

    /// The error a per-request deny stands for, where one applies.
    fn denial_error(&self, reason: DenyReason) -> Option<BrokerError> {
        match reason {
            DenyReason::Timeout => Some(BrokerError::RequestTimeout(self.config.decision_timeout)),
            DenyReason::PeerClosed => Some(BrokerError::PeerClosedEarly),
            _ => None,
        }
    }

    fn unregister(&self, request_id: &RequestId) {
        self.table().remove(request_id);
    }
}

/// Removes a pending entry whichever way the wait ends.
struct Unregister<'a> {
    broker: &'a DecisionBroker,
    request_id: RequestId,
}

impl Drop for Unregister<'_> {
    fn drop(&mut self) {
        self.broker.unregister(&self.request_id);
    }
}

// ── Transport helpers ───────────────────────────────────────

/// Send the reply token (unless the requester is already gone) and close.
fn finish(stream: &mut UnixStream, outcome: &RequestOutcome) {
    let peer_gone = matches!(
        outcome,
        RequestOutcome::Denied {
            reason: DenyReason::PeerClosed
        }
    );
    if !peer_gone {
        if let Err(e) = wire::write_reply(stream, outcome.outcome()) {
            debug!("[SU_REPLY] requester closed before reply: {e}");
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Non-blocking probe: has the requester closed its end?
///
/// Peeks without blocking. Requests carry no payload, so bytes the requester
/// sent anyway are consumed and the peek repeated until it would block or
/// reports EOF.
pub fn peer_hung_up(stream: &UnixStream) -> bool {
    let fd = stream.as_raw_fd();
    let mut scratch = [0u8; 256];
    for _ in 0..MAX_DRAIN_READS {
        match recv(fd, &mut scratch, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT) {
            Ok(0) => return true,
            Ok(_) => {
                if recv(fd, &mut scratch, MsgFlags::MSG_DONTWAIT).is_err() {
                    return false;
                }
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => return false,
            Err(e) => {
                debug!("[SU_PROBE] recv failed: {}", io::Error::from(e));
                return true;
            }
        }
    }
    false
}

// ── Tests ───────────────────────────────────────────────────
