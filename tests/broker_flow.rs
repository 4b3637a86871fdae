//! Decision broker behaviour over real socket pairs.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use common::{quick_config, read_reply, FailingResolver, Harness, RecordingNotifier};
use rootgate::broker::{
    AllowSource, BrokerConfig, DecisionBroker, DenyReason, RequestOutcome, ResolveStatus,
    WithdrawReason,
};
use rootgate::trust::TrustStore;
use rootgate::wire::{Outcome, ALLOW_TOKEN, DENY_TOKEN};

const ALLOWED_BY_PROMPT: RequestOutcome = RequestOutcome::Allowed {
    source: AllowSource::Prompt,
};
const ALLOWED_FROM_CACHE: RequestOutcome = RequestOutcome::Allowed {
    source: AllowSource::Cache,
};

fn denied(reason: DenyReason) -> RequestOutcome {
    RequestOutcome::Denied { reason }
}

// ── Remembered and one-time decisions ───────────────────────

#[test]
fn allow_always_is_remembered_for_next_request() {
    let h = Harness::new(quick_config());

    let (client, worker) = h.request(10010);
    let id = h.notifier.wait_for_prompt(1);
    assert_eq!(h.broker.resolve(&id, Outcome::Allow, true), ResolveStatus::Accepted);

    let (raw, outcome) = read_reply(client);
    assert_eq!(raw, ALLOW_TOKEN);
    assert_eq!(outcome, Outcome::Allow);
    assert_eq!(worker.join().unwrap(), ALLOWED_BY_PROMPT);
    assert_eq!(h.broker.trust().lookup(10010).unwrap().decision, Outcome::Allow);

    // Second request is answered from the store without a prompt.
    let (client, worker) = h.request(10010);
    let (raw, _) = read_reply(client);
    assert_eq!(raw, ALLOW_TOKEN);
    assert_eq!(worker.join().unwrap(), ALLOWED_FROM_CACHE);
    assert_eq!(h.notifier.notified().len(), 1);
}

#[test]
fn deny_once_is_not_remembered() {
    let h = Harness::new(quick_config());

    let (client, worker) = h.request(10020);
    let id = h.notifier.wait_for_prompt(1);
    h.broker.resolve(&id, Outcome::Deny, false);

    let (raw, outcome) = read_reply(client);
    assert_eq!(raw, DENY_TOKEN);
    assert_eq!(outcome, Outcome::Deny);
    assert_eq!(worker.join().unwrap(), denied(DenyReason::UserDenied));
    assert_eq!(h.broker.trust().lookup(10020), None);

    // The next request prompts again.
    let (client, worker) = h.request(10020);
    let second = h.notifier.wait_for_prompt(2);
    assert!(second != id);
    h.broker.resolve(&second, Outcome::Allow, false);
    assert_eq!(read_reply(client).1, Outcome::Allow);
    assert_eq!(worker.join().unwrap(), ALLOWED_BY_PROMPT);
    assert_eq!(h.broker.trust().lookup(10020), None);
}

#[test]
fn persisted_record_is_on_disk_before_reply() {
    let h = Harness::new(quick_config());

    let (client, worker) = h.request(10030);
    let id = h.notifier.wait_for_prompt(1);
    h.broker.resolve(&id, Outcome::Allow, true);
    assert_eq!(read_reply(client).1, Outcome::Allow);

    // A fresh store opened right after the reply already sees the grant.
    let reopened = TrustStore::open(h.trust_path()).unwrap();
    assert_eq!(reopened.lookup(10030).unwrap().decision, Outcome::Allow);
    worker.join().unwrap();
}

#[test]
fn store_failure_still_delivers_decision_once() {
    let h = Harness::new(quick_config());
    // A directory where the store file should be makes the rename fail.
    std::fs::create_dir(h.trust_path()).unwrap();

    let (client, worker) = h.request(10040);
    let id = h.notifier.wait_for_prompt(1);
    assert_eq!(h.broker.resolve(&id, Outcome::Allow, true), ResolveStatus::Accepted);

    assert_eq!(read_reply(client).1, Outcome::Allow);
    assert_eq!(worker.join().unwrap(), ALLOWED_BY_PROMPT);
    assert_eq!(h.broker.trust().lookup(10040), None);
}

// ── Response channel ────────────────────────────────────────

#[test]
fn resolve_is_idempotent() {
    let h = Harness::new(quick_config());

    let (client, worker) = h.request(10050);
    let id = h.notifier.wait_for_prompt(1);
    assert_eq!(h.broker.resolve(&id, Outcome::Allow, false), ResolveStatus::Accepted);
    assert_eq!(h.broker.resolve(&id, Outcome::Deny, true), ResolveStatus::Stale);
    assert_eq!(h.broker.resolve(&id, Outcome::Allow, true), ResolveStatus::Stale);

    assert_eq!(read_reply(client).1, Outcome::Allow);
    assert_eq!(worker.join().unwrap(), ALLOWED_BY_PROMPT);
    assert!(h.broker.trust().is_empty());
    assert_eq!(h.broker.pending_count(), 0);
}

// ── Deadlines and cancellation ──────────────────────────────

#[test]
fn unanswered_prompt_times_out_to_deny() {
    let timeout = Duration::from_millis(300);
    let h = Harness::new(BrokerConfig {
        decision_timeout: timeout,
        ..quick_config()
    });

    let started = Instant::now();
    let (client, worker) = h.request(10060);
    let id = h.notifier.wait_for_prompt(1);
    let (raw, _) = read_reply(client);
    let elapsed = started.elapsed();

    assert_eq!(raw, DENY_TOKEN);
    assert_eq!(worker.join().unwrap(), denied(DenyReason::Timeout));
    assert!(elapsed >= timeout, "replied after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "replied after {elapsed:?}");
    assert_eq!(h.notifier.withdrawn(), vec![(id.clone(), WithdrawReason::TimedOut)]);
    assert_eq!(h.broker.pending_count(), 0);

    // A late answer changes nothing.
    assert_eq!(h.broker.resolve(&id, Outcome::Allow, true), ResolveStatus::Stale);
    assert!(h.broker.trust().is_empty());
}

#[test]
fn decision_racing_the_deadline_is_honoured_when_accepted() {
    let timeout = Duration::from_millis(60);
    let h = Harness::new(BrokerConfig {
        decision_timeout: timeout,
        ..quick_config()
    });

    for round in 0..20u32 {
        let (client, worker) = h.request(10200 + round);
        let id = h.notifier.wait_for_prompt(round as usize + 1);
        // Land the answer around the deadline, sometimes before and sometimes after.
        thread::sleep(timeout - Duration::from_millis(10) + Duration::from_millis(u64::from(round)));
        let status = h.broker.resolve(&id, Outcome::Allow, false);
        let (_, outcome) = read_reply(client);
        let served = worker.join().unwrap();

        match status {
            ResolveStatus::Accepted => {
                assert_eq!(outcome, Outcome::Allow, "round {round}");
                assert_eq!(served, ALLOWED_BY_PROMPT, "round {round}");
            }
            ResolveStatus::Stale => {
                assert_eq!(outcome, Outcome::Deny, "round {round}");
                assert_eq!(served, denied(DenyReason::Timeout), "round {round}");
            }
        }
    }
    assert_eq!(h.broker.pending_count(), 0);
}

#[test]
fn requester_hangup_aborts_wait() {
    let h = Harness::new(quick_config());

    let (client, worker) = h.request(10070);
    let id = h.notifier.wait_for_prompt(1);
    let started = Instant::now();
    drop(client);

    assert_eq!(worker.join().unwrap(), denied(DenyReason::PeerClosed));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(h.notifier.withdrawn(), vec![(id.clone(), WithdrawReason::PeerClosed)]);
    assert_eq!(h.broker.pending_count(), 0);

    assert_eq!(h.broker.resolve(&id, Outcome::Allow, true), ResolveStatus::Stale);
    assert!(h.broker.trust().is_empty());
}

#[test]
fn cache_hit_is_not_blocked_by_pending_prompt() {
    let h = Harness::new(quick_config());
    h.broker.trust().record(10080, Outcome::Allow).unwrap();

    let (pending_client, pending_worker) = h.request(10090);
    let pending_id = h.notifier.wait_for_prompt(1);

    let started = Instant::now();
    let (client, worker) = h.request(10080);
    assert_eq!(read_reply(client).1, Outcome::Allow);
    assert_eq!(worker.join().unwrap(), ALLOWED_FROM_CACHE);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.broker.pending_ids(), vec![pending_id.clone()]);

    h.broker.resolve(&pending_id, Outcome::Deny, false);
    assert_eq!(read_reply(pending_client).1, Outcome::Deny);
    pending_worker.join().unwrap();
}

#[test]
fn duplicate_requests_from_one_uid_are_independent() {
    let h = Harness::new(quick_config());

    let (first_client, first_worker) = h.request(10100);
    let first = h.notifier.wait_for_prompt(1);
    let (second_client, second_worker) = h.request(10100);
    let second = h.notifier.wait_for_prompt(2);
    assert!(first != second);
    assert_eq!(h.broker.pending_count(), 2);

    h.broker.resolve(&second, Outcome::Deny, false);
    assert_eq!(read_reply(second_client).1, Outcome::Deny);
    assert_eq!(h.broker.pending_ids(), vec![first.clone()]);

    h.broker.resolve(&first, Outcome::Allow, false);
    assert_eq!(read_reply(first_client).1, Outcome::Allow);

    assert_eq!(first_worker.join().unwrap(), ALLOWED_BY_PROMPT);
    assert_eq!(second_worker.join().unwrap(), denied(DenyReason::UserDenied));
}

// ── Fail-closed paths ───────────────────────────────────────

#[test]
fn unresolvable_identity_is_denied_without_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(RecordingNotifier::dispatching());
    let broker = DecisionBroker::new(
        quick_config(),
        Arc::new(TrustStore::open(dir.path().join("trusted.txt")).unwrap()),
        Arc::new(FailingResolver),
        notifier.clone(),
    );

    let (daemon_end, client) = std::os::unix::net::UnixStream::pair().unwrap();
    assert_eq!(
        broker.handle_connection(daemon_end),
        denied(DenyReason::IdentityUnresolvable)
    );
    assert_eq!(read_reply(client).0, DENY_TOKEN);
    assert!(notifier.events().is_empty());
}

#[test]
fn no_collaborator_is_denied_immediately() {
    let h = Harness::with_notifier(quick_config(), RecordingNotifier::unavailable());

    let started = Instant::now();
    let (client, worker) = h.request(10110);
    assert_eq!(read_reply(client).0, DENY_TOKEN);
    assert_eq!(worker.join().unwrap(), denied(DenyReason::NoCollaborator));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.broker.pending_count(), 0);
    assert_eq!(h.notifier.withdrawn().len(), 1);
    assert_eq!(h.notifier.withdrawn()[0].1, WithdrawReason::NoCollaborator);
}

#[test]
fn stored_deny_replies_deny_without_prompt() {
    let h = Harness::new(quick_config());
    h.broker.trust().record(10120, Outcome::Deny).unwrap();

    let (client, worker) = h.request(10120);
    assert_eq!(read_reply(client).0, DENY_TOKEN);
    assert_eq!(worker.join().unwrap(), denied(DenyReason::StoredDeny));
    assert!(h.notifier.events().is_empty());
}

// ── Load ────────────────────────────────────────────────────

#[test]
fn many_cached_requests_in_parallel() {
    let h = Harness::new(quick_config());
    for uid in 20000..20010 {
        h.broker.trust().record(uid, Outcome::Allow).unwrap();
    }

    let requests: Vec<_> = (0..50).map(|i| h.request(20000 + (i % 10))).collect();
    let readers: Vec<_> = requests
        .into_iter()
        .map(|(client, worker)| {
            thread::spawn(move || {
                let outcome = read_reply(client).1;
                (outcome, worker.join().unwrap())
            })
        })
        .collect();

    for reader in readers {
        let (outcome, served) = reader.join().unwrap();
        assert_eq!(outcome, Outcome::Allow);
        assert_eq!(served, ALLOWED_FROM_CACHE);
    }
    assert!(h.notifier.events().is_empty());
}
