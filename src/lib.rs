//! rootgate library: shared modules for the binary targets and
//! integration tests.
//!
//! A requester connects to the request socket and reads one reply. The
//! broker resolves who is asking from the peer credential, answers from the
//! trust store when it can, and otherwise asks a UI over the IPC channel.

pub mod broker;
pub mod config;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod listener;
pub mod logging;
pub mod notify;
pub mod trust;
pub mod wire;

pub use broker::{BrokerConfig, DecisionBroker, Notifier, NotifyStatus, RequestOutcome};
pub use error::{BrokerError, Result};
pub use wire::Outcome;
