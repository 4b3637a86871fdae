//! IPC channel between the daemon and a native UI client.
//!
//! Transport: Unix domain socket, NDJSON protocol.
//! Policy: fail-closed (no UI connected = deny).

pub mod bridge;
pub mod id;
pub mod server;
pub mod types;
