//! Daemon configuration: command line with `ROOTGATE_*` environment
//! fallbacks, lowered into the plain structs the library uses.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::broker::{BrokerConfig, DEFAULT_MAX_IN_FLIGHT};
use crate::ipc::server::{IpcConfig, DEFAULT_SOCKET_PATH as DEFAULT_UI_SOCKET};
use crate::listener::{DEFAULT_REQUEST_SOCKET, DEFAULT_SOCKET_MODE};
use crate::trust::DEFAULT_TRUST_PATH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "rootgate",
    version,
    about = "Superuser request broker: decides root requests from a trust store or a UI prompt",
    after_help = "Pass a prompt program after --; {uid}, {request_id} and {ui_socket} are substituted:\n  rootgate -- /usr/libexec/rootgate-prompt --request {request_id} --socket {ui_socket}"
)]
pub struct Cli {
    /// Socket requesters connect to
    #[arg(long, env = "ROOTGATE_REQUEST_SOCKET", default_value = DEFAULT_REQUEST_SOCKET)]
    pub request_socket: PathBuf,

    /// Permission bits for the request socket (octal)
    #[arg(
        long,
        env = "ROOTGATE_REQUEST_SOCKET_MODE",
        default_value = "0666",
        value_parser = parse_octal_mode
    )]
    pub request_socket_mode: u32,

    /// Socket the UI client connects to
    #[arg(long, env = "ROOTGATE_UI_SOCKET", default_value = DEFAULT_UI_SOCKET)]
    pub ui_socket: PathBuf,

    /// Uid allowed to act as the UI (repeatable; default: the daemon's own uid)
    #[arg(long = "ui-uid", env = "ROOTGATE_UI_UIDS", value_delimiter = ',')]
    pub ui_uids: Vec<u32>,

    /// Trust store file
    #[arg(long, env = "ROOTGATE_TRUST_FILE", default_value = DEFAULT_TRUST_PATH)]
    pub trust_file: PathBuf,

    /// Seconds a prompt may stay unanswered before the request is denied
    #[arg(long, env = "ROOTGATE_DECISION_TIMEOUT_SECS", default_value = "30")]
    pub decision_timeout_secs: u64,

    /// Milliseconds between requester liveness checks while a prompt is open
    #[arg(long, env = "ROOTGATE_LIVENESS_INTERVAL_MS", default_value = "250")]
    pub liveness_interval_ms: u64,

    /// Remember `deny_always` decisions too
    #[arg(long, env = "ROOTGATE_PERSIST_DENIALS")]
    pub persist_denials: bool,

    /// Requests handled concurrently before new ones are denied outright
    #[arg(long, env = "ROOTGATE_MAX_IN_FLIGHT", default_value_t = DEFAULT_MAX_IN_FLIGHT)]
    pub max_in_flight: usize,

    /// packages.list-format file used to name the requesting packages
    #[arg(long, env = "ROOTGATE_PACKAGES_LIST")]
    pub packages_list: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "ROOTGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "ROOTGATE_LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Prompt program launched per request (everything after --)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub prompt_command: Vec<String>,
}

/// Everything the daemon needs, resolved from [`Cli`].
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub request_socket: PathBuf,
    pub request_socket_mode: u32,
    pub trust_file: PathBuf,
    pub packages_list: Option<PathBuf>,
    pub prompt_command: Vec<String>,
    pub broker: BrokerConfig,
    pub ipc: IpcConfig,
}

impl Cli {
    /// Lower into a [`DaemonConfig`]. `own_uid` fills an empty UI allowlist.
    pub fn into_config(self, own_uid: u32) -> DaemonConfig {
        let decision_timeout = Duration::from_secs(self.decision_timeout_secs);
        let ui_uids = if self.ui_uids.is_empty() {
            vec![own_uid]
        } else {
            self.ui_uids
        };
        DaemonConfig {
            request_socket: self.request_socket,
            request_socket_mode: self.request_socket_mode,
            trust_file: self.trust_file,
            packages_list: self.packages_list,
            prompt_command: self.prompt_command,
            broker: BrokerConfig {
                decision_timeout,
                liveness_interval: Duration::from_millis(self.liveness_interval_ms.max(1)),
                persist_denials: self.persist_denials,
                max_in_flight: self.max_in_flight.max(1),
            },
            ipc: IpcConfig {
                socket_path: self.ui_socket,
                allowed_uids: ui_uids,
                prompt_timeout: decision_timeout,
            },
        }
    }
}

/// Parse permission bits written in octal, with or without a `0o` prefix.
pub fn parse_octal_mode(s: &str) -> Result<u32, String> {
    let digits = s.trim().trim_start_matches("0o");
    let mode = u32::from_str_radix(digits, 8).map_err(|e| format!("invalid octal mode {s:?}: {e}"))?;
    if mode > 0o777 {
        return Err(format!("mode {s} has bits outside 0777"));
    }
    Ok(mode)
}
