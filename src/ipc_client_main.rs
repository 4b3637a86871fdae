//! rootgate-ui-client: Dev harness for the daemon's UI IPC channel.
//!
//! Connects to the UI socket, prints incoming events, and auto-answers
//! `su.request` prompts. Can also list or revoke trust records.
//!
//! Usage:
//!   rootgate-ui-client [--socket <path>] [--auto-allow] [--always]
//!   rootgate-ui-client --list
//!   rootgate-ui-client --revoke <uid>

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use rootgate::config::LogFormat;
use rootgate::ipc::server::DEFAULT_SOCKET_PATH;
use rootgate::ipc::types::{
    Decision, DecisionPayload, IpcKind, IpcMessage, TrustRevokePayload, SU_DECISION, SU_REQUEST,
    TRUST_LIST, TRUST_REVOKE, TRUST_SNAPSHOT,
};
use rootgate::logging::init_tracing;

#[derive(Debug, Parser)]
#[command(name = "rootgate-ui-client", about = "Dev harness for the rootgate UI socket")]
struct Cli {
    /// UI socket path
    #[arg(long, env = "ROOTGATE_UI_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Answer prompts with allow (default: deny)
    #[arg(long)]
    auto_allow: bool,

    /// Ask the daemon to remember the answer
    #[arg(long)]
    always: bool,

    /// Print the trust store and exit
    #[arg(long, conflicts_with = "revoke")]
    list: bool,

    /// Revoke the record for this uid, print the store and exit
    #[arg(long)]
    revoke: Option<u32>,

    /// Exit after answering this many prompts
    #[arg(long)]
    count: Option<usize>,
}

fn main() -> Result<()> {
    init_tracing("info", LogFormat::Text);
    let cli = Cli::parse();

    let decision = match (cli.auto_allow, cli.always) {
        (true, true) => Decision::AllowAlways,
        (true, false) => Decision::AllowOnce,
        (false, true) => Decision::DenyAlways,
        (false, false) => Decision::DenyOnce,
    };

    let stream = UnixStream::connect(&cli.socket)
        .with_context(|| format!("failed to connect to {}", cli.socket.display()))?;
    let reader = BufReader::new(stream.try_clone().context("failed to clone stream")?);
    let mut writer = stream;

    let one_shot = if cli.list {
        Some(IpcMessage::new_command(TRUST_LIST, serde_json::json!({})))
    } else if let Some(uid) = cli.revoke {
        Some(IpcMessage::new_command(
            TRUST_REVOKE,
            serde_json::to_value(TrustRevokePayload { uid })?,
        ))
    } else {
        None
    };
    let one_shot_mode = one_shot.is_some();
    if let Some(command) = one_shot {
        send(&mut writer, &command)?;
    } else {
        info!("[ui-client] connected to {} (auto-reply: {decision:?})", cli.socket.display());
    }

    let mut answered = 0usize;
    // The daemon pushes a snapshot on connect; the second one answers a command.
    let mut snapshots_seen = 0usize;

    for line in reader.lines() {
        let line = line.context("read error")?;
        if line.is_empty() {
            continue;
        }
        let msg: IpcMessage = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[ui-client] invalid JSON: {e}");
                continue;
            }
        };

        println!(
            "<< {:?} | {} | {}",
            msg.kind,
            msg.msg_type,
            serde_json::to_string(&msg.payload).unwrap_or_default()
        );

        if msg.kind != IpcKind::Event {
            continue;
        }
        if one_shot_mode {
            if msg.msg_type == TRUST_SNAPSHOT {
                snapshots_seen += 1;
                if snapshots_seen == 2 {
                    break;
                }
            }
            continue;
        }
        if msg.msg_type != SU_REQUEST {
            continue;
        }
        let Some(request) = msg.as_su_request() else {
            warn!("[ui-client] malformed su.request");
            continue;
        };

        let reply = IpcMessage::new_decision(
            SU_DECISION,
            serde_json::to_value(DecisionPayload {
                request_id: request.request_id.clone(),
                decision,
                note: Some("auto-reply from rootgate-ui-client".to_string()),
            })?,
        );
        send(&mut writer, &reply)?;
        println!(">> su.decision {decision:?} (request_id={})", request.request_id);

        answered += 1;
        if cli.count.is_some_and(|n| answered >= n) {
            break;
        }
    }

    info!("[ui-client] disconnected");
    Ok(())
}

fn send(writer: &mut UnixStream, msg: &IpcMessage) -> Result<()> {
    let line = msg.to_ndjson().context("serialize message")?;
    writer.write_all(line.as_bytes()).context("write error")?;
    writer.flush().context("flush error")?;
    Ok(())
}
