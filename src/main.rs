//! rootgate: superuser request daemon.
//!
//! Serves the request socket, answers from the trust store when it can, and
//! otherwise prompts a UI connected on the UI socket (optionally launching a
//! prompt program per request). Anything unanswered is denied.
//!
//! Usage:
//!   rootgate [--request-socket <path>] [--ui-socket <path>] [--trust-file <path>] [-- <prompt argv>]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use rootgate::broker::{DecisionBroker, Notifier};
use rootgate::config::Cli;
use rootgate::identity::{IdentityResolver, PeerCredResolver};
use rootgate::ipc::bridge::spawn_decision_pump;
use rootgate::ipc::server::IpcServer;
use rootgate::listener::RequestListener;
use rootgate::logging::init_tracing;
use rootgate::notify::{CommandNotifier, CompositeNotifier};
use rootgate::trust::TrustStore;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    let own_uid = nix::unistd::geteuid().as_raw();
    let config = cli.into_config(own_uid);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        uid = own_uid,
        "starting rootgate"
    );

    let trust = TrustStore::open(&config.trust_file).with_context(|| {
        format!("failed to open trust store {}", config.trust_file.display())
    })?;
    info!("[TRUST] {} record(s) loaded", trust.len());

    // Bind the request socket first: a live daemon there must stop us before
    // we touch its UI socket.
    let listener = RequestListener::bind(&config.request_socket, config.request_socket_mode)
        .context("failed to bind request socket")?;

    let resolver: Arc<dyn IdentityResolver> = Arc::new(match &config.packages_list {
        Some(path) => PeerCredResolver::new().with_packages_list(path),
        None => PeerCredResolver::new(),
    });

    let (ipc, inbound) = IpcServer::start(config.ipc.clone(), Arc::clone(&resolver))
        .context("failed to start UI IPC server")?;
    let ipc = Arc::new(ipc);

    let notifier: Arc<dyn Notifier> =
        match CommandNotifier::new(config.prompt_command.clone(), &config.ipc.socket_path) {
            Some(command) => {
                info!("[PROMPT] prompt command: {:?}", config.prompt_command);
                Arc::new(
                    CompositeNotifier::new()
                        .with(ipc.clone())
                        .with(Arc::new(command)),
                )
            }
            None => ipc.clone(),
        };

    let broker = Arc::new(DecisionBroker::new(
        config.broker.clone(),
        Arc::new(trust),
        resolver,
        notifier,
    ));

    let _pump = spawn_decision_pump(inbound, Arc::clone(&broker), Arc::clone(&ipc))
        .context("failed to start decision pump")?;

    info!(
        "[DAEMON] ready: requests on {}, UI on {}",
        config.request_socket.display(),
        config.ipc.socket_path.display()
    );
    listener
        .spawn(broker)
        .context("failed to start request listener")?
        .join();

    Ok(())
}
