//! rootgate-request: ask the daemon for root.
//!
//! Connects, reads exactly one reply, and exits 0 on allow, 1 on deny.
//! A daemon that cannot be reached, closes early, or answers with anything
//! but the allow token is a deny.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, warn};

use rootgate::config::LogFormat;
use rootgate::listener::DEFAULT_REQUEST_SOCKET;
use rootgate::logging::init_tracing;
use rootgate::wire::{self, Outcome};

#[derive(Debug, Parser)]
#[command(name = "rootgate-request", about = "Request root from the rootgate daemon")]
struct Cli {
    /// Request socket path
    #[arg(long, env = "ROOTGATE_REQUEST_SOCKET", default_value = DEFAULT_REQUEST_SOCKET)]
    socket: PathBuf,

    /// Give up waiting for a reply after this many seconds (0 = wait for the daemon)
    #[arg(long, default_value = "0")]
    timeout_secs: u64,

    /// Print the outcome on stdout
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> ExitCode {
    init_tracing("warn", LogFormat::Text);
    let cli = Cli::parse();

    let outcome = request(&cli);
    if cli.verbose {
        println!("{}", outcome.as_str());
    }
    match outcome {
        Outcome::Allow => ExitCode::SUCCESS,
        Outcome::Deny => ExitCode::FAILURE,
    }
}

fn request(cli: &Cli) -> Outcome {
    let stream = match UnixStream::connect(&cli.socket) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("cannot reach {}: {e}", cli.socket.display());
            return Outcome::Deny;
        }
    };
    if cli.timeout_secs > 0 {
        if let Err(e) = stream.set_read_timeout(Some(Duration::from_secs(cli.timeout_secs))) {
            debug!("cannot set read timeout: {e}");
        }
    }
    wire::read_reply(stream)
}
