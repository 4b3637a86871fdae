//! Notifiers beyond the IPC channel: an external prompt launcher and a
//! fan-out combinator.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::broker::{Notifier, NotifyStatus, WithdrawReason};
use crate::identity::Identity;
use crate::ipc::id::RequestId;

/// Launches a prompt program for each pending request.
///
/// The argv template may use `{uid}`, `{request_id}` and `{ui_socket}`.
/// The program is expected to connect to the UI socket and answer there.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    argv: Vec<String>,
    ui_socket: PathBuf,
}

impl CommandNotifier {
    /// `None` for an empty template.
    pub fn new(argv: Vec<String>, ui_socket: impl Into<PathBuf>) -> Option<Self> {
        if argv.is_empty() {
            return None;
        }
        Some(Self {
            argv,
            ui_socket: ui_socket.into(),
        })
    }

    /// Substitute placeholders for one request.
    pub fn render(&self, identity: &Identity, request_id: &RequestId) -> Vec<String> {
        let uid = identity.uid.to_string();
        let socket = self.ui_socket.display().to_string();
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{uid}", &uid)
                    .replace("{request_id}", request_id.as_str())
                    .replace("{ui_socket}", &socket)
            })
            .collect()
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, identity: &Identity, request_id: &RequestId) -> NotifyStatus {
        let argv = self.render(identity, request_id);
        let Some((program, args)) = argv.split_first() else {
            return NotifyStatus::Unavailable;
        };

        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(request_id = %request_id, "[PROMPT] cannot launch {program}: {e}");
                return NotifyStatus::Unavailable;
            }
        };

        info!(
            uid = identity.uid,
            request_id = %request_id,
            "[PROMPT] launched {program} (pid {})",
            child.id()
        );
        let reaper = thread::Builder::new()
            .name("prompt-reaper".to_string())
            .spawn(move || match child.wait() {
                Ok(status) => debug!("[PROMPT] prompt exited: {status}"),
                Err(e) => debug!("[PROMPT] wait failed: {e}"),
            });
        if let Err(e) = reaper {
            warn!("[PROMPT] cannot spawn reaper thread: {e}");
        }
        NotifyStatus::Dispatched
    }
}

/// Notifies every inner notifier. Dispatched when at least one dispatched.
#[derive(Clone, Default)]
pub struct CompositeNotifier {
    inner: Vec<Arc<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.inner.push(notifier);
        self
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Notifier for CompositeNotifier {
    fn notify(&self, identity: &Identity, request_id: &RequestId) -> NotifyStatus {
        // No short-circuit: every notifier must see the request.
        let mut status = NotifyStatus::Unavailable;
        for notifier in &self.inner {
            if notifier.notify(identity, request_id) == NotifyStatus::Dispatched {
                status = NotifyStatus::Dispatched;
            }
        }
        status
    }

    fn withdraw(&self, request_id: &RequestId, reason: WithdrawReason) {
        for notifier in &self.inner {
            notifier.withdraw(request_id, reason);
        }
    }
}
