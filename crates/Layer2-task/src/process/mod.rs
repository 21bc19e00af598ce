//! Child process plumbing shared by the agent and service supervisors
//!
//! - `liveness` - pid probe / SIGTERM / SIGKILL for any pid
//! - `reader` - bounded line reader for stdout/stderr pipes
//! - `ChildHandle` - control surface for a child owned by a monitor task
//!
//! One monitor task owns each `tokio::process::Child`. Everyone else talks to
//! it through a `ChildHandle`: a watch channel publishing the lifecycle and
//! two `Notify`s asking the monitor to SIGTERM or SIGKILL the child. Signals
//! are sent by the task that reaps the child, so a recycled pid is never hit.

pub mod liveness;
pub mod reader;

use serde::Serialize;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

pub use liveness::{probe, send_signal, terminate_pid, wait_for_exit, Liveness, StopSignal};
pub use reader::LineReader;

/// How long to wait for the monitor after a SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// ExitOutcome
// ============================================================================

/// How a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn from_status(status: &ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// "exited with code 1" / "terminated by signal 9"
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(signal)) => format!("terminated by signal {}", signal),
            (None, None) => "exited".to_string(),
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Published by the monitor task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    /// Process is gone; the monitor is still draining output / finalizing
    Exited(ExitOutcome),
    /// Monitor is done; registry entry released
    Finished(ExitOutcome),
}

impl Lifecycle {
    pub fn exit(&self) -> Option<ExitOutcome> {
        match self {
            Lifecycle::Running => None,
            Lifecycle::Exited(outcome) | Lifecycle::Finished(outcome) => Some(*outcome),
        }
    }
}

/// Monitor side of a `ChildHandle`
pub struct LifecycleSender {
    tx: watch::Sender<Lifecycle>,
}

impl LifecycleSender {
    pub fn exited(&self, outcome: ExitOutcome) {
        self.tx.send_replace(Lifecycle::Exited(outcome));
    }

    pub fn finished(&self, outcome: ExitOutcome) {
        self.tx.send_replace(Lifecycle::Finished(outcome));
    }
}

// ============================================================================
// ChildHandle
// ============================================================================

/// Shared control surface for one running child
pub struct ChildHandle {
    pid: u32,
    state: watch::Receiver<Lifecycle>,
    term: Notify,
    kill: Notify,
}

impl ChildHandle {
    pub fn new(pid: u32) -> (Arc<Self>, LifecycleSender) {
        let (tx, rx) = watch::channel(Lifecycle::Running);
        let handle = Arc::new(Self {
            pid,
            state: rx,
            term: Notify::new(),
            kill: Notify::new(),
        });
        (handle, LifecycleSender { tx })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Running)
    }

    /// Wait until the process has exited; `None` on timeout
    pub async fn wait_exited(&self, timeout: Duration) -> Option<ExitOutcome> {
        let mut rx = self.state.clone();
        // Bound to a local so the watch::Ref is dropped before `rx`
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| s.exit().is_some())).await;
        match waited {
            Ok(Ok(state)) => state.exit(),
            // Monitor dropped the sender: the child is gone
            Ok(Err(_)) => Some(self.lifecycle().exit().unwrap_or(ExitOutcome {
                code: None,
                signal: None,
            })),
            Err(_) => None,
        }
    }

    /// Wait until the monitor has released the process; `false` on timeout
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        let finished = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, Lifecycle::Finished(_))),
        )
        .await
        .is_ok();
        finished
    }

    /// Ask the monitor to SIGTERM the child
    pub fn request_terminate(&self) {
        self.term.notify_one();
    }

    /// Ask the monitor to SIGKILL the child
    pub fn request_kill(&self) {
        self.kill.notify_one();
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL
    pub async fn terminate(&self, grace: Duration) -> Option<ExitOutcome> {
        if let Some(outcome) = self.lifecycle().exit() {
            return Some(outcome);
        }

        if cfg!(unix) {
            self.request_terminate();
            if let Some(outcome) = self.wait_exited(grace).await {
                return Some(outcome);
            }
            warn!(
                "Process {} ignored SIGTERM for {:?}, killing",
                self.pid, grace
            );
        }

        self.request_kill();
        self.wait_exited(KILL_WAIT).await
    }

    /// Wait for `child`, serving terminate/kill requests (monitor side)
    pub async fn wait_child(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        loop {
            tokio::select! {
                status = child.wait() => return status,
                _ = self.term.notified() => {
                    // `id()` is None once the child has been reaped
                    if let Some(pid) = child.id() {
                        send_signal(pid, StopSignal::Terminate);
                    }
                }
                _ = self.kill.notified() => {
                    debug!("Kill requested for pid {}", self.pid);
                    if let Err(e) = child.start_kill() {
                        debug!("start_kill for pid {} failed: {}", self.pid, e);
                    }
                    return child.wait().await;
                }
            }
        }
    }
}
