//! PID liveness probing and signalling
//!
//! Used for processes this server did not spawn (orphans from a previous run)
//! and for the graceful half of termination. Probing is best-effort: a pid
//! that exists but belongs to another user (EPERM) counts as alive.

use std::time::Duration;
use tracing::{debug, warn};

/// Liveness poll interval while waiting for an untracked pid to exit
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Result of probing a pid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Signal 0 delivered
    Alive,
    /// No such process (ESRCH)
    NotFound,
    /// Exists but we may not signal it (EPERM)
    Inaccessible,
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        !matches!(self, Liveness::NotFound)
    }
}

/// Which termination signal to send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

#[cfg(unix)]
fn to_pid(pid: u32) -> Option<nix::unistd::Pid> {
    // 0 and negative values address process groups, never a single process
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(nix::unistd::Pid::from_raw(raw)),
        _ => None,
    }
}

/// Probe whether `pid` exists
#[cfg(unix)]
pub fn probe(pid: u32) -> Liveness {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    let Some(target) = to_pid(pid) else {
        return Liveness::NotFound;
    };

    match kill(target, None::<Signal>) {
        Ok(()) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::NotFound,
        Err(Errno::EPERM) => Liveness::Inaccessible,
        Err(e) => {
            debug!("Unexpected error probing pid {}: {}", pid, e);
            Liveness::Inaccessible
        }
    }
}

#[cfg(not(unix))]
pub fn probe(_pid: u32) -> Liveness {
    Liveness::Inaccessible
}

/// Send a termination signal
///
/// Returns `true` if delivered. A process that is already gone is not an
/// error: the race between exit and signal is expected.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: StopSignal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    let Some(target) = to_pid(pid) else {
        return false;
    };
    let sig = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };

    match kill(target, sig) {
        Ok(()) => {
            debug!("Sent {:?} to pid {}", sig, pid);
            true
        }
        Err(Errno::ESRCH) => {
            debug!("pid {} already exited before {:?}", pid, sig);
            false
        }
        Err(e) => {
            warn!("Failed to send {:?} to pid {}: {}", sig, pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, signal: StopSignal) -> bool {
    debug!("Signals are not supported on this platform ({:?} to {})", signal, pid);
    false
}

/// Poll until `pid` disappears or `timeout` elapses; returns `true` if gone
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !probe(pid).is_alive() {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(PROBE_INTERVAL.min(deadline - now)).await;
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL an untracked pid
///
/// Returns `true` once the pid is confirmed gone.
pub async fn terminate_pid(pid: u32, grace: Duration) -> bool {
    if !probe(pid).is_alive() {
        return true;
    }
    send_signal(pid, StopSignal::Terminate);
    if wait_for_exit(pid, grace).await {
        return true;
    }
    warn!("pid {} ignored SIGTERM for {:?}, sending SIGKILL", pid, grace);
    send_signal(pid, StopSignal::Kill);
    wait_for_exit(pid, Duration::from_secs(1)).await
}
