//! Process Supervisor - one agent process per task
//!
//! Features:
//! - Spawn the agent CLI with the task/store env contract
//! - Stream stdout into the activity log, keep a stderr tail
//! - Cancel with SIGTERM -> grace -> SIGKILL (tracked and orphaned pids)
//! - Persist the pid so a restarted server can reconcile orphans
//! - Graceful shutdown of everything still running
//!
//! The registry only lives in memory. The pid column in the store is the
//! on-disk witness: non-null while a process works on the task, cleared on
//! every exit path.

use crate::agent::task_prompt;
use crate::process::{
    probe, terminate_pid, ChildHandle, ExitOutcome, LifecycleSender, LineReader,
};
use crate::stream::classify_line;
use dashboard_foundation::strings::tail_chars;
use dashboard_foundation::{
    ActivityKind, AgentSettings, SupervisorSettings, TaskPatch, TaskStatus, TaskStore,
    DB_PATH_ENV, TASK_ID_ENV,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Result text written when a user cancels a task
pub const CANCELLED_RESULT: &str = "Cancelled by user";

/// Result text written for processes stopped by server shutdown
pub const SHUTDOWN_RESULT: &str = "Server shutting down";

/// Result text for a clean exit
pub const COMPLETED_RESULT: &str = "Process completed successfully";

/// Phase recorded on successful completion
pub const COMPLETION_PHASE: &str = "completion";

/// How long output readers may lag behind process exit
const READER_DRAIN: Duration = Duration::from_secs(2);

/// How long to wait for a monitor to release its registry entry
const MONITOR_WAIT: Duration = Duration::from_secs(3);

/// After SIGKILL at shutdown
const KILL_WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Types
// ============================================================================

/// Why a tracked process is being stopped by someone other than itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    Shutdown,
}

/// Registry entry for a running agent process
struct ManagedProcess {
    task_id: String,
    handle: Arc<ChildHandle>,
    started_at: Instant,
    /// Set before signalling; the monitor then leaves the task status alone
    stop_reason: parking_lot::Mutex<Option<StopReason>>,
}

impl ManagedProcess {
    fn set_stop_reason(&self, reason: StopReason) {
        *self.stop_reason.lock() = Some(reason);
    }

    fn stop_reason(&self) -> Option<StopReason> {
        *self.stop_reason.lock()
    }
}

/// Process status for one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessStatus {
    Running {
        pid: u32,
        /// Started by a previous server run
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        orphaned: bool,
    },
    Completed {
        pid: u32,
    },
    Failed {
        pid: u32,
        exit_code: Option<i32>,
    },
    NotFound,
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running { .. })
    }
}

/// Outcome of the startup orphan pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    /// Still alive; left running and cancellable
    pub alive: Vec<String>,
    /// Dead; marked failed
    pub reaped: Vec<String>,
}

// ============================================================================
// ProcessSupervisor
// ============================================================================

/// Spawns, tracks, cancels and recovers agent processes
#[derive(Clone)]
pub struct ProcessSupervisor {
    /// Shared task store
    store: TaskStore,

    /// Working directory of every agent
    project_root: Arc<PathBuf>,

    /// Agent CLI invocation
    agent: Arc<AgentSettings>,

    /// Grace periods and output bounds
    settings: Arc<SupervisorSettings>,

    /// Tracked processes by task id
    processes: Arc<RwLock<HashMap<String, Arc<ManagedProcess>>>>,
}

impl ProcessSupervisor {
    pub fn new(
        store: TaskStore,
        project_root: impl Into<PathBuf>,
        agent: AgentSettings,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            store,
            project_root: Arc::new(project_root.into()),
            agent: Arc::new(agent),
            settings: Arc::new(settings),
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Whether an in-memory process exists for the task
    pub async fn is_tracked(&self, task_id: &str) -> bool {
        self.processes.read().await.contains_key(task_id)
    }

    // ========================================================================
    // Spawn
    // ========================================================================

    /// Launch the agent for a task
    ///
    /// Returns `false` without side effects when the task already has a
    /// tracked process, a live orphaned pid, or does not exist. A launch failure marks the task
    /// failed and is not retried.
    pub async fn spawn(&self, task_id: &str, prompt: &str) -> bool {
        // Held across launch + registration so concurrent spawns serialize
        let mut processes = self.processes.write().await;
        if processes.contains_key(task_id) {
            warn!("Process already running for task {}", task_id);
            return false;
        }

        match self.store.find_task(task_id) {
            Ok(Some(task)) => {
                // A live orphan from a previous server still owns the task
                if let Some(pid) = task.pid {
                    if probe(pid).is_alive() {
                        warn!(
                            "Task {} still has a live process (PID {}), not spawning",
                            task_id, pid
                        );
                        return false;
                    }
                }
            }
            Ok(None) => {
                warn!("Cannot spawn for unknown task {}", task_id);
                return false;
            }
            Err(e) => {
                error!("Failed to load task {}: {}", task_id, e);
                return false;
            }
        }

        let args = self.agent.build_args(&task_prompt(task_id, prompt));
        let mut command = Command::new(&self.agent.program);
        command
            .args(&args)
            .current_dir(self.project_root.as_path())
            .env(TASK_ID_ENV, task_id)
            .env(DB_PATH_ENV, self.store.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let result = if e.kind() == std::io::ErrorKind::NotFound {
                    format!("Agent CLI not found: {}", self.agent.program)
                } else {
                    format!("Spawn error: {}", e)
                };
                error!("Failed to spawn agent for task {}: {}", task_id, e);
                self.mark_failed(task_id, &result, &result, ActivityKind::Error);
                return false;
            }
        };

        let Some(pid) = child.id() else {
            // Exited and reaped before we could look
            error!("Agent for task {} exited before registration", task_id);
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill agent for task {}: {}", task_id, e);
            }
            self.mark_failed(
                task_id,
                "Spawn error: process exited immediately",
                "Agent process exited immediately",
                ActivityKind::Error,
            );
            return false;
        };

        let (handle, lifecycle) = ChildHandle::new(pid);
        let managed = Arc::new(ManagedProcess {
            task_id: task_id.to_string(),
            handle,
            started_at: Instant::now(),
            stop_reason: parking_lot::Mutex::new(None),
        });
        processes.insert(task_id.to_string(), Arc::clone(&managed));

        // Persist pid before anything can observe the process
        let patch = TaskPatch::new().status(TaskStatus::InProgress).pid(pid);
        if let Err(e) = self.store.update_task(task_id, &patch) {
            error!("Failed to persist pid for task {}: {}", task_id, e);
        }
        self.log(
            task_id,
            ActivityKind::Message,
            &format!("Agent process started (PID {})", pid),
        );

        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.monitor(managed, child, lifecycle).await });

        info!("Spawned agent for task {}, PID={}", task_id, pid);
        true
    }

    // ========================================================================
    // Monitor
    // ========================================================================

    async fn monitor(self, managed: Arc<ManagedProcess>, mut child: Child, lifecycle: LifecycleSender) {
        let task_id = managed.task_id.clone();
        let max_line = self.settings.max_line_bytes;

        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(stream_stdout(
                self.store.clone(),
                task_id.clone(),
                stdout,
                max_line,
            ))
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(collect_stderr(
                task_id.clone(),
                stderr,
                max_line,
                self.settings.stderr_tail_chars,
            ))
        });

        let outcome = match managed.handle.wait_child(&mut child).await {
            Ok(status) => ExitOutcome::from_status(&status),
            Err(e) => {
                error!("Failed to wait for task {} process: {}", task_id, e);
                ExitOutcome {
                    code: None,
                    signal: None,
                }
            }
        };
        lifecycle.exited(outcome);
        info!(
            "Agent for task {} {} after {:.1}s",
            task_id,
            outcome.describe(),
            managed.started_at.elapsed().as_secs_f64()
        );

        // Grandchildren can hold the pipes open; don't wait on them forever
        drain(stdout_task).await;
        let stderr_tail = drain(stderr_task).await.unwrap_or_default();

        if managed.stop_reason().is_none() {
            self.record_exit(&task_id, outcome, &stderr_tail);
        }

        self.release(&managed).await;
        lifecycle.finished(outcome);
    }

    /// Write the terminal state for a process that ended on its own
    fn record_exit(&self, task_id: &str, outcome: ExitOutcome, stderr_tail: &str) {
        if outcome.success() {
            let current = match self.store.find_task(task_id) {
                Ok(task) => task,
                Err(e) => {
                    error!("Failed to load task {}: {}", task_id, e);
                    None
                }
            };

            let patch = match current {
                // Status already set by the agent itself
                Some(task) if task.status == TaskStatus::Completed => {
                    if task.phase.as_deref() != Some(COMPLETION_PHASE) {
                        TaskPatch::new().phase(COMPLETION_PHASE).clear_pid()
                    } else {
                        TaskPatch::new().clear_pid()
                    }
                }
                Some(task) if task.status == TaskStatus::Failed => TaskPatch::new().clear_pid(),
                _ => TaskPatch::new()
                    .status(TaskStatus::Completed)
                    .phase(COMPLETION_PHASE)
                    .result(COMPLETED_RESULT)
                    .clear_pid(),
            };
            self.update(task_id, &patch);
            self.log(task_id, ActivityKind::Message, "Agent process completed");
        } else {
            let detail = match (outcome.code, outcome.signal) {
                (Some(code), _) => format!("Process exited with code {}. {}", code, stderr_tail),
                (None, Some(signal)) => {
                    format!("Process terminated by signal {}. {}", signal, stderr_tail)
                }
                (None, None) => format!("Process exited with unknown status. {}", stderr_tail),
            };
            let activity = match (outcome.code, outcome.signal) {
                (Some(code), _) => format!("Process failed (exit code {})", code),
                (None, Some(signal)) => format!("Process failed (signal {})", signal),
                (None, None) => "Process failed".to_string(),
            };
            self.mark_failed(task_id, detail.trim(), &activity, ActivityKind::Error);
        }
    }

    /// Drop the registry entry if it still belongs to this process
    async fn release(&self, managed: &Arc<ManagedProcess>) -> bool {
        let mut processes = self.processes.write().await;
        match processes.get(&managed.task_id) {
            Some(current) if Arc::ptr_eq(current, managed) => {
                processes.remove(&managed.task_id);
                true
            }
            _ => false,
        }
    }

    // ========================================================================
    // Cancel
    // ========================================================================

    /// Stop the process for a task
    ///
    /// Works for tracked processes and for orphans known only by their
    /// persisted pid. Returns `false` when there is nothing to cancel.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let tracked = self.processes.read().await.get(task_id).cloned();

        if let Some(managed) = tracked {
            managed.set_stop_reason(StopReason::Cancelled);
            info!(
                "Cancelling task {} (PID {})",
                task_id,
                managed.handle.pid()
            );

            if managed
                .handle
                .terminate(self.settings.terminate_grace())
                .await
                .is_none()
            {
                warn!("Process for task {} did not exit after SIGKILL", task_id);
            }
            if !managed.handle.wait_finished(MONITOR_WAIT).await {
                warn!("Monitor for task {} did not finish in time", task_id);
                self.release(&managed).await;
            }

            self.mark_failed(
                task_id,
                CANCELLED_RESULT,
                "Process cancelled by user",
                ActivityKind::Message,
            );
            return true;
        }

        // Fallback: pid persisted by a previous server run
        let pid = match self.store.task_pid(task_id) {
            Ok(Some(pid)) => pid,
            Ok(None) => return false,
            Err(e) => {
                error!("Failed to read pid for task {}: {}", task_id, e);
                return false;
            }
        };

        if probe(pid).is_alive() {
            if !terminate_pid(pid, self.settings.orphan_grace()).await {
                warn!("Orphaned PID {} for task {} survived SIGKILL", pid, task_id);
            }
            self.mark_failed(
                task_id,
                CANCELLED_RESULT,
                "Orphaned process cancelled by user",
                ActivityKind::Message,
            );
            info!("Cancelled orphaned process (PID {}) for task {}", pid, task_id);
        } else {
            // Stale pid; the process is long gone
            self.mark_failed(
                task_id,
                CANCELLED_RESULT,
                &format!("Cancelled by user (PID {} no longer running)", pid),
                ActivityKind::Message,
            );
            debug!("Cleared stale PID {} for task {}", pid, task_id);
        }
        true
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Terminate every tracked process and mark its task failed
    pub async fn shutdown(&self) {
        let tracked: Vec<Arc<ManagedProcess>> =
            self.processes.read().await.values().cloned().collect();
        if tracked.is_empty() {
            return;
        }

        info!("Shutting down {} running process(es)...", tracked.len());

        for managed in &tracked {
            managed.set_stop_reason(StopReason::Shutdown);
            managed.handle.request_terminate();
        }

        // One shared grace period, not one per process
        let grace = self.settings.shutdown_grace();
        futures::future::join_all(tracked.iter().map(|managed| async move {
            if managed.handle.wait_exited(grace).await.is_none() {
                warn!("Force-killing process for task {}", managed.task_id);
                managed.handle.request_kill();
                managed.handle.wait_exited(KILL_WAIT).await;
            }
            managed.handle.wait_finished(MONITOR_WAIT).await;
        }))
        .await;

        for managed in &tracked {
            self.mark_failed(
                &managed.task_id,
                SHUTDOWN_RESULT,
                "Process terminated - server shutdown",
                ActivityKind::Message,
            );
        }

        self.processes.write().await.clear();
        info!("All processes terminated");
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// In-memory status, or persisted pid + liveness for an orphan
    pub async fn get_status(&self, task_id: &str) -> ProcessStatus {
        let tracked = self.processes.read().await.get(task_id).cloned();
        if let Some(managed) = tracked {
            let pid = managed.handle.pid();
            return match managed.handle.lifecycle().exit() {
                None => ProcessStatus::Running {
                    pid,
                    orphaned: false,
                },
                Some(outcome) if outcome.success() => ProcessStatus::Completed { pid },
                Some(outcome) => ProcessStatus::Failed {
                    pid,
                    exit_code: outcome.code,
                },
            };
        }

        match self.store.find_task(task_id) {
            Ok(Some(task)) if task.status.is_active() => match task.pid {
                Some(pid) if probe(pid).is_alive() => ProcessStatus::Running {
                    pid,
                    orphaned: true,
                },
                _ => ProcessStatus::NotFound,
            },
            Ok(_) => ProcessStatus::NotFound,
            Err(e) => {
                warn!("Failed to load task {} for status: {}", task_id, e);
                ProcessStatus::NotFound
            }
        }
    }

    /// Task ids with a live process, tracked or orphaned, sorted
    pub async fn list_running(&self) -> Vec<String> {
        let mut running: BTreeSet<String> = {
            let processes = self.processes.read().await;
            processes
                .values()
                .filter(|managed| managed.handle.is_running())
                .map(|managed| managed.task_id.clone())
                .collect()
        };

        match self.store.orphaned_tasks() {
            Ok(orphans) => {
                for task in orphans {
                    if running.contains(&task.id) || self.is_tracked(&task.id).await {
                        continue;
                    }
                    if task.pid.is_some_and(|pid| probe(pid).is_alive()) {
                        running.insert(task.id);
                    }
                }
            }
            Err(e) => warn!("Failed to list orphaned tasks: {}", e),
        }

        running.into_iter().collect()
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Reconcile tasks left active by a previous server run
    ///
    /// Live pids stay running (they can still be cancelled by pid). Dead
    /// pids are marked failed and cleared.
    pub async fn recover_orphans(&self) -> OrphanReport {
        let mut report = OrphanReport::default();

        let orphans = match self.store.orphaned_tasks() {
            Ok(orphans) => orphans,
            Err(e) => {
                error!("Failed to list orphaned tasks: {}", e);
                return report;
            }
        };

        for task in orphans {
            let Some(pid) = task.pid else { continue };
            if self.is_tracked(&task.id).await {
                continue;
            }

            if probe(pid).is_alive() {
                warn!(
                    "Task {} has live orphaned process (PID {}). Cancel it if needed.",
                    task.id, pid
                );
                self.log(
                    &task.id,
                    ActivityKind::Message,
                    &format!("Server restarted - orphaned process (PID {}) still alive", pid),
                );
                report.alive.push(task.id);
            } else {
                info!(
                    "Task {} orphaned process (PID {}) is dead, marking failed",
                    task.id, pid
                );
                self.mark_failed(
                    &task.id,
                    &format!("Process (PID {}) died during server restart", pid),
                    &format!(
                        "Server restarted - process (PID {}) no longer running, marked failed",
                        pid
                    ),
                    ActivityKind::Error,
                );
                report.reaped.push(task.id);
            }
        }

        if !report.alive.is_empty() || !report.reaped.is_empty() {
            info!(
                "Orphan recovery: {} alive, {} reaped",
                report.alive.len(),
                report.reaped.len()
            );
        }
        report
    }

    // ========================================================================
    // Store helpers (errors are logged, never propagated)
    // ========================================================================

    fn update(&self, task_id: &str, patch: &TaskPatch) {
        if let Err(e) = self.store.update_task(task_id, patch) {
            error!("Failed to update task {}: {}", task_id, e);
        }
    }

    fn log(&self, task_id: &str, kind: ActivityKind, message: &str) {
        if let Err(e) = self.store.log_activity(task_id, kind, message, None) {
            warn!("Failed to log activity for task {}: {}", task_id, e);
        }
    }

    fn mark_failed(&self, task_id: &str, result: &str, activity: &str, kind: ActivityKind) {
        let patch = TaskPatch::new()
            .status(TaskStatus::Failed)
            .result(result)
            .clear_pid();
        self.update(task_id, &patch);
        self.log(task_id, kind, activity);
    }
}

// ============================================================================
// Output readers
// ============================================================================

async fn stream_stdout(store: TaskStore, task_id: String, stdout: ChildStdout, max_line_bytes: usize) {
    let mut lines = LineReader::new(BufReader::new(stdout), max_line_bytes);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                for activity in classify_line(line) {
                    if let Err(e) = store.log_activity(
                        &task_id,
                        ActivityKind::Message,
                        &activity.message,
                        Some(activity.agent),
                    ) {
                        warn!("Failed to log output for task {}: {}", task_id, e);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("stdout read error for task {}: {}", task_id, e);
                break;
            }
        }
    }
    if lines.dropped() > 0 {
        warn!(
            "Skipped {} oversized stdout line(s) for task {}",
            lines.dropped(),
            task_id
        );
    }
}

/// Read stderr to EOF, keeping only the last `tail` characters
async fn collect_stderr(task_id: String, stderr: ChildStderr, max_line_bytes: usize, tail: usize) -> String {
    let mut lines = LineReader::new(BufReader::new(stderr), max_line_bytes);
    let mut buffer = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!("[{}] stderr: {}", task_id, line);
                buffer.push_str(&line);
                buffer.push('\n');
                if buffer.len() > tail.saturating_mul(8).max(4096) {
                    buffer = tail_chars(&buffer, tail).to_string();
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("stderr read error for task {}: {}", task_id, e);
                break;
            }
        }
    }
    tail_chars(&buffer, tail).to_string()
}

/// Join a reader task, aborting it if it outlives the process
async fn drain<T>(task: Option<JoinHandle<T>>) -> Option<T> {
    let mut task = task?;
    match tokio::time::timeout(READER_DRAIN, &mut task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("Output reader failed: {}", e);
            None
        }
        Err(_) => {
            debug!("Output reader still open after process exit, aborting");
            task.abort();
            None
        }
    }
}
