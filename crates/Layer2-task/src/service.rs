//! Service Supervisor - long-lived dev servers declared in services.json
//!
//! Features:
//! - Idempotent start through the platform shell in `project_root/cwd`
//! - Combined stdout/stderr in a per-service ring buffer (ANSI stripped)
//! - Port detection from `http(s)://host:PORT` output lines
//! - Exit detection: non-zero -> failed, zero -> stopped
//! - Stop with SIGTERM -> grace -> SIGKILL
//!
//! Unlike agent processes, services are not recovered across server restarts.

use crate::log::ServiceLogBuffer;
use crate::process::{ChildHandle, ExitOutcome, LifecycleSender, LineReader};
use chrono::{DateTime, SecondsFormat, Utc};
use dashboard_foundation::{load_services, DashboardPaths, ServiceSettings, ServiceSpec};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a stopped service's monitor may take to wind down
const MONITOR_WAIT: Duration = Duration::from_secs(3);

/// How long output readers may lag behind process exit
const READER_DRAIN: Duration = Duration::from_secs(2);

/// Lines longer than this are skipped
const MAX_LINE_BYTES: usize = 1024 * 1024;

fn port_regex() -> Option<&'static Regex> {
    static PORT_RE: OnceLock<Option<Regex>> = OnceLock::new();
    PORT_RE
        .get_or_init(|| {
            Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]|[\w.-]+):(\d{2,5})")
                .ok()
        })
        .as_ref()
}

/// Port announced in a line like `Local: http://localhost:5173/`
pub fn detect_port(line: &str) -> Option<u16> {
    port_regex()?
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl ServiceStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Running)
    }
}

/// Serializable view of a service
///
/// Carries `started_at` rather than a ticking uptime so that snapshots of an
/// unchanged service compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub command: String,
    pub cwd: String,
    pub port: Option<u16>,
    pub detected_port: Option<u16>,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub started_at: Option<String>,
}

/// A launched process; kept after a natural exit until the next stop/start
struct ServiceRun {
    handle: Arc<ChildHandle>,
    monitor: Option<JoinHandle<()>>,
}

struct ServiceState {
    status: ServiceStatus,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    detected_port: Option<u16>,
    run: Option<ServiceRun>,
    /// Bumped by every start/stop; a monitor only writes for its own run
    generation: u64,
}

impl ServiceState {
    fn reset(&mut self, status: ServiceStatus) {
        self.status = status;
        self.pid = None;
        self.started_at = None;
        self.detected_port = None;
    }
}

struct ServiceSlot {
    spec: parking_lot::Mutex<ServiceSpec>,
    state: parking_lot::Mutex<ServiceState>,
    logs: ServiceLogBuffer,
    /// Serializes start/stop of this service
    op: Mutex<()>,
}

impl ServiceSlot {
    fn new(spec: ServiceSpec, log_capacity: usize) -> Self {
        Self {
            spec: parking_lot::Mutex::new(spec),
            state: parking_lot::Mutex::new(ServiceState {
                status: ServiceStatus::Stopped,
                pid: None,
                started_at: None,
                detected_port: None,
                run: None,
                generation: 0,
            }),
            logs: ServiceLogBuffer::new(log_capacity),
            op: Mutex::new(()),
        }
    }

    fn id(&self) -> String {
        self.spec.lock().id.clone()
    }

    fn info(&self) -> ServiceInfo {
        let spec = self.spec.lock().clone();
        let state = self.state.lock();
        ServiceInfo {
            id: spec.id,
            name: spec.name,
            command: spec.command,
            cwd: spec.cwd,
            port: spec.port,
            detected_port: state.detected_port,
            status: state.status,
            pid: state.pid,
            started_at: state
                .started_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }

    /// Seconds since start, for running services
    fn uptime_secs(&self) -> Option<i64> {
        let state = self.state.lock();
        state
            .started_at
            .map(|started| (Utc::now() - started).num_seconds().max(0))
    }

    /// Record output from run `generation`
    fn record_line(&self, generation: u64, line: &str) {
        self.logs.push(line);
        if let Some(port) = detect_port(line) {
            let mut state = self.state.lock();
            if state.generation == generation && state.detected_port.is_none() {
                debug!("Detected port {} for service {}", port, self.spec.lock().id);
                state.detected_port = Some(port);
            }
        }
    }
}

// ============================================================================
// ServiceSupervisor
// ============================================================================

/// Starts, stops and watches declared dev services
#[derive(Clone)]
pub struct ServiceSupervisor {
    /// Base for each service's `cwd`
    project_root: Arc<PathBuf>,

    /// `.dashboard/services.json`
    services_file: Arc<PathBuf>,

    settings: Arc<ServiceSettings>,

    /// Services in config order
    slots: Arc<RwLock<Vec<Arc<ServiceSlot>>>>,
}

impl ServiceSupervisor {
    pub fn new(
        project_root: impl Into<PathBuf>,
        services_file: impl Into<PathBuf>,
        settings: ServiceSettings,
    ) -> Self {
        let services_file = services_file.into();
        let specs = load_services(&services_file);
        if !specs.is_empty() {
            info!("Loaded {} service(s) from {}", specs.len(), services_file.display());
        }
        let slots = specs
            .into_iter()
            .map(|spec| Arc::new(ServiceSlot::new(spec, settings.log_capacity)))
            .collect();

        Self {
            project_root: Arc::new(project_root.into()),
            services_file: Arc::new(services_file),
            settings: Arc::new(settings),
            slots: Arc::new(RwLock::new(slots)),
        }
    }

    pub fn from_paths(paths: &DashboardPaths, settings: ServiceSettings) -> Self {
        Self::new(paths.project_root(), paths.services_file(), settings)
    }

    async fn slot(&self, service_id: &str) -> Option<Arc<ServiceSlot>> {
        let slots = self.slots.read().await;
        slots.iter().find(|s| s.id() == service_id).cloned()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn has_services(&self) -> bool {
        !self.slots.read().await.is_empty()
    }

    pub async fn list(&self) -> Vec<ServiceInfo> {
        let slots = self.slots.read().await;
        slots.iter().map(|slot| slot.info()).collect()
    }

    pub async fn status(&self, service_id: &str) -> Option<ServiceInfo> {
        self.slot(service_id).await.map(|slot| slot.info())
    }

    pub async fn uptime_secs(&self, service_id: &str) -> Option<i64> {
        self.slot(service_id).await?.uptime_secs()
    }

    /// Last `limit` output lines, oldest first; empty for unknown services
    pub async fn logs(&self, service_id: &str, limit: usize) -> Vec<String> {
        match self.slot(service_id).await {
            Some(slot) => slot.logs.tail(limit),
            None => Vec::new(),
        }
    }

    // ========================================================================
    // Start / Stop
    // ========================================================================

    /// Start a service
    ///
    /// Already starting/running counts as success and launches nothing.
    pub async fn start(&self, service_id: &str) -> bool {
        let Some(slot) = self.slot(service_id).await else {
            return false;
        };
        let _op = slot.op.lock().await;

        let generation = {
            let mut state = slot.state.lock();
            if state.status.is_up() {
                return true;
            }
            // Previous run exited on its own; its monitor is done or finishing
            state.run = None;
            state.generation += 1;
            state.reset(ServiceStatus::Starting);
            state.generation
        };
        slot.logs.clear();

        let spec = slot.spec.lock().clone();
        let cwd = self.project_root.join(&spec.cwd);
        if !cwd.is_dir() {
            slot.state.lock().status = ServiceStatus::Failed;
            slot.logs
                .push_diagnostic(&format!("cwd does not exist: {}", cwd.display()));
            warn!("Service {} cwd does not exist: {}", service_id, cwd.display());
            return false;
        }

        let mut child = match shell_command(&spec.command, &cwd).spawn() {
            Ok(child) => child,
            Err(e) => {
                slot.state.lock().status = ServiceStatus::Failed;
                slot.logs.push_diagnostic(&format!("failed to start: {}", e));
                error!("Failed to start service {}: {}", service_id, e);
                return false;
            }
        };

        let pid = child.id().unwrap_or_default();
        let (handle, lifecycle) = ChildHandle::new(pid);
        {
            let mut state = slot.state.lock();
            state.status = ServiceStatus::Running;
            state.pid = child.id();
            state.started_at = Some(Utc::now());
            state.run = Some(ServiceRun {
                handle: Arc::clone(&handle),
                monitor: None,
            });
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let monitor = tokio::spawn(monitor_service(
            Arc::clone(&slot),
            generation,
            child,
            handle,
            lifecycle,
            stdout,
            stderr,
        ));
        {
            let mut state = slot.state.lock();
            if let Some(run) = state.run.as_mut() {
                run.monitor = Some(monitor);
            }
        }

        info!("Started service {} (pid={})", service_id, pid);
        true
    }

    /// Stop a service; `false` when it was never started
    pub async fn stop(&self, service_id: &str) -> bool {
        let Some(slot) = self.slot(service_id).await else {
            return false;
        };
        let _op = slot.op.lock().await;
        self.stop_slot(&slot).await
    }

    async fn stop_slot(&self, slot: &ServiceSlot) -> bool {
        let run = {
            let mut state = slot.state.lock();
            let Some(run) = state.run.take() else {
                return false;
            };
            // Detach the monitor from the slot before the process dies
            state.generation += 1;
            run
        };

        if run
            .handle
            .terminate(self.settings.stop_grace())
            .await
            .is_none()
        {
            warn!("Service {} did not exit after SIGKILL", slot.id());
        }
        if !run.handle.wait_finished(MONITOR_WAIT).await {
            if let Some(monitor) = run.monitor {
                monitor.abort();
            }
        }

        slot.state.lock().reset(ServiceStatus::Stopped);
        info!("Stopped service {}", slot.id());
        true
    }

    pub async fn restart(&self, service_id: &str) -> bool {
        self.stop(service_id).await;
        self.start(service_id).await
    }

    /// Stop every service
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<ServiceSlot>> = self.slots.read().await.clone();
        for slot in slots {
            let _op = slot.op.lock().await;
            self.stop_slot(&slot).await;
        }
        info!("All services shut down");
    }

    /// Re-read services.json
    ///
    /// Known ids keep their process and logs (a changed command applies on
    /// the next start); new ids are added; removed ids are stopped.
    pub async fn reload_config(&self) {
        let specs = load_services(&self.services_file);
        let mut removed = Vec::new();
        {
            let mut slots = self.slots.write().await;
            let mut next = Vec::with_capacity(specs.len());
            for spec in specs {
                match slots.iter().find(|s| s.id() == spec.id) {
                    Some(slot) => {
                        *slot.spec.lock() = spec;
                        next.push(Arc::clone(slot));
                    }
                    None => next.push(Arc::new(ServiceSlot::new(spec, self.settings.log_capacity))),
                }
            }
            for slot in slots.iter() {
                if !next.iter().any(|s| Arc::ptr_eq(s, slot)) {
                    removed.push(Arc::clone(slot));
                }
            }
            *slots = next;
        }

        for slot in removed {
            let _op = slot.op.lock().await;
            if self.stop_slot(&slot).await {
                info!("Stopped removed service {}", slot.id());
            }
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }
}

fn shell_command(command_line: &str, cwd: &Path) -> Command {
    #[cfg(windows)]
    let mut command = {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(command_line);
        command
    };
    #[cfg(not(windows))]
    let mut command = {
        let mut command = Command::new("sh");
        command.arg("-c").arg(command_line);
        command
    };

    command
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

// ============================================================================
// Monitor
// ============================================================================

async fn monitor_service(
    slot: Arc<ServiceSlot>,
    generation: u64,
    mut child: Child,
    handle: Arc<ChildHandle>,
    lifecycle: LifecycleSender,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
) {
    let readers: Vec<JoinHandle<()>> = [
        stdout.map(|out| spawn_reader(Arc::clone(&slot), generation, BufReader::new(out))),
        stderr.map(|err| spawn_reader(Arc::clone(&slot), generation, BufReader::new(err))),
    ]
    .into_iter()
    .flatten()
    .collect();

    let outcome = match handle.wait_child(&mut child).await {
        Ok(status) => ExitOutcome::from_status(&status),
        Err(e) => {
            error!("Failed to wait for service {}: {}", slot.id(), e);
            ExitOutcome {
                code: None,
                signal: None,
            }
        }
    };
    lifecycle.exited(outcome);

    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    let still_current = {
        let mut state = slot.state.lock();
        if state.generation == generation {
            state.pid = None;
            state.started_at = None;
            state.status = if outcome.success() {
                ServiceStatus::Stopped
            } else {
                ServiceStatus::Failed
            };
            true
        } else {
            false
        }
    };
    if still_current {
        if outcome.success() {
            info!("Service {} exited", slot.id());
        } else {
            slot.logs.push_diagnostic(&outcome.describe());
            warn!("Service {} {}", slot.id(), outcome.describe());
        }
    }

    lifecycle.finished(outcome);
}

fn spawn_reader<R>(slot: Arc<ServiceSlot>, generation: u64, reader: R) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LineReader::new(reader, MAX_LINE_BYTES);
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => slot.record_line(generation, &line),
                Ok(None) => break,
                Err(e) => {
                    slot.logs.push_diagnostic(&format!("reader error: {}", e));
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_port() {
        assert_eq!(detect_port("- Local: http://localhost:3001"), Some(3001));
        assert_eq!(detect_port("  Local:   http://localhost:5174/"), Some(5174));
        assert_eq!(detect_port("Uvicorn running on http://127.0.0.1:8001"), Some(8001));
        assert_eq!(detect_port("Listening on http://0.0.0.0:4000"), Some(4000));
        assert_eq!(detect_port("https://localhost:9443"), Some(9443));
        assert_eq!(detect_port("Starting server..."), None);
        assert_eq!(detect_port("http://localhost:99999"), None);
    }

    fn write_services(dir: &Path, json: &str) -> PathBuf {
        let data_dir = dir.join(".dashboard");
        std::fs::create_dir_all(&data_dir).unwrap();
        let path = data_dir.join("services.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    #[tokio::test]
    async fn test_missing_and_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let missing = ServiceSupervisor::new(
            dir.path(),
            dir.path().join("nope.json"),
            ServiceSettings::default(),
        );
        assert!(!missing.has_services().await);

        let path = write_services(dir.path(), "{invalid json!!!");
        let invalid = ServiceSupervisor::new(dir.path(), path, ServiceSettings::default());
        assert!(invalid.list().await.is_empty());
        assert!(invalid.status("web").await.is_none());
        assert!(invalid.logs("web", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_stopped_service_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_services(
            dir.path(),
            r#"{"services":[{"id":"web","name":"Web","command":"npm start","cwd":".","port":3000}]}"#,
        );
        let services = ServiceSupervisor::new(dir.path(), path, ServiceSettings::default());
        let info = services.status("web").await.unwrap();
        assert_eq!(info.name, "Web");
        assert_eq!(info.status, ServiceStatus::Stopped);
        assert_eq!(info.port, Some(3000));
        assert!(info.pid.is_none());
        assert!(info.started_at.is_none());
        assert!(services.uptime_secs("web").await.is_none());

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["status"], "stopped");
    }

    #[tokio::test]
    async fn test_stop_never_started() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_services(
            dir.path(),
            r#"{"services":[{"id":"web","name":"Web","command":"true"}]}"#,
        );
        let services = ServiceSupervisor::new(dir.path(), path, ServiceSettings::default());
        assert!(!services.stop("web").await);
        assert!(!services.stop("unknown").await);
        assert!(!services.start("unknown").await);
    }

    #[tokio::test]
    async fn test_missing_cwd_fails_with_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_services(
            dir.path(),
            r#"{"services":[{"id":"api","name":"API","command":"true","cwd":"backend"}]}"#,
        );
        let services = ServiceSupervisor::new(dir.path(), path, ServiceSettings::default());
        assert!(!services.start("api").await);
        assert_eq!(
            services.status("api").await.unwrap().status,
            ServiceStatus::Failed
        );
        let logs = services.logs("api", 10).await;
        assert_eq!(logs.len(), 1);
        assert!(logs[0].starts_with("[service-manager] cwd does not exist"));
    }

    #[tokio::test]
    async fn test_reload_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_services(
            dir.path(),
            r#"{"services":[{"id":"web","name":"Web","command":"npm start"}]}"#,
        );
        let services = ServiceSupervisor::new(dir.path(), &path, ServiceSettings::default());
        assert_eq!(services.list().await.len(), 1);

        std::fs::write(
            &path,
            r#"{"services":[
                {"id":"web","name":"Web 2","command":"npm start"},
                {"id":"api","name":"API","command":"python serve.py"}
            ]}"#,
        )
        .unwrap();
        services.reload_config().await;

        let list = services.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "Web 2");
        assert_eq!(list[1].id, "api");
    }
}
