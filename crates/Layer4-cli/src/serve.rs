//! `dashboard serve` - supervision server over stdio
//!
//! ```text
//! stdin  ── {"op": "spawn", "task_id": "..."} ──▶ Server ──▶ supervisors
//! stdout ◀── {"type": "reply", ...}          ◀──┤
//!        ◀── {"type": "tasks_updated", ...}  ◀── SyncBroadcaster
//! ```
//!
//! One JSON document per line in both directions. Every request gets one
//! reply line; push messages are interleaved as they happen. Stdin EOF or
//! Ctrl-C shuts everything down.

use crate::context::Context;
use anyhow::Context as _;
use dashboard_foundation::{DashboardPaths, DashboardSettings, TaskStore};
use dashboard_sync::{SyncBroadcaster, SyncMessage};
use dashboard_task::{
    default_prompt, resolve_agent, ProcessSupervisor, QuestionBroker, ServiceSupervisor,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

const DEFAULT_LOG_LINES: usize = 200;

// ============================================================================
// Protocol
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Spawn {
        task_id: String,
        /// Defaults to the task title and description
        #[serde(default)]
        prompt: Option<String>,
    },
    Cancel {
        task_id: String,
    },
    Status {
        task_id: String,
    },
    Running,
    Answer {
        question_id: String,
        answer: String,
    },
    Services,
    /// Re-read services.json
    ServicesReload,
    ServiceStart {
        service_id: String,
    },
    ServiceStop {
        service_id: String,
    },
    ServiceRestart {
        service_id: String,
    },
    ServiceLogs {
        service_id: String,
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl ControlRequest {
    pub fn op(&self) -> &'static str {
        match self {
            ControlRequest::Spawn { .. } => "spawn",
            ControlRequest::Cancel { .. } => "cancel",
            ControlRequest::Status { .. } => "status",
            ControlRequest::Running => "running",
            ControlRequest::Answer { .. } => "answer",
            ControlRequest::Services => "services",
            ControlRequest::ServicesReload => "services_reload",
            ControlRequest::ServiceStart { .. } => "service_start",
            ControlRequest::ServiceStop { .. } => "service_stop",
            ControlRequest::ServiceRestart { .. } => "service_restart",
            ControlRequest::ServiceLogs { .. } => "service_logs",
        }
    }
}

/// Reply line for one request
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    #[serde(rename = "type")]
    kind: &'static str,
    op: &'static str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Reply {
    fn ok(op: &'static str, data: Value) -> Self {
        Self {
            kind: "reply",
            op,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(op: &'static str, error: impl Into<String>) -> Self {
        Self {
            kind: "reply",
            op,
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

#[derive(Clone)]
pub struct Server {
    store: TaskStore,
    processes: ProcessSupervisor,
    services: ServiceSupervisor,
    broker: QuestionBroker,
    broadcaster: Arc<SyncBroadcaster>,
}

impl Server {
    pub fn new(store: TaskStore, paths: &DashboardPaths, settings: &DashboardSettings) -> Self {
        let agent = resolve_agent(&settings.agent, paths.project_root(), paths.data_dir());
        let processes = ProcessSupervisor::new(
            store.clone(),
            paths.project_root(),
            agent,
            settings.supervisor.clone(),
        );
        let services = ServiceSupervisor::from_paths(paths, settings.services.clone());
        let broker = QuestionBroker::new(store.clone(), settings.questions.clone());
        let broadcaster = Arc::new(SyncBroadcaster::new(
            store.clone(),
            processes.clone(),
            services.clone(),
            settings.sync.clone(),
        ));

        Self {
            store,
            processes,
            services,
            broker,
            broadcaster,
        }
    }

    /// Handle one request; failures become error replies
    pub async fn handle(&self, request: ControlRequest) -> Reply {
        let op = request.op();
        match self.dispatch(request).await {
            Ok(data) => Reply::ok(op, data),
            Err(e) => {
                debug!("{} failed: {:#}", op, e);
                Reply::error(op, format!("{:#}", e))
            }
        }
    }

    async fn dispatch(&self, request: ControlRequest) -> anyhow::Result<Value> {
        Ok(match request {
            ControlRequest::Spawn { task_id, prompt } => {
                let task = self
                    .store
                    .find_task(&task_id)?
                    .ok_or_else(|| anyhow::anyhow!("Task '{}' not found", task_id))?;
                let prompt = prompt
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or_else(|| default_prompt(&task));
                json!({ "spawned": self.processes.spawn(&task_id, &prompt).await })
            }
            ControlRequest::Cancel { task_id } => {
                json!({ "cancelled": self.processes.cancel(&task_id).await })
            }
            ControlRequest::Status { task_id } => {
                serde_json::to_value(self.processes.get_status(&task_id).await)?
            }
            ControlRequest::Running => json!(self.processes.list_running().await),
            ControlRequest::Answer {
                question_id,
                answer,
            } => serde_json::to_value(self.broker.answer(&question_id, &answer)?)?,
            ControlRequest::Services => serde_json::to_value(self.services.list().await)?,
            ControlRequest::ServicesReload => {
                self.services.reload_config().await;
                serde_json::to_value(self.services.list().await)?
            }
            ControlRequest::ServiceStart { service_id } => {
                self.require_service(&service_id).await?;
                json!({ "started": self.services.start(&service_id).await })
            }
            ControlRequest::ServiceStop { service_id } => {
                self.require_service(&service_id).await?;
                json!({ "stopped": self.services.stop(&service_id).await })
            }
            ControlRequest::ServiceRestart { service_id } => {
                self.require_service(&service_id).await?;
                json!({ "started": self.services.restart(&service_id).await })
            }
            ControlRequest::ServiceLogs { service_id, limit } => {
                self.require_service(&service_id).await?;
                let lines = self
                    .services
                    .logs(&service_id, limit.unwrap_or(DEFAULT_LOG_LINES))
                    .await;
                json!({ "service_id": service_id, "lines": lines })
            }
        })
    }

    async fn require_service(&self, service_id: &str) -> anyhow::Result<()> {
        if self.services.status(service_id).await.is_none() {
            anyhow::bail!("Service '{}' not found", service_id);
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.processes.shutdown().await;
        self.services.shutdown().await;
    }
}

// ============================================================================
// stdio loop
// ============================================================================

pub async fn run(ctx: Context) -> anyhow::Result<()> {
    let store = ctx.open_store()?;
    info!("Task store: {}", store.path().display());

    let server = Server::new(store, &ctx.paths, &ctx.settings);
    let report = server.processes.recover_orphans().await;
    if !report.alive.is_empty() {
        warn!(
            "{} orphaned agent process(es) still running: {}",
            report.alive.len(),
            report.alive.join(", ")
        );
    }

    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_lines(out_rx));

    // Subscribe before the loop starts so the first diff is not missed
    let updates = server.broadcaster.subscribe();
    let initial = server
        .broadcaster
        .initial_state()
        .await
        .context("Failed to read initial state")?;
    send(&out_tx, &initial);
    let forwarder = tokio::spawn(forward_updates(
        Arc::clone(&server.broadcaster),
        updates,
        out_tx.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_loop = {
        let broadcaster = Arc::clone(&server.broadcaster);
        tokio::spawn(async move { broadcaster.run(shutdown_rx).await })
    };

    info!("Dashboard serving on stdio (project {})", ctx.paths.project_root().display());

    read_requests(
        &server,
        BufReader::new(tokio::io::stdin()),
        &out_tx,
        tokio::signal::ctrl_c(),
    )
    .await;

    info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    let _ = sync_loop.await;
    forwarder.abort();
    server.shutdown().await;

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Dispatch request lines until EOF, a read error, or `interrupt` resolves
async fn read_requests<R, I>(
    server: &Server,
    input: R,
    out_tx: &mpsc::UnboundedSender<String>,
    interrupt: I,
) where
    R: AsyncBufRead + Unpin,
    I: Future,
{
    // Pinned once and polled across iterations
    tokio::pin!(interrupt);
    let mut lines = input.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ControlRequest>(line) {
                        Ok(request) => {
                            // Cancel and ask-style ops can take seconds
                            let server = server.clone();
                            let out_tx = out_tx.clone();
                            tokio::spawn(async move {
                                let reply = server.handle(request).await;
                                send(&out_tx, &reply);
                            });
                        }
                        Err(e) => send(out_tx, &Reply::error("unknown", format!("Invalid request: {}", e))),
                    }
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            _ = &mut interrupt => {
                info!("Interrupted");
                break;
            }
        }
    }
}

fn send<T: Serialize>(out: &mpsc::UnboundedSender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(line) => {
            // Receiver only goes away at shutdown
            let _ = out.send(line);
        }
        Err(e) => error!("Failed to serialize message: {}", e),
    }
}

async fn write_lines(mut rx: mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        let written = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await
        };
        if let Err(e) = written.await {
            error!("Failed to write to stdout: {}", e);
            break;
        }
    }
}

/// Relay broadcast messages; a lagging reader gets a fresh `init`
async fn forward_updates(
    broadcaster: Arc<SyncBroadcaster>,
    mut updates: broadcast::Receiver<SyncMessage>,
    out: mpsc::UnboundedSender<String>,
) {
    loop {
        match updates.recv().await {
            Ok(message) => send(&out, &message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Output lagged, {} message(s) skipped; resending state", skipped);
                match broadcaster.initial_state().await {
                    Ok(initial) => send(&out, &initial),
                    Err(e) => error!("Failed to rebuild state: {}", e),
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
