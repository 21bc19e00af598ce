//! Supervisor integration tests - real child processes driven through `sh`
//!
//! `cargo test -p dashboard-task --test supervisor_test`

#![cfg(unix)]

use dashboard_foundation::{
    AgentSettings, NewQuestion, NewTask, ServiceSettings, SupervisorSettings, Task, TaskPatch,
    TaskStatus, TaskStore,
};
use dashboard_task::{
    ProcessStatus, ProcessSupervisor, ServiceStatus, ServiceSupervisor, CANCELLED_RESULT,
    COMPLETION_PHASE, SHUTDOWN_RESULT,
};
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

/// Agent CLI replaced by a shell script; the prompt is not passed along
fn fake_agent(script: &str) -> AgentSettings {
    AgentSettings {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        mcp_config: None,
        allowed_tools: Vec::new(),
    }
}

fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        terminate_grace_ms: 500,
        orphan_grace_ms: 500,
        shutdown_grace_ms: 500,
        ..Default::default()
    }
}

fn setup(script: &str) -> (tempfile::TempDir, TaskStore, ProcessSupervisor) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = TaskStore::open(dir.path().join(".dashboard").join("tasks.db"))
        .expect("Failed to open store");
    let supervisor = ProcessSupervisor::new(
        store.clone(),
        dir.path(),
        fake_agent(script),
        fast_settings(),
    );
    (dir, store, supervisor)
}

fn task(store: &TaskStore, id: &str) -> Task {
    store.find_task(id).unwrap().expect("task exists")
}

/// Wait until the monitor has released the task
async fn wait_untracked(supervisor: &ProcessSupervisor, task_id: &str) {
    for _ in 0..200 {
        if !supervisor.is_tracked(task_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("process for {} still tracked", task_id);
}

fn activity_messages(store: &TaskStore, task_id: &str) -> Vec<String> {
    store
        .activity(Some(task_id), 100, false)
        .unwrap()
        .into_iter()
        .map(|entry| entry.message)
        .collect()
}

/// Pid of a process that has already been reaped
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

// ============================================================================
// Agent processes
// ============================================================================

#[tokio::test]
async fn test_clean_exit_completes_task() {
    let (_dir, store, supervisor) = setup(
        r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"}]}}'; exit 0"#,
    );
    let t = store.create_task(&NewTask::new("ok")).unwrap();

    assert!(supervisor.spawn(&t.id, "do it").await);
    wait_untracked(&supervisor, &t.id).await;

    let done = task(&store, &t.id);
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.phase.as_deref(), Some(COMPLETION_PHASE));
    assert_eq!(done.pid, None);

    let messages = activity_messages(&store, &t.id);
    assert!(messages.iter().any(|m| m == "working on it"));
    assert!(messages.iter().any(|m| m == "Agent process completed"));
    assert!(messages.iter().any(|m| m.starts_with("Agent process started (PID")));
}

#[tokio::test]
async fn test_clean_exit_keeps_status_set_by_agent() {
    let (_dir, store, supervisor) = setup("sleep 1; exit 0");
    let gave_up = store.create_task(&NewTask::new("gave up")).unwrap();
    let finished = store.create_task(&NewTask::new("finished")).unwrap();
    assert!(supervisor.spawn(&gave_up.id, "x").await);
    assert!(supervisor.spawn(&finished.id, "x").await);

    // What the agent reports through its tools before exiting
    store
        .update_task(
            &gave_up.id,
            &TaskPatch::new()
                .status(TaskStatus::Failed)
                .phase("review")
                .result("Tests keep failing"),
        )
        .unwrap();
    store
        .update_task(
            &finished.id,
            &TaskPatch::new()
                .status(TaskStatus::Completed)
                .phase("review")
                .result("Shipped the fix"),
        )
        .unwrap();

    wait_untracked(&supervisor, &gave_up.id).await;
    wait_untracked(&supervisor, &finished.id).await;

    let gave_up = task(&store, &gave_up.id);
    assert_eq!(gave_up.status, TaskStatus::Failed);
    assert_eq!(gave_up.result.as_deref(), Some("Tests keep failing"));
    assert_eq!(gave_up.phase.as_deref(), Some("review"));
    assert_eq!(gave_up.pid, None);

    let finished = task(&store, &finished.id);
    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(finished.result.as_deref(), Some("Shipped the fix"));
    assert_eq!(finished.phase.as_deref(), Some(COMPLETION_PHASE));
    assert_eq!(finished.pid, None);
}

#[tokio::test]
async fn test_nonzero_exit_fails_with_stderr_tail() {
    let (_dir, store, supervisor) = setup("echo 'missing API key' >&2; exit 3");
    let t = store.create_task(&NewTask::new("bad")).unwrap();

    assert!(supervisor.spawn(&t.id, "x").await);
    wait_untracked(&supervisor, &t.id).await;

    let failed = task(&store, &t.id);
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.pid, None);
    let result = failed.result.unwrap_or_default();
    assert!(result.starts_with("Process exited with code 3"), "{}", result);
    assert!(result.contains("missing API key"), "{}", result);
    assert!(activity_messages(&store, &t.id)
        .iter()
        .any(|m| m == "Process failed (exit code 3)"));
}

#[tokio::test]
async fn test_missing_agent_binary_fails_task() {
    let (_dir, store, _) = setup("exit 0");
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new(
        store.clone(),
        dir.path(),
        AgentSettings {
            program: "definitely-not-an-agent-cli".to_string(),
            ..fake_agent("")
        },
        fast_settings(),
    );
    let t = store.create_task(&NewTask::new("x")).unwrap();

    assert!(!supervisor.spawn(&t.id, "x").await);
    let failed = task(&store, &t.id);
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(
        failed.result.as_deref(),
        Some("Agent CLI not found: definitely-not-an-agent-cli")
    );
}

#[tokio::test]
async fn test_spawn_twice_and_cancel() {
    let (_dir, store, supervisor) = setup("sleep 30");
    let t = store.create_task(&NewTask::new("long")).unwrap();

    assert!(supervisor.spawn(&t.id, "x").await);
    assert!(!supervisor.spawn(&t.id, "x").await);
    assert!(!supervisor.spawn("unknown", "x").await);

    let running = task(&store, &t.id);
    assert_eq!(running.status, TaskStatus::InProgress);
    let pid = running.pid.expect("pid persisted");
    assert_eq!(
        supervisor.get_status(&t.id).await,
        ProcessStatus::Running {
            pid,
            orphaned: false
        }
    );
    assert_eq!(supervisor.list_running().await, vec![t.id.clone()]);

    assert!(supervisor.cancel(&t.id).await);
    assert!(!supervisor.is_tracked(&t.id).await);

    let cancelled = task(&store, &t.id);
    assert_eq!(cancelled.status, TaskStatus::Failed);
    assert_eq!(cancelled.result.as_deref(), Some(CANCELLED_RESULT));
    assert_eq!(cancelled.pid, None);
    assert_eq!(supervisor.get_status(&t.id).await, ProcessStatus::NotFound);

    // Nothing left to cancel
    assert!(!supervisor.cancel(&t.id).await);
}

#[tokio::test]
async fn test_cancel_blocked_task_with_pending_questions() {
    let (_dir, store, supervisor) = setup("sleep 30");
    let t = store.create_task(&NewTask::new("asking")).unwrap();
    assert!(supervisor.spawn(&t.id, "x").await);

    for q in ["first?", "second?"] {
        store
            .create_question(&NewQuestion {
                task_id: t.id.clone(),
                question: q.to_string(),
                ..Default::default()
            })
            .unwrap();
    }
    store
        .update_task(&t.id, &TaskPatch::new().status(TaskStatus::Blocked))
        .unwrap();

    assert!(supervisor.cancel(&t.id).await);
    let cancelled = task(&store, &t.id);
    assert_eq!(cancelled.status, TaskStatus::Failed);
    assert_eq!(cancelled.result.as_deref(), Some(CANCELLED_RESULT));
}

#[tokio::test]
async fn test_shutdown_fails_running_tasks() {
    let (_dir, store, supervisor) = setup("sleep 30");
    let a = store.create_task(&NewTask::new("a")).unwrap();
    let b = store.create_task(&NewTask::new("b")).unwrap();
    assert!(supervisor.spawn(&a.id, "x").await);
    assert!(supervisor.spawn(&b.id, "x").await);

    supervisor.shutdown().await;

    for id in [&a.id, &b.id] {
        let t = task(&store, id);
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.result.as_deref(), Some(SHUTDOWN_RESULT));
        assert_eq!(t.pid, None);
    }
    assert!(supervisor.list_running().await.is_empty());
}

// ============================================================================
// Orphans
// ============================================================================

#[tokio::test]
async fn test_recover_dead_orphan() {
    let (_dir, store, supervisor) = setup("exit 0");
    let t = store
        .create_task(&NewTask::new("orphan").with_status(TaskStatus::InProgress))
        .unwrap();
    store
        .update_task(&t.id, &TaskPatch::new().pid(dead_pid()))
        .unwrap();

    let report = supervisor.recover_orphans().await;
    assert_eq!(report.reaped, vec![t.id.clone()]);
    assert!(report.alive.is_empty());

    let reaped = task(&store, &t.id);
    assert_eq!(reaped.status, TaskStatus::Failed);
    assert_eq!(reaped.pid, None);
    assert!(reaped
        .result
        .unwrap_or_default()
        .contains("died during server restart"));
}

#[tokio::test]
async fn test_recover_and_cancel_live_orphan() {
    let (_dir, store, supervisor) = setup("exit 0");
    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();
    // Reap in the background so the pid disappears once killed
    let reaper = std::thread::spawn(move || child.wait());

    let t = store
        .create_task(&NewTask::new("orphan").with_status(TaskStatus::InProgress))
        .unwrap();
    store.update_task(&t.id, &TaskPatch::new().pid(pid)).unwrap();

    let report = supervisor.recover_orphans().await;
    assert_eq!(report.alive, vec![t.id.clone()]);
    assert_eq!(task(&store, &t.id).status, TaskStatus::InProgress);
    assert_eq!(
        supervisor.get_status(&t.id).await,
        ProcessStatus::Running {
            pid,
            orphaned: true
        }
    );
    assert_eq!(supervisor.list_running().await, vec![t.id.clone()]);

    let warnings = activity_messages(&store, &t.id)
        .into_iter()
        .filter(|m| m.contains("orphaned process"))
        .count();
    assert_eq!(warnings, 1);

    // The orphan still owns the task: no second agent, pid untouched
    assert!(!supervisor.spawn(&t.id, "x").await);
    assert!(!supervisor.is_tracked(&t.id).await);
    assert_eq!(task(&store, &t.id).pid, Some(pid));

    assert!(supervisor.cancel(&t.id).await);
    let cancelled = task(&store, &t.id);
    assert_eq!(cancelled.status, TaskStatus::Failed);
    assert_eq!(cancelled.result.as_deref(), Some(CANCELLED_RESULT));
    assert_eq!(cancelled.pid, None);

    let status = reaper.join().unwrap().unwrap();
    assert!(!status.success());
}

// ============================================================================
// Services
// ============================================================================

fn write_services(root: &Path, json: &str) -> std::path::PathBuf {
    let path = root.join("services.json");
    std::fs::write(&path, json).unwrap();
    path
}

#[tokio::test]
async fn test_service_start_twice_runs_one_process() {
    let dir = tempfile::tempdir().unwrap();
    let services_file = write_services(
        dir.path(),
        r#"{"services": [{"id": "web", "name": "Web", "command": "echo listening on http://localhost:4173; sleep 30"}]}"#,
    );
    let services = ServiceSupervisor::new(dir.path(), services_file, ServiceSettings::default());

    assert!(services.start("web").await);
    let first = services.status("web").await.unwrap();
    assert!(services.start("web").await);
    let second = services.status("web").await.unwrap();
    assert_eq!(first.pid, second.pid);
    assert_eq!(second.status, ServiceStatus::Running);

    // Wait for the banner line
    let mut detected = None;
    for _ in 0..100 {
        detected = services.status("web").await.and_then(|s| s.detected_port);
        if detected.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(detected, Some(4173));
    assert!(services
        .logs("web", 10)
        .await
        .iter()
        .any(|l| l.contains("listening")));

    assert!(services.stop("web").await);
    let stopped = services.status("web").await.unwrap();
    assert_eq!(stopped.status, ServiceStatus::Stopped);
    assert_eq!(stopped.pid, None);
    assert!(!services.stop("web").await);
}

#[tokio::test]
async fn test_service_crash_is_failed() {
    let dir = tempfile::tempdir().unwrap();
    let services_file = write_services(
        dir.path(),
        r#"{"services": [{"id": "api", "name": "API", "command": "exit 2"}]}"#,
    );
    let services = ServiceSupervisor::new(dir.path(), services_file, ServiceSettings::default());

    assert!(services.start("api").await);
    let mut status = ServiceStatus::Starting;
    for _ in 0..100 {
        status = services.status("api").await.unwrap().status;
        if status == ServiceStatus::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, ServiceStatus::Failed);
    assert!(services
        .logs("api", 10)
        .await
        .iter()
        .any(|l| l.starts_with("[service-manager]")));
}
