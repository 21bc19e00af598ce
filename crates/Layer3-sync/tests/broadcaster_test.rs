//! Broadcaster integration tests against a real store
//!
//! `cargo test -p dashboard-sync --test broadcaster_test`

use dashboard_foundation::{
    ActivityKind, AgentSettings, NewQuestion, NewTask, ServiceSettings, SupervisorSettings,
    SyncSettings, TaskStore,
};
use dashboard_sync::{SyncBroadcaster, SyncMessage};
use dashboard_task::{ProcessSupervisor, ServiceSupervisor};
use std::time::Duration;

fn setup(services_json: Option<&str>) -> (tempfile::TempDir, TaskStore, SyncBroadcaster) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = TaskStore::open(dir.path().join("tasks.db")).expect("Failed to open store");

    let services_file = dir.path().join("services.json");
    if let Some(json) = services_json {
        std::fs::write(&services_file, json).unwrap();
    }

    let processes = ProcessSupervisor::new(
        store.clone(),
        dir.path(),
        AgentSettings::default(),
        SupervisorSettings::default(),
    );
    let services = ServiceSupervisor::new(dir.path(), services_file, ServiceSettings::default());
    let broadcaster = SyncBroadcaster::new(
        store.clone(),
        processes,
        services,
        SyncSettings {
            tick_ms: 20,
            ..Default::default()
        },
    );
    (dir, store, broadcaster)
}

fn kinds(messages: &[SyncMessage]) -> Vec<&'static str> {
    messages.iter().map(SyncMessage::kind).collect()
}

#[tokio::test]
async fn test_quiet_ticks_only_push_processes() {
    let (_dir, store, broadcaster) = setup(None);
    store.create_task(&NewTask::new("t")).unwrap();

    let first = broadcaster.tick().await.unwrap();
    assert_eq!(
        kinds(&first),
        vec!["tasks_updated", "stats", "activity", "questions", "processes"]
    );

    let second = broadcaster.tick().await.unwrap();
    assert_eq!(kinds(&second), vec!["processes"]);
    let third = broadcaster.tick().await.unwrap();
    assert_eq!(kinds(&third), vec!["processes"]);
}

#[tokio::test]
async fn test_activity_cursor_advances() {
    let (_dir, store, broadcaster) = setup(None);
    let task = store.create_task(&NewTask::new("t")).unwrap();
    broadcaster.tick().await.unwrap();

    let first = store
        .log_activity(&task.id, ActivityKind::Message, "one", None)
        .unwrap();
    let second = store
        .log_activity(&task.id, ActivityKind::Message, "two", None)
        .unwrap();

    let messages = broadcaster.tick().await.unwrap();
    let activity = messages
        .iter()
        .find_map(|m| match m {
            SyncMessage::Activity(entries) => Some(entries.clone()),
            _ => None,
        })
        .expect("activity pushed");
    let ids: Vec<i64> = activity.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![first, second]);

    // Logging activity does not touch the task row
    assert!(!kinds(&messages).contains(&"tasks_updated"));

    let next = broadcaster.tick().await.unwrap();
    assert!(!kinds(&next).contains(&"activity"));
}

#[tokio::test]
async fn test_failed_tick_keeps_activity_for_next_tick() {
    let (_dir, store, broadcaster) = setup(None);
    let task = store.create_task(&NewTask::new("t")).unwrap();
    broadcaster.tick().await.unwrap();

    let logged = store
        .log_activity(&task.id, ActivityKind::Message, "while broken", None)
        .unwrap();

    // Break only the pending-questions query, which runs after activity
    let conn = rusqlite::Connection::open(store.path()).unwrap();
    conn.execute_batch("ALTER TABLE questions RENAME COLUMN context TO context_moved")
        .unwrap();
    assert!(broadcaster.tick().await.is_err());

    conn.execute_batch("ALTER TABLE questions RENAME COLUMN context_moved TO context")
        .unwrap();
    let messages = broadcaster.tick().await.unwrap();
    let ids: Vec<i64> = messages
        .iter()
        .find_map(|m| match m {
            SyncMessage::Activity(entries) => Some(entries.iter().map(|e| e.id).collect()),
            _ => None,
        })
        .expect("activity pushed after recovery");
    assert_eq!(ids, vec![logged]);
}

#[tokio::test]
async fn test_question_change_pushes_tasks_and_questions() {
    let (_dir, store, broadcaster) = setup(None);
    let task = store.create_task(&NewTask::new("t")).unwrap();
    broadcaster.tick().await.unwrap();

    store
        .create_question(&NewQuestion {
            task_id: task.id.clone(),
            question: "Proceed?".into(),
            ..Default::default()
        })
        .unwrap();

    let messages = broadcaster.tick().await.unwrap();
    let pending = messages
        .iter()
        .find_map(|m| match m {
            SyncMessage::Questions(questions) => Some(questions.len()),
            _ => None,
        })
        .expect("questions pushed");
    assert_eq!(pending, 1);
    // Pending question count is part of the task view and stats
    assert!(kinds(&messages).contains(&"stats"));
}

#[tokio::test]
async fn test_services_pushed_once() {
    let (_dir, _store, broadcaster) = setup(Some(
        r#"{"services": [{"id": "web", "name": "Web", "command": "true"}]}"#,
    ));

    let first = broadcaster.tick().await.unwrap();
    assert!(kinds(&first).contains(&"services"));
    let second = broadcaster.tick().await.unwrap();
    assert!(!kinds(&second).contains(&"services"));

    match broadcaster.initial_state().await.unwrap() {
        SyncMessage::Init(init) => {
            assert_eq!(init.services.len(), 1);
            assert_eq!(init.services[0].id, "web");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_run_publishes_to_subscribers_and_stops() {
    let (_dir, store, broadcaster) = setup(None);
    store.create_task(&NewTask::new("t")).unwrap();
    let broadcaster = std::sync::Arc::new(broadcaster);
    let mut rx = broadcaster.subscribe();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let loop_task = {
        let broadcaster = broadcaster.clone();
        tokio::spawn(async move { broadcaster.run(shutdown_rx).await })
    };

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message within timeout")
        .unwrap();
    assert_eq!(first.kind(), "tasks_updated");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), loop_task)
        .await
        .expect("loop stops")
        .unwrap();
}
