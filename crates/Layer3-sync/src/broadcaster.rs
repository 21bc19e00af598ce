//! Sync Broadcaster - polling snapshot-diff loop
//!
//! Every tick reads the full state (cheap at dashboard scale), compares it
//! with the previous tick and publishes only the parts that changed:
//!
//! - root tasks + stats: on change, `tasks_updated` then `stats`
//! - activity: id cursor, entries above it in ascending order
//! - pending questions: on change
//! - processes: every tick, so subscribers drop stale entries
//! - services: on change, only when services are configured
//!
//! The store is shared with agent processes, so polling is the only change
//! signal available. Timestamps have second precision; the activity cursor
//! uses the autoincrement id instead.

use crate::message::{InitState, SyncMessage};
use dashboard_foundation::{Result, SyncSettings, TaskStore};
use dashboard_task::{ProcessSupervisor, ServiceSupervisor};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Previous-tick snapshots
#[derive(Debug, Default)]
struct DiffState {
    tasks: Option<String>,
    questions: Option<String>,
    services: Option<String>,
    /// Highest activity id already published
    activity_cursor: i64,
}

/// Serialized form used for change detection
fn snapshot<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Replace `previous` and report whether it differed
fn changed(previous: &mut Option<String>, current: String) -> bool {
    if previous.as_deref() == Some(current.as_str()) {
        return false;
    }
    *previous = Some(current);
    true
}

pub struct SyncBroadcaster {
    store: TaskStore,
    processes: ProcessSupervisor,
    services: ServiceSupervisor,
    settings: SyncSettings,
    sender: broadcast::Sender<SyncMessage>,
    state: Mutex<DiffState>,
}

impl SyncBroadcaster {
    pub fn new(
        store: TaskStore,
        processes: ProcessSupervisor,
        services: ServiceSupervisor,
        settings: SyncSettings,
    ) -> Self {
        let (sender, _) = broadcast::channel(settings.channel_capacity.max(1));
        Self {
            store,
            processes,
            services,
            settings,
            sender,
            state: Mutex::new(DiffState::default()),
        }
    }

    /// New subscriber; pair with [`Self::initial_state`]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Full state for a newly connected subscriber
    pub async fn initial_state(&self) -> Result<SyncMessage> {
        let services = if self.services.has_services().await {
            self.services.list().await
        } else {
            Vec::new()
        };
        Ok(SyncMessage::Init(InitState {
            tasks: self.store.root_tasks()?,
            stats: self.store.stats()?,
            services,
        }))
    }

    /// Compute the messages for one tick and advance the diff state
    ///
    /// Every query runs before the state is touched, so a failed tick is
    /// retried in full on the next one.
    pub async fn tick(&self) -> Result<Vec<SyncMessage>> {
        let mut state = self.state.lock().await;

        let tasks = self.store.root_tasks()?;
        let stats = self.store.stats()?;
        let tasks_snapshot = snapshot(&(&tasks, &stats))?;
        let activity = self.store.activity_since(state.activity_cursor, None)?;
        let questions = self.store.pending_questions()?;
        let questions_snapshot = snapshot(&questions)?;

        let mut processes = BTreeMap::new();
        for task_id in self.processes.list_running().await {
            let status = self.processes.get_status(&task_id).await;
            processes.insert(task_id, status);
        }

        let services = if self.services.has_services().await {
            let services = self.services.list().await;
            let services_snapshot = snapshot(&services)?;
            Some((services, services_snapshot))
        } else {
            None
        };

        let mut out = Vec::new();
        if changed(&mut state.tasks, tasks_snapshot) {
            out.push(SyncMessage::TasksUpdated(tasks));
            out.push(SyncMessage::Stats(stats));
        }
        if let Some(last) = activity.iter().map(|entry| entry.id).max() {
            state.activity_cursor = last;
            out.push(SyncMessage::Activity(activity));
        }
        if changed(&mut state.questions, questions_snapshot) {
            out.push(SyncMessage::Questions(questions));
        }
        out.push(SyncMessage::Processes(processes));
        if let Some((services, services_snapshot)) = services {
            if changed(&mut state.services, services_snapshot) {
                out.push(SyncMessage::Services(services));
            }
        }

        Ok(out)
    }

    /// Send to every subscriber; returns how many received it
    pub fn publish(&self, message: SyncMessage) -> usize {
        // No receivers is not an error
        self.sender.send(message).unwrap_or(0)
    }

    /// Tick until `shutdown` flips to true (or its sender is dropped)
    ///
    /// Ticks are skipped while nobody is subscribed. A failing tick is
    /// logged and the loop keeps going.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Sync broadcaster started ({}ms tick)", self.settings.tick_ms);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if self.sender.receiver_count() == 0 {
                continue;
            }

            match self.tick().await {
                Ok(messages) => {
                    for message in messages {
                        debug!("Broadcasting {}", message.kind());
                        self.publish(message);
                    }
                }
                Err(e) => error!("Sync tick failed: {}", e),
            }
        }

        info!("Sync broadcaster stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed() {
        let mut previous = None;
        assert!(changed(&mut previous, "a".to_string()));
        assert!(!changed(&mut previous, "a".to_string()));
        assert!(changed(&mut previous, "b".to_string()));
        assert_eq!(previous.as_deref(), Some("b"));
    }
}
