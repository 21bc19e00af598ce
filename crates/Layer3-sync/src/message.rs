//! Push messages
//!
//! Serialized as `{"type": "...", "data": ...}`:
//!
//! | type | data |
//! |---|---|
//! | `init` | `{tasks, stats, services}` for a new subscriber |
//! | `tasks_updated` | root tasks with children |
//! | `stats` | status counts |
//! | `activity` | new entries, ascending id |
//! | `questions` | every pending question |
//! | `processes` | task id -> process status |
//! | `services` | service list |

use dashboard_foundation::{ActivityEntry, Question, TaskStats, TaskView};
use dashboard_task::{ProcessStatus, ServiceInfo};
use serde::Serialize;
use std::collections::BTreeMap;

/// Full state sent once when a subscriber connects
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitState {
    pub tasks: Vec<TaskView>,
    pub stats: TaskStats,
    pub services: Vec<ServiceInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SyncMessage {
    Init(InitState),
    TasksUpdated(Vec<TaskView>),
    Stats(TaskStats),
    Activity(Vec<ActivityEntry>),
    Questions(Vec<Question>),
    Processes(BTreeMap<String, ProcessStatus>),
    Services(Vec<ServiceInfo>),
}

impl SyncMessage {
    /// Wire name of the message
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Init(_) => "init",
            SyncMessage::TasksUpdated(_) => "tasks_updated",
            SyncMessage::Stats(_) => "stats",
            SyncMessage::Activity(_) => "activity",
            SyncMessage::Questions(_) => "questions",
            SyncMessage::Processes(_) => "processes",
            SyncMessage::Services(_) => "services",
        }
    }
}
