//! Store record types
//!
//! Enums are stored as snake_case text and serialized the same way, so the
//! JSON pushed to subscribers matches what lives in SQLite.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        "Unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: Error| rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

// ============================================================================
// Task
// ============================================================================

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

text_enum!(TaskStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Blocked => "blocked",
});

impl TaskStatus {
    /// Completed or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// A process is expected to be working on the task
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::Blocked)
    }
}

/// Where a task was created from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    #[default]
    Cli,
    Dashboard,
}

text_enum!(TaskSource {
    Cli => "cli",
    Dashboard => "dashboard",
});

/// A task row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub phase: Option<String>,
    pub result: Option<String>,
    pub pid: Option<u32>,
    pub auto_accept: bool,
    pub source: TaskSource,
    pub created_at: String,
    pub updated_at: String,
}

/// A task with its derived read-time fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,

    /// Direct children, oldest first
    pub children: Vec<Task>,

    /// Unanswered questions on this task
    pub pending_questions: u32,
}

/// Input for creating a task
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub parent_id: Option<String>,
    pub assigned_agent: Option<String>,
    pub status: Option<TaskStatus>,
    pub auto_accept: bool,
    pub source: TaskSource,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.assigned_agent = Some(agent.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept = auto_accept;
        self
    }

    pub fn with_source(mut self, source: TaskSource) -> Self {
        self.source = source;
        self
    }
}

/// Partial update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub assigned_agent: Option<String>,
    pub phase: Option<String>,
    pub result: Option<String>,
    /// `Some(None)` clears the pid
    pub pid: Option<Option<u32>>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn assigned_agent(mut self, agent: impl Into<String>) -> Self {
        self.assigned_agent = Some(agent.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = Some(Some(pid));
        self
    }

    pub fn clear_pid(mut self) -> Self {
        self.pid = Some(None);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ============================================================================
// Activity
// ============================================================================

/// Activity log event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Created,
    StatusChange,
    PhaseChange,
    Message,
    Question,
    Answer,
    Artifact,
    Error,
}

text_enum!(ActivityKind {
    Created => "created",
    StatusChange => "status_change",
    PhaseChange => "phase_change",
    Message => "message",
    Question => "question",
    Answer => "answer",
    Artifact => "artifact",
    Error => "error",
});

/// One append-only activity entry; `id` is the change cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub task_id: String,
    pub event_type: ActivityKind,
    pub agent: Option<String>,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

// ============================================================================
// Question
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    #[default]
    Text,
    Single,
    Multiple,
    Confirm,
    PlanReview,
}

text_enum!(QuestionType {
    Text => "text",
    Single => "single",
    Multiple => "multiple",
    Confirm => "confirm",
    PlanReview => "plan_review",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub task_id: String,
    pub agent: Option<String>,
    pub question: String,
    pub question_type: QuestionType,
    pub options: Option<Vec<String>>,
    pub context: Option<String>,
    /// `None` while pending
    pub answer: Option<String>,
    pub answered_at: Option<String>,
    pub auto_accepted: bool,
    pub created_at: String,
}

impl Question {
    pub fn is_pending(&self) -> bool {
        self.answer.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewQuestion {
    pub task_id: String,
    pub agent: Option<String>,
    pub question: String,
    pub question_type: QuestionType,
    pub options: Option<Vec<String>>,
    pub context: Option<String>,
}

// ============================================================================
// Artifact
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub task_id: String,
    /// screenshot, markdown_report, eval_report, file ...
    pub artifact_type: String,
    pub label: String,
    /// Snapshot copy under `.dashboard/artifacts/`
    pub file_path: String,
    pub mime_type: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewArtifact {
    /// Pre-allocated so the snapshot directory can be named after it
    pub id: String,
    pub task_id: String,
    pub artifact_type: String,
    pub label: String,
    pub file_path: String,
    pub mime_type: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

// ============================================================================
// Stats
// ============================================================================

/// Counts per status plus pending questions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: u32,
    pub in_progress: u32,
    pub completed: u32,
    pub failed: u32,
    pub blocked: u32,
    pub total: u32,
    pub pending_questions: u32,
}

impl TaskStats {
    pub(crate) fn add(&mut self, status: TaskStatus, count: u32) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::InProgress => self.in_progress += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Blocked => self.blocked += count,
        }
        self.total += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_roundtrip() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), *status);
        }
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_serde_matches_text() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let json = serde_json::to_string(&QuestionType::PlanReview).unwrap();
        assert_eq!(json, "\"plan_review\"");
    }

    #[test]
    fn test_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(TaskStatus::Blocked.is_active());
    }

    #[test]
    fn test_patch_builder() {
        assert!(TaskPatch::new().is_empty());
        let patch = TaskPatch::new().status(TaskStatus::Failed).clear_pid();
        assert_eq!(patch.pid, Some(None));
        assert!(!patch.is_empty());
    }

    #[test]
    fn test_task_view_flattens() {
        let view = TaskView {
            task: Task {
                id: "t1".into(),
                parent_id: None,
                title: "Root".into(),
                description: None,
                status: TaskStatus::Pending,
                assigned_agent: None,
                phase: None,
                result: None,
                pid: None,
                auto_accept: false,
                source: TaskSource::Cli,
                created_at: "2024-01-01T00:00:00.000Z".into(),
                updated_at: "2024-01-01T00:00:00.000Z".into(),
            },
            children: Vec::new(),
            pending_questions: 2,
        };
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["id"], "t1");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["pending_questions"], 2);
    }
}
