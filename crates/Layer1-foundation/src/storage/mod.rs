//! Storage module
//!
//! - `db`: SQLite - 작업 트리, 활동 로그, 질문, 아티팩트
//! - `types`: 레코드 타입

mod db;
mod types;

pub use db::TaskStore;
pub use types::{
    ActivityEntry, ActivityKind, Artifact, NewArtifact, NewQuestion, NewTask, Question,
    QuestionType, Task, TaskPatch, TaskSource, TaskStats, TaskStatus, TaskView,
};
