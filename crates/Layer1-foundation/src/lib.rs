//! # dashboard-foundation
//!
//! Foundation layer for the agent dashboard:
//! - Storage: SQLite 작업 저장소 (TaskStore) 와 레코드 타입
//! - Config: 통합 설정 (DashboardSettings), services.json, `.dashboard/` 경로
//! - Env: 에이전트 프로세스와의 환경 변수 계약
//!
//! ## 아키텍처
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  dashboard serve                                        │
//! │  ├── ProcessSupervisor ──spawn──▶ agent process         │
//! │  ├── ServiceSupervisor             │                    │
//! │  └── SyncBroadcaster               │ DASHBOARD_TASK_ID   │
//! │            │                       │ DASHBOARD_DB_PATH   │
//! │            ▼                       ▼                    │
//! │       TaskStore  ◀──────────  TaskTools (child side)    │
//! │       (.dashboard/tasks.db, WAL)                        │
//! └────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod env;
pub mod error;
pub mod storage;
pub mod strings;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Storage
// ============================================================================
pub use storage::{
    ActivityEntry, ActivityKind, Artifact, NewArtifact, NewQuestion, NewTask, Question,
    QuestionType, Task, TaskPatch, TaskSource, TaskStats, TaskStatus, TaskStore, TaskView,
};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    load_services, AgentSettings, DashboardPaths, DashboardSettings, QuestionSettings,
    ServiceSettings, ServiceSpec, SettingsLoader, SupervisorSettings, SyncSettings, REQUIRED_TOOLS,
};

// ============================================================================
// Env
// ============================================================================
pub use env::{ChildEnv, DB_PATH_ENV, TASK_ID_ENV};
