//! # dashboard-task
//!
//! Process side of the agent dashboard.
//!
//! ## Features
//!
//! - One supervised agent process per task (spawn, cancel, shutdown)
//! - stream-json stdout parsed into the activity log
//! - Orphan reconciliation after a server restart
//! - Blocking human-in-the-loop questions with auto-accept and timeout
//! - Long-running dev services with bounded logs and port detection
//! - Child-side task tools sharing the store with the server

pub mod agent;
pub mod log;
pub mod process;
pub mod question;
pub mod service;
pub mod stream;
pub mod supervisor;
pub mod tools;

// Agent processes
pub use agent::{default_prompt, resolve_agent, task_prompt, MCP_CONFIG_FILE};
pub use supervisor::{
    OrphanReport, ProcessStatus, ProcessSupervisor, CANCELLED_RESULT, COMPLETED_RESULT,
    COMPLETION_PHASE, SHUTDOWN_RESULT,
};
pub use stream::{classify_line, ActivityLine, StreamEvent};
pub use process::{ChildHandle, ExitOutcome, Lifecycle, Liveness};

// Questions
pub use question::{default_answer, AskOutcome, AskRequest, QuestionBroker, TIMEOUT_ANSWER};

// Services
pub use log::{ServiceLogBuffer, DEFAULT_LOG_CAPACITY};
pub use service::{detect_port, ServiceInfo, ServiceStatus, ServiceSupervisor};

// Child-side tools
pub use tools::{ArtifactRequest, TaskTools, ORCHESTRATOR_AGENT};
