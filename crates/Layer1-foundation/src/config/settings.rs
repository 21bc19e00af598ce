//! Dashboard Settings - 통합 설정
//!
//! 모든 필드는 `#[serde(default)]`이므로 부분적인 settings.json도 허용된다.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// DashboardSettings (통합)
// ============================================================================

/// Dashboard 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DashboardSettings {
    /// 에이전트 실행 명령
    pub agent: AgentSettings,

    /// 프로세스 감독 타이밍
    pub supervisor: SupervisorSettings,

    /// 질문 대기 설정
    pub questions: QuestionSettings,

    /// 브로드캐스트 루프 설정
    pub sync: SyncSettings,

    /// 서비스 감독 설정
    pub services: ServiceSettings,
}

// ============================================================================
// Agent
// ============================================================================

/// Placeholder replaced by the task prompt inside `args`
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Tools pre-approved for headless runs; without them the agent waits for an
/// interactive permission prompt that never comes
pub const REQUIRED_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "Bash",
    "Glob",
    "Grep",
    "Task",
    "TodoWrite",
    "WebFetch",
    "WebSearch",
    "mcp__dashboard__dashboard_register_task",
    "mcp__dashboard__dashboard_create_subtask",
    "mcp__dashboard__dashboard_update_status",
    "mcp__dashboard__dashboard_update_phase",
    "mcp__dashboard__dashboard_log",
    "mcp__dashboard__dashboard_ask_question",
    "mcp__dashboard__dashboard_get_task",
    "mcp__dashboard__dashboard_add_artifact",
];

/// How the agent CLI is launched for a task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentSettings {
    /// Executable name or path
    pub program: String,

    /// Arguments; `{prompt}` is substituted with the task prompt
    pub args: Vec<String>,

    /// Passed as `--mcp-config <path>` when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<PathBuf>,

    /// Passed as `--allowedTools a,b,c` when non-empty
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                PROMPT_PLACEHOLDER.to_string(),
                "--verbose".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
            ],
            mcp_config: None,
            allowed_tools: REQUIRED_TOOLS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl AgentSettings {
    /// Full argument vector for one run
    pub fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(PROMPT_PLACEHOLDER, prompt))
            .collect();

        if let Some(ref mcp) = self.mcp_config {
            args.push("--mcp-config".to_string());
            args.push(mcp.display().to_string());
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed_tools.join(","));
        }
        args
    }
}

// ============================================================================
// Supervisor
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SupervisorSettings {
    /// SIGTERM -> SIGKILL grace for tracked processes
    pub terminate_grace_ms: u64,

    /// SIGTERM -> SIGKILL grace for orphaned (untracked) pids
    pub orphan_grace_ms: u64,

    /// Grace shared by all processes at shutdown
    pub shutdown_grace_ms: u64,

    /// Longest stdout line read whole; longer lines are discarded
    pub max_line_bytes: usize,

    /// stderr characters kept for the failure result
    pub stderr_tail_chars: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            terminate_grace_ms: 5_000,
            orphan_grace_ms: 2_000,
            shutdown_grace_ms: 5_000,
            max_line_bytes: 10 * 1024 * 1024,
            stderr_tail_chars: 500,
        }
    }
}

impl SupervisorSettings {
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_millis(self.orphan_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ============================================================================
// Questions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuestionSettings {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for QuestionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            timeout_secs: 30 * 60,
        }
    }
}

impl QuestionSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ============================================================================
// Sync
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    /// Broadcast tick
    pub tick_ms: u64,

    /// Per-subscriber message backlog
    pub channel_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            channel_capacity: 256,
        }
    }
}

impl SyncSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

// ============================================================================
// Services
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceSettings {
    /// Lines kept per service
    pub log_capacity: usize,

    pub stop_grace_ms: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            log_capacity: 500,
            stop_grace_ms: 5_000,
        }
    }
}

impl ServiceSettings {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_agent_args() {
        let agent = AgentSettings::default();
        let args = agent.build_args("Use PM: demo");
        assert_eq!(
            &args[..5],
            &["-p", "Use PM: demo", "--verbose", "--output-format", "stream-json"]
        );
        assert_eq!(args[5], "--allowedTools");
        assert!(args[6].starts_with("Read,Write,Edit,Bash"));
        assert_eq!(args.len(), 7);
    }

    #[test]
    fn test_agent_args_with_tools_and_mcp() {
        let agent = AgentSettings {
            mcp_config: Some(PathBuf::from("/tmp/mcp.json")),
            allowed_tools: vec!["Read".into(), "Bash".into()],
            ..Default::default()
        };
        let args = agent.build_args("x");
        let tail: Vec<&str> = args.iter().rev().take(4).rev().map(|s| s.as_str()).collect();
        assert_eq!(
            tail,
            vec!["--mcp-config", "/tmp/mcp.json", "--allowedTools", "Read,Bash"]
        );
    }

    #[test]
    fn test_partial_settings_deserialize() {
        let json = r#"{"questions": {"timeoutSecs": 5}, "sync": {"tickMs": 100}}"#;
        let settings: DashboardSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.questions.timeout(), Duration::from_secs(5));
        assert_eq!(settings.questions.poll_interval(), Duration::from_secs(2));
        assert_eq!(settings.sync.tick(), Duration::from_millis(100));
        assert_eq!(settings.agent.program, "claude");
    }
}
