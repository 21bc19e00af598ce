//! Agent launch configuration
//!
//! Headless (`-p`) runs cannot answer permission prompts and do not load the
//! project's MCP servers on their own, so before the first spawn the server:
//! - merges the required tool list with `.claude/settings.json`
//!   `permissions.allow`
//! - writes `.dashboard/mcp-config.json` from `.claude/settings.json`
//!   `mcpServers`, with relative paths made absolute

use dashboard_foundation::{AgentSettings, Result, Task, REQUIRED_TOOLS};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Generated MCP config, relative to the data dir
pub const MCP_CONFIG_FILE: &str = "mcp-config.json";

fn claude_settings_path(project_root: &Path) -> PathBuf {
    project_root.join(".claude").join("settings.json")
}

fn read_claude_settings(project_root: &Path) -> Option<Value> {
    let path = claude_settings_path(project_root);
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring invalid {}: {}", path.display(), e);
            None
        }
    }
}

/// Final agent settings for this project
pub fn resolve_agent(settings: &AgentSettings, project_root: &Path, data_dir: &Path) -> AgentSettings {
    let claude_settings = read_claude_settings(project_root);
    let mut agent = settings.clone();

    let mut tools: BTreeSet<String> = REQUIRED_TOOLS.iter().map(|t| t.to_string()).collect();
    tools.extend(agent.allowed_tools.drain(..));
    if let Some(allow) = claude_settings
        .as_ref()
        .and_then(|s| s.pointer("/permissions/allow"))
        .and_then(Value::as_array)
    {
        tools.extend(allow.iter().filter_map(Value::as_str).map(str::to_string));
    }
    agent.allowed_tools = tools.into_iter().collect();

    if agent.mcp_config.is_none() {
        let servers = claude_settings
            .as_ref()
            .and_then(|s| s.get("mcpServers"))
            .and_then(Value::as_object);
        if let Some(servers) = servers.filter(|s| !s.is_empty()) {
            match write_mcp_config(servers, project_root, data_dir) {
                Ok(path) => agent.mcp_config = Some(path),
                Err(e) => warn!("Failed to write MCP config: {}", e),
            }
        } else {
            debug!("No mcpServers in {}", claude_settings_path(project_root).display());
        }
    }

    agent
}

/// Relative paths containing a separator are anchored at the project root
fn absolutize(value: &str, project_root: &Path) -> Option<String> {
    if value.contains('/') && !Path::new(value).is_absolute() {
        Some(project_root.join(value).display().to_string())
    } else {
        None
    }
}

fn write_mcp_config(
    servers: &Map<String, Value>,
    project_root: &Path,
    data_dir: &Path,
) -> Result<PathBuf> {
    let mut resolved = Map::new();
    for (name, config) in servers {
        let mut config = config.clone();
        if let Some(obj) = config.as_object_mut() {
            if let Some(absolute) = obj
                .get("command")
                .and_then(Value::as_str)
                .and_then(|c| absolutize(c, project_root))
            {
                obj.insert("command".to_string(), Value::String(absolute));
            }
            if let Some(env) = obj.get_mut("env").and_then(Value::as_object_mut) {
                for value in env.values_mut() {
                    if let Some(absolute) = value.as_str().and_then(|v| absolutize(v, project_root)) {
                        *value = Value::String(absolute);
                    }
                }
            }
        }
        resolved.insert(name.clone(), config);
    }

    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(MCP_CONFIG_FILE);
    let mut content = serde_json::to_string_pretty(&json!({ "mcpServers": resolved }))?;
    content.push('\n');
    std::fs::write(&path, content)?;
    info!("Wrote MCP config with {} server(s) to {}", servers.len(), path.display());
    Ok(path)
}

/// Prompt used when a spawn request carries none
pub fn default_prompt(task: &Task) -> String {
    match task.description.as_deref().filter(|d| !d.trim().is_empty()) {
        Some(description) => format!("Use PM: {}\n\n{}", task.title, description),
        None => format!("Use PM: {}", task.title),
    }
}

/// Prompt handed to the agent CLI
pub fn task_prompt(task_id: &str, prompt: &str) -> String {
    format!("You have been assigned task ID: {}.\n\n{}", task_id, prompt)
}
