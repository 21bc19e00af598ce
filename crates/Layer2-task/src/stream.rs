//! Agent stdout classification
//!
//! The agent CLI emits one JSON event per line (`--output-format stream-json`).
//! Each line becomes zero or more bounded activity messages:
//!
//! | event         | activity                                   |
//! |---------------|--------------------------------------------|
//! | `assistant`   | each non-blank text block (300 chars)      |
//! | `tool_use`    | `Using tool: <name>` (+ Task description)  |
//! | `tool_result` | `Tool result (<name>): ...` (250 chars)    |
//! | `system`      | message text, agent `system`               |
//! | `result`      | `Result: ...` / `Agent result: ...`        |
//!
//! Non-JSON lines longer than 10 characters are kept verbatim (truncated).
//! Everything else is dropped.

use dashboard_foundation::strings::truncate_chars;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::trace;

/// Agent name recorded for model output
pub const CLAUDE_AGENT: &str = "claude";

/// Agent name recorded for system events
pub const SYSTEM_AGENT: &str = "system";

const MESSAGE_CHARS: usize = 300;
const TOOL_RESULT_CHARS: usize = 250;

/// Shorter raw lines are noise (progress dots, blank prompts)
const MIN_RAW_CHARS: usize = 10;

/// One activity message derived from an output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityLine {
    pub agent: &'static str,
    pub message: String,
}

impl ActivityLine {
    fn claude(message: impl Into<String>) -> Self {
        Self {
            agent: CLAUDE_AGENT,
            message: message.into(),
        }
    }

    fn system(message: impl Into<String>) -> Self {
        Self {
            agent: SYSTEM_AGENT,
            message: message.into(),
        }
    }
}

// ============================================================================
// Event model
// ============================================================================

/// One stream-json event
///
/// Field shapes vary between CLI versions, so every payload field is lenient:
/// a value of the wrong type reads as absent instead of rejecting the event.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Assistant {
        #[serde(default, deserialize_with = "lenient")]
        message: Option<AssistantMessage>,
        #[serde(default, deserialize_with = "lenient")]
        content: Option<Content>,
        #[serde(default, deserialize_with = "lenient")]
        text: Option<String>,
    },
    ToolUse {
        #[serde(default, deserialize_with = "lenient")]
        tool: Option<String>,
        #[serde(default, deserialize_with = "lenient")]
        name: Option<String>,
        #[serde(default)]
        input: Option<Value>,
    },
    ToolResult {
        #[serde(default, deserialize_with = "lenient")]
        content: Option<Content>,
        #[serde(default, deserialize_with = "lenient")]
        tool: Option<String>,
        #[serde(default, deserialize_with = "lenient")]
        name: Option<String>,
    },
    System {
        #[serde(default, deserialize_with = "lenient")]
        message: Option<String>,
        #[serde(default, deserialize_with = "lenient")]
        text: Option<String>,
    },
    Result {
        #[serde(default, deserialize_with = "lenient")]
        result: Option<String>,
        #[serde(default, rename = "subResult", deserialize_with = "lenient")]
        sub_result: Option<String>,
    },
    /// Event kinds with no activity (stream_event, user, ...)
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default, deserialize_with = "lenient")]
    pub content: Option<Content>,
}

/// Message content: a plain string or a list of typed blocks
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<Block>),
}

impl Content {
    fn is_empty(&self) -> bool {
        match self {
            Content::Text(text) => text.is_empty(),
            Content::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Block {
    Known(ContentBlock),
    Malformed(IgnoredAny),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Other,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Text of every `text` block, in order
fn text_blocks(blocks: &[Block]) -> impl Iterator<Item = &str> {
    blocks.iter().filter_map(|block| match block {
        Block::Known(ContentBlock::Text { text }) => Some(text.as_str()),
        _ => None,
    })
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

// ============================================================================
// Classification
// ============================================================================

/// Classify one (already trimmed, non-empty) stdout line
pub fn classify_line(line: &str) -> Vec<ActivityLine> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => {
            if line.chars().count() > MIN_RAW_CHARS {
                return vec![ActivityLine::claude(truncate_chars(line, MESSAGE_CHARS))];
            }
            return Vec::new();
        }
    };

    match StreamEvent::deserialize(value) {
        Ok(event) => classify_event(event),
        Err(e) => {
            trace!("Dropping unrecognized stream line: {}", e);
            Vec::new()
        }
    }
}

/// Activity lines for a parsed event
pub fn classify_event(event: StreamEvent) -> Vec<ActivityLine> {
    let mut out = Vec::new();

    match event {
        StreamEvent::Assistant {
            message,
            content,
            text,
        } => {
            // Nested `message.content` wins over a top-level `content`
            let content = match message {
                Some(message) => message.content,
                None => content,
            };

            match &content {
                Some(Content::Blocks(blocks)) => {
                    for text in text_blocks(blocks) {
                        let snippet = truncate_chars(text, MESSAGE_CHARS);
                        if !is_blank(&snippet) {
                            out.push(ActivityLine::claude(snippet));
                        }
                    }
                }
                Some(Content::Text(text)) if !is_blank(text) => {
                    out.push(ActivityLine::claude(truncate_chars(text, MESSAGE_CHARS)));
                }
                _ => {}
            }

            let content_empty = content.as_ref().map_or(true, Content::is_empty);
            if let Some(text) = text.filter(|t| !is_blank(t)) {
                if content_empty {
                    out.push(ActivityLine::claude(truncate_chars(&text, MESSAGE_CHARS)));
                }
            }
        }

        StreamEvent::Result { result, sub_result } => {
            if let Some(result) = result.filter(|r| !is_blank(r)) {
                out.push(ActivityLine::claude(format!(
                    "Result: {}",
                    truncate_chars(&result, MESSAGE_CHARS)
                )));
            }
            if let Some(sub) = sub_result.filter(|r| !is_blank(r)) {
                out.push(ActivityLine::claude(format!(
                    "Agent result: {}",
                    truncate_chars(&sub, MESSAGE_CHARS)
                )));
            }
        }

        StreamEvent::ToolUse { tool, name, input } => {
            let tool_name = tool.or(name).unwrap_or_else(|| "unknown".to_string());
            let mut message = format!("Using tool: {}", tool_name);
            if tool_name == "Task" {
                let description = input
                    .as_ref()
                    .and_then(|i| i.get("description"))
                    .and_then(Value::as_str)
                    .filter(|d| !d.is_empty());
                if let Some(description) = description {
                    message.push_str(" - ");
                    message.push_str(description);
                }
            }
            out.push(ActivityLine::claude(truncate_chars(&message, MESSAGE_CHARS)));
        }

        StreamEvent::ToolResult {
            content,
            tool,
            name,
        } => {
            let prefix = match tool.or(name).filter(|n| !n.is_empty()) {
                Some(name) => format!("Tool result ({}): ", name),
                None => "Tool result: ".to_string(),
            };

            match content {
                Some(Content::Text(text)) if text.trim().chars().count() > MIN_RAW_CHARS => {
                    out.push(ActivityLine::claude(format!(
                        "{}{}",
                        prefix,
                        truncate_chars(&text, TOOL_RESULT_CHARS)
                    )));
                }
                Some(Content::Blocks(blocks)) => {
                    for text in text_blocks(&blocks) {
                        let snippet = truncate_chars(text, TOOL_RESULT_CHARS);
                        if !is_blank(&snippet) {
                            out.push(ActivityLine::claude(format!("{}{}", prefix, snippet)));
                        }
                    }
                }
                _ => {}
            }
        }

        StreamEvent::System { message, text } => {
            if let Some(message) = message.or(text).filter(|m| !is_blank(m)) {
                out.push(ActivityLine::system(truncate_chars(&message, MESSAGE_CHARS)));
            }
        }

        StreamEvent::Unknown => {
            trace!("Ignoring stream event without activity");
        }
    }

    out
}
