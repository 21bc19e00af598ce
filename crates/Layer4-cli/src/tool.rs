//! `dashboard tool` - task tools for agent processes
//!
//! Each command prints one JSON document on stdout. The task id and store
//! location come from `DASHBOARD_TASK_ID` / `DASHBOARD_DB_PATH` when the
//! agent was spawned by the dashboard.

use crate::context::Context;
use clap::Subcommand;
use dashboard_foundation::{ChildEnv, QuestionType, TaskStatus};
use dashboard_task::{ArtifactRequest, AskRequest, TaskTools};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum ToolCommand {
    /// Register (or resume) the root task for this run
    Register {
        title: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Create a subtask under a parent
    Subtask {
        parent_id: String,
        title: String,
        /// Agent assigned to the subtask
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Set task status (pending, in_progress, completed, failed, blocked)
    Status {
        task_id: String,
        status: String,
        #[arg(long)]
        result: Option<String>,
    },
    /// Set task phase
    Phase { task_id: String, phase: String },
    /// Append a message to the activity log
    Log {
        task_id: String,
        message: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Ask a question and wait for the answer
    Ask {
        task_id: String,
        question: String,
        /// text, single, multiple, confirm, plan_review
        #[arg(long = "type", default_value = "text")]
        question_type: String,
        /// Answer choice (repeatable)
        #[arg(long = "option")]
        options: Vec<String>,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Register a file as a task artifact
    Artifact {
        task_id: String,
        file: PathBuf,
        /// screenshot, markdown_report, eval_report, file
        #[arg(long = "type", default_value = "file")]
        artifact_type: String,
        #[arg(long)]
        label: Option<String>,
        /// JSON object
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Show a task with its children
    Get { task_id: String },
}

pub async fn run(ctx: &Context, command: ToolCommand) -> anyhow::Result<()> {
    let tools = TaskTools::new(
        ctx.open_store()?,
        ChildEnv::from_env(),
        ctx.paths.project_root(),
        ctx.settings.questions.clone(),
    );

    match command {
        ToolCommand::Register { title, description } => {
            print_json(&tools.register_task(&title, description.as_deref())?)
        }
        ToolCommand::Subtask {
            parent_id,
            title,
            agent,
            description,
        } => print_json(&tools.create_subtask(
            &parent_id,
            &title,
            agent.as_deref(),
            description.as_deref(),
        )?),
        ToolCommand::Status {
            task_id,
            status,
            result,
        } => {
            let status: TaskStatus = status.parse()?;
            print_json(&tools.update_status(&task_id, status, result.as_deref())?)
        }
        ToolCommand::Phase { task_id, phase } => {
            print_json(&tools.update_phase(&task_id, &phase)?)
        }
        ToolCommand::Log {
            task_id,
            message,
            agent,
        } => {
            let id = tools.log(&task_id, &message, agent.as_deref())?;
            print_json(&serde_json::json!({ "activity_id": id }))
        }
        ToolCommand::Ask {
            task_id,
            question,
            question_type,
            options,
            context,
            agent,
        } => {
            let question_type: QuestionType = question_type.parse()?;
            let request = AskRequest {
                task_id,
                question,
                question_type,
                options: (!options.is_empty()).then_some(options),
                context,
                agent,
            };
            print_json(&tools.ask(&request).await?)
        }
        ToolCommand::Artifact {
            task_id,
            file,
            artifact_type,
            label,
            metadata,
        } => {
            let metadata = metadata
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?;
            let request = ArtifactRequest {
                task_id,
                file_path: file,
                artifact_type,
                label,
                metadata,
            };
            print_json(&tools.add_artifact(&request)?)
        }
        ToolCommand::Get { task_id } => print_json(&tools.get_task(&task_id)?),
    }
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
