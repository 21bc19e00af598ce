//! `dashboard task` - user-side task management

use crate::context::Context;
use crate::tool::print_json;
use clap::Subcommand;
use dashboard_foundation::strings::truncate_chars;
use dashboard_foundation::{NewTask, TaskSource};
use dashboard_task::QuestionBroker;

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    /// Create a task (run it with the `spawn` op of `dashboard serve`)
    Create {
        title: String,
        #[arg(long)]
        description: Option<String>,
        /// Answer the agent's questions automatically
        #[arg(long)]
        auto_accept: bool,
        #[arg(long)]
        parent: Option<String>,
    },
    /// List root tasks
    List,
    /// Show a task with children, pending questions and artifacts
    Show { task_id: String },
    /// Delete a task and everything under it
    Delete { task_id: String },
    /// Answer a pending question
    Answer { question_id: String, answer: String },
    /// List pending questions
    Questions,
}

pub fn run(ctx: &Context, command: TaskCommand) -> anyhow::Result<()> {
    let store = ctx.open_store()?;

    match command {
        TaskCommand::Create {
            title,
            description,
            auto_accept,
            parent,
        } => {
            let mut new = NewTask::new(title)
                .with_auto_accept(auto_accept)
                .with_source(TaskSource::Dashboard);
            if let Some(description) = description {
                new = new.with_description(description);
            }
            if let Some(parent) = parent {
                new = new.with_parent(parent);
            }
            print_json(&store.create_task(&new)?)
        }
        TaskCommand::List => {
            let tasks = store.root_tasks()?;
            if tasks.is_empty() {
                println!("No tasks found.");
                return Ok(());
            }

            println!("{:<10} {:<12} {:<40} {:<9} {:<8}", "ID", "Status", "Title", "Subtasks", "Asks");
            println!("{}", "-".repeat(82));
            for view in tasks {
                println!(
                    "{:<10} {:<12} {:<40} {:<9} {:<8}",
                    view.task.id,
                    view.task.status.as_str(),
                    truncate_chars(&view.task.title, 38),
                    view.children.len(),
                    view.pending_questions
                );
            }

            let stats = store.stats()?;
            println!(
                "\n{} total: {} in progress, {} blocked, {} completed, {} failed",
                stats.total, stats.in_progress, stats.blocked, stats.completed, stats.failed
            );
            Ok(())
        }
        TaskCommand::Show { task_id } => {
            let view = store
                .get_task(&task_id)?
                .ok_or_else(|| anyhow::anyhow!("Task '{}' not found", task_id))?;
            let questions = store.questions(&task_id, false, false)?;
            let artifacts = store.artifacts(&task_id, false)?;
            print_json(&serde_json::json!({
                "task": view,
                "questions": questions,
                "artifacts": artifacts,
            }))
        }
        TaskCommand::Delete { task_id } => {
            if !store.delete_task(&task_id)? {
                anyhow::bail!("Task '{}' not found", task_id);
            }
            println!("Deleted task {}", task_id);
            Ok(())
        }
        TaskCommand::Answer {
            question_id,
            answer,
        } => {
            let broker = QuestionBroker::new(store, ctx.settings.questions.clone());
            print_json(&broker.answer(&question_id, &answer)?)
        }
        TaskCommand::Questions => print_json(&store.pending_questions()?),
    }
}
