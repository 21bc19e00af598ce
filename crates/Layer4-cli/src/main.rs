//! Agent Dashboard CLI - Main entry point

mod context;
mod serve;
mod task;
mod tool;

use clap::{Parser, Subcommand};
use context::Context;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Agent dashboard - supervise coding-agent runs and their dev services
#[derive(Parser, Debug)]
#[command(name = "dashboard")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// Task database (defaults to $DASHBOARD_DB_PATH, then .dashboard/tasks.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor: JSON-line control on stdin, push stream on stdout
    Serve,
    /// Task tools called from inside an agent process
    #[command(subcommand)]
    Tool(tool::ToolCommand),
    /// Manage tasks and answer questions
    #[command(subcommand)]
    Task(task::TaskCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries JSON, so logs go to stderr
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let ctx = Context::load(args.project, args.db)?;

    match args.command {
        Command::Serve => serve::run(ctx).await,
        Command::Tool(command) => tool::run(&ctx, command).await,
        Command::Task(command) => task::run(&ctx, command),
    }
}
