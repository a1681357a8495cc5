use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use warden::audit::AuditQuery;

mod cmd;

#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about = "Workflow enforcement orchestrator for AI coding agents")]
pub struct Cli {
    /// Working directory for state, logs and tool execution
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator HTTP server
    Serve {
        #[arg(short, long, default_value = "8000")]
        port: u16,
        /// Workflow document; the bundled default is used when omitted
        #[arg(long)]
        workflow: Option<PathBuf>,
        /// Bind on all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
    /// Validate a workflow document without starting anything
    Validate { workflow: PathBuf },
    /// Show the current session's workflow state
    Status,
    /// Approve a manual-gate item in the current session
    ApproveItem {
        item_id: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Approve the current (or a named) phase's human gate
    ApprovePhase {
        #[arg(long)]
        phase: Option<String>,
    },
    /// Query the tool audit log
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// List audit entries, newest filters win
    Query {
        #[arg(long)]
        task_id: Option<String>,
        #[arg(long)]
        phase: Option<String>,
        #[arg(long)]
        tool: Option<String>,
        #[arg(long)]
        success: Option<bool>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Aggregate statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warden=info")),
        )
        .init();

    let cli = Cli::parse();
    let dir = match &cli.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Serve {
            port,
            workflow,
            dev,
        } => cmd::cmd_serve(&dir, workflow, port, dev).await,
        Commands::Validate { workflow } => cmd::cmd_validate(&workflow),
        Commands::Status => cmd::cmd_status(&dir),
        Commands::ApproveItem { item_id, notes } => cmd::cmd_approve_item(&dir, &item_id, notes),
        Commands::ApprovePhase { phase } => cmd::cmd_approve_phase(&dir, phase),
        Commands::Audit { command } => match command {
            AuditCommands::Query {
                task_id,
                phase,
                tool,
                success,
                limit,
            } => cmd::cmd_audit_query(
                &dir,
                AuditQuery {
                    task_id,
                    phase,
                    tool_name: tool,
                    success,
                    limit,
                },
            ),
            AuditCommands::Stats => cmd::cmd_audit_stats(&dir),
        },
    }
}
