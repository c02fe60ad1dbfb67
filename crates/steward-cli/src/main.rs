//! Steward: autonomous ops agent with traffic-light governance.
//!
//! Three command families over the core:
//! - `execute` runs a task through the orchestrator
//! - `approve` is the operator side of the approval ledger
//! - `stop` controls the emergency-stop sentinel

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use steward_core::ai::backends::provider_from_config;
use steward_core::governance::approvals::{ApprovalStatus, ApprovalStore};
use steward_core::stop::EmergencyStop;
use steward_core::{Config, Environment, ExecuteRequest, Orchestrator, StatePaths, TaskStatus};

/// Steward - autonomous ops agent
#[derive(Parser)]
#[command(name = "steward")]
#[command(about = "Execute tasks with risk-graded governance and operator approvals", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a task through the orchestrator
    Execute {
        /// The task, in natural language
        task: Vec<String>,
        /// Environment tag (dev, staging, production, local)
        #[arg(long)]
        env: Option<String>,
        /// Reject every approval-requiring call instead of parking the task
        #[arg(long)]
        dry_run: bool,
        /// Reuse a task id when re-invoking a parked task
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Inspect and decide pending approvals
    Approve {
        #[command(subcommand)]
        command: ApproveCommands,
    },
    /// Control the emergency stop
    Stop {
        #[command(subcommand)]
        command: StopCommands,
    },
}

#[derive(Subcommand)]
enum ApproveCommands {
    /// List approvals
    List {
        /// Filter by status (pending, approved, rejected)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one approval in full
    Show { id: String },
    /// Approve a pending request
    Approve {
        id: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Reject a pending request
    Reject { id: String, reason: Vec<String> },
}

#[derive(Subcommand)]
enum StopCommands {
    /// Activate the emergency stop for every cooperating process
    Activate { reason: Vec<String> },
    /// Show whether the stop is active
    Status,
    /// Clear the stop and remove the sentinel
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = StatePaths::in_working_dir();

    match cli.command {
        Commands::Execute {
            task,
            env,
            dry_run,
            task_id,
        } => {
            let code = run_execute(paths, task.join(" "), env, dry_run, task_id).await?;
            std::process::exit(code);
        }
        Commands::Approve { command } => run_approve(paths, command)?,
        Commands::Stop { command } => run_stop(paths, command)?,
    }

    Ok(())
}

async fn run_execute(
    paths: StatePaths,
    task_text: String,
    env: Option<String>,
    dry_run: bool,
    task_id: Option<String>,
) -> Result<i32> {
    let environment = match env {
        Some(raw) => Some(Environment::from_str(&raw).map_err(|e| anyhow::anyhow!(e))?),
        None => None,
    };

    let config = Config::from_env();
    let provider = provider_from_config(&config)?;
    let orchestrator = Orchestrator::bootstrap(config, paths, provider).await?;

    // Interrupt and terminate both trip the emergency stop.
    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.trigger("signal: interrupt");
        }
    });

    let report = orchestrator
        .execute(ExecuteRequest {
            task_text,
            environment,
            task_id,
            dry_run,
        })
        .await;

    match report.status {
        TaskStatus::Succeeded => {
            println!("succeeded: {}", report.summary.as_deref().unwrap_or(""));
        }
        TaskStatus::Failed => {
            println!(
                "failed: {}",
                report.reason.as_deref().unwrap_or("unknown reason")
            );
        }
        TaskStatus::BudgetExhausted => {
            println!(
                "budget exhausted: {}",
                report.reason.as_deref().unwrap_or("")
            );
        }
        TaskStatus::Stopped => {
            println!("stopped: {}", report.reason.as_deref().unwrap_or(""));
        }
        TaskStatus::AwaitingApproval => {
            println!(
                "awaiting approval: {} (decide with `steward approve`, then re-run the task)",
                report.approval_id.as_deref().unwrap_or("?")
            );
        }
        TaskStatus::NeedsInput => {
            println!(
                "needs input: {}",
                report.clarification.as_deref().unwrap_or("")
            );
        }
    }

    Ok(report.status.exit_code())
}

fn run_approve(paths: StatePaths, command: ApproveCommands) -> Result<()> {
    let store = ApprovalStore::new(paths.approvals())?;

    match command {
        ApproveCommands::List { status } => {
            let filter = match status {
                Some(raw) => Some(ApprovalStatus::from_str(&raw).map_err(|e| anyhow::anyhow!(e))?),
                None => None,
            };
            let approvals = store.list(filter);
            if approvals.is_empty() {
                println!("no approvals");
                return Ok(());
            }
            for approval in approvals {
                println!(
                    "{}  {:<9} {:<6} {}  {}",
                    approval.id, approval.status, approval.risk, approval.tool_name, approval.summary
                );
            }
        }
        ApproveCommands::Show { id } => match store.get(&id) {
            Some(approval) => println!("{}", serde_json::to_string_pretty(&approval)?),
            None => anyhow::bail!("approval '{id}' not found"),
        },
        ApproveCommands::Approve { id, note } => {
            let approval = store.approve(&id, note.as_deref())?;
            println!(
                "approved {} ({}). Re-run the original task to execute it.",
                approval.id, approval.tool_name
            );
        }
        ApproveCommands::Reject { id, reason } => {
            let reason = reason.join(" ");
            let approval = store.reject(&id, &reason)?;
            println!("rejected {} ({})", approval.id, approval.tool_name);
        }
    }

    Ok(())
}

fn run_stop(paths: StatePaths, command: StopCommands) -> Result<()> {
    let stop = EmergencyStop::new(paths.emergency_stop());

    match command {
        StopCommands::Activate { reason } => {
            let reason = if reason.is_empty() {
                "activated by operator".to_string()
            } else {
                reason.join(" ")
            };
            stop.trigger(&reason);
            println!("emergency stop active: {reason}");
        }
        StopCommands::Status => {
            if stop.is_set() {
                println!(
                    "active: {}",
                    stop.reason().unwrap_or_else(|| "no reason recorded".to_string())
                );
            } else {
                println!("inactive");
            }
        }
        StopCommands::Reset => {
            stop.reset();
            println!("emergency stop cleared");
        }
    }

    Ok(())
}
