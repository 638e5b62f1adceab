use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rmcp::{ServiceExt, transport::stdio};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use build_forge::{
    ApprovalStatus, BuildForgeServer, BuildLoop, BuildSummary, CapabilityTarget, CliConfig,
    CommandDecomposer, CommandWorker, GoalTemplate, Guardrails, KeywordComplexity, LoopStatus,
    OrchestrationContext, Orchestrator, RunMode, StateStore, mcp::load_status,
    resolve_goal_template,
};

/// Build-Forge CLI: drive a project to completion with approval-gated writes
#[derive(Parser, Debug)]
#[command(name = "build-forge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the build loop until every capability is implemented
    Run {
        /// Maximum iterations before giving up (overrides config)
        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// Run a single task through the orchestrator
    Task {
        /// Task description
        #[arg(short, long)]
        task: String,

        /// Session context passed to workers, as a JSON object
        #[arg(long)]
        context: Option<String>,
    },

    /// Inspect and decide pending approvals
    Approvals {
        #[command(subcommand)]
        action: ApprovalsCommand,
    },

    /// Show the derived build status
    Status,

    /// Serve the approval and status tools over MCP (stdio)
    Mcp,
}

#[derive(Subcommand, Debug)]
enum ApprovalsCommand {
    /// List approval requests
    List {
        /// pending (default), approved, denied or all
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one request with its proposed content
    Show { id: String },
    /// Apply the proposed content
    Approve { id: String },
    /// Discard the proposed content
    Deny { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = CliConfig::load_with_env(cli.config.as_ref())?;

    match cli.command {
        Some(Command::Run { max_iterations }) => handle_run_command(config, max_iterations).await,
        Some(Command::Task { task, context }) => handle_task_command(config, task, context).await,
        Some(Command::Approvals { action }) => handle_approvals_command(config, action).await,
        Some(Command::Status) => handle_status_command(config).await,
        Some(Command::Mcp) => handle_mcp_command(config).await,
        None => {
            // Default behavior: show help
            eprintln!("No command specified. Use --help for usage information.");
            eprintln!("Example: build-forge run --max-iterations 5");
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr so stdout stays free for results and the MCP transport.
fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Open the store (recovering interrupted steps) and wire the orchestrator.
async fn build_orchestrator(config: &CliConfig) -> Result<Arc<Orchestrator>> {
    let (store, interrupted) = StateStore::open(config.state_path(), config.state.step_retention)
        .await
        .context("Failed to open state store")?;
    if interrupted > 0 {
        warn!("Marked {} step(s) from a previous run as interrupted", interrupted);
    }

    let mut worker_spec = config.worker.command.clone().ok_or_else(|| {
        anyhow::anyhow!("No worker command configured (set worker.command or BUILD_FORGE_WORKER_COMMAND)")
    })?;
    worker_spec
        .working_dir
        .get_or_insert_with(|| config.project_root.clone());

    // The worker command also answers decomposition requests unless a
    // dedicated decomposer is configured.
    let mut decomposer_spec = config
        .decomposer
        .command
        .clone()
        .unwrap_or_else(|| worker_spec.clone());
    decomposer_spec
        .working_dir
        .get_or_insert_with(|| config.project_root.clone());

    let orchestrator = Orchestrator::new(
        Arc::new(CommandWorker::new(&config.worker.name, worker_spec)),
        Arc::new(CommandDecomposer::new(&config.decomposer.name, decomposer_spec)),
        Arc::new(store),
        Arc::new(config.approval_gate()?),
    )
    .with_complexity(Arc::new(KeywordComplexity::from_config(
        &config.orchestrator.complexity,
    )))
    .with_guardrails(Guardrails::from_config(&config.guardrails()));

    Ok(Arc::new(orchestrator))
}

/// Cancel the token on Ctrl-C; the current step finishes, the next is skipped.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            on_signal.cancel();
        }
    });
    token
}

async fn handle_run_command(config: CliConfig, max_iterations: Option<u32>) -> Result<()> {
    info!("Build-Forge starting in {:?}", config.project_root);

    let specs = config.load_capabilities()?;
    if specs.is_empty() {
        anyhow::bail!("No capabilities configured (add `capabilities` or build_loop.capabilities_file)");
    }
    let targets = specs
        .iter()
        .map(|spec| {
            let validator = spec.build_validator(config.build_loop.min_content_bytes)?;
            Ok(CapabilityTarget::new(spec.to_capability(), validator))
        })
        .collect::<Result<Vec<_>>>()?;

    let template = resolve_goal_template(
        config.build_loop.goal_template.as_deref(),
        &config.project_root,
    );
    let goals = GoalTemplate::load(&template)?;

    let orchestrator = build_orchestrator(&config).await?;
    let build_loop = BuildLoop::new(orchestrator, &config.project_root)
        .with_goal_template(goals)
        .with_cancellation(cancel_on_interrupt());

    let max_iterations = max_iterations.unwrap_or(config.build_loop.max_iterations);
    let summary = build_loop
        .run_until_converged(&targets, max_iterations)
        .await
        .context("Build loop failed to persist state")?;

    print_summary(&summary)
}

async fn handle_task_command(config: CliConfig, task: String, context: Option<String>) -> Result<()> {
    let session: Map<String, Value> = match context {
        Some(raw) => serde_json::from_str(&raw).context("--context must be a JSON object")?,
        None => Map::new(),
    };

    let orchestrator = build_orchestrator(&config).await?;
    let ctx = OrchestrationContext::new(RunMode::Task)
        .with_session(session)
        .with_cancellation(cancel_on_interrupt());

    let result = orchestrator.run_task(&task, &ctx).await;
    orchestrator.store().persist().await?;
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(report) = e.partial_report() {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            return Err(e.into());
        }
    };

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    for id in outcome.pending_approvals() {
        println!("Awaiting approval: {} (build-forge approvals show {})", id, id);
    }
    Ok(())
}

async fn handle_approvals_command(config: CliConfig, action: ApprovalsCommand) -> Result<()> {
    let gate = config.approval_gate()?;

    match action {
        ApprovalsCommand::List { status } => {
            let filter = match status.as_deref() {
                None => Some(ApprovalStatus::Pending),
                Some("all") => None,
                Some(s) => Some(s.parse::<ApprovalStatus>().map_err(anyhow::Error::msg)?),
            };
            let approvals = gate.list_approvals(filter).await?;
            if approvals.is_empty() {
                println!("No approvals.");
            }
            for approval in approvals {
                println!(
                    "{}  {:<8}  {}  {}",
                    approval.id, approval.status, approval.file_path, approval.reason
                );
            }
        }
        ApprovalsCommand::Show { id } => {
            let approval = gate.get_approval(&id).await?;
            println!("{}", serde_json::to_string_pretty(&approval)?);
        }
        ApprovalsCommand::Approve { id } => {
            let approval = gate.approve(&id).await?;
            println!("Approved {}: wrote {}", approval.id, approval.file_path);
        }
        ApprovalsCommand::Deny { id } => {
            let approval = gate.deny(&id).await?;
            println!("Denied {}: {} left unchanged", approval.id, approval.file_path);
        }
    }
    Ok(())
}

async fn handle_status_command(config: CliConfig) -> Result<()> {
    let gate = config.approval_gate()?;
    let info = load_status(&config.state_path(), &gate).await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn handle_mcp_command(config: CliConfig) -> Result<()> {
    let server = BuildForgeServer::with_config(config)?;
    info!("Starting MCP server on stdio");

    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    info!("MCP server shutting down");
    Ok(())
}

fn print_summary(summary: &BuildSummary) -> Result<()> {
    println!("\n========================================");
    println!("Build {}", summary.status);
    println!("========================================");
    println!("Iterations: {}", summary.iterations);
    if !summary.resolved.is_empty() {
        println!("Resolved: {}", summary.resolved.join(", "));
    }
    if !summary.remaining.is_empty() {
        println!("Remaining: {}", summary.remaining.join(", "));
    }
    if !summary.pending_approvals.is_empty() {
        println!("\nAwaiting approval:");
        for id in &summary.pending_approvals {
            println!("  build-forge approvals show {}", id);
        }
    }

    if summary.status != LoopStatus::Converged {
        std::process::exit(1);
    }
    Ok(())
}
