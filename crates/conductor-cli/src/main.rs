//! `conductor` command-line entry point: serve the gateway or manage
//! workflows, executions, providers and agents against the local store.

mod config;

use clap::{Parser, Subcommand};
use conductor_core::{
    Agent, ExecutionState, FileStore, ProviderRecord, Repository, Workflow, WorkflowStatus,
};
use conductor_gateway::GatewayServer;
use conductor_orchestrator::{HttpAgentHandler, Orchestrator, Scheduler};
use config::ConductorConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: workflow and agent orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and the observer gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage workflow definitions
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Inspect executions
    Execution {
        #[command(subcommand)]
        action: ExecutionAction,
    },
    /// Manage capability providers
    Provider {
        #[command(subcommand)]
        action: ProviderAction,
    },
    /// Inspect and deploy configured agents
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Register or replace a workflow from a JSON or TOML file
    Register { file: PathBuf },
    /// Run a workflow now and wait for it to finish
    Run { id: String },
    /// List registered workflows
    List,
    /// Delete a workflow
    Delete { id: String },
    /// Activate a workflow's schedule
    Enable { id: String },
    /// Deactivate a workflow's schedule
    Disable { id: String },
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// List executions, newest first
    List {
        /// Only executions of this workflow
        #[arg(long)]
        workflow: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one execution with its log
    Show { id: Uuid },
}

#[derive(Subcommand)]
enum ProviderAction {
    /// Register an HTTP capability provider
    Register {
        #[arg(long)]
        id: String,
        #[arg(long)]
        endpoint: String,
        /// Comma-separated capability names
        #[arg(long, value_delimiter = ',', required = true)]
        capabilities: Vec<String>,
    },
    /// Remove a capability provider
    Deregister { id: String },
    /// List providers with a fresh health probe
    List,
}

#[derive(Subcommand)]
enum AgentAction {
    /// List configured agents and their statistics
    List,
    /// Run an agent's deployment hook
    Deploy { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = ConductorConfig::load(&cli.config).await?;
    let orch = build_orchestrator(&config).await?;

    match cli.command {
        Commands::Serve { host, port } => serve(orch.clone(), &config, host, port).await?,
        Commands::Workflow { action } => workflow_command(&orch, action).await?,
        Commands::Execution { action } => execution_command(&orch, action).await?,
        Commands::Provider { action } => provider_command(&orch, &config, action).await?,
        Commands::Agent { action } => agent_command(&orch, action).await?,
    }

    orch.shutdown();
    Ok(())
}

/// Wire the orchestrator over the file store, with configured agents and
/// persisted providers registered.
async fn build_orchestrator(config: &ConductorConfig) -> anyhow::Result<Arc<Orchestrator>> {
    let store = FileStore::new(config.data_dir.clone()).await?;
    let orch = Arc::new(Orchestrator::new(
        Repository::new(Arc::new(store)),
        config.orchestrator(),
    ));

    let timeout = config.agents.dispatch_timeout_secs.map(Duration::from_secs);
    for def in &config.agents.definitions {
        let handler = HttpAgentHandler::new(def.endpoint.clone(), timeout)?;
        orch.register_agent(
            Agent::new(def.id.clone(), def.name.clone())
                .with_capabilities(def.capabilities.iter().cloned()),
            Arc::new(handler),
        )
        .await?;
    }

    orch.restore_providers(config.request_timeout()).await?;
    Ok(orch)
}

async fn serve(
    orch: Arc<Orchestrator>,
    config: &ConductorConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    let interrupted = orch.recover_interrupted().await?;
    if interrupted > 0 {
        info!(interrupted, "Interrupted executions marked failed");
    }
    let active = orch.sync_schedules().await?;
    info!(active, "Workflow triggers installed");

    if config.scheduler.resync_interval_secs > 0 {
        orch.clone()
            .start_schedule_sync(Duration::from_secs(config.scheduler.resync_interval_secs));
    }
    if config.capabilities.health_check_interval_secs > 0 {
        orch.capabilities().clone().start_health_loop(Duration::from_secs(
            config.capabilities.health_check_interval_secs,
        ));
    }

    let app = GatewayServer::build(orch.clone(), &config.gateway());
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Conductor gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;
    Ok(())
}

async fn workflow_command(orch: &Orchestrator, action: WorkflowAction) -> anyhow::Result<()> {
    match action {
        WorkflowAction::Register { file } => {
            let workflow = read_workflow(&file).await?;
            let workflow = orch.register_workflow(workflow).await?;
            println!(
                "Registered workflow '{}' (version {}, {} steps)",
                workflow.id,
                workflow.version,
                workflow.step_count()
            );
        }
        WorkflowAction::Run { id } => {
            let execution = orch.execute(&id).await?;
            println!("Execution {} {}", execution.id, execution.state);
            for line in &execution.log {
                println!("  {} {}", line.timestamp.format("%H:%M:%S%.3f"), line.message);
            }
            if execution.state == ExecutionState::Failed {
                anyhow::bail!("workflow '{id}' failed");
            }
        }
        WorkflowAction::List => {
            let workflows = orch.list_workflows().await?;
            if workflows.is_empty() {
                println!("No workflows registered.");
                println!("Register one with `conductor workflow register <file>`");
            }
            for wf in &workflows {
                let next = wf
                    .trigger
                    .as_deref()
                    .filter(|_| wf.is_schedulable())
                    .and_then(|t| Scheduler::next_fire_time(t, chrono::Utc::now()).ok())
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {} - {} (v{}, {:?}, trigger: {}, next: {})",
                    wf.id,
                    wf.name,
                    wf.version,
                    wf.status,
                    wf.trigger.as_deref().unwrap_or("none"),
                    next
                );
            }
        }
        WorkflowAction::Delete { id } => {
            orch.delete_workflow(&id).await?;
            println!("Deleted workflow '{id}'");
        }
        WorkflowAction::Enable { id } => {
            orch.set_status(&id, WorkflowStatus::Active).await?;
            println!("Workflow '{id}' is active");
        }
        WorkflowAction::Disable { id } => {
            orch.set_status(&id, WorkflowStatus::Inactive).await?;
            println!("Workflow '{id}' is inactive");
        }
    }
    Ok(())
}

async fn execution_command(orch: &Orchestrator, action: ExecutionAction) -> anyhow::Result<()> {
    match action {
        ExecutionAction::List { workflow, limit } => {
            let executions = orch.list_executions(workflow.as_deref()).await?;
            if executions.is_empty() {
                println!("No executions recorded.");
            }
            for e in executions.iter().take(limit) {
                let duration = e
                    .duration_ms()
                    .map(|ms| format!("{ms}ms"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {} {} {} started {} ({})",
                    e.id,
                    e.workflow_id,
                    e.state,
                    e.started_at.to_rfc3339(),
                    duration
                );
            }
        }
        ExecutionAction::Show { id } => {
            let execution = orch
                .get_execution(id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("execution {id} not found"))?;
            println!(
                "Execution {} of '{}' v{} ({:?}): {}",
                execution.id,
                execution.workflow_id,
                execution.workflow_version,
                execution.trigger,
                execution.state
            );
            for line in &execution.log {
                println!("  {} {}", line.timestamp.to_rfc3339(), line.message);
            }
        }
    }
    Ok(())
}

async fn provider_command(
    orch: &Orchestrator,
    config: &ConductorConfig,
    action: ProviderAction,
) -> anyhow::Result<()> {
    match action {
        ProviderAction::Register {
            id,
            endpoint,
            capabilities,
        } => {
            orch.register_provider(
                ProviderRecord::new(id.clone(), endpoint, capabilities),
                config.request_timeout(),
            )
            .await?;
            let status = orch.capabilities().probe(&id).await?;
            println!("Registered provider '{id}' (health: {status})");
        }
        ProviderAction::Deregister { id } => {
            if !orch.deregister_provider(&id).await? {
                anyhow::bail!("provider '{id}' is not registered");
            }
            println!("Deregistered provider '{id}'");
        }
        ProviderAction::List => {
            orch.capabilities().health_check().await;
            let providers = orch.capabilities().status().await;
            if providers.is_empty() {
                println!("No capability providers registered.");
            }
            for p in &providers {
                let latency = p
                    .last_response_ms
                    .map(|ms| format!("{ms:.1}ms"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {} [{}] {} ({})",
                    p.id,
                    p.capabilities.join(", "),
                    p.status,
                    latency
                );
            }
        }
    }
    Ok(())
}

async fn agent_command(orch: &Orchestrator, action: AgentAction) -> anyhow::Result<()> {
    match action {
        AgentAction::List => {
            let agents = orch.agents().list();
            if agents.is_empty() {
                println!("No agents configured.");
                println!("Declare agents in conductor.toml under [[agents.definitions]]");
            }
            for a in &agents {
                let caps: Vec<&str> = a.capabilities.iter().map(String::as_str).collect();
                println!(
                    "  {} - {} [{}] {} runs, {} errors, avg {:.1}ms",
                    a.id,
                    a.name,
                    caps.join(", "),
                    a.execution_count,
                    a.error_count,
                    a.avg_latency_ms
                );
            }
        }
        AgentAction::Deploy { id } => {
            orch.agents().deploy(&id).await?;
            println!("Agent '{id}' deployed");
        }
    }
    Ok(())
}

/// Parse a workflow definition, TOML when the extension says so, JSON otherwise.
async fn read_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read workflow file '{}': {}", path.display(), e)
    })?;
    let workflow = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&text)?,
        _ => serde_json::from_str(&text)?,
    };
    Ok(workflow)
}
