use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use agent_core::dispatch::{run_worker_loop, WorkerConfig};
use coordination::{NullPlanner, Planner, RunStore, WorkerRole};

/// Worker process for the agent-driven code-mutation orchestrator: claims
/// run jobs from the queue and drives each one to a terminal status.
#[derive(Parser, Debug)]
#[command(name = "agent-core", about = "Run lifecycle engine worker")]
struct Args {
    /// Postgres connection string for the shared run store.
    #[arg(long, env = "AGENT_DATABASE_URL")]
    database_url: String,

    /// Stable identifier for this worker node, recorded on every heartbeat
    /// and job claim.
    #[arg(long, env = "AGENT_NODE_ID")]
    node_id: String,

    /// Worker role this process serves: compute or eval.
    #[arg(long, env = "AGENT_WORKER_ROLE", default_value = "compute")]
    role: String,

    /// JSON object describing this worker's capabilities, matched against
    /// each job's `requiredCapabilities` subset.
    #[arg(long, env = "AGENT_CAPABILITIES", default_value = "{}")]
    capabilities: String,

    /// Root directory under which `<orgId>/<workspaceId>/<projectId>`
    /// project trees and their run worktrees live.
    #[arg(long, env = "AGENT_WORKSPACE_ROOT")]
    workspace_root: PathBuf,

    /// Job lease duration in seconds.
    #[arg(long, env = "AGENT_LEASE_SECONDS", default_value_t = 300)]
    lease_seconds: i64,

    /// How long to sleep between claim attempts when no job is available.
    #[arg(long, env = "AGENT_POLL_INTERVAL_MS", default_value_t = 2000)]
    poll_interval_ms: u64,
}

fn parse_role(role: &str) -> Result<WorkerRole> {
    match role {
        "compute" => Ok(WorkerRole::Compute),
        "eval" => Ok(WorkerRole::Eval),
        other => anyhow::bail!("unknown worker role \"{other}\" (expected compute|eval)"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let role = parse_role(&args.role)?;
    let capabilities: serde_json::Value =
        serde_json::from_str(&args.capabilities).context("AGENT_CAPABILITIES must be a JSON object")?;

    info!(
        node_id = %args.node_id,
        role = %args.role,
        workspace_root = %args.workspace_root.display(),
        lease_seconds = args.lease_seconds,
        "agent-core worker starting"
    );

    let store = Arc::new(RunStore::connect(&args.database_url).await.context("connecting run store")?);
    let queue = Arc::new(coordination::JobQueue::new(store.pg()));

    // The planner facade is a pluggable seam (see `coordination::Planner`);
    // wiring a real LLM-backed planner is left to the process that
    // constructs this binary's deployment, not to the worker loop itself.
    let planner: Arc<dyn Planner> = Arc::new(NullPlanner { plan_steps: Vec::new(), correction_steps: Vec::new() });
    let tools = Arc::new(agent_core::DefaultToolExecutor);

    let config = WorkerConfig {
        node_id: args.node_id,
        role,
        capabilities,
        lease_seconds: args.lease_seconds,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        workspace_root: args.workspace_root,
    };

    run_worker_loop(store, queue, planner, tools, config).await?;
    Ok(())
}
