//! Job Queue & Worker Dispatch glue (C10): creates runs with a sealed
//! execution contract, resolves resume/fork requests against that
//! contract, and runs the poll-claim-execute worker loop that hands
//! claimed jobs to [`crate::engine::RunEngine`].
//!
//! The queue mechanics (enqueue/claim/lease) live in
//! [`coordination::JobQueue`]; this module only wires run creation and
//! the worker process around it, mirroring the teacher's agent-loop
//! binary rather than introducing a second scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use thiserror::Error;

use coordination::{
    build_contract, evaluate_support, resolve, verify_stored_hash, AgentRun, CommitPointers,
    ContractError, ExecutionContract, JobQueue, JobType, Planner, QueueError, ResolveOptions,
    ResolveOutcome, RunJob, RunStatus, RunStore, StoreError, TargetRole, WorkerRole,
};
use coordination::state::types::new_id;

use crate::engine::{seal_execution_contract, EngineError, RunEngine, ToolExecutor};

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("run {0} has no execution contract in its metadata")]
    MissingContract(String),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("requested contract differs from the persisted one; pass overrideExecutionConfig or fork")]
    ContractMismatch { diff: Vec<String> },

    #[error("unsupported execution contract: {0}")]
    UnsupportedContract(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Parameters for creating a brand-new run. The caller supplies the goal
/// and routing identifiers; the execution contract is sealed here so
/// every run, from its very first persisted row, carries the content
/// hash invariant the engine checks on every subsequent update.
pub struct RunCreationRequest {
    pub org_id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub created_by_user_id: String,
    pub goal: String,
    pub provider_id: String,
    pub model: String,
    pub profile: String,
    pub randomness_seed: u64,
}

/// Build a fresh, queued [`AgentRun`], seal its execution contract,
/// persist it, and enqueue its kernel job. Returns the persisted run.
pub async fn create_run(
    store: &RunStore,
    queue: &JobQueue,
    req: RunCreationRequest,
) -> DispatchResult<AgentRun> {
    let now = chrono::Utc::now();
    let mut run = AgentRun {
        id: new_id(),
        project_id: req.project_id,
        org_id: req.org_id,
        workspace_id: req.workspace_id,
        created_by_user_id: req.created_by_user_id,
        goal: req.goal,
        provider_id: req.provider_id,
        model: req.model,
        status: RunStatus::Queued,
        plan: Vec::new(),
        current_step_index: 0,
        last_step_id: None,
        pointers: CommitPointers::default(),
        validation_status: None,
        validation_result: None,
        validated_at: None,
        correction_attempts: 0,
        last_correction_reason: None,
        run_lock_owner: None,
        run_lock_acquired_at: None,
        metadata: serde_json::json!({}),
        error_message: None,
        error_details: None,
        created_at: now,
        updated_at: now,
        finished_at: None,
    };

    seal_execution_contract(&mut run, &req.profile, req.randomness_seed)?;
    store.put_run(&run).await?;
    queue.enqueue(&run.id, JobType::Kernel, TargetRole::Compute, None).await?;
    Ok(run)
}

/// What resolving a resume request against the run's persisted contract
/// produced: the same run re-enqueued, or a new run forked off it.
pub enum ResumeOutcome {
    Resumed(AgentRun),
    Forked(AgentRun),
}

pub struct ResumeRequest {
    pub run_id: String,
    pub requested_profile: String,
    pub randomness_seed: u64,
    pub override_execution_config: bool,
    pub fork: bool,
}

/// Resolve a resume request for `req.run_id` against its persisted
/// execution contract per §4.7's invariant: a differing requested
/// contract is rejected unless `overrideExecutionConfig` or `fork` is
/// set. Fork pins a new run's worktree to the source run's
/// `current||lastValid||base` commit and leaves the source run
/// untouched.
pub async fn resume_run(
    store: &RunStore,
    queue: &JobQueue,
    req: ResumeRequest,
) -> DispatchResult<ResumeOutcome> {
    let source = store
    .get_run(&req.run_id)
    .await?
    .ok_or_else(|| DispatchError::RunNotFound(req.run_id.clone()))?;

    let persisted = persisted_contract(&source)?;
    let requested = build_contract(&req.requested_profile, req.randomness_seed)?;

    let support = evaluate_support(&requested.material);
    if !support.supported {
        return Err(DispatchError::UnsupportedContract(support.message.unwrap_or_default()));
    }

    let options = ResolveOptions { override_execution_config: req.override_execution_config, fork: req.fork };
    let outcome = match resolve(persisted, requested, &options) {
        Ok(outcome) => outcome,
        Err(ContractError::ContractDrift) => {
            let diff = diff_against_requested(&source, &req)?;
            return Err(DispatchError::ContractMismatch { diff });
        }
        Err(e) => return Err(e.into()),
    };

    if req.fork {
        fork_run(store, queue, &source, outcome).await.map(ResumeOutcome::Forked)
    } else {
        resolve_in_place(store, queue, source, outcome).await.map(ResumeOutcome::Resumed)
    }
}

fn persisted_contract(run: &AgentRun) -> DispatchResult<ExecutionContract> {
    let contract: ExecutionContract = run
    .metadata
    .get("executionContract")
    .cloned()
    .map(serde_json::from_value)
    .transpose()
    .map_err(ContractError::from)?
    .ok_or_else(|| DispatchError::MissingContract(run.id.clone()))?;
    verify_stored_hash(&contract)?;
    Ok(contract)
}

/// Recompute the diff a rejected `resolve` call would have returned, for
/// the error payload: `resolve` only hands back a diff on success, so a
/// drift rejection needs its own call to surface which fields differ.
fn diff_against_requested(source: &AgentRun, req: &ResumeRequest) -> DispatchResult<Vec<String>> {
    let persisted = persisted_contract(source)?;
    let requested = build_contract(&req.requested_profile, req.randomness_seed)?;
    let forced = ResolveOptions { override_execution_config: true, fork: false };
    Ok(resolve(persisted, requested, &forced)?.diff)
}

async fn resolve_in_place(
    store: &RunStore,
    queue: &JobQueue,
    mut run: AgentRun,
    outcome: ResolveOutcome,
) -> DispatchResult<AgentRun> {
    let contract = if outcome.diff.is_empty() {
        outcome.persisted_contract
    } else {
        outcome.requested_contract
    };
    ensure_metadata_object(&mut run)
    .insert("executionContract".to_string(), serde_json::to_value(&contract)?);
    run.updated_at = chrono::Utc::now();
    store.update_run(&run).await?;
    queue.enqueue(&run.id, JobType::Kernel, TargetRole::Compute, None).await?;
    Ok(run)
}

async fn fork_run(
    store: &RunStore,
    queue: &JobQueue,
    source: &AgentRun,
    outcome: ResolveOutcome,
) -> DispatchResult<AgentRun> {
    let pinned_commit = source
    .pointers
    .current_commit_hash
    .clone()
    .or_else(|| source.pointers.last_valid_commit_hash.clone())
    .or_else(|| source.pointers.base_commit_hash.clone());

    let now = chrono::Utc::now();
    let mut forked = AgentRun {
        id: new_id(),
        project_id: source.project_id.clone(),
        org_id: source.org_id.clone(),
        workspace_id: source.workspace_id.clone(),
        created_by_user_id: source.created_by_user_id.clone(),
        goal: source.goal.clone(),
        provider_id: source.provider_id.clone(),
        model: source.model.clone(),
        status: RunStatus::Queued,
        plan: Vec::new(),
        current_step_index: 0,
        last_step_id: None,
        pointers: CommitPointers { base_commit_hash: pinned_commit, ..CommitPointers::default() },
        validation_status: None,
        validation_result: None,
        validated_at: None,
        correction_attempts: 0,
        last_correction_reason: None,
        run_lock_owner: None,
        run_lock_acquired_at: None,
        metadata: serde_json::json!({}),
        error_message: None,
        error_details: None,
        created_at: now,
        updated_at: now,
        finished_at: None,
    };

    ensure_metadata_object(&mut forked)
    .insert("executionContract".to_string(), serde_json::to_value(&outcome.requested_contract)?);

    store.put_run(&forked).await?;
    queue.enqueue(&forked.id, JobType::Kernel, TargetRole::Compute, None).await?;
    Ok(forked)
}

fn ensure_metadata_object(run: &mut AgentRun) -> &mut serde_json::Map<String, serde_json::Value> {
    if !run.metadata.is_object() {
        run.metadata = serde_json::json!({});
    }
    run.metadata.as_object_mut().expect("just ensured object")
}

/// Map a worker's role to the job queue's target role. The two enums
/// carry the same cases but belong to different tables (`worker_nodes`
/// vs `run_jobs`) and are kept distinct on purpose.
fn target_role_for(role: WorkerRole) -> TargetRole {
    match role {
        WorkerRole::Compute => TargetRole::Compute,
        WorkerRole::Eval => TargetRole::Eval,
    }
}

/// Static configuration for one worker process's poll loop.
pub struct WorkerConfig {
    pub node_id: String,
    pub role: WorkerRole,
    pub capabilities: serde_json::Value,
    pub lease_seconds: i64,
    pub poll_interval: StdDuration,
    pub workspace_root: PathBuf,
}

/// Run the claim-execute-complete loop forever. A worker heartbeats on
/// every iteration (claim or not), claims the oldest eligible job for its
/// role, drives the run to terminal, and completes or fails the job
/// based on whether the run landed in [`RunStatus::Complete`]. Mirrors
/// the teacher's pick-work -> claim -> execute -> verify iterate loop,
/// with the job queue substituting for direct work-item polling.
pub async fn run_worker_loop(
    store: Arc<RunStore>,
    queue: Arc<JobQueue>,
    planner: Arc<dyn Planner>,
    tools: Arc<dyn ToolExecutor>,
    config: WorkerConfig,
) -> DispatchResult<()> {
    let target_role = target_role_for(config.role);

    loop {
        store.heartbeat_worker(&config.node_id, config.role, &config.capabilities).await?;

        let claimed = queue
        .claim(target_role, &config.node_id, &config.capabilities, config.lease_seconds)
        .await?;

        let job = match claimed {
            Some(job) => job,
            None => {
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        if let Err(e) = run_claimed_job(&store, &queue, &planner, &tools, &config, &job).await {
            tracing::error!(job_id = %job.id, run_id = %job.run_id, error = %e, "job execution failed");
        }
    }
}

async fn run_claimed_job(
    store: &Arc<RunStore>,
    queue: &Arc<JobQueue>,
    planner: &Arc<dyn Planner>,
    tools: &Arc<dyn ToolExecutor>,
    config: &WorkerConfig,
    job: &RunJob,
) -> DispatchResult<()> {
    queue.mark_running(&job.id, &config.node_id, config.lease_seconds).await?;
    tracing::info!(job_id = %job.id, run_id = %job.run_id, node_id = %config.node_id, "claimed job");

    let engine = RunEngine::new(
        store.clone(),
        planner.clone(),
        config.workspace_root.clone(),
        config.node_id.clone(),
    )
    .with_tool_executor(tools.clone());

    match engine.drive_to_terminal(&job.run_id).await {
        Ok(run) if run.status == RunStatus::Complete => {
            queue.complete(&job.id).await?;
            tracing::info!(job_id = %job.id, run_id = %job.run_id, "run complete");
        }
        Ok(run) => {
            queue.complete(&job.id).await?;
            tracing::info!(job_id = %job.id, run_id = %job.run_id, status = ?run.status, "run reached terminal status");
        }
        Err(e) => {
            queue.fail(&job.id).await?;
            tracing::error!(job_id = %job.id, run_id = %job.run_id, error = %e, "run failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_contract_round_trips_through_metadata() {
        let mut run = sample_run();
        seal_execution_contract(&mut run, "agent-workflow", 7).unwrap();
        let recovered = persisted_contract(&run).expect("sealed contract reads back");
        assert_eq!(recovered.hash, test_contract_hash(&recovered));
    }

    #[test]
    fn missing_contract_is_reported() {
        let run = sample_run();
        let err = persisted_contract(&run).unwrap_err();
        assert!(matches!(err, DispatchError::MissingContract(_)));
    }

    #[test]
    fn target_role_mapping_is_stable() {
        assert_eq!(target_role_for(WorkerRole::Compute), TargetRole::Compute);
        assert_eq!(target_role_for(WorkerRole::Eval), TargetRole::Eval);
    }

    fn test_contract_hash(contract: &ExecutionContract) -> String {
        coordination::hash_config(&contract.effective_config).unwrap()
    }

    fn sample_run() -> AgentRun {
        let now = chrono::Utc::now();
        AgentRun {
            id: new_id(),
            project_id: "proj-1".into(),
            org_id: "org-1".into(),
            workspace_id: "ws-1".into(),
            created_by_user_id: "user-1".into(),
            goal: "add a readme".into(),
            provider_id: "test-provider".into(),
            model: "test-model".into(),
            status: RunStatus::Queued,
            plan: vec![],
            current_step_index: 0,
            last_step_id: None,
            pointers: CommitPointers::default(),
            validation_status: None,
            validation_result: None,
            validated_at: None,
            correction_attempts: 0,
            last_correction_reason: None,
            run_lock_owner: None,
            run_lock_acquired_at: None,
            metadata: serde_json::json!({}),
            error_message: None,
            error_details: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}
