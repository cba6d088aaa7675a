//! Run Lifecycle Engine — drives a single [`AgentRun`] through the
//! queued → running → (correcting|optimizing|validating)* → terminal state
//! machine, one step at a time, persisting after every transition so a
//! worker crash mid-run resumes cleanly from the last committed pointer.
//!
//! Tool execution, light/heavy validation, and architectural invariant
//! checks are pluggable seams (mirrors [`coordination::Planner`]'s stance:
//! no concrete backend lives here). Everything else — the state machine,
//! the correction-insertion bookkeeping, the commit-pointer discipline,
//! the learning-telemetry trail — is owned by this module.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use coordination::{
    build_contract, classify, classify_outcome, evaluate, evaluate_support, extract_import_signal,
    interpret, render_debt_resolution_module, run_import_resolution_recipe, verify_stored_hash,
    AgentRun, AttemptPhase, ClassifierCaps, ClassifierInput, ClusterType, CommitPointers,
    CorrectionAttempt, CorrectionConstraint, CorrectionPhase, CorrectionReasoning,
    CorrectionRequest, ErrorCategory, ErrorDetails, ExecutionConfig, HeavyValidationVerdict, Id,
    ImportResolutionOutcome, LearningEvent, LearningOutcome, LearningTelemetry, Planner,
    PolicyMode, ProposedChange, QueueError, RunStatus, RunStore, Step, StepRecord, StepStatus,
    StepType, StoreError, StubDebtRecord, StubDebtStatus, TelemetryError, ValidationStatus,
};
use coordination::state::contract::CorrectionPolicyMode;

use crate::file_session::{FileSession, FileSessionError, SessionCaps, StagedDiff};
use crate::vcs::{ensure_worktree, recover_dirty_worktree, run_branch_name, VcsAdapter, VcsError};

/// Runtime-verify correction attempts cap before non-convergence kicks in
/// regardless of the plan-level attempt limit. See invariant (e) and the
/// "6th failure with same signature" rule.
const RUNTIME_CORRECTION_RETRY_CAP: u32 = 5;

/// Post-complete validation auto-correction attempts cap (invariant e).
const MAX_VALIDATION_AUTO_CORRECTIONS: i32 = 2;

const DEFAULT_RUN_LOCK_STALE_SECONDS: i64 = 1800;

const RUNTIME_CORRECTION_PREFIX: &str = "runtime-correction-";
const RUNTIME_RETRY_PREFIX: &str = "runtime-retry-";
const VALIDATION_CORRECTION_PREFIX: &str = "validation-correction-";

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("run lock lost for {0}")]
    LockLost(Id),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("step transaction failed: {0}")]
    StepTransaction(String),

    #[error("step execution failed: {0}")]
    StepExecution(String),

    #[error("runtime verification failed: {0}")]
    RuntimeVerification(String),

    #[error("heavy validation failed: {0}")]
    HeavyValidation(String),

    #[error("heavy validation execution failed: {0}")]
    HeavyValidationExecution(String),

    #[error("correction policy violation: {0}")]
    CorrectionPolicy(String),

    #[error("runtime correction attempts exhausted")]
    RuntimeCorrectionLimit,

    #[error("heavy validation correction attempts exhausted")]
    HeavyValidationCorrectionLimit,

    #[error("runtime correction failed to converge")]
    RuntimeCorrectionConvergence,

    #[error("heavy validation correction failed to converge")]
    HeavyValidationConvergence,

    #[error("stored execution contract hash does not match recomputed hash")]
    ContractMismatch,

    #[error("unsupported execution contract: {0}")]
    UnsupportedContract(String),

    #[error("tool execution error: {0}")]
    Tool(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    FileSession(#[from] FileSessionError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Planner(#[from] coordination::PlannerError),

    #[error(transparent)]
    Contract(#[from] coordination::ContractError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::LockLost(_) => ErrorCategory::ExecutionLockLost,
            Self::InvariantViolation(_) => ErrorCategory::InvariantViolation,
            Self::StepTransaction(_) | Self::FileSession(_) => ErrorCategory::StepTransaction,
            Self::StepExecution(_) | Self::Tool(_) => ErrorCategory::StepExecution,
            Self::RuntimeVerification(_) => ErrorCategory::RuntimeVerification,
            Self::HeavyValidation(_) => ErrorCategory::HeavyValidation,
            Self::HeavyValidationExecution(_) => ErrorCategory::HeavyValidationExecution,
            Self::CorrectionPolicy(_) => ErrorCategory::CorrectionPolicy,
            Self::RuntimeCorrectionLimit => ErrorCategory::RuntimeCorrectionLimit,
            Self::HeavyValidationCorrectionLimit => ErrorCategory::HeavyValidationCorrectionLimit,
            Self::RuntimeCorrectionConvergence => ErrorCategory::RuntimeCorrectionConvergence,
            Self::HeavyValidationConvergence => ErrorCategory::HeavyValidationConvergence,
            Self::ContractMismatch => ErrorCategory::ContractMismatch,
            Self::UnsupportedContract(_) => ErrorCategory::UnsupportedContract,
            Self::Vcs(_) => ErrorCategory::StepTransaction,
            Self::Store(_) | Self::Queue(_) | Self::Telemetry(_) | Self::Planner(_)
            | Self::Contract(_) | Self::Json(_) => ErrorCategory::StepExecution,
        }
    }

    pub fn to_error_details(&self) -> ErrorDetails {
        ErrorDetails::new(self.category()).with_context("message", self.to_string())
    }
}

/// What a tool execution produced. The three shapes the engine knows how
/// to route: a set of proposed file mutations, a runtime-verify health
/// signal, or an opaque analysis payload.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Mutation { proposed_changes: Vec<ProposedChange> },
    RuntimeVerify { healthy: bool, logs: String },
    Analysis { output: serde_json::Value },
}

/// Executes one plan step's tool against a working directory. No concrete
/// tool backend lives in this crate (pluggable, like the planner facade);
/// [`DefaultToolExecutor`] only covers the generic `write_file` case.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, step: &Step, workdir: &Path) -> EngineResult<StepOutcome>;
}

/// Fast, synchronous checks run against staged diffs before commit (e.g.
/// lint/format). Distinct from heavy validation, which runs against the
/// committed working tree after the full plan executes.
#[derive(Debug, Clone)]
pub struct LightValidationVerdict {
    pub blocking: bool,
    pub message: String,
}

#[async_trait]
pub trait LightValidator: Send + Sync {
    async fn validate(&self, staged: &[StagedDiff]) -> EngineResult<LightValidationVerdict>;
}

/// Runs the external heavy validation suite (typecheck/build/test) against
/// the working tree and returns its raw verdict for interpretation.
#[async_trait]
pub trait HeavyValidator: Send + Sync {
    async fn validate(&self, workdir: &Path) -> EngineResult<HeavyValidationVerdict>;
}

/// Architectural guard checked against staged diffs before commit. Returns
/// `Some(reason)` to block the step.
pub trait InvariantGuard: Send + Sync {
    fn check(&self, staged: &[StagedDiff]) -> Option<String>;
}

/// Generic `write_file` tool: creates the target if absent, updates it
/// otherwise. Any other tool id is a hard [`EngineError::Tool`] — concrete
/// tool behavior beyond this one generic case is left to callers supplying
/// their own [`ToolExecutor`].
pub struct DefaultToolExecutor;

#[async_trait]
impl ToolExecutor for DefaultToolExecutor {
    async fn execute(&self, step: &Step, workdir: &Path) -> EngineResult<StepOutcome> {
        match step.tool.as_str() {
            coordination::state::types::TOOL_WRITE_FILE => {
                let path = step
                .input
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| EngineError::Tool("write_file step missing \"path\" input".into()))?;
                let content = step
                .input
                .get("content")
                .and_then(|v| v.as_str())
                .ok_or_else(|| EngineError::Tool("write_file step missing \"content\" input".into()))?;
                let exists = workdir.join(path).is_file();
                let change = if exists {
                    ProposedChange::Update { path: path.to_string(), content: content.to_string() }
                } else {
                    ProposedChange::Create { path: path.to_string(), content: content.to_string() }
                };
                Ok(StepOutcome::Mutation { proposed_changes: vec![change] })
            }
            other => Err(EngineError::Tool(format!("no executor registered for tool \"{other}\""))),
        }
    }
}

struct StepLoopOutcome {
    reached_complete: bool,
}

enum LoopSignal {
    Continue,
    Stop,
}

/// Drives runs through their lifecycle. Holds the persistence layer, the
/// planner facade, the pluggable tool/validation seams, and the workspace
/// root under which every project's worktree lives.
pub struct RunEngine {
    store: Arc<RunStore>,
    telemetry_root: PathBuf,
    planner: Arc<dyn Planner>,
    tools: Arc<dyn ToolExecutor>,
    light_validator: Option<Arc<dyn LightValidator>>,
    heavy_validator: Option<Arc<dyn HeavyValidator>>,
    invariant_guard: Option<Arc<dyn InvariantGuard>>,
    workspace_root: PathBuf,
    worker_id: String,
}

impl RunEngine {
    pub fn new(
        store: Arc<RunStore>,
        planner: Arc<dyn Planner>,
        workspace_root: impl Into<PathBuf>,
        worker_id: impl Into<String>,
    ) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            store,
            telemetry_root: workspace_root.clone(),
            planner,
            tools: Arc::new(DefaultToolExecutor),
            light_validator: None,
            heavy_validator: None,
            invariant_guard: None,
            workspace_root,
            worker_id: worker_id.into(),
        }
    }

    pub fn with_tool_executor(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_light_validator(mut self, validator: Arc<dyn LightValidator>) -> Self {
        self.light_validator = Some(validator);
        self
    }

    pub fn with_heavy_validator(mut self, validator: Arc<dyn HeavyValidator>) -> Self {
        self.heavy_validator = Some(validator);
        self
    }

    pub fn with_invariant_guard(mut self, guard: Arc<dyn InvariantGuard>) -> Self {
        self.invariant_guard = Some(guard);
        self
    }

    /// Drive `run_id` from whatever status it's in until it reaches a
    /// terminal status, releasing the run lock on every exit path
    /// (including lock-loss, where nothing else is persisted).
    pub async fn drive_to_terminal(&self, run_id: &str) -> EngineResult<AgentRun> {
        let stale_seconds = self
        .store
        .get_run(run_id)
        .await?
        .map(|r| execution_config(&r).map(|c| c.run_lock_stale_seconds as i64))
        .transpose()?
        .unwrap_or(DEFAULT_RUN_LOCK_STALE_SECONDS);

        let mut run = self
        .store
        .try_acquire_run_lock(run_id, &self.worker_id, stale_seconds)
        .await?
        .ok_or_else(|| EngineError::LockLost(run_id.to_string()))?;

        loop {
            if run.status.is_terminal() {
                self.store.release_run_lock(&run.id, &self.worker_id).await?;
                return Ok(run);
            }

            if run.status == RunStatus::Queued {
                self.start_run(&mut run).await?;
            } else {
                let outcome = self.advance_steps(&mut run).await?;
                if outcome.reached_complete && plan_has_ai_mutation(&run) {
                    self.run_validation_auto_correction(&mut run).await?;
                }
            }

            run = self
            .store
            .refresh_run_lock(&run.id, &self.worker_id)
            .await?
            .ok_or_else(|| EngineError::LockLost(run.id.clone()))?;
        }
    }

    async fn start_run(&self, run: &mut AgentRun) -> EngineResult<()> {
        let expected_branch = run_branch_name(&run.id);
        let project_root = project_root(&self.workspace_root, run);
        VcsAdapter::init_repo(&project_root)?;

        let worktree_path = worktree_path(&self.workspace_root, run);
        let vcs = VcsAdapter::new(&project_root);
        let base_commit = vcs.current_commit()?;
        ensure_worktree(&vcs, &worktree_path, &expected_branch, &base_commit)?;

        let worktree_vcs = VcsAdapter::new(&worktree_path);
        if worktree_vcs.is_dirty()? {
            recover_dirty_worktree(
                &worktree_vcs,
                run.pointers.last_valid_commit_hash.as_deref(),
                run.pointers.current_commit_hash.as_deref(),
                Some(&base_commit),
            )?;
        }

        if run.current_step_index == 0 && run.pointers.base_commit_hash.is_none() {
            run.pointers = CommitPointers {
                run_branch: Some(expected_branch),
                worktree_path: Some(worktree_path),
                base_commit_hash: Some(base_commit.clone()),
                current_commit_hash: Some(base_commit.clone()),
                last_valid_commit_hash: Some(base_commit),
            };
        }

        run.status = RunStatus::Running;
        run.updated_at = Utc::now();
        self.store.update_run(run).await?;
        Ok(())
    }

    async fn advance_steps(&self, run: &mut AgentRun) -> EngineResult<StepLoopOutcome> {
        loop {
            *run = self
            .store
            .refresh_run_lock(&run.id, &self.worker_id)
            .await?
            .ok_or_else(|| EngineError::LockLost(run.id.clone()))?;

            if run.current_step_index as usize >= run.plan.len() {
                self.mark_complete(run).await?;
                return Ok(StepLoopOutcome { reached_complete: true });
            }

            match self.execute_one_step(run).await? {
                LoopSignal::Continue => continue,
                LoopSignal::Stop => {
                    return Ok(StepLoopOutcome { reached_complete: run.status == RunStatus::Complete });
                }
            }
        }
    }

    async fn execute_one_step(&self, run: &mut AgentRun) -> EngineResult<LoopSignal> {
        let idx = run.current_step_index as usize;
        let step = run.plan[idx].clone();
        let attempt = self.next_attempt(&run.id, idx as i32).await?;
        let worktree = run
        .pointers
        .worktree_path
        .clone()
        .ok_or_else(|| EngineError::InvariantViolation("run has no worktree path".into()))?;

        let started_at = Utc::now();
        let outcome = self.tools.execute(&step, &worktree).await;

        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                self.record_step_failure(run, &step, idx as i32, attempt, started_at, &e.to_string()).await?;
                return self.fail_step(run, EngineError::StepExecution(e.to_string())).await;
            }
        };

        match outcome {
            StepOutcome::Analysis { output } => {
                self.record_step_success(run, &step, idx as i32, attempt, started_at, output, None, None)
                .await?;
                self.advance_index(run).await?;
                if idx + 1 >= run.plan.len() {
                    return self.finish_or_validate(run).await;
                }
                Ok(LoopSignal::Continue)
            }
            StepOutcome::Mutation { proposed_changes } => {
                self.handle_mutation(run, &step, idx, attempt, started_at, proposed_changes).await
            }
            StepOutcome::RuntimeVerify { healthy, logs } => {
                self.handle_runtime_verify(run, &step, idx, attempt, started_at, healthy, logs).await
            }
        }
    }

    async fn handle_mutation(
        &self,
        run: &mut AgentRun,
        step: &Step,
        idx: usize,
        attempt: i32,
        started_at: chrono::DateTime<Utc>,
        proposed_changes: Vec<ProposedChange>,
    ) -> EngineResult<LoopSignal> {
        let config = execution_config(run)?;
        let worktree = run.pointers.worktree_path.clone().unwrap();
        let caps = SessionCaps {
            max_files_per_step: config.max_files_per_step,
            max_file_bytes: config.max_single_file_bytes,
            max_total_diff_bytes: config.max_total_diff_bytes,
            allow_env_mutation: config.allow_env_mutation,
        };
        let mut session = FileSession::begin(&worktree, step.id.clone(), idx as i32, caps);

        for change in proposed_changes {
            if let Err(e) = session.stage(change) {
                session.abort();
                self.record_step_failure(run, step, idx as i32, attempt, started_at, &e.to_string()).await?;
                return self.fail_step(run, EngineError::StepTransaction(e.to_string())).await;
            }
        }

        if let Err(e) = session.validate() {
            session.abort();
            self.record_step_failure(run, step, idx as i32, attempt, started_at, &e.to_string()).await?;
            return self.fail_step(run, EngineError::StepTransaction(e.to_string())).await;
        }

        let staged = session.get_staged_diffs();

        if let Some(guard) = &self.invariant_guard {
            if let Some(reason) = guard.check(&staged) {
                session.abort();
                self.record_step_failure(run, step, idx as i32, attempt, started_at, &reason).await?;
                return self.fail_step(run, EngineError::InvariantViolation(reason)).await;
            }
        }

        if config.light_validation_mode != coordination::state::contract::ValidationMode::Off {
            if let Some(validator) = &self.light_validator {
                let verdict = validator.validate(&staged).await?;
                if verdict.blocking && config.light_validation_mode == coordination::state::contract::ValidationMode::Enforce {
                    session.abort();
                    self.record_step_failure(run, step, idx as i32, attempt, started_at, &verdict.message).await?;
                    return self.fail_step(run, EngineError::StepTransaction(verdict.message)).await;
                }
            }
        }

        if let Err(e) = session.apply() {
            session.abort();
            self.record_step_failure(run, step, idx as i32, attempt, started_at, &e.to_string()).await?;
            return self.fail_step(run, EngineError::StepTransaction(e.to_string())).await;
        }

        let vcs = VcsAdapter::new(&worktree);
        let commit_hash = session.commit(&vcs, &step.tool, &run.goal)?;

        if step.is_correction() && commit_hash.is_none() {
            return self
            .fail_step(run, EngineError::StepTransaction("correction step produced no commit".into()))
            .await;
        }

        let mut output = serde_json::json!({ "stagedPaths": staged.iter().map(|d| d.path.clone()).collect::<Vec<_>>() });

        if step.is_correction() {
            if let Some(constraint) = active_constraint(step) {
                let staged_paths: Vec<String> = staged.iter().map(|d| d.path.clone()).collect();
                let staged_diff_bytes: u64 = staged.iter().map(|d| d.diff_bytes).sum();
                let attempt_record = CorrectionAttempt {
                    staged_paths: &staged_paths,
                    staged_diff_bytes,
                    produced_commit: commit_hash.is_some(),
                };
                let mode = to_policy_mode(config.correction_policy_mode);
                let record = evaluate(&constraint, &attempt_record, mode);
                output["correctionPolicy"] = serde_json::to_value(&record)?;

                if let Some(reasoning) = &step.correction {
                    if reasoning.classification == "debt_resolution" {
                        let telemetry = self.telemetry(run);
                        for path in &staged_paths {
                            telemetry.close_stub_debt_by_path(&run.id, path)?;
                        }
                    }
                }

                if record.blocks_step {
                    self.record_step_failure(
                        run,
                        step,
                        idx as i32,
                        attempt,
                        started_at,
                        "correction policy violated in enforce mode",
                    )
                    .await?;
                    return self
                    .fail_step(run, EngineError::CorrectionPolicy(format!("{:?}", record.violations)))
                    .await;
                }
            }
        }

        if let Some(hash) = &commit_hash {
            run.pointers.base_commit_hash = run.pointers.current_commit_hash.clone();
            run.pointers.current_commit_hash = Some(hash.clone());
            run.pointers.last_valid_commit_hash = Some(hash.clone());
        }

        self.record_step_success(run, step, idx as i32, attempt, started_at, output, commit_hash, None).await?;
        self.advance_index(run).await?;

        if idx + 1 >= run.plan.len() {
            return self.finish_or_validate(run).await;
        }
        Ok(LoopSignal::Continue)
    }

    async fn handle_runtime_verify(
        &self,
        run: &mut AgentRun,
        step: &Step,
        idx: usize,
        attempt: i32,
        started_at: chrono::DateTime<Utc>,
        healthy: bool,
        logs: String,
    ) -> EngineResult<LoopSignal> {
        let config = execution_config(run)?;

        if healthy {
            self.record_step_success(
                run,
                step,
                idx as i32,
                attempt,
                started_at,
                serde_json::json!({ "runtimeStatus": "healthy" }),
                None,
                Some("healthy".to_string()),
            )
            .await?;
            self.advance_index(run).await?;
            if idx + 1 >= run.plan.len() {
                return self.finish_or_validate(run).await;
            }
            return Ok(LoopSignal::Continue);
        }

        self.record_step_failure_with_status(run, step, idx as i32, attempt, started_at, &logs, "failed").await?;

        let signature = blake3::hash(logs.as_bytes()).to_hex().to_string();
        let (previous_signature, mut consecutive) = runtime_correction_state(run);
        consecutive = if previous_signature.as_deref() == Some(signature.as_str()) { consecutive + 1 } else { 1 };
        set_runtime_correction_state(run, &signature, consecutive);

        if consecutive > RUNTIME_CORRECTION_RETRY_CAP
        && config.correction_convergence_mode == coordination::state::contract::CorrectionConvergenceMode::Enforce
        {
            self.rollback_to_last_valid(run)?;
            return self.fail_step(run, EngineError::RuntimeCorrectionConvergence).await;
        }

        let existing = count_prefix(&run.plan, RUNTIME_CORRECTION_PREFIX);
        if existing >= config.max_runtime_correction_attempts as usize {
            self.rollback_to_last_valid(run)?;
            return self.fail_step(run, EngineError::RuntimeCorrectionLimit).await;
        }

        let n = existing as u32 + 1;
        let caps = ClassifierCaps {
            max_files_cap: config.max_files_per_step,
            max_total_diff_bytes_cap: config.max_total_diff_bytes,
        };
        let input = ClassifierInput {
            phase: CorrectionPhase::Goal,
            failed_step_id: &step.id,
            attempt: n,
            runtime_logs: Some(&logs),
            validation_profile: None,
        };
        let constraint = classify(&input, caps);

        let correction_step = match self
        .planner
        .plan_runtime_correction(CorrectionRequest {
            goal: &run.goal,
            failed_step: step,
            failure_summary: &logs,
            constraint: &constraint,
            provider_id: &run.provider_id,
            model: &run.model,
        })
        .await
        {
            Ok(response) if !response.steps.is_empty() => response.steps.into_iter().next().unwrap(),
            _ => fallback_correction_step(
                format!("{RUNTIME_CORRECTION_PREFIX}{n}"),
                CorrectionPhase::Goal,
                n,
                &step.id,
                &constraint,
            ),
        };

        let retry_step = Step {
            id: format!("{RUNTIME_RETRY_PREFIX}{n}"),
            step_type: StepType::Verify,
            tool: coordination::state::types::TOOL_RUN_PREVIEW_CONTAINER.to_string(),
            input: serde_json::json!({}),
            correction: None,
        };

        run.plan.insert(idx + 1, retry_step);
        run.plan.insert(idx + 1, correction_step);
        run.current_step_index = (idx + 1) as i32;
        run.status = RunStatus::Correcting;
        run.updated_at = Utc::now();
        self.store.update_run(run).await?;
        Ok(LoopSignal::Continue)
    }

    async fn finish_or_validate(&self, run: &mut AgentRun) -> EngineResult<LoopSignal> {
        let config = execution_config(run)?;

        if config.heavy_validation_mode == coordination::state::contract::ValidationMode::Off
        || self.heavy_validator.is_none()
        {
            self.mark_complete(run).await?;
            return Ok(LoopSignal::Stop);
        }

        run.status = RunStatus::Validating;
        run.updated_at = Utc::now();
        self.store.update_run(run).await?;

        let worktree = run.pointers.worktree_path.clone().unwrap();
        let validator = self.heavy_validator.as_ref().unwrap();
        let verdict = validator
        .validate(&worktree)
        .await
        .map_err(|e| EngineError::HeavyValidationExecution(e.to_string()))?;
        let profile = interpret(&verdict);

        if verdict.ok {
            run.validation_status = Some(ValidationStatus::Passed);
            run.validation_result = Some(serde_json::to_value(&verdict)?);
            run.validated_at = Some(Utc::now());
            self.mark_complete(run).await?;
            return Ok(LoopSignal::Stop);
        }

        run.validation_status = Some(ValidationStatus::Failed);
        run.validation_result = Some(serde_json::to_value(&verdict)?);
        run.validated_at = Some(Utc::now());

        let existing = count_prefix(&run.plan, VALIDATION_CORRECTION_PREFIX);
        if existing >= config.max_heavy_correction_attempts as usize {
            self.rollback_to_last_valid(run)?;
            return self.fail_step(run, EngineError::HeavyValidationCorrectionLimit).await;
        }

        let n = existing as u32 + 1;
        let idx = run.current_step_index as usize;
        let failed_step = run.plan[idx.saturating_sub(1).min(run.plan.len().saturating_sub(1))].clone();
        let caps = ClassifierCaps {
            max_files_cap: config.max_files_per_step,
            max_total_diff_bytes_cap: config.max_total_diff_bytes,
        };
        let input = ClassifierInput {
            phase: CorrectionPhase::Optimization,
            failed_step_id: &failed_step.id,
            attempt: n,
            runtime_logs: None,
            validation_profile: Some(&profile),
        };
        let constraint = classify(&input, caps);

        let correction_step = match self
        .planner
        .plan_correction(CorrectionRequest {
            goal: &run.goal,
            failed_step: &failed_step,
            failure_summary: &verdict.summary,
            constraint: &constraint,
            provider_id: &run.provider_id,
            model: &run.model,
        })
        .await
        {
            Ok(response) if !response.steps.is_empty() => response.steps.into_iter().next().unwrap(),
            _ => fallback_correction_step(
                format!("{VALIDATION_CORRECTION_PREFIX}{n}"),
                CorrectionPhase::Optimization,
                n,
                &failed_step.id,
                &constraint,
            ),
        };

        run.plan.insert(idx, correction_step);
        run.status = RunStatus::Optimizing;
        run.updated_at = Utc::now();
        self.store.update_run(run).await?;
        Ok(LoopSignal::Continue)
    }

    /// The post-complete validation auto-correction outer loop (distinct
    /// from the terminal-step heavy validation above): only entered once a
    /// run has a plan containing an `ai_mutation` step, capped at
    /// [`MAX_VALIDATION_AUTO_CORRECTIONS`].
    async fn run_validation_auto_correction(&self, run: &mut AgentRun) -> EngineResult<()> {
        if run.correction_attempts >= MAX_VALIDATION_AUTO_CORRECTIONS {
            return Ok(());
        }
        let Some(validator) = self.heavy_validator.clone() else { return Ok(()) };
        let worktree = match &run.pointers.worktree_path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };

        let blocking_before = run
        .metadata
        .get("lastBlockingCount")
        .and_then(|v| v.as_i64())
        .unwrap_or(0) as i32;

        let verdict = validator
        .validate(&worktree)
        .await
        .map_err(|e| EngineError::HeavyValidationExecution(e.to_string()))?;
        let profile = interpret(&verdict);
        let blocking_after = profile.blocking_count;
        ensure_metadata_object(run).insert("lastBlockingCount".to_string(), serde_json::json!(blocking_after));

        if verdict.ok {
            run.validation_status = Some(ValidationStatus::Passed);
            run.validation_result = Some(serde_json::to_value(&verdict)?);
            run.validated_at = Some(Utc::now());

            let telemetry = self.telemetry(run);
            let open_debts = telemetry.open_stub_debts(&run.id)?;
            if !open_debts.is_empty() {
                self.synthesize_debt_resolution(run, &open_debts)?;
                self.write_learning_event(
                    run,
                    "validation_auto_correction",
                    blocking_before,
                    blocking_after,
                    profile.architecture_collapse,
                    AttemptPhase::DebtResolution,
                )?;
            } else {
                self.write_learning_event(
                    run,
                    "validation_auto_correction",
                    blocking_before,
                    blocking_after,
                    profile.architecture_collapse,
                    AttemptPhase::Normal,
                )?;
            }

            run.updated_at = Utc::now();
            self.store.update_run(run).await?;
            return Ok(());
        }

        let import_cluster = profile.clusters.iter().any(|c| c.cluster_type == ClusterType::ImportResolutionError);
        let import_signal = extract_import_signal(&verdict);

        let (step, attempt_phase) = if import_cluster {
            if let Some(signal) = import_signal {
                match self.import_recipe_step(run, &signal)? {
                    Some(outcome) => outcome,
                    None => self.delegate_correction_step(run, &profile, &verdict, run.correction_attempts + 1).await?,
                }
            } else {
                self.delegate_correction_step(run, &profile, &verdict, run.correction_attempts + 1).await?
            }
        } else {
            let recent = self.store.recent_learning_events(20).await?;
            let (regression_rate, avg_delta) = pressure_stats(&recent);
            let stall_rate = stall_stats(&recent);

            if regression_rate >= 0.25 || avg_delta <= 0.0 {
                ensure_metadata_object(run).insert("architectureCollapse".to_string(), serde_json::json!(true));
                (
                    structural_reset_step(run.correction_attempts + 1, &profile),
                    AttemptPhase::Normal,
                )
            } else if recent.len() >= 8 && stall_rate >= 0.5 {
                (escalation_step(run.correction_attempts + 1, "feature_reintegration"), AttemptPhase::Normal)
            } else {
                self.delegate_correction_step(run, &profile, &verdict, run.correction_attempts + 1).await?
            }
        };

        run.plan.push(step);
        run.correction_attempts += 1;
        run.last_correction_reason = Some(profile.reason.clone());
        run.validation_status = Some(ValidationStatus::Failed);
        run.validation_result = Some(serde_json::to_value(&verdict)?);
        run.validated_at = Some(Utc::now());
        run.status = RunStatus::Running;
        run.updated_at = Utc::now();

        self.write_learning_event(
            run,
            "validation_auto_correction",
            blocking_before,
            blocking_after,
            profile.architecture_collapse,
            attempt_phase,
        )?;
        self.store.update_run(run).await?;
        Ok(())
    }

    fn import_recipe_step(
        &self,
        run: &mut AgentRun,
        signal: &coordination::ImportSignal,
    ) -> EngineResult<Option<(Step, AttemptPhase)>> {
        let project_root = project_root(&self.workspace_root, run);
        let worktree = match &run.pointers.worktree_path {
            Some(p) => p.clone(),
            None => return Ok(None),
        };
        let full_path = worktree.join(&signal.containing_file);
        let Some(import_line) = read_import_line(&full_path, &signal.specifier) else { return Ok(None) };

        let n = run.correction_attempts + 1;
        let outcome = run_import_resolution_recipe(
            &project_root,
            &run.id,
            &run.project_id,
            signal,
            &import_line,
            Utc::now(),
        );

        match outcome {
            ImportResolutionOutcome::Rewrite { target_relative_path } => {
                let rewritten_line =
                coordination::rewrite_import_specifier(&import_line, &signal.specifier, &target_relative_path);
                let Some(rewritten_file) = rewrite_single_line(&full_path, &import_line, &rewritten_line) else {
                    return Ok(None);
                };
                let step = Step {
                    id: format!("{VALIDATION_CORRECTION_PREFIX}{n}"),
                    step_type: StepType::Modify,
                    tool: coordination::state::types::TOOL_WRITE_FILE.to_string(),
                    input: serde_json::json!({
                        "path": signal.containing_file,
                        "content": rewritten_file,
                    }),
                    correction: Some(CorrectionReasoning {
                        phase: "optimization".to_string(),
                        attempt: n as u32,
                        failed_step_id: signal.containing_file.clone(),
                        classification: "import_resolution_rewrite".to_string(),
                        constraint: serde_json::json!({}),
                        summary: format!("rewrote import specifier \"{}\"", signal.specifier),
                        created_at: Utc::now(),
                    }),
                };
                Ok(Some((step, AttemptPhase::Normal)))
            }
            ImportResolutionOutcome::MaterializeStub { stub_path, stub_content, exports } => {
                self.telemetry(run).open_stub_debt(&StubDebtRecord {
                    run_id: run.id.clone(),
                    step_index: run.plan.len() as i32,
                    attempt: n,
                    stub_path: stub_path.clone(),
                    exports,
                    status: StubDebtStatus::Open,
                    created_at: Utc::now(),
                })?;
                let step = Step {
                    id: format!("{VALIDATION_CORRECTION_PREFIX}{n}"),
                    step_type: StepType::Modify,
                    tool: coordination::state::types::TOOL_WRITE_FILE.to_string(),
                    input: serde_json::json!({ "path": stub_path, "content": stub_content }),
                    correction: Some(CorrectionReasoning {
                        phase: "optimization".to_string(),
                        attempt: n as u32,
                        failed_step_id: signal.containing_file.clone(),
                        classification: "import_resolution_stub".to_string(),
                        constraint: serde_json::json!({}),
                        summary: format!("materialized stub for \"{}\"", signal.specifier),
                        created_at: Utc::now(),
                    }),
                };
                Ok(Some((step, AttemptPhase::ImportResolutionStub)))
            }
        }
    }

    async fn delegate_correction_step(
        &self,
        run: &AgentRun,
        profile: &coordination::ValidationProfile,
        verdict: &HeavyValidationVerdict,
        attempt: i32,
    ) -> EngineResult<(Step, AttemptPhase)> {
        let config = execution_config(run)?;
        let caps = ClassifierCaps {
            max_files_cap: config.max_files_per_step,
            max_total_diff_bytes_cap: config.max_total_diff_bytes,
        };
        let last_step_id = run.plan.last().map(|s| s.id.clone()).unwrap_or_default();
        let input = ClassifierInput {
            phase: CorrectionPhase::Optimization,
            failed_step_id: &last_step_id,
            attempt: attempt as u32,
            runtime_logs: None,
            validation_profile: Some(profile),
        };
        let constraint = classify(&input, caps);
        let failed_step = run.plan.last().cloned().unwrap_or_else(|| Step {
            id: last_step_id.clone(),
            step_type: StepType::Modify,
            tool: coordination::state::types::TOOL_WRITE_FILE.to_string(),
            input: serde_json::json!({}),
            correction: None,
        });

        let step = match self
        .planner
        .plan_correction(CorrectionRequest {
            goal: &run.goal,
            failed_step: &failed_step,
            failure_summary: &verdict.summary,
            constraint: &constraint,
            provider_id: &run.provider_id,
            model: &run.model,
        })
        .await
        {
            Ok(response) if !response.steps.is_empty() => response.steps.into_iter().next().unwrap(),
            _ => fallback_correction_step(
                format!("{VALIDATION_CORRECTION_PREFIX}{attempt}"),
                CorrectionPhase::Optimization,
                attempt as u32,
                &last_step_id,
                &constraint,
            ),
        };
        Ok((step, AttemptPhase::Normal))
    }

    fn synthesize_debt_resolution(&self, run: &mut AgentRun, debts: &[StubDebtRecord]) -> EngineResult<()> {
        let n = run.correction_attempts + 1;
        for (i, debt) in debts.iter().enumerate() {
            let content = render_debt_resolution_module(&debt.exports);
            let step = Step {
                id: format!("{VALIDATION_CORRECTION_PREFIX}{n}-{i}"),
                step_type: StepType::Modify,
                tool: coordination::state::types::TOOL_WRITE_FILE.to_string(),
                input: serde_json::json!({ "path": debt.stub_path, "content": content }),
                correction: Some(CorrectionReasoning {
                    phase: "optimization".to_string(),
                    attempt: n as u32,
                    failed_step_id: debt.stub_path.clone(),
                    classification: "debt_resolution".to_string(),
                    constraint: serde_json::json!({}),
                    summary: format!("paid down stub debt at \"{}\"", debt.stub_path),
                    created_at: Utc::now(),
                }),
            };
            run.plan.push(step);
        }
        run.status = RunStatus::Running;
        Ok(())
    }

    fn write_learning_event(
        &self,
        run: &AgentRun,
        event_type: &str,
        blocking_before: i32,
        blocking_after: i32,
        architecture_collapse: bool,
        attempt_phase: AttemptPhase,
    ) -> EngineResult<()> {
        let exhausted = run.correction_attempts + 1 >= MAX_VALIDATION_AUTO_CORRECTIONS;
        let outcome = classify_outcome(blocking_before, blocking_after, attempt_phase, exhausted);
        let event = LearningEvent::new(
            run.id.clone(),
            run.project_id.clone(),
            run.plan.len() as i32,
            event_type,
            "optimization",
            serde_json::json!({}),
            blocking_before,
            blocking_after,
            architecture_collapse,
            0,
            serde_json::json!({}),
            outcome,
        );
        self.telemetry(run).append_run_event(&run.id, &event)?;
        Ok(())
    }

    async fn mark_complete(&self, run: &mut AgentRun) -> EngineResult<()> {
        run.status = RunStatus::Complete;
        run.finished_at = Some(Utc::now());
        run.updated_at = Utc::now();
        self.store.update_run(run).await?;
        Ok(())
    }

    async fn mark_failed(&self, run: &mut AgentRun, error: &EngineError) -> EngineResult<()> {
        run.status = RunStatus::Failed;
        run.error_message = Some(error.to_string());
        run.error_details = Some(error.to_error_details());
        run.finished_at = Some(Utc::now());
        run.updated_at = Utc::now();
        self.store.update_run(run).await?;
        Ok(())
    }

    async fn fail_step(&self, run: &mut AgentRun, error: EngineError) -> EngineResult<LoopSignal> {
        self.mark_failed(run, &error).await?;
        Err(error)
    }

    fn rollback_to_last_valid(&self, run: &AgentRun) -> EngineResult<()> {
        if let (Some(worktree), Some(last_valid)) =
        (&run.pointers.worktree_path, &run.pointers.last_valid_commit_hash)
        {
            let vcs = VcsAdapter::new(worktree);
            vcs.reset_hard(last_valid)?;
        }
        Ok(())
    }

    async fn advance_index(&self, run: &mut AgentRun) -> EngineResult<()> {
        run.current_step_index += 1;
        run.last_step_id = run.plan.get(run.current_step_index as usize - 1).map(|s| s.id.clone());
        run.updated_at = Utc::now();
        self.store.update_run(run).await?;
        Ok(())
    }

    async fn next_attempt(&self, run_id: &str, step_index: i32) -> EngineResult<i32> {
        let records = self.store.list_step_records(run_id).await?;
        Ok(records.iter().filter(|r| r.step_index == step_index).count() as i32 + 1)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_step_success(
        &self,
        run: &AgentRun,
        step: &Step,
        step_index: i32,
        attempt: i32,
        started_at: chrono::DateTime<Utc>,
        output: serde_json::Value,
        commit_hash: Option<String>,
        runtime_status: Option<String>,
    ) -> EngineResult<()> {
        let record = StepRecord {
            run_id: run.id.clone(),
            step_index,
            attempt,
            step_id: step.id.clone(),
            step_type: step.step_type,
            tool: step.tool.clone(),
            input_payload: step.input.clone(),
            output_payload: output,
            status: StepStatus::Completed,
            error_message: None,
            commit_hash,
            runtime_status,
            started_at,
            finished_at: Some(Utc::now()),
            created_at: started_at,
        };
        self.store.put_step_record(&record).await?;
        Ok(())
    }

    async fn record_step_failure(
        &self,
        run: &AgentRun,
        step: &Step,
        step_index: i32,
        attempt: i32,
        started_at: chrono::DateTime<Utc>,
        message: &str,
    ) -> EngineResult<()> {
        self.record_step_failure_with_status(run, step, step_index, attempt, started_at, message, "failed").await
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_step_failure_with_status(
        &self,
        run: &AgentRun,
        step: &Step,
        step_index: i32,
        attempt: i32,
        started_at: chrono::DateTime<Utc>,
        message: &str,
        runtime_status: &str,
    ) -> EngineResult<()> {
        let record = StepRecord {
            run_id: run.id.clone(),
            step_index,
            attempt,
            step_id: step.id.clone(),
            step_type: step.step_type,
            tool: step.tool.clone(),
            input_payload: step.input.clone(),
            output_payload: serde_json::json!({}),
            status: StepStatus::Failed,
            error_message: Some(message.to_string()),
            commit_hash: None,
            runtime_status: Some(runtime_status.to_string()),
            started_at,
            finished_at: Some(Utc::now()),
            created_at: started_at,
        };
        self.store.put_step_record(&record).await?;
        Ok(())
    }

    fn telemetry(&self, run: &AgentRun) -> LearningTelemetry {
        LearningTelemetry::new(project_root(&self.workspace_root, run))
    }
}

fn project_root(workspace_root: &Path, run: &AgentRun) -> PathBuf {
    workspace_root.join(&run.org_id).join(&run.workspace_id).join(&run.project_id)
}

fn worktree_path(workspace_root: &Path, run: &AgentRun) -> PathBuf {
    project_root(workspace_root, run).join(".deeprun").join("worktrees").join(&run.id)
}

fn plan_has_ai_mutation(run: &AgentRun) -> bool {
    run.plan.iter().any(|s| s.tool == coordination::state::types::TOOL_AI_MUTATION)
}

fn execution_config(run: &AgentRun) -> EngineResult<ExecutionConfig> {
    let contract: coordination::ExecutionContract = run
    .metadata
    .get("executionContract")
    .cloned()
    .map(serde_json::from_value)
    .transpose()?
    .ok_or_else(|| EngineError::InvariantViolation("run has no execution contract".into()))?;

    verify_stored_hash(&contract).map_err(|_| EngineError::ContractMismatch)?;
    let support = evaluate_support(&contract.material);
    if !support.supported {
        return Err(EngineError::UnsupportedContract(support.message.unwrap_or_default()));
    }
    Ok(contract.effective_config)
}

/// Seal a freshly-built execution contract into a run's metadata. Used by
/// callers creating a run (the job-queue/dispatch layer), not by the
/// engine's own step loop, which only ever reads it back.
pub fn seal_execution_contract(run: &mut AgentRun, profile: &str, randomness_seed: u64) -> EngineResult<()> {
    let contract = build_contract(profile, randomness_seed)?;
    ensure_metadata_object(run).insert("executionContract".to_string(), serde_json::to_value(&contract)?);
    Ok(())
}

fn active_constraint(step: &Step) -> Option<CorrectionConstraint> {
    let reasoning = step.correction.as_ref()?;
    serde_json::from_value(reasoning.constraint.clone()).ok()
}

fn to_policy_mode(mode: CorrectionPolicyMode) -> PolicyMode {
    match mode {
        CorrectionPolicyMode::Off => PolicyMode::Off,
        CorrectionPolicyMode::Warn => PolicyMode::Warn,
        CorrectionPolicyMode::Enforce => PolicyMode::Enforce,
    }
}

fn count_prefix(plan: &[Step], prefix: &str) -> usize {
    plan.iter().filter(|s| s.id.starts_with(prefix)).count()
}

fn ensure_metadata_object(run: &mut AgentRun) -> &mut serde_json::Map<String, serde_json::Value> {
    if !run.metadata.is_object() {
        run.metadata = serde_json::json!({});
    }
    run.metadata.as_object_mut().unwrap()
}

fn runtime_correction_state(run: &AgentRun) -> (Option<String>, u32) {
    let signature = run.metadata.get("runtimeVerifySignature").and_then(|v| v.as_str()).map(str::to_string);
    let consecutive = run.metadata.get("runtimeVerifyConsecutive").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    (signature, consecutive)
}

fn set_runtime_correction_state(run: &mut AgentRun, signature: &str, consecutive: u32) {
    let map = ensure_metadata_object(run);
    map.insert("runtimeVerifySignature".to_string(), serde_json::json!(signature));
    map.insert("runtimeVerifyConsecutive".to_string(), serde_json::json!(consecutive));
}

fn fallback_correction_step(
    id: String,
    phase: CorrectionPhase,
    attempt: u32,
    failed_step_id: &str,
    constraint: &CorrectionConstraint,
) -> Step {
    let phase_str = match phase {
        CorrectionPhase::Goal => "goal",
        CorrectionPhase::Optimization => "optimization",
    };
    Step {
        id,
        step_type: StepType::Modify,
        tool: coordination::state::types::TOOL_AI_MUTATION.to_string(),
        input: serde_json::json!({
            "failedStepId": failed_step_id,
            "intent": constraint.intent.to_string(),
        }),
        correction: Some(CorrectionReasoning {
            phase: phase_str.to_string(),
            attempt,
            failed_step_id: failed_step_id.to_string(),
            classification: constraint.intent.to_string(),
            constraint: serde_json::to_value(constraint).unwrap_or(serde_json::json!({})),
            summary: format!("deterministic fallback correction for {failed_step_id}"),
            created_at: Utc::now(),
        }),
    }
}

fn structural_reset_step(attempt: i32, profile: &coordination::ValidationProfile) -> Step {
    Step {
        id: format!("{VALIDATION_CORRECTION_PREFIX}{attempt}"),
        step_type: StepType::Modify,
        tool: coordination::state::types::TOOL_AI_MUTATION.to_string(),
        input: serde_json::json!({ "mode": "structural_reset", "reason": profile.reason }),
        correction: Some(CorrectionReasoning {
            phase: "optimization".to_string(),
            attempt: attempt as u32,
            failed_step_id: "structural_reset".to_string(),
            classification: "architecture_violation".to_string(),
            constraint: serde_json::json!({}),
            summary: "structural reset fallback triggered by import pressure statistics".to_string(),
            created_at: Utc::now(),
        }),
    }
}

fn escalation_step(attempt: i32, mode_override: &str) -> Step {
    Step {
        id: format!("{VALIDATION_CORRECTION_PREFIX}{attempt}"),
        step_type: StepType::Modify,
        tool: coordination::state::types::TOOL_AI_MUTATION.to_string(),
        input: serde_json::json!({ "mode": mode_override }),
        correction: Some(CorrectionReasoning {
            phase: "optimization".to_string(),
            attempt: attempt as u32,
            failed_step_id: "micro_targeted_stall".to_string(),
            classification: "stall_escalation".to_string(),
            constraint: serde_json::json!({}),
            summary: format!("escalated to {mode_override} after sustained stall"),
            created_at: Utc::now(),
        }),
    }
}

/// `(regressionRate, avgDelta)` over the given recent events.
fn pressure_stats(events: &[LearningEvent]) -> (f64, f64) {
    if events.is_empty() {
        return (0.0, 0.0);
    }
    let regressed = events.iter().filter(|e| e.regression_flag).count() as f64;
    let total_delta: i32 = events.iter().map(|e| e.delta()).sum();
    (regressed / events.len() as f64, total_delta as f64 / events.len() as f64)
}

/// Fraction of recent events classified `stalled`.
fn stall_stats(events: &[LearningEvent]) -> f64 {
    if events.is_empty() {
        return 0.0;
    }
    let stalled = events.iter().filter(|e| e.outcome == LearningOutcome::Stalled).count() as f64;
    stalled / events.len() as f64
}

fn read_import_line(file_path: &Path, specifier: &str) -> Option<String> {
    let content = std::fs::read_to_string(file_path).ok()?;
    content.lines().find(|l| l.contains(specifier)).map(str::to_string)
}

/// Replace the first occurrence of `old_line` in `path`'s contents with
/// `new_line`, returning the whole rewritten file. A `write_file` mutation
/// overwrites the entire target, so the import rewrite must carry the
/// file's other contents through rather than just the one corrected line.
fn rewrite_single_line(path: &Path, old_line: &str, new_line: &str) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    Some(content.replacen(old_line, new_line, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_prefix_counts_matching_ids_only() {
        let plan = vec![
            Step { id: "runtime-correction-1".into(), step_type: StepType::Modify, tool: "ai_mutation".into(), input: serde_json::json!({}), correction: None },
            Step { id: "runtime-retry-1".into(), step_type: StepType::Verify, tool: "run_preview_container".into(), input: serde_json::json!({}), correction: None },
            Step { id: "runtime-correction-2".into(), step_type: StepType::Modify, tool: "ai_mutation".into(), input: serde_json::json!({}), correction: None },
        ];
        assert_eq!(count_prefix(&plan, RUNTIME_CORRECTION_PREFIX), 2);
        assert_eq!(count_prefix(&plan, RUNTIME_RETRY_PREFIX), 1);
    }

    #[test]
    fn pressure_stats_reports_regression_rate_and_avg_delta() {
        let events = vec![
            LearningEvent::new("r".into(), "p".into(), 0, "t", "goal", serde_json::json!({}), 5, 3, false, 0, serde_json::json!({}), LearningOutcome::Improved),
            LearningEvent::new("r".into(), "p".into(), 1, "t", "goal", serde_json::json!({}), 3, 6, false, 0, serde_json::json!({}), LearningOutcome::Regressed),
        ];
        let (rate, avg_delta) = pressure_stats(&events);
        assert_eq!(rate, 0.5);
        assert_eq!(avg_delta, -0.5);
    }

    #[test]
    fn stall_stats_reports_fraction_stalled() {
        let events = vec![
            LearningEvent::new("r".into(), "p".into(), 0, "t", "goal", serde_json::json!({}), 3, 3, false, 0, serde_json::json!({}), LearningOutcome::Stalled),
            LearningEvent::new("r".into(), "p".into(), 1, "t", "goal", serde_json::json!({}), 3, 1, false, 0, serde_json::json!({}), LearningOutcome::Improved),
        ];
        assert_eq!(stall_stats(&events), 0.5);
    }

    #[test]
    fn to_policy_mode_maps_each_variant() {
        assert_eq!(to_policy_mode(CorrectionPolicyMode::Off), PolicyMode::Off);
        assert_eq!(to_policy_mode(CorrectionPolicyMode::Warn), PolicyMode::Warn);
        assert_eq!(to_policy_mode(CorrectionPolicyMode::Enforce), PolicyMode::Enforce);
    }

    #[test]
    fn plan_has_ai_mutation_detects_tool() {
        let mut run = sample_run();
        run.plan = vec![Step {
            id: "s1".into(),
            step_type: StepType::Modify,
            tool: "ai_mutation".into(),
            input: serde_json::json!({}),
            correction: None,
        }];
        assert!(plan_has_ai_mutation(&run));
    }

    fn sample_run() -> AgentRun {
        AgentRun {
            id: "run-1".into(),
            project_id: "proj-1".into(),
            org_id: "org-1".into(),
            workspace_id: "ws-1".into(),
            created_by_user_id: "user-1".into(),
            goal: "goal".into(),
            provider_id: "provider".into(),
            model: "model".into(),
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
            created_at: Utc::now(),
            updated_at: Utc::now(),
            finished_at: None,
        }
    }
}
