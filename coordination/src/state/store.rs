//! Run Store — Postgres-backed persistence for runs, steps, jobs,
//! worker heartbeats and learning events.
//!

use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tokio_postgres::{Client, NoTls};

use super::schema::DDL;
use super::types::{
    AgentRun, CommitPointers, ErrorDetails, JobStatus, JobType, LearningEvent, LearningOutcome,
    RunStatus, Step, StepRecord, StepStatus, StepType, TargetRole, ToolId, ValidationStatus,
    WorkerNode, WorkerRole, WorkerStatus,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection error: {0}")]
    Connect(String),

    #[error("row did not contain a valid {field}: {detail}")]
    Decode { field: &'static str, detail: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle to the underlying Postgres connection.
///
/// A single `tokio_postgres::Client` is shared between [`RunStore`] and
/// [`crate::queue::JobQueue`] — both operate on the same `agent_runs` /
/// `run_jobs` tables and must observe each other's writes without going
/// through a pool.
pub type SharedPg = Arc<Client>;

/// Connect to Postgres and ensure the schema exists.
///
/// The connection's background driver task is spawned onto the current
/// Tokio runtime and detached; a dropped connection logs and exits rather
/// than panicking the process.
pub async fn connect(conn_str: &str) -> StoreResult<SharedPg> {
    let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
        .await
        .map_err(|e| StoreError::Connect(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "postgres connection task terminated");
        }
    });

    client.batch_execute(DDL).await?;
    Ok(Arc::new(client))
}

/// Run Store: persistence for [`AgentRun`], [`StepRecord`],
/// [`WorkerNode`] and [`LearningEvent`].
pub struct RunStore {
    pg: SharedPg,
}

impl RunStore {
    pub fn new(pg: SharedPg) -> Self {
        Self { pg }
    }

    pub async fn connect(conn_str: &str) -> StoreResult<Self> {
        Ok(Self::new(connect(conn_str).await?))
    }

    pub fn pg(&self) -> SharedPg {
        self.pg.clone()
    }

    /// Insert a brand-new run.
    pub async fn put_run(&self, run: &AgentRun) -> StoreResult<()> {
        let plan = serde_json::to_value(&run.plan)?;
        let validation_status = run.validation_status.map(|s| s.to_string());
        let error_details = run.error_details.as_ref().map(serde_json::to_value).transpose()?;

        self.pg
        .execute(
            "INSERT INTO agent_runs (
                id, project_id, org_id, workspace_id, created_by_user_id, goal,
                provider_id, model, status, plan, current_step_index, last_step_id,
                run_branch, worktree_path, base_commit_hash, current_commit_hash,
                last_valid_commit_hash, validation_status, validation_result, validated_at,
                correction_attempts, last_correction_reason, run_lock_owner,
                run_lock_acquired_at, metadata, error_message, error_details,
                created_at, updated_at, finished_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,
                $21,$22,$23,$24,$25,$26,$27,$28,$29,$30)",
            &[
                &run.id,
                &run.project_id,
                &run.org_id,
                &run.workspace_id,
                &run.created_by_user_id,
                &run.goal,
                &run.provider_id,
                &run.model,
                &run.status.to_string(),
                &plan,
                &run.current_step_index,
                &run.last_step_id,
                &run.pointers.run_branch,
                &run.pointers.worktree_path.as_ref().map(|p| p.display().to_string()),
                &run.pointers.base_commit_hash,
                &run.pointers.current_commit_hash,
                &run.pointers.last_valid_commit_hash,
                &validation_status,
                &run.validation_result,
                &run.validated_at,
                &run.correction_attempts,
                &run.last_correction_reason,
                &run.run_lock_owner,
                &run.run_lock_acquired_at,
                &run.metadata,
                &run.error_message,
                &error_details,
                &run.created_at,
                &run.updated_at,
                &run.finished_at,
            ],
        )
        .await?;
        Ok(())
    }

    /// Persist a full update to an existing run. Callers are responsible
    /// for contract-hash validation before calling this — the store
    /// itself does not recompute hashes.
    pub async fn update_run(&self, run: &AgentRun) -> StoreResult<()> {
        let plan = serde_json::to_value(&run.plan)?;
        let validation_status = run.validation_status.map(|s| s.to_string());
        let error_details = run.error_details.as_ref().map(serde_json::to_value).transpose()?;

        self.pg
        .execute(
            "UPDATE agent_runs SET
            status=$2, plan=$3, current_step_index=$4, last_step_id=$5,
            run_branch=$6, worktree_path=$7, base_commit_hash=$8,
            current_commit_hash=$9, last_valid_commit_hash=$10,
            validation_status=$11, validation_result=$12, validated_at=$13,
            correction_attempts=$14, last_correction_reason=$15,
            run_lock_owner=$16, run_lock_acquired_at=$17, metadata=$18,
            error_message=$19, error_details=$20, updated_at=$21, finished_at=$22
            WHERE id=$1",
            &[
                &run.id,
                &run.status.to_string(),
                &plan,
                &run.current_step_index,
                &run.last_step_id,
                &run.pointers.run_branch,
                &run.pointers.worktree_path.as_ref().map(|p| p.display().to_string()),
                &run.pointers.base_commit_hash,
                &run.pointers.current_commit_hash,
                &run.pointers.last_valid_commit_hash,
                &validation_status,
                &run.validation_result,
                &run.validated_at,
                &run.correction_attempts,
                &run.last_correction_reason,
                &run.run_lock_owner,
                &run.run_lock_acquired_at,
                &run.metadata,
                &run.error_message,
                &error_details,
                &Utc::now(),
                &run.finished_at,
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> StoreResult<Option<AgentRun>> {
        let row = self
        .pg
        .query_opt("SELECT * FROM agent_runs WHERE id = $1", &[&run_id])
        .await?;
        row.map(row_to_run).transpose()
    }

    /// Atomically acquire the run's execution lock for `owner`, succeeding
    /// when the lock is unheld or held past `stale_seconds`. Mirrors
    /// [`crate::queue::JobQueue::claim`]'s optimistic conditional-UPDATE
    /// idiom rather than a separate advisory-lock table.
    pub async fn try_acquire_run_lock(
        &self,
        run_id: &str,
        owner: &str,
        stale_seconds: i64,
    ) -> StoreResult<Option<AgentRun>> {
        let now = Utc::now();
        let stale_before = now - Duration::seconds(stale_seconds);
        let row = self
        .pg
        .query_opt(
            "UPDATE agent_runs SET
            run_lock_owner = $2, run_lock_acquired_at = $3, updated_at = $3
            WHERE id = $1
            AND (run_lock_owner IS NULL OR run_lock_owner = $2 OR run_lock_acquired_at < $4)
            RETURNING *",
            &[&run_id, &owner, &now, &stale_before],
        )
        .await?;
        row.map(row_to_run).transpose()
    }

    /// Extend the lock's freshness without changing ownership, called
    /// periodically by the owning worker while it executes the run.
    pub async fn refresh_run_lock(&self, run_id: &str, owner: &str) -> StoreResult<Option<AgentRun>> {
        let now = Utc::now();
        let row = self
        .pg
        .query_opt(
            "UPDATE agent_runs SET run_lock_acquired_at = $3, updated_at = $3
            WHERE id = $1 AND run_lock_owner = $2
            RETURNING *",
            &[&run_id, &owner, &now],
        )
        .await?;
        row.map(row_to_run).transpose()
    }

    /// Release the lock if still held by `owner`. A no-op (not an error) if
    /// another owner has since taken it over a staleness window.
    pub async fn release_run_lock(&self, run_id: &str, owner: &str) -> StoreResult<Option<AgentRun>> {
        let now = Utc::now();
        let row = self
        .pg
        .query_opt(
            "UPDATE agent_runs SET run_lock_owner = NULL, run_lock_acquired_at = NULL, updated_at = $3
            WHERE id = $1 AND run_lock_owner = $2
            RETURNING *",
            &[&run_id, &owner, &now],
        )
        .await?;
        row.map(row_to_run).transpose()
    }

    pub async fn put_step_record(&self, rec: &StepRecord) -> StoreResult<()> {
        self.pg
        .execute(
            "INSERT INTO agent_steps (
                run_id, step_index, attempt, step_id, step_type, tool,
                input_payload, output_payload, status, error_message, commit_hash,
                runtime_status, started_at, finished_at, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
            ON CONFLICT (run_id, step_index, attempt) DO UPDATE SET
            output_payload=EXCLUDED.output_payload, status=EXCLUDED.status,
            error_message=EXCLUDED.error_message, commit_hash=EXCLUDED.commit_hash,
            runtime_status=EXCLUDED.runtime_status, finished_at=EXCLUDED.finished_at",
            &[
                &rec.run_id,
                &rec.step_index,
                &rec.attempt,
                &rec.step_id,
                &step_type_str(rec.step_type),
                &rec.tool,
                &rec.input_payload,
                &rec.output_payload,
                &step_status_str(rec.status),
                &rec.error_message,
                &rec.commit_hash,
                &rec.runtime_status,
                &rec.started_at,
                &rec.finished_at,
                &rec.created_at,
            ],
        )
        .await?;
        Ok(())
    }

    /// Step records ordered by `(stepIndex, attempt, createdAt)`.
    pub async fn list_step_records(&self, run_id: &str) -> StoreResult<Vec<StepRecord>> {
        let rows = self
        .pg
        .query(
            "SELECT * FROM agent_steps WHERE run_id = $1
            ORDER BY step_index, attempt, created_at",
            &[&run_id],
        )
        .await?;
        rows.into_iter().map(row_to_step_record).collect()
    }

    pub async fn put_learning_event(&self, ev: &LearningEvent) -> StoreResult<()> {
        self.pg
        .execute(
            "INSERT INTO learning_events (
                run_id, project_id, step_index, event_type, phase, clusters,
                blocking_before, blocking_after, regression_flag, convergence_flag,
                architecture_collapse, invariant_count, metadata, outcome, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
            &[
                &ev.run_id,
                &ev.project_id,
                &ev.step_index,
                &ev.event_type,
                &ev.phase,
                &ev.clusters,
                &ev.blocking_before,
                &ev.blocking_after,
                &ev.regression_flag,
                &ev.convergence_flag,
                &ev.architecture_collapse,
                &ev.invariant_count,
                &ev.metadata,
                &learning_outcome_str(ev.outcome),
                &ev.created_at,
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn list_learning_events(&self, run_id: &str) -> StoreResult<Vec<LearningEvent>> {
        let rows = self
        .pg
        .query(
            "SELECT run_id, project_id, step_index, event_type, phase, clusters,
            blocking_before, blocking_after, regression_flag, convergence_flag,
            architecture_collapse, invariant_count, metadata, outcome, created_at
            FROM learning_events WHERE run_id = $1 ORDER BY step_index, created_at",
            &[&run_id],
        )
        .await?;
        rows.into_iter().map(row_to_learning_event).collect()
    }

    /// Most recent `limit` learning events across all runs, used by the
    /// correction classifier's regression/stall pressure heuristics.
    pub async fn recent_learning_events(&self, limit: i64) -> StoreResult<Vec<LearningEvent>> {
        let rows = self
        .pg
        .query(
            "SELECT run_id, project_id, step_index, event_type, phase, clusters,
            blocking_before, blocking_after, regression_flag, convergence_flag,
            architecture_collapse, invariant_count, metadata, outcome, created_at
            FROM learning_events ORDER BY created_at DESC LIMIT $1",
            &[&limit],
        )
        .await?;
        rows.into_iter().map(row_to_learning_event).collect()
    }

    pub async fn heartbeat_worker(
        &self,
        node_id: &str,
        role: WorkerRole,
        capabilities: &serde_json::Value,
    ) -> StoreResult<()> {
        self.pg
        .execute(
            "INSERT INTO worker_nodes (node_id, role, capabilities, last_heartbeat, status)
            VALUES ($1, $2, $3, $4, 'online')
            ON CONFLICT (node_id) DO UPDATE SET
            capabilities = EXCLUDED.capabilities,
            last_heartbeat = EXCLUDED.last_heartbeat,
            status = 'online'",
            &[&node_id, &worker_role_str(role), capabilities, &Utc::now()],
        )
        .await?;
        Ok(())
    }

    pub async fn mark_worker_offline(&self, node_id: &str) -> StoreResult<()> {
        self.pg
        .execute(
            "UPDATE worker_nodes SET status = 'offline' WHERE node_id = $1",
            &[&node_id],
        )
        .await?;
        Ok(())
    }

    pub async fn get_worker(&self, node_id: &str) -> StoreResult<Option<WorkerNode>> {
        let row = self
        .pg
        .query_opt("SELECT * FROM worker_nodes WHERE node_id = $1", &[&node_id])
        .await?;
        row.map(row_to_worker).transpose()
    }
}

fn step_type_str(t: StepType) -> &'static str {
    match t {
        StepType::Analyze => "analyze",
        StepType::Modify => "modify",
        StepType::Verify => "verify",
    }
}

fn parse_step_type(s: &str) -> StoreResult<StepType> {
    match s {
        "analyze" => Ok(StepType::Analyze),
        "modify" => Ok(StepType::Modify),
        "verify" => Ok(StepType::Verify),
        other => Err(StoreError::Decode {
                field: "step_type",
                detail: other.to_string(),
        }),
    }
}

fn step_status_str(s: StepStatus) -> &'static str {
    match s {
        StepStatus::Completed => "completed",
        StepStatus::Failed => "failed",
    }
}

fn parse_step_status(s: &str) -> StoreResult<StepStatus> {
    match s {
        "completed" => Ok(StepStatus::Completed),
        "failed" => Ok(StepStatus::Failed),
        other => Err(StoreError::Decode {
                field: "step_status",
                detail: other.to_string(),
        }),
    }
}

fn learning_outcome_str(o: LearningOutcome) -> &'static str {
    match o {
        LearningOutcome::Success => "success",
        LearningOutcome::Improved => "improved",
        LearningOutcome::Regressed => "regressed",
        LearningOutcome::Noop => "noop",
        LearningOutcome::Stalled => "stalled",
        LearningOutcome::ProvisionallyFixed => "provisionally_fixed",
        LearningOutcome::Failed => "failed",
    }
}

fn parse_learning_outcome(s: &str) -> StoreResult<LearningOutcome> {
    Ok(match s {
            "success" => LearningOutcome::Success,
            "improved" => LearningOutcome::Improved,
            "regressed" => LearningOutcome::Regressed,
            "noop" => LearningOutcome::Noop,
            "stalled" => LearningOutcome::Stalled,
            "provisionally_fixed" => LearningOutcome::ProvisionallyFixed,
            "failed" => LearningOutcome::Failed,
            other => {
                return Err(StoreError::Decode {
                        field: "learning_outcome",
                        detail: other.to_string(),
                })
            }
    })
}

pub(crate) fn worker_role_str(r: WorkerRole) -> &'static str {
    match r {
        WorkerRole::Compute => "compute",
        WorkerRole::Eval => "eval",
    }
}

fn parse_worker_role(s: &str) -> StoreResult<WorkerRole> {
    match s {
        "compute" => Ok(WorkerRole::Compute),
        "eval" => Ok(WorkerRole::Eval),
        other => Err(StoreError::Decode {
                field: "worker_role",
                detail: other.to_string(),
        }),
    }
}

pub(crate) fn parse_run_status(s: &str) -> StoreResult<RunStatus> {
    Ok(match s {
            "queued" => RunStatus::Queued,
            "running" => RunStatus::Running,
            "correcting" => RunStatus::Correcting,
            "optimizing" => RunStatus::Optimizing,
            "validating" => RunStatus::Validating,
            "cancelled" => RunStatus::Cancelled,
            "failed" => RunStatus::Failed,
            "complete" => RunStatus::Complete,
            other => {
                return Err(StoreError::Decode {
                        field: "run_status",
                        detail: other.to_string(),
                })
            }
    })
}

pub(crate) fn parse_job_status(s: &str) -> StoreResult<JobStatus> {
    Ok(match s {
            "queued" => JobStatus::Queued,
            "claimed" => JobStatus::Claimed,
            "running" => JobStatus::Running,
            "complete" => JobStatus::Complete,
            "failed" => JobStatus::Failed,
            other => {
                return Err(StoreError::Decode {
                        field: "job_status",
                        detail: other.to_string(),
                })
            }
    })
}

pub(crate) fn job_status_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Queued => "queued",
        JobStatus::Claimed => "claimed",
        JobStatus::Running => "running",
        JobStatus::Complete => "complete",
        JobStatus::Failed => "failed",
    }
}

pub(crate) fn parse_job_type(s: &str) -> StoreResult<JobType> {
    Ok(match s {
            "kernel" => JobType::Kernel,
            "validation" => JobType::Validation,
            "evaluation" => JobType::Evaluation,
            other => {
                return Err(StoreError::Decode {
                        field: "job_type",
                        detail: other.to_string(),
                })
            }
    })
}

pub(crate) fn job_type_str(t: JobType) -> &'static str {
    match t {
        JobType::Kernel => "kernel",
        JobType::Validation => "validation",
        JobType::Evaluation => "evaluation",
    }
}

pub(crate) fn parse_target_role(s: &str) -> StoreResult<TargetRole> {
    Ok(match s {
            "compute" => TargetRole::Compute,
            "eval" => TargetRole::Eval,
            other => {
                return Err(StoreError::Decode {
                        field: "target_role",
                        detail: other.to_string(),
                })
            }
    })
}

pub(crate) fn target_role_str(t: TargetRole) -> &'static str {
    match t {
        TargetRole::Compute => "compute",
        TargetRole::Eval => "eval",
    }
}

fn row_to_run(row: tokio_postgres::Row) -> StoreResult<AgentRun> {
    let status: String = row.try_get("status")?;
    let plan_json: serde_json::Value = row.try_get("plan")?;
    let plan: Vec<Step> = serde_json::from_value(plan_json)?;
    let validation_status: Option<String> = row.try_get("validation_status")?;
    let error_details_json: Option<serde_json::Value> = row.try_get("error_details")?;
    let error_details: Option<ErrorDetails> =
    error_details_json.map(serde_json::from_value).transpose()?;
    let worktree_path: Option<String> = row.try_get("worktree_path")?;

    Ok(AgentRun {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            org_id: row.try_get("org_id")?,
            workspace_id: row.try_get("workspace_id")?,
            created_by_user_id: row.try_get("created_by_user_id")?,
            goal: row.try_get("goal")?,
            provider_id: row.try_get("provider_id")?,
            model: row.try_get("model")?,
            status: parse_run_status(&status)?,
            plan,
            current_step_index: row.try_get("current_step_index")?,
            last_step_id: row.try_get("last_step_id")?,
            pointers: CommitPointers {
                run_branch: row.try_get("run_branch")?,
                worktree_path: worktree_path.map(std::path::PathBuf::from),
                base_commit_hash: row.try_get("base_commit_hash")?,
                current_commit_hash: row.try_get("current_commit_hash")?,
                last_valid_commit_hash: row.try_get("last_valid_commit_hash")?,
            },
            validation_status: validation_status
            .map(|s| match s.as_str() {
                    "passed" => Ok(ValidationStatus::Passed),
                    "failed" => Ok(ValidationStatus::Failed),
                    other => Err(StoreError::Decode {
                            field: "validation_status",
                            detail: other.to_string(),
                    }),
            })
            .transpose()?,
            validation_result: row.try_get("validation_result")?,
            validated_at: row.try_get("validated_at")?,
            correction_attempts: row.try_get("correction_attempts")?,
            last_correction_reason: row.try_get("last_correction_reason")?,
            run_lock_owner: row.try_get("run_lock_owner")?,
            run_lock_acquired_at: row.try_get("run_lock_acquired_at")?,
            metadata: row.try_get("metadata")?,
            error_message: row.try_get("error_message")?,
            error_details,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
    })
}

fn row_to_step_record(row: tokio_postgres::Row) -> StoreResult<StepRecord> {
    let step_type: String = row.try_get("step_type")?;
    let status: String = row.try_get("status")?;
    Ok(StepRecord {
            run_id: row.try_get("run_id")?,
            step_index: row.try_get("step_index")?,
            attempt: row.try_get("attempt")?,
            step_id: row.try_get("step_id")?,
            step_type: parse_step_type(&step_type)?,
            tool: row.try_get::<_, String>("tool")? as ToolId,
            input_payload: row.try_get("input_payload")?,
            output_payload: row.try_get("output_payload")?,
            status: parse_step_status(&status)?,
            error_message: row.try_get("error_message")?,
            commit_hash: row.try_get("commit_hash")?,
            runtime_status: row.try_get("runtime_status")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            created_at: row.try_get("created_at")?,
    })
}

fn row_to_learning_event(row: tokio_postgres::Row) -> StoreResult<LearningEvent> {
    let outcome: String = row.try_get("outcome")?;
    Ok(LearningEvent {
            run_id: row.try_get("run_id")?,
            project_id: row.try_get("project_id")?,
            step_index: row.try_get("step_index")?,
            event_type: row.try_get("event_type")?,
            phase: row.try_get("phase")?,
            clusters: row.try_get("clusters")?,
            blocking_before: row.try_get("blocking_before")?,
            blocking_after: row.try_get("blocking_after")?,
            regression_flag: row.try_get("regression_flag")?,
            convergence_flag: row.try_get("convergence_flag")?,
            architecture_collapse: row.try_get("architecture_collapse")?,
            invariant_count: row.try_get("invariant_count")?,
            metadata: row.try_get("metadata")?,
            outcome: parse_learning_outcome(&outcome)?,
            created_at: row.try_get("created_at")?,
    })
}

fn row_to_worker(row: tokio_postgres::Row) -> StoreResult<WorkerNode> {
    let role: String = row.try_get("role")?;
    let status: String = row.try_get("status")?;
    Ok(WorkerNode {
            node_id: row.try_get("node_id")?,
            role: parse_worker_role(&role)?,
            capabilities: row.try_get("capabilities")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            status: match status.as_str() {
                "online" => WorkerStatus::Online,
                "offline" => WorkerStatus::Offline,
                other => {
                    return Err(StoreError::Decode {
                            field: "worker_status",
                            detail: other.to_string(),
                    })
                }
            },
    })
}

/// Returns `Some(connection string)` when a test database is configured,
/// following the "best effort, skip if unreachable" posture for
/// inference endpoints (`config::check_endpoint`) rather than failing when
/// no database is present.
pub fn test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::new_id;

    fn sample_run() -> AgentRun {
        AgentRun {
            id: new_id(),
            project_id: "proj-1".into(),
            org_id: "org-1".into(),
            workspace_id: "ws-1".into(),
            created_by_user_id: "user-1".into(),
            goal: "add a readme".into(),
            provider_id: "test".into(),
            model: "test".into(),
            status: RunStatus::Queued,
            plan: vec![Step {
                    id: "step-1".into(),
                    step_type: StepType::Modify,
                    tool: "write_file".into(),
                    input: serde_json::json!({"path": "README.md"}),
                    correction: None,
            }],
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

    #[test]
    fn status_round_trips_through_string_form() {
        for s in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Correcting,
            RunStatus::Optimizing,
            RunStatus::Validating,
            RunStatus::Cancelled,
            RunStatus::Failed,
            RunStatus::Complete,
        ] {
            assert_eq!(parse_run_status(&s.to_string()).unwrap(), s);
        }
    }

    #[test]
    fn job_status_round_trips() {
        for s in [
            JobStatus::Queued,
            JobStatus::Claimed,
            JobStatus::Running,
            JobStatus::Complete,
            JobStatus::Failed,
        ] {
            assert_eq!(parse_job_status(job_status_str(s)).unwrap(), s);
        }
    }

    #[tokio::test]
    async fn put_and_get_run_round_trips() {
        let Some(url) = test_database_url() else {
            eprintln!("skipping: TEST_DATABASE_URL not set");
            return;
        };
        let store = RunStore::connect(&url).await.expect("connect");
        let run = sample_run();
        store.put_run(&run).await.expect("put_run");

        let fetched = store.get_run(&run.id).await.expect("get_run").expect("run exists");
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.status, RunStatus::Queued);
        assert_eq!(fetched.plan.len(), 1);
    }

    #[tokio::test]
    async fn run_lock_is_exclusive_until_stale_or_released() {
        let Some(url) = test_database_url() else {
            eprintln!("skipping: TEST_DATABASE_URL not set");
            return;
        };
        let store = RunStore::connect(&url).await.expect("connect");
        let run = sample_run();
        store.put_run(&run).await.expect("put_run");

        let acquired = store
        .try_acquire_run_lock(&run.id, "worker-1", 1800)
        .await
        .expect("acquire")
        .expect("lock granted");
        assert_eq!(acquired.run_lock_owner.as_deref(), Some("worker-1"));

        let contended = store
        .try_acquire_run_lock(&run.id, "worker-2", 1800)
        .await
        .expect("acquire attempt");
        assert!(contended.is_none(), "a fresh lock must not be stealable");

        let renewed = store
        .refresh_run_lock(&run.id, "worker-1")
        .await
        .expect("refresh")
        .expect("owner still holds the lock");
        assert!(renewed.run_lock_acquired_at.unwrap() >= acquired.run_lock_acquired_at.unwrap());

        let refresh_by_other = store.refresh_run_lock(&run.id, "worker-2").await.expect("refresh attempt");
        assert!(refresh_by_other.is_none(), "a non-owner must not be able to refresh the lock");

        let stolen = store
        .try_acquire_run_lock(&run.id, "worker-2", 0)
        .await
        .expect("acquire after staleness window collapses to zero")
        .expect("a zero-second staleness window makes the lock immediately reclaimable");
        assert_eq!(stolen.run_lock_owner.as_deref(), Some("worker-2"));

        let released = store
        .release_run_lock(&run.id, "worker-2")
        .await
        .expect("release")
        .expect("owner still holds the lock");
        assert!(released.run_lock_owner.is_none());

        let reacquired = store
        .try_acquire_run_lock(&run.id, "worker-1", 1800)
        .await
        .expect("acquire after release")
        .expect("lock granted");
        assert_eq!(reacquired.run_lock_owner.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn step_records_are_ordered_by_index_attempt_created() {
        let Some(url) = test_database_url() else {
            eprintln!("skipping: TEST_DATABASE_URL not set");
            return;
        };
        let store = RunStore::connect(&url).await.expect("connect");
        let run = sample_run();
        store.put_run(&run).await.expect("put_run");

        for (idx, attempt) in [(0, 1), (1, 1), (0, 2)] {
            let rec = StepRecord {
                run_id: run.id.clone(),
                step_index: idx,
                attempt,
                step_id: format!("step-{idx}"),
                step_type: StepType::Modify,
                tool: "write_file".into(),
                input_payload: serde_json::json!({}),
                output_payload: serde_json::json!({}),
                status: StepStatus::Completed,
                error_message: None,
                commit_hash: Some("abc123".into()),
                runtime_status: None,
                started_at: Utc::now(),
                finished_at: Some(Utc::now()),
                created_at: Utc::now(),
            };
            store.put_step_record(&rec).await.expect("put_step_record");
        }

        let records = store.list_step_records(&run.id).await.expect("list");
        assert_eq!(records.len(), 3);
        assert_eq!((records[0].step_index, records[0].attempt), (0, 1));
        assert_eq!((records[1].step_index, records[1].attempt), (0, 2));
        assert_eq!((records[2].step_index, records[2].attempt), (1, 1));
    }
}
