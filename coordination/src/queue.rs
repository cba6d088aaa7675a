//! Job Queue & Worker Dispatch — enqueues, claims and renews leases
//! for [`RunJob`]s against the shared Postgres connection.
//!

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::state::store::{
    job_status_str, job_type_str, parse_job_status, parse_job_type, parse_target_role,
    target_role_str, worker_role_str, SharedPg, StoreError,
};
use crate::state::types::{new_id, Id, JobStatus, JobType, RunJob, TargetRole, WorkerRole};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store decode error: {0}")]
    Store(#[from] StoreError),

    #[error("no job found with id {0}")]
    NotFound(Id),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Default job lease duration. A claimed-but-abandoned job (worker crash,
/// network partition) is reclaimable once `lease_expires_at` passes.
pub const DEFAULT_LEASE_SECONDS: i64 = 300;

pub struct JobQueue {
    pg: SharedPg,
}

impl JobQueue {
    pub fn new(pg: SharedPg) -> Self {
        Self { pg }
    }

    /// Enqueue a job for `run_id`. Idempotent: if an active job
    /// (queued/claimed/running) already exists for this run, returns it
    /// unchanged instead of violating `run_jobs_one_active_per_run`.
    pub async fn enqueue(
        &self,
        run_id: &str,
        job_type: JobType,
        target_role: TargetRole,
        required_capabilities: Option<serde_json::Value>,
    ) -> QueueResult<RunJob> {
        if let Some(existing) = self.active_job_for_run(run_id).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let id = new_id();
        let row = self
        .pg
        .query_one(
            "INSERT INTO run_jobs (
                id, run_id, job_type, target_role, status, required_capabilities,
                assigned_node, lease_expires_at, attempt_count, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,'queued',$5,NULL,NULL,0,$6,$6)
            RETURNING *",
            &[
                &id,
                &run_id,
                &job_type_str(job_type),
                &target_role_str(target_role),
                &required_capabilities,
                &now,
            ],
        )
        .await?;
        row_to_job(row).map_err(QueueError::Store)
    }

    async fn active_job_for_run(&self, run_id: &str) -> QueueResult<Option<RunJob>> {
        let row = self
        .pg
        .query_opt(
            "SELECT * FROM run_jobs
            WHERE run_id = $1 AND status IN ('queued', 'claimed', 'running')
            LIMIT 1",
            &[&run_id],
        )
        .await?;
        row.map(row_to_job).transpose().map_err(QueueError::Store)
    }

    /// Atomically claim the oldest queued job (or a claimed/running job
    /// whose lease has expired) matching `role` and whose
    /// `required_capabilities` (if any) are a subset of `capabilities`.
    ///
    /// The capability subset check happens in Rust, not SQL: capability
    /// sets are small, flat JSON objects and pushing the comparison into a
    /// `jsonb @>` predicate would silently stop matching the moment a
    /// worker advertises an unexpected leaf type. Fetching a small
    /// candidate batch and filtering here is cheap and keeps the match
    /// fully typed.
    pub async fn claim(
        &self,
        role: TargetRole,
        node_id: &str,
        capabilities: &serde_json::Value,
        lease_seconds: i64,
    ) -> QueueResult<Option<RunJob>> {
        let now = Utc::now();
        let candidates = self
        .pg
        .query(
            "SELECT * FROM run_jobs
            WHERE target_role = $1
            AND (status = 'queued' OR (status IN ('claimed', 'running') AND lease_expires_at < $2))
            ORDER BY created_at
            LIMIT 20
            FOR UPDATE SKIP LOCKED",
            &[&target_role_str(role), &now],
        )
        .await?;

        for row in candidates {
            let job = row_to_job(row).map_err(QueueError::Store)?;
            if !capabilities_satisfy(job.required_capabilities.as_ref(), capabilities) {
                continue;
            }

            let lease_expires_at = now + Duration::seconds(lease_seconds);
            let updated = self
            .pg
            .query_opt(
                "UPDATE run_jobs SET
                status = 'claimed', assigned_node = $2, lease_expires_at = $3,
                attempt_count = attempt_count + 1, updated_at = $4
                WHERE id = $1
                AND (status = 'queued' OR (status IN ('claimed', 'running') AND lease_expires_at < $4))
                RETURNING *",
                &[&job.id, &node_id, &lease_expires_at, &now],
            )
            .await?;
            if let Some(row) = updated {
                return row_to_job(row).map(Some).map_err(QueueError::Store);
            }
            // Another worker won the race between our SELECT and this UPDATE; try the next candidate.
        }
        Ok(None)
    }

    /// Transition a claimed job to running, refreshing its lease in the
    /// same statement and gating on `assigned_node` so a worker whose
    /// lease already expired (and was reclaimed by someone else) can't
    /// mark the job running out from under the new owner.
    pub async fn mark_running(&self, job_id: &str, node_id: &str, lease_seconds: i64) -> QueueResult<RunJob> {
        let now = Utc::now();
        let lease_expires_at = now + Duration::seconds(lease_seconds);
        let row = self
        .pg
        .query_opt(
            "UPDATE run_jobs SET status = 'running', lease_expires_at = $3, updated_at = $4
            WHERE id = $1 AND assigned_node = $2 AND status = 'claimed'
            RETURNING *",
            &[&job_id, &node_id, &lease_expires_at, &now],
        )
        .await?;
        match row {
            Some(row) => row_to_job(row).map_err(QueueError::Store),
            None => Err(QueueError::NotFound(job_id.to_string())),
        }
    }

    /// Extend a claimed job's lease without changing its status, called
    /// periodically by the owning worker while it executes.
    pub async fn renew_lease(&self, job_id: &str, lease_seconds: i64) -> QueueResult<RunJob> {
        let now = Utc::now();
        let lease_expires_at = now + Duration::seconds(lease_seconds);
        let row = self
        .pg
        .query_opt(
            "UPDATE run_jobs SET lease_expires_at = $2, updated_at = $3
            WHERE id = $1 AND status IN ('claimed', 'running')
            RETURNING *",
            &[&job_id, &lease_expires_at, &now],
        )
        .await?;
        match row {
            Some(row) => row_to_job(row).map_err(QueueError::Store),
            None => Err(QueueError::NotFound(job_id.to_string())),
        }
    }

    pub async fn complete(&self, job_id: &str) -> QueueResult<RunJob> {
        self.transition(job_id, "complete", None).await
    }

    pub async fn fail(&self, job_id: &str) -> QueueResult<RunJob> {
        self.transition(job_id, "failed", None).await
    }

    async fn transition(&self, job_id: &str, status: &str, node_id: Option<&str>) -> QueueResult<RunJob> {
        let now = Utc::now();
        let row = self
        .pg
        .query_opt(
            "UPDATE run_jobs SET status = $2, assigned_node = COALESCE($3, assigned_node), updated_at = $4
            WHERE id = $1
            RETURNING *",
            &[&job_id, &status, &node_id, &now],
        )
        .await?;
        match row {
            Some(row) => row_to_job(row).map_err(QueueError::Store),
            None => Err(QueueError::NotFound(job_id.to_string())),
        }
    }

    pub async fn get(&self, job_id: &str) -> QueueResult<Option<RunJob>> {
        let row = self.pg.query_opt("SELECT * FROM run_jobs WHERE id = $1", &[&job_id]).await?;
        row.map(row_to_job).transpose().map_err(QueueError::Store)
    }
}

/// `required` is a subset of `offered` iff every key in `required` is
/// present in `offered` with an equal value. `None`/non-object
/// `required` always matches.
fn capabilities_satisfy(required: Option<&serde_json::Value>, offered: &serde_json::Value) -> bool {
    let Some(required) = required else { return true };
    let Some(required_obj) = required.as_object() else { return true };
    let Some(offered_obj) = offered.as_object() else { return required_obj.is_empty() };
    required_obj.iter().all(|(k, v)| offered_obj.get(k) == Some(v))
}

fn row_to_job(row: tokio_postgres::Row) -> Result<RunJob, StoreError> {
    let job_type: String = row.try_get("job_type")?;
    let target_role: String = row.try_get("target_role")?;
    let status: String = row.try_get("status")?;
    Ok(RunJob {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            job_type: parse_job_type(&job_type)?,
            target_role: parse_target_role(&target_role)?,
            status: parse_job_status(&status)?,
            required_capabilities: row.try_get("required_capabilities")?,
            assigned_node: row.try_get("assigned_node")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            attempt_count: row.try_get("attempt_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
    })
}

/// Is `expires_at` in the past relative to `now`? Used by the worker
/// heartbeat loop to decide when to treat its own lease as lost and abort
/// the run (, lease expiry).
pub fn lease_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.map(|e| e < now).unwrap_or(false)
}

/// Role string used when a worker process registers its heartbeat; kept
/// alongside the queue module since claim/heartbeat are the two halves of
/// worker dispatch.
pub fn heartbeat_role_str(role: WorkerRole) -> &'static str {
    worker_role_str(role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::store::RunStore;
    use crate::state::store::test_database_url;
    use crate::state::types::{AgentRun, CommitPointers, RunStatus, Step, StepType};

    fn sample_run(id: &str) -> AgentRun {
        AgentRun {
            id: id.to_string(),
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
                    input: serde_json::json!({}),
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
    fn capabilities_subset_matches() {
        let required = serde_json::json!({"gpu": false});
        let offered = serde_json::json!({"gpu": false, "arch": "x86_64"});
        assert!(capabilities_satisfy(Some(&required), &offered));
    }

    #[test]
    fn capabilities_mismatch_blocks_claim() {
        let required = serde_json::json!({"gpu": true});
        let offered = serde_json::json!({"gpu": false});
        assert!(!capabilities_satisfy(Some(&required), &offered));
    }

    #[test]
    fn no_requirements_always_matches() {
        let offered = serde_json::json!({"gpu": false});
        assert!(capabilities_satisfy(None, &offered));
    }

    #[test]
    fn lease_expired_detects_past_deadline() {
        let now = Utc::now();
        assert!(lease_expired(Some(now - Duration::seconds(1)), now));
        assert!(!lease_expired(Some(now + Duration::seconds(60)), now));
        assert!(!lease_expired(None, now));
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_while_active() {
        let Some(url) = test_database_url() else {
            eprintln!("skipping: TEST_DATABASE_URL not set");
            return;
        };
        let store = RunStore::connect(&url).await.expect("connect");
        let run = sample_run(&new_id());
        store.put_run(&run).await.expect("put_run");

        let queue = JobQueue::new(store.pg());
        let first = queue.enqueue(&run.id, JobType::Kernel, TargetRole::Compute, None).await.expect("enqueue");
        let second = queue.enqueue(&run.id, JobType::Kernel, TargetRole::Compute, None).await.expect("enqueue");
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn claim_respects_role_and_marks_claimed() {
        let Some(url) = test_database_url() else {
            eprintln!("skipping: TEST_DATABASE_URL not set");
            return;
        };
        let store = RunStore::connect(&url).await.expect("connect");
        let run = sample_run(&new_id());
        store.put_run(&run).await.expect("put_run");

        let queue = JobQueue::new(store.pg());
        queue.enqueue(&run.id, JobType::Kernel, TargetRole::Compute, None).await.expect("enqueue");

        let claimed = queue
        .claim(TargetRole::Compute, "node-1", &serde_json::json!({}), DEFAULT_LEASE_SECONDS)
        .await
        .expect("claim")
        .expect("a job was claimed");
        assert_eq!(claimed.status, JobStatus::Claimed);
        assert_eq!(claimed.assigned_node.as_deref(), Some("node-1"));

        let none_left = queue
        .claim(TargetRole::Compute, "node-2", &serde_json::json!({}), DEFAULT_LEASE_SECONDS)
        .await
        .expect("claim");
        assert!(none_left.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let Some(url) = test_database_url() else {
            eprintln!("skipping: TEST_DATABASE_URL not set");
            return;
        };
        let store = RunStore::connect(&url).await.expect("connect");
        let run = sample_run(&new_id());
        store.put_run(&run).await.expect("put_run");

        let queue = JobQueue::new(store.pg());
        queue.enqueue(&run.id, JobType::Kernel, TargetRole::Compute, None).await.expect("enqueue");
        queue.claim(TargetRole::Compute, "node-1", &serde_json::json!({}), -1).await.expect("claim");

        let reclaimed = queue
        .claim(TargetRole::Compute, "node-2", &serde_json::json!({}), DEFAULT_LEASE_SECONDS)
        .await
        .expect("claim")
        .expect("the expired-lease job is reclaimable");
        assert_eq!(reclaimed.assigned_node.as_deref(), Some("node-2"));
    }

    #[tokio::test]
    async fn mark_running_rejects_a_node_that_no_longer_owns_the_lease() {
        let Some(url) = test_database_url() else {
            eprintln!("skipping: TEST_DATABASE_URL not set");
            return;
        };
        let store = RunStore::connect(&url).await.expect("connect");
        let run = sample_run(&new_id());
        store.put_run(&run).await.expect("put_run");

        let queue = JobQueue::new(store.pg());
        let claimed = queue
        .enqueue(&run.id, JobType::Kernel, TargetRole::Compute, None)
        .await
        .expect("enqueue");
        queue
        .claim(TargetRole::Compute, "node-1", &serde_json::json!({}), -1)
        .await
        .expect("claim");

        // node-1's lease already expired; node-2 reclaims it.
        queue
        .claim(TargetRole::Compute, "node-2", &serde_json::json!({}), DEFAULT_LEASE_SECONDS)
        .await
        .expect("claim")
        .expect("reclaimed by node-2");

        // The evicted node-1 can no longer mark the job running.
        let err = queue.mark_running(&claimed.id, "node-1", DEFAULT_LEASE_SECONDS).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));

        let ok = queue.mark_running(&claimed.id, "node-2", DEFAULT_LEASE_SECONDS).await.expect("node-2 owns it");
        assert_eq!(ok.status, JobStatus::Running);
    }
}
