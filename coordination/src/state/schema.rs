//! SQL DDL for the Run Store's relational schema.
//!
//! Tables own the subset of relational schema this core is
//! responsible for (`agent_runs`, `agent_steps`, `run_jobs`,
//! `worker_nodes`, `learning_events`); `org_id`/`workspace_id`/
//! `created_by_user_id` are opaque foreign-key-shaped columns since
//! organization/workspace/user CRUD is an explicit non-goal.
//!
//! `CREATE TABLE IF NOT EXISTS` makes this idempotent so [`super::store::RunStore::connect`]
//! can simply re-issue it on every startup, the way the RocksDB store used
//! to declare its column families up front.

/// Issued once per connection; safe to re-run.
pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS agent_runs (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    org_id TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    created_by_user_id TEXT NOT NULL,
    goal TEXT NOT NULL,
    provider_id TEXT NOT NULL,
    model TEXT NOT NULL,
    status TEXT NOT NULL,
    plan JSONB NOT NULL DEFAULT '[]',
    current_step_index INTEGER NOT NULL DEFAULT 0,
    last_step_id TEXT,
    run_branch TEXT,
    worktree_path TEXT,
    base_commit_hash TEXT,
    current_commit_hash TEXT,
    last_valid_commit_hash TEXT,
    validation_status TEXT,
    validation_result JSONB,
    validated_at TIMESTAMPTZ,
    correction_attempts INTEGER NOT NULL DEFAULT 0,
    last_correction_reason TEXT,
    run_lock_owner TEXT,
    run_lock_acquired_at TIMESTAMPTZ,
    metadata JSONB NOT NULL DEFAULT '{}',
    error_message TEXT,
    error_details JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    finished_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS agent_steps (
    run_id TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    attempt INTEGER NOT NULL,
    step_id TEXT NOT NULL,
    step_type TEXT NOT NULL,
    tool TEXT NOT NULL,
    input_payload JSONB NOT NULL DEFAULT '{}',
    output_payload JSONB NOT NULL DEFAULT '{}',
    status TEXT NOT NULL,
    error_message TEXT,
    commit_hash TEXT,
    runtime_status TEXT,
    started_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (run_id, step_index, attempt)
);

CREATE TABLE IF NOT EXISTS run_jobs (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    job_type TEXT NOT NULL,
    target_role TEXT NOT NULL,
    status TEXT NOT NULL,
    required_capabilities JSONB,
    assigned_node TEXT,
    lease_expires_at TIMESTAMPTZ,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- at most one active job per run.
CREATE UNIQUE INDEX IF NOT EXISTS run_jobs_one_active_per_run
ON run_jobs (run_id)
WHERE status IN ('queued', 'claimed', 'running');

CREATE TABLE IF NOT EXISTS worker_nodes (
    node_id TEXT PRIMARY KEY,
    role TEXT NOT NULL,
    capabilities JSONB NOT NULL DEFAULT '{}',
    last_heartbeat TIMESTAMPTZ NOT NULL,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS learning_events (
    id BIGSERIAL PRIMARY KEY,
    run_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    phase TEXT NOT NULL,
    clusters JSONB NOT NULL DEFAULT '[]',
    blocking_before INTEGER NOT NULL,
    blocking_after INTEGER NOT NULL,
    regression_flag BOOLEAN NOT NULL,
    convergence_flag BOOLEAN NOT NULL,
    architecture_collapse BOOLEAN NOT NULL DEFAULT false,
    invariant_count INTEGER NOT NULL DEFAULT 0,
    metadata JSONB NOT NULL DEFAULT '{}',
    outcome TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS learning_events_run_order
ON learning_events (run_id, step_index, created_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_declares_every_owned_table() {
        for table in [
            "agent_runs",
            "agent_steps",
            "run_jobs",
            "worker_nodes",
            "learning_events",
        ] {
            assert!(DDL.contains(table), "DDL missing table {table}");
        }
    }

    #[test]
    fn ddl_declares_one_active_job_index() {
        assert!(DDL.contains("run_jobs_one_active_per_run"));
        assert!(DDL.contains("'queued', 'claimed', 'running'"));
    }
}
