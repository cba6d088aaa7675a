//! Core types for the run lifecycle engine's persistent state.
//!
//! These types are stored in Postgres (see [`super::store`]) and represent
//! the durable state of a code-mutation run: the project it targets, the
//! run itself with its plan and version-control pointers, individual step
//! executions, the job queue entry that dispatches it to a worker, worker
//! node registration, and the learning-telemetry trail left behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Opaque 128-bit identifier, rendered as canonical 36-character hyphenated form.
pub type Id = String;

pub fn new_id() -> Id {
    uuid::Uuid::new_v4().to_string()
}

/// A project: the unit that owns a workspace root directory on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Id,
    pub org_id: Id,
    pub workspace_id: Id,
    /// e.g. "canonical-backend", "agent-workflow"
    pub template: String,
    pub history: Vec<String>,
}

impl Project {
    /// `<root>/<orgId>/<workspaceId>/<projectId>`
    pub fn root_dir(&self, workspace_root: &std::path::Path) -> PathBuf {
        workspace_root
        .join(&self.org_id)
        .join(&self.workspace_id)
        .join(&self.id)
    }
}

/// Top-level run status. See for the full transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Correcting,
    Optimizing,
    Validating,
    Cancelled,
    Failed,
    Complete,
}

impl RunStatus {
    /// `executing = {queued, running, correcting, optimizing, validating}`.
    pub fn is_executing(self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Running | Self::Correcting | Self::Optimizing | Self::Validating
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Complete)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Correcting => "correcting",
            Self::Optimizing => "optimizing",
            Self::Validating => "validating",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

/// Plan step kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Analyze,
    Modify,
    Verify,
}

/// A tool identifier. Kept as a string (the set of tools is a pluggable
/// surface outside this core), but a few well-known names drive `mutates`
/// and runtime-verify detection.
pub type ToolId = String;

pub const TOOL_WRITE_FILE: &str = "write_file";
pub const TOOL_APPLY_PATCH: &str = "apply_patch";
pub const TOOL_AI_MUTATION: &str = "ai_mutation";
pub const TOOL_RUN_PREVIEW_CONTAINER: &str = "run_preview_container";

/// Embedded reasoning record carried by correction steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionReasoning {
    pub phase: String,
    pub attempt: u32,
    pub failed_step_id: String,
    pub classification: String,
    pub constraint: serde_json::Value,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// A plan element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Stable string id. Correction steps are prefixed
    /// `runtime-correction-` or `validation-correction-` (see [`Step::is_correction`]).
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub tool: ToolId,
    pub input: serde_json::Value,
    pub correction: Option<CorrectionReasoning>,
}

impl Step {
    /// `mutates` capability: true iff type=modify or tool is one of the
    /// mutating tool kinds.
    pub fn mutates(&self) -> bool {
        self.step_type == StepType::Modify
        || matches!(
            self.tool.as_str(),
            TOOL_WRITE_FILE | TOOL_APPLY_PATCH | TOOL_AI_MUTATION
        )
    }

    pub fn is_correction(&self) -> bool {
        self.id.starts_with("runtime-correction-") || self.id.starts_with("validation-correction-")
    }

    pub fn is_runtime_verify(&self) -> bool {
        self.step_type == StepType::Verify && self.tool == TOOL_RUN_PREVIEW_CONTAINER
    }
}

/// A single proposed file mutation returned by a mutating step's tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ProposedChange {
    Create { path: String, content: String },
    Update { path: String, content: String },
    Delete { path: String },
}

impl ProposedChange {
    pub fn path(&self) -> &str {
        match self {
            Self::Create { path,.. } | Self::Update { path,.. } | Self::Delete { path } => path,
        }
    }
}

/// Execution status of a completed/failed step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// Append-only execution artifact for one (run, stepIndex, attempt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: Id,
    pub step_index: i32,
    /// Monotonic within the (run_id, step_index) pair.
    pub attempt: i32,
    pub step_id: String,
    pub step_type: StepType,
    pub tool: ToolId,
    pub input_payload: serde_json::Value,
    pub output_payload: serde_json::Value,
    pub status: StepStatus,
    pub error_message: Option<String>,
    pub commit_hash: Option<String>,
    pub runtime_status: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Structured, versioned error detail attached to a terminal run failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub version: u32,
    pub source: String,
    pub category: ErrorCategory,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub planner_error: Option<String>,
}

impl ErrorDetails {
    pub fn new(category: ErrorCategory) -> Self {
        Self {
            version: 1,
            source: "agent_kernel".to_string(),
            category,
            context: HashMap::new(),
            planner_error: None,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// The stable taxonomy of structured error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    StepTransaction,
    StepExecution,
    RuntimeVerification,
    HeavyValidation,
    HeavyValidationExecution,
    CorrectionPolicy,
    RuntimeCorrectionLimit,
    HeavyValidationCorrectionLimit,
    RuntimeCorrectionConvergence,
    HeavyValidationConvergence,
    ExecutionLockLost,
    ContractMismatch,
    UnsupportedContract,
    InvariantViolation,
}

/// Version-control pointer set carried by every run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommitPointers {
    pub run_branch: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub base_commit_hash: Option<String>,
    pub current_commit_hash: Option<String>,
    pub last_valid_commit_hash: Option<String>,
}

/// Validation verdict snapshot attached to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Passed,
    Failed,
}

/// The central entity: a single agent-driven code-mutation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: Id,
    pub project_id: Id,
    pub org_id: Id,
    pub workspace_id: Id,
    pub created_by_user_id: Id,
    pub goal: String,
    pub provider_id: String,
    pub model: String,

    pub status: RunStatus,

    pub plan: Vec<Step>,
    pub current_step_index: i32,
    pub last_step_id: Option<String>,

    pub pointers: CommitPointers,

    pub validation_status: Option<ValidationStatus>,
    pub validation_result: Option<serde_json::Value>,
    pub validated_at: Option<DateTime<Utc>>,

    pub correction_attempts: i32,
    pub last_correction_reason: Option<String>,

    pub run_lock_owner: Option<String>,
    pub run_lock_acquired_at: Option<DateTime<Utc>>,

    /// Opaque metadata record containing the normalized execution contract.
    pub metadata: serde_json::Value,

    pub error_message: Option<String>,
    pub error_details: Option<ErrorDetails>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub const MAX_VALIDATION_AUTO_CORRECTIONS: i32 = 2;
pub const MAX_INVARIANT_RETRIES_PER_ATTEMPT: i32 = 3;

impl AgentRun {
    pub fn run_branch_name(&self) -> String {
        format!("run/{}", self.id)
    }
}

/// Job kind dispatched through the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Kernel,
    Validation,
    Evaluation,
}

/// Which worker role a job targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRole {
    Compute,
    Eval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Claimed,
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Claimed | Self::Running)
    }
}

/// A queued/claimed/leased unit of work dispatching a run to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJob {
    pub id: Id,
    pub run_id: Id,
    pub job_type: JobType,
    pub target_role: TargetRole,
    pub status: JobStatus,
    /// JSON-object subset matched against worker capabilities; `None` means
    /// no requirements.
    pub required_capabilities: Option<serde_json::Value>,
    pub assigned_node: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Compute,
    Eval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Offline,
}

/// A registered worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
    pub node_id: String,
    /// Immutable after registration.
    pub role: WorkerRole,
    pub capabilities: serde_json::Value,
    pub last_heartbeat: DateTime<Utc>,
    pub status: WorkerStatus,
}

/// Outcome classification for a learning-telemetry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningOutcome {
    Success,
    Improved,
    Regressed,
    Noop,
    Stalled,
    ProvisionallyFixed,
    Failed,
}

/// One append-only learning_events row, written for every correction attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEvent {
    pub run_id: Id,
    pub project_id: Id,
    pub step_index: i32,
    pub event_type: String,
    pub phase: String,
    pub clusters: serde_json::Value,
    pub blocking_before: i32,
    pub blocking_after: i32,
    pub regression_flag: bool,
    pub convergence_flag: bool,
    pub architecture_collapse: bool,
    pub invariant_count: i32,
    pub metadata: serde_json::Value,
    pub outcome: LearningOutcome,
    pub created_at: DateTime<Utc>,
}

impl LearningEvent {
    /// `delta = blockingBefore − blockingAfter`, `convergenceFlag ⇔ blockingAfter = 0`,
    /// `regressionFlag ⇔ blockingAfter > blockingBefore` — invariants.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: Id,
        project_id: Id,
        step_index: i32,
        event_type: impl Into<String>,
        phase: impl Into<String>,
        clusters: serde_json::Value,
        blocking_before: i32,
        blocking_after: i32,
        architecture_collapse: bool,
        invariant_count: i32,
        metadata: serde_json::Value,
        outcome: LearningOutcome,
    ) -> Self {
        Self {
            run_id,
            project_id,
            step_index,
            event_type: event_type.into(),
            phase: phase.into(),
            clusters,
            blocking_before,
            blocking_after,
            regression_flag: blocking_after > blocking_before,
            convergence_flag: blocking_after == 0,
            architecture_collapse,
            invariant_count,
            metadata,
            outcome,
            created_at: Utc::now(),
        }
    }

    pub fn delta(&self) -> i32 {
        self.blocking_before - self.blocking_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_branch_name_matches_convention() {
        let run = test_run();
        assert_eq!(run.run_branch_name(), format!("run/{}", run.id));
    }

    #[test]
    fn step_mutates_detection() {
        let analyze = Step {
            id: "s1".into(),
            step_type: StepType::Analyze,
            tool: "read_file".into(),
            input: serde_json::json!({}),
            correction: None,
        };
        assert!(!analyze.mutates());

        let modify = Step {
            id: "s2".into(),
            step_type: StepType::Modify,
            tool: "write_file".into(),
            input: serde_json::json!({}),
            correction: None,
        };
        assert!(modify.mutates());

        let ai_mutation = Step {
            id: "s3".into(),
            step_type: StepType::Verify,
            tool: TOOL_AI_MUTATION.into(),
            input: serde_json::json!({}),
            correction: None,
        };
        assert!(ai_mutation.mutates());
    }

    #[test]
    fn correction_step_id_prefixes() {
        let step = Step {
            id: "runtime-correction-1".into(),
            step_type: StepType::Modify,
            tool: TOOL_WRITE_FILE.into(),
            input: serde_json::json!({}),
            correction: None,
        };
        assert!(step.is_correction());

        let step = Step {
            id: "validation-correction-1".into(),
            step_type: StepType::Modify,
            tool: TOOL_WRITE_FILE.into(),
            input: serde_json::json!({}),
            correction: None,
        };
        assert!(step.is_correction());

        let step = Step {
            id: "step-1".into(),
            step_type: StepType::Modify,
            tool: TOOL_WRITE_FILE.into(),
            input: serde_json::json!({}),
            correction: None,
        };
        assert!(!step.is_correction());
    }

    #[test]
    fn learning_event_delta_and_flags() {
        let ev = LearningEvent::new(
            "run-1".into(),
            "proj-1".into(),
            0,
            "validation",
            "goal",
            serde_json::json!([]),
            5,
            2,
            false,
            0,
            serde_json::json!({}),
            LearningOutcome::Improved,
        );
        assert_eq!(ev.delta(), 3);
        assert!(!ev.convergence_flag);
        assert!(!ev.regression_flag);

        let ev2 = LearningEvent::new(
            "run-1".into(),
            "proj-1".into(),
            0,
            "validation",
            "goal",
            serde_json::json!([]),
            0,
            0,
            false,
            0,
            serde_json::json!({}),
            LearningOutcome::Success,
        );
        assert!(ev2.convergence_flag);
        assert!(!ev2.regression_flag);
    }

    fn test_run() -> AgentRun {
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
            created_at: Utc::now(),
            updated_at: Utc::now(),
            finished_at: None,
        }
    }
}
