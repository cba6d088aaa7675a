//! Domain and persistence layer for the agent-driven code-mutation
//! orchestrator: the run/step/job/worker/learning-event store, the
//! versioned execution contract, the correction classifier/policy/recipe
//! system, validation-failure cluster interpretation, the job queue, the
//! learning telemetry ledger, and the planner facade.
//!
//! This is a library crate with no process entrypoint. The worker process
//! that actually touches the filesystem and `git` lives in the `agent-core`
//! crate, driving a run through this crate's types.

pub mod correction;
pub mod planner;
pub mod queue;
pub mod state;
pub mod telemetry;
pub mod verifier;

pub use correction::{
    classify, evaluate, is_debt_paid_down, is_stub_content, parse_import_bindings,
    render_debt_resolution_module, resolve_module, rewrite_import_specifier,
    run_import_resolution_recipe, ClassifierCaps, ClassifierInput, CorrectionAttempt,
    CorrectionConstraint, CorrectionIntent, CorrectionPhase, CorrectionPolicyRecord,
    ImportBindings, ImportResolutionOutcome, PolicyMode, PolicyViolation, RecipePhase,
    StubDebtRecord, StubDebtStatus, StubExportsSummary,
};
pub use planner::{
    extract_json_block, parse_correction_response, parse_plan_response, CorrectionRequest,
    CorrectionResponse, NullPlanner, Planner, PlanRequest, PlanResponse, PlannerError,
};
pub use queue::{heartbeat_role_str, lease_expired, JobQueue, QueueError, QueueResult, DEFAULT_LEASE_SECONDS};
pub use state::{
    build_contract, connect, evaluate_support, hash_config, resolve, verify_stored_hash, AgentRun,
    CommitPointers, ContractError, ContractMaterial, CorrectionReasoning, ErrorCategory,
    ErrorDetails, ExecutionConfig, ExecutionContract, Id, JobStatus, JobType, LearningEvent,
    LearningOutcome, Project, ProposedChange, ResolveOptions, ResolveOutcome, RunJob, RunStatus,
    RunStore, SharedPg, Step, StepRecord, StepStatus, StepType, StoreError, StoreResult,
    SupportVerdict, TargetRole, ToolId, ValidationStatus, WorkerNode, WorkerRole, WorkerStatus,
};
pub use telemetry::{classify_outcome, AttemptPhase, LearningTelemetry, TelemetryError};
pub use verifier::{
    extract_import_signal, extract_ts_code, interpret, CheckResult, Cluster, ClusterType,
    HeavyValidationVerdict, ImportSignal, RawFailure, ValidationProfile,
};
