//! Run Store and Execution Contract — persistent state for the
//! run lifecycle engine.
//!
//! Persistence is Postgres-backed (`tokio_postgres`): the run's concurrency
//! model needs a unique partial index ("at most one active job per run")
//! and `SELECT ... FOR UPDATE SKIP LOCKED` claim semantics. Each entity
//! gets its own table with a `put_x`/`get_x`/`list_x` accessor set.
//!
//! # Usage
//!
//! ```ignore
//! use coordination::state::{RunStore, types::AgentRun};
//!
//! let store = RunStore::connect(&database_url).await?;
//! store.put_run(&run).await?;
//! let fetched = store.get_run(&run.id).await?;
//! ```

pub mod contract;
pub mod schema;
pub mod store;
pub mod types;

pub use contract::{
    build_contract, evaluate_support, hash_config, resolve, verify_stored_hash, ContractError,
    ContractMaterial, ExecutionConfig, ExecutionContract, ResolveOptions, ResolveOutcome,
    SupportVerdict,
};
pub use store::{connect, RunStore, SharedPg, StoreError, StoreResult};
pub use types::{
    AgentRun, CommitPointers, CorrectionReasoning, ErrorCategory, ErrorDetails, Id, JobStatus,
    JobType, LearningEvent, LearningOutcome, Project, ProposedChange, RunJob, RunStatus, Step,
    StepRecord, StepStatus, StepType, TargetRole, ToolId, ValidationStatus, WorkerNode,
    WorkerRole, WorkerStatus,
};
