//! Worker-side execution primitives for the agent-driven code-mutation
//! orchestrator: version control, staged file mutation, and (once built)
//! the run lifecycle engine that drives a run from queued to terminal.
//!
//! Domain and persistence types live in the `coordination` crate; this
//! crate is the process that actually touches the filesystem and `git`.

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod file_session;
pub mod vcs;

pub use engine::{
    seal_execution_contract, DefaultToolExecutor, EngineError, EngineResult, HeavyValidator,
    InvariantGuard, LightValidationVerdict, LightValidator, RunEngine, StepOutcome, ToolExecutor,
};
