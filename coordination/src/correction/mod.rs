//! Correction Classifier & Policy — turns a failure signal into a
//! bounded, constrained retry plan, enforces that plan's compliance once
//! the correction step runs, and (for the two deterministic failure
//! shapes the step types name) runs the fix itself without a planner round
//! trip.
//!

pub mod classifier;
pub mod policy;
pub mod recipes;

pub use classifier::{
    classify, ClassifierCaps, ClassifierInput, CorrectionConstraint, CorrectionIntent,
    CorrectionPhase,
};
pub use policy::{evaluate, CorrectionAttempt, CorrectionPolicyRecord, PolicyMode, PolicyViolation};
pub use recipes::{
    is_debt_paid_down, is_stub_content, parse_import_bindings, render_debt_resolution_module,
    resolve_module, rewrite_import_specifier, run_import_resolution_recipe, ImportBindings,
    ImportResolutionOutcome, RecipePhase, StubDebtRecord, StubDebtStatus, StubExportsSummary,
};
