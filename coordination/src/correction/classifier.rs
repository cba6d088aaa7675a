//! Correction Classifier — maps a failure signal
//! into an intent and a bounded constraint.
//!

use serde::{Deserialize, Serialize};

use crate::verifier::interpreter::{ClusterType, ValidationProfile};

/// Which correction run phase produced this classification; drives the
/// step-id prefix the caller assigns (`runtime-correction-` vs
/// `validation-correction-`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionPhase {
    Goal,
    Optimization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionIntent {
    RuntimeBoot,
    RuntimeHealth,
    TypescriptCompile,
    TestFailure,
    MigrationFailure,
    ArchitectureViolation,
    SecurityBaseline,
    Unknown,
}

impl std::fmt::Display for CorrectionIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RuntimeBoot => "runtime_boot",
            Self::RuntimeHealth => "runtime_health",
            Self::TypescriptCompile => "typescript_compile",
            Self::TestFailure => "test_failure",
            Self::MigrationFailure => "migration_failure",
            Self::ArchitectureViolation => "architecture_violation",
            Self::SecurityBaseline => "security_baseline",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Hard caps the classifier's constraint may never exceed, sealed into the
/// execution contract (file-session limits).
#[derive(Debug, Clone, Copy)]
pub struct ClassifierCaps {
    pub max_files_cap: u32,
    pub max_total_diff_bytes_cap: u64,
}

/// `{ intent, maxFiles (<=cap), maxTotalDiffBytes (<=cap),
/// allowedPathPrefixes[], guidance[] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionConstraint {
    pub intent: CorrectionIntent,
    pub max_files: u32,
    pub max_total_diff_bytes: u64,
    pub allowed_path_prefixes: Vec<String>,
    pub guidance: Vec<String>,
}

/// Input to the classifier: phase, the failing step, attempt number,
/// runtime logs (if the failure came from a runtime verify), and an
/// optional parsed validator profile (if the failure came from heavy
/// validation).
#[derive(Debug, Clone)]
pub struct ClassifierInput<'a> {
    pub phase: CorrectionPhase,
    pub failed_step_id: &'a str,
    pub attempt: u32,
    pub runtime_logs: Option<&'a str>,
    pub validation_profile: Option<&'a ValidationProfile>,
}

fn dominant_cluster_type(profile: &ValidationProfile) -> Option<ClusterType> {
    profile.clusters.iter().max_by_key(|c| c.count).map(|c| c.cluster_type)
}

fn intent_from_cluster(cluster_type: ClusterType) -> CorrectionIntent {
    match cluster_type {
        ClusterType::TypecheckFailure => CorrectionIntent::TypescriptCompile,
        ClusterType::BuildFailure => CorrectionIntent::TypescriptCompile,
        ClusterType::TestFailure => CorrectionIntent::TestFailure,
        ClusterType::TestContractGap => CorrectionIntent::TestFailure,
        ClusterType::ImportResolutionError => CorrectionIntent::TypescriptCompile,
        ClusterType::LayerBoundaryViolation => CorrectionIntent::ArchitectureViolation,
        ClusterType::ArchitectureContract => CorrectionIntent::ArchitectureViolation,
    }
}

fn intent_from_runtime_logs(logs: &str) -> CorrectionIntent {
    let lower = logs.to_lowercase();
    if lower.contains("eaddrinuse") || lower.contains("bind") || lower.contains("port") {
        CorrectionIntent::RuntimeBoot
    } else if lower.contains("migration") {
        CorrectionIntent::MigrationFailure
    } else if lower.contains("cve") || lower.contains("vulnerab") || lower.contains("security") {
        CorrectionIntent::SecurityBaseline
    } else if lower.contains("healthcheck") || lower.contains("health check") || lower.contains("unhealthy") {
        CorrectionIntent::RuntimeHealth
    } else {
        CorrectionIntent::RuntimeBoot
    }
}

/// Classify a failure into an intent + bounded constraint.
/// `allowedPathPrefixes` narrows to files implicated by the failure when
/// derivable; falls back to the whole project (`""`) when the signal
/// carries no file provenance (e.g. a bare runtime boot failure).
pub fn classify(input: &ClassifierInput<'_>, caps: ClassifierCaps) -> CorrectionConstraint {
    let (intent, implicated_files): (CorrectionIntent, Vec<String>) = match input.validation_profile {
        Some(profile) => {
            let cluster_type = dominant_cluster_type(profile).unwrap_or(ClusterType::TypecheckFailure);
            let intent = intent_from_cluster(cluster_type);
            let files = profile
            .clusters
            .iter()
            .find(|c| c.cluster_type == cluster_type)
            .map(|c| c.files.clone())
            .unwrap_or_default();
            (intent, files)
        }
        None => {
            let logs = input.runtime_logs.unwrap_or_default();
            (intent_from_runtime_logs(logs), Vec::new())
        }
    };

    // Constraint tightens with attempt number: later attempts get a
    // narrower blast radius, never a wider one.
    let attempt_factor = 1.0 / (1.0 + (input.attempt.saturating_sub(1)) as f64 * 0.5);
    let max_files = ((caps.max_files_cap as f64 * attempt_factor).round() as u32).clamp(1, caps.max_files_cap);
    let max_total_diff_bytes = ((caps.max_total_diff_bytes_cap as f64 * attempt_factor) as u64)
    .clamp(1, caps.max_total_diff_bytes_cap);

    let allowed_path_prefixes = if implicated_files.is_empty() {
        vec![String::new()]
    } else {
        implicated_files
    };

    let guidance = vec![format!(
            "fix the {} failure on step {} (attempt {}) without touching files outside the listed prefixes",
            intent, input.failed_step_id, input.attempt
    )];

    CorrectionConstraint {
        intent,
        max_files,
        max_total_diff_bytes,
        allowed_path_prefixes,
        guidance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::interpreter::Cluster;

    fn caps() -> ClassifierCaps {
        ClassifierCaps { max_files_cap: 8, max_total_diff_bytes_cap: 100_000 }
    }

    #[test]
    fn runtime_boot_detected_from_eaddrinuse() {
        let input = ClassifierInput {
            phase: CorrectionPhase::Goal,
            failed_step_id: "step-1",
            attempt: 1,
            runtime_logs: Some("Error: listen EADDRINUSE: address already in use"),
            validation_profile: None,
        };
        let constraint = classify(&input, caps());
        assert_eq!(constraint.intent, CorrectionIntent::RuntimeBoot);
    }

    #[test]
    fn typescript_compile_detected_from_typecheck_cluster() {
        let profile = ValidationProfile {
            clusters: vec![Cluster {
                    cluster_type: ClusterType::TypecheckFailure,
                    files: vec!["src/a.ts".into()],
                    imports: vec![],
                    summary: "1 failure".into(),
                    count: 1,
            }],
            blocking_count: 1,
            architecture_collapse: false,
            architecture_modules: vec![],
            planner_mode_override: None,
            should_auto_correct: true,
            reason: "blocking".into(),
        };
        let input = ClassifierInput {
            phase: CorrectionPhase::Goal,
            failed_step_id: "step-2",
            attempt: 1,
            runtime_logs: None,
            validation_profile: Some(&profile),
        };
        let constraint = classify(&input, caps());
        assert_eq!(constraint.intent, CorrectionIntent::TypescriptCompile);
        assert_eq!(constraint.allowed_path_prefixes, vec!["src/a.ts".to_string()]);
    }

    #[test]
    fn constraint_never_exceeds_caps() {
        let input = ClassifierInput {
            phase: CorrectionPhase::Goal,
            failed_step_id: "step-1",
            attempt: 1,
            runtime_logs: Some(""),
            validation_profile: None,
        };
        let constraint = classify(&input, caps());
        assert!(constraint.max_files <= caps().max_files_cap);
        assert!(constraint.max_total_diff_bytes <= caps().max_total_diff_bytes_cap);
    }

    #[test]
    fn later_attempts_never_widen_the_constraint() {
        let input1 = ClassifierInput {
            phase: CorrectionPhase::Goal,
            failed_step_id: "step-1",
            attempt: 1,
            runtime_logs: Some(""),
            validation_profile: None,
        };
        let input2 = ClassifierInput {
            phase: CorrectionPhase::Goal,
            failed_step_id: "step-1",
            attempt: 3,
            runtime_logs: Some(""),
            validation_profile: None,
        };
        let c1 = classify(&input1, caps());
        let c2 = classify(&input2, caps());
        assert!(c2.max_files <= c1.max_files);
        assert!(c2.max_total_diff_bytes <= c1.max_total_diff_bytes);
    }
}
