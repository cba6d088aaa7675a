//! Correction Policy — evaluates a completed
//! correction step attempt against its constraint.
//!

use serde::{Deserialize, Serialize};

use crate::correction::classifier::CorrectionConstraint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    Off,
    Warn,
    Enforce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub code: &'static str,
    pub message: String,
}

/// Attached to the correction step's output as `correctionPolicy`, per
///.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionPolicyRecord {
    pub mode: PolicyMode,
    pub compliant: bool,
    pub violations: Vec<PolicyViolation>,
    /// True when `mode=enforce` and violations exist: the caller must
    /// promote this to a step failure.
    pub blocks_step: bool,
}

/// The observed outcome of a single correction step attempt, evaluated
/// against its constraint.
#[derive(Debug, Clone)]
pub struct CorrectionAttempt<'a> {
    pub staged_paths: &'a [String],
    pub staged_diff_bytes: u64,
    pub produced_commit: bool,
}

/// A correction step is compliant iff: it produced >=1 file change AND a
/// commit, it stays within its constraint, its changes match
/// `allowedPathPrefixes`, and the total diff is within the constraint
/// bound —.
pub fn evaluate(
    constraint: &CorrectionConstraint,
    attempt: &CorrectionAttempt<'_>,
    mode: PolicyMode,
) -> CorrectionPolicyRecord {
    let mut violations = Vec::new();

    if attempt.staged_paths.is_empty() {
        violations.push(PolicyViolation {
                code: "NO_FILE_CHANGE",
                message: "correction step produced zero file changes".to_string(),
        });
    }
    if !attempt.produced_commit {
        violations.push(PolicyViolation {
                code: "NO_COMMIT",
                message: "correction step produced no commit (silent patching blocked)".to_string(),
        });
    }
    if attempt.staged_paths.len() as u32 > constraint.max_files {
        violations.push(PolicyViolation {
                code: "TOO_MANY_FILES",
                message: format!(
                    "{} files staged, constraint allows {}",
                    attempt.staged_paths.len(),
                    constraint.max_files
                ),
        });
    }
    if attempt.staged_diff_bytes > constraint.max_total_diff_bytes {
        violations.push(PolicyViolation {
                code: "DIFF_TOO_LARGE",
                message: format!(
                    "{} diff bytes staged, constraint allows {}",
                    attempt.staged_diff_bytes, constraint.max_total_diff_bytes
                ),
        });
    }

    let allows_any_path = constraint.allowed_path_prefixes.iter().any(|p| p.is_empty());
    if !allows_any_path {
        for path in attempt.staged_paths {
            if !constraint.allowed_path_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str())) {
                violations.push(PolicyViolation {
                        code: "PATH_OUTSIDE_CONSTRAINT",
                        message: format!("{path} does not match any allowed path prefix"),
                });
            }
        }
    }

    let compliant = violations.is_empty();
    let blocks_step = mode == PolicyMode::Enforce && !compliant;

    CorrectionPolicyRecord { mode, compliant, violations, blocks_step }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::classifier::CorrectionIntent;

    fn constraint() -> CorrectionConstraint {
        CorrectionConstraint {
            intent: CorrectionIntent::TypescriptCompile,
            max_files: 2,
            max_total_diff_bytes: 1000,
            allowed_path_prefixes: vec!["src/a.ts".to_string()],
            guidance: vec![],
        }
    }

    #[test]
    fn compliant_attempt_passes() {
        let attempt = CorrectionAttempt {
            staged_paths: &["src/a.ts".to_string()],
            staged_diff_bytes: 50,
            produced_commit: true,
        };
        let record = evaluate(&constraint(), &attempt, PolicyMode::Enforce);
        assert!(record.compliant);
        assert!(!record.blocks_step);
    }

    #[test]
    fn no_commit_is_always_a_violation() {
        let attempt = CorrectionAttempt {
            staged_paths: &["src/a.ts".to_string()],
            staged_diff_bytes: 50,
            produced_commit: false,
        };
        let record = evaluate(&constraint(), &attempt, PolicyMode::Enforce);
        assert!(!record.compliant);
        assert!(record.violations.iter().any(|v| v.code == "NO_COMMIT"));
        assert!(record.blocks_step);
    }

    #[test]
    fn warn_mode_never_blocks_the_step() {
        let attempt = CorrectionAttempt {
            staged_paths: &["src/outside.ts".to_string()],
            staged_diff_bytes: 50,
            produced_commit: true,
        };
        let record = evaluate(&constraint(), &attempt, PolicyMode::Warn);
        assert!(!record.compliant);
        assert!(!record.blocks_step, "warn mode must attach a warning but never change terminal status");
    }

    #[test]
    fn path_outside_allowed_prefixes_is_a_violation() {
        let attempt = CorrectionAttempt {
            staged_paths: &["src/outside.ts".to_string()],
            staged_diff_bytes: 50,
            produced_commit: true,
        };
        let record = evaluate(&constraint(), &attempt, PolicyMode::Enforce);
        assert!(record.violations.iter().any(|v| v.code == "PATH_OUTSIDE_CONSTRAINT"));
    }
}
