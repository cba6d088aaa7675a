//! Validation Failure Interpreter — turns an externally-produced
//! heavy-validation verdict into semantic clusters the correction
//! classifier can act on.
//!

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static IMPORT_SPECIFIER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?i)cannot find module ['"]([^'"]+)['"]"#).unwrap()
});

static TS_ERROR_CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"TS(\d{4})").unwrap());

/// One check the external validator ran (e.g. `tsc`, `eslint`, `pytest`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub blocking_count: i32,
    #[serde(default)]
    pub warning_count: i32,
}

/// One raw failure line from the validator's report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFailure {
    pub check: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

/// `{ ok, blockingCount, warningCount, summary, checks[], failures[], logs }`
/// — the verdict shape consumed (never produced) by this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeavyValidationVerdict {
    pub ok: bool,
    pub blocking_count: i32,
    pub warning_count: i32,
    pub summary: String,
    #[serde(default)]
    pub checks: Vec<CheckResult>,
    #[serde(default)]
    pub failures: Vec<RawFailure>,
    #[serde(default)]
    pub logs: String,
}

/// Semantic grouping of related validator failures with common file/import
/// provenance (GLOSSARY: "Cluster").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    TypecheckFailure,
    BuildFailure,
    TestFailure,
    ImportResolutionError,
    LayerBoundaryViolation,
    ArchitectureContract,
    TestContractGap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_type: ClusterType,
    pub files: Vec<String>,
    /// Module specifiers implicated, when derivable (import clusters only).
    pub imports: Vec<String>,
    pub summary: String,
    pub count: i32,
}

/// A broken import: the specifier and the file that imports it. Feeds the
/// import-resolution recipe in C5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSignal {
    pub specifier: String,
    pub containing_file: String,
}

/// Derived profile: `{ clusters[], blockingCount,
/// architectureCollapse?, architectureModules?[], plannerModeOverride?,
/// shouldAutoCorrect, reason }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationProfile {
    pub clusters: Vec<Cluster>,
    pub blocking_count: i32,
    pub architecture_collapse: bool,
    pub architecture_modules: Vec<String>,
    pub planner_mode_override: Option<String>,
    pub should_auto_correct: bool,
    pub reason: String,
}

fn classify_failure(failure: &RawFailure) -> ClusterType {
    let check = failure.check.to_lowercase();
    let message = failure.message.to_lowercase();

    if message.contains("cannot find module") || message.contains("unresolved import") {
        return ClusterType::ImportResolutionError;
    }
    if message.contains("layer") && (message.contains("boundary") || message.contains("import")) {
        return ClusterType::LayerBoundaryViolation;
    }
    if message.contains("architecture") || message.contains("contract violat") {
        return ClusterType::ArchitectureContract;
    }
    if message.contains("missing test") || message.contains("untested") || message.contains("coverage") {
        return ClusterType::TestContractGap;
    }
    if check.contains("test") || message.contains("test failed") || message.contains("assertion") {
        return ClusterType::TestFailure;
    }
    if check.contains("build") || check.contains("compile") {
        return ClusterType::BuildFailure;
    }
    ClusterType::TypecheckFailure
}

fn extract_import_specifier(message: &str) -> Option<String> {
    IMPORT_SPECIFIER_PATTERN
    .captures(message)
    .map(|c| c[1].to_string())
}

/// `{ files[], imports[] }`: cluster records carry files and
/// imports when derivable from the raw failures.
pub fn interpret(verdict: &HeavyValidationVerdict) -> ValidationProfile {
    use std::collections::HashMap;

    let mut groups: HashMap<ClusterType, Vec<&RawFailure>> = HashMap::new();
    for failure in &verdict.failures {
        groups.entry(classify_failure(failure)).or_default().push(failure);
    }

    let mut clusters: Vec<Cluster> = Vec::new();
    let mut architecture_modules: Vec<String> = Vec::new();

    for (cluster_type, failures) in &groups {
        let mut files: Vec<String> = failures.iter().filter_map(|f| f.file.clone()).collect();
        files.sort();
        files.dedup();

        let imports: Vec<String> = failures
        .iter()
        .filter_map(|f| extract_import_specifier(&f.message))
        .collect();

        if matches!(cluster_type, ClusterType::LayerBoundaryViolation | ClusterType::ArchitectureContract) {
            architecture_modules.extend(files.iter().cloned());
        }

        clusters.push(Cluster {
                cluster_type: *cluster_type,
                files,
                imports,
                summary: format!("{} failure(s) in {:?}", failures.len(), cluster_type),
                count: failures.len() as i32,
        });
    }
    clusters.sort_by_key(|c| format!("{:?}", c.cluster_type));
    architecture_modules.sort();
    architecture_modules.dedup();

    // architectureCollapse: >=2 affected architectural modules
    // OR a layer_boundary_violation cluster present.
    let has_layer_violation = clusters.iter().any(|c| c.cluster_type == ClusterType::LayerBoundaryViolation);
    let architecture_collapse = architecture_modules.len() >= 2 || has_layer_violation;

    let blocking_count = verdict.blocking_count;
    let should_auto_correct = !verdict.ok && blocking_count > 0 && !clusters.is_empty();

    let reason = if verdict.ok {
        "validation passed".to_string()
    } else if architecture_collapse {
        "architecture collapse detected; structural reset recommended".to_string()
    } else if should_auto_correct {
        format!("{} blocking failure(s) across {} cluster(s)", blocking_count, clusters.len())
    } else {
        "no actionable clusters derived from verdict".to_string()
    };

    ValidationProfile {
        clusters,
        blocking_count,
        architecture_collapse,
        architecture_modules,
        planner_mode_override: if architecture_collapse { Some("architecture_reconstruction".to_string()) } else { None },
        should_auto_correct,
        reason,
    }
}

/// Extract the first derivable import signal from an `import_resolution_error`
/// cluster "when an import signal can be extracted (module
/// specifier + containing file)".
pub fn extract_import_signal(verdict: &HeavyValidationVerdict) -> Option<ImportSignal> {
    verdict.failures.iter().find_map(|f| {
            let specifier = extract_import_specifier(&f.message)?;
            let containing_file = f.file.clone()?;
            Some(ImportSignal { specifier, containing_file })
    })
}

/// Best-effort rustc/tsc style error-code extraction, used by the
/// classifier to recognize `TS2307` (module not found) and similar.
pub fn extract_ts_code(message: &str) -> Option<String> {
    TS_ERROR_CODE_PATTERN.captures(message).map(|c| format!("TS{}", &c[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(check: &str, file: &str, message: &str) -> RawFailure {
        RawFailure {
            check: check.to_string(),
            file: Some(file.to_string()),
            line: None,
            code: None,
            message: message.to_string(),
        }
    }

    #[test]
    fn import_resolution_failure_clusters_and_extracts_specifier() {
        let verdict = HeavyValidationVerdict {
            ok: false,
            blocking_count: 1,
            warning_count: 0,
            summary: "1 error".into(),
            checks: vec![],
            failures: vec![failure(
                    "tsc",
                    "src/service/order.ts",
                    "TS2307: Cannot find module '../dto/missing'",
            )],
            logs: String::new(),
        };
        let profile = interpret(&verdict);
        assert_eq!(profile.clusters.len(), 1);
        assert_eq!(profile.clusters[0].cluster_type, ClusterType::ImportResolutionError);
        assert_eq!(profile.clusters[0].imports, vec!["../dto/missing".to_string()]);

        let signal = extract_import_signal(&verdict).unwrap();
        assert_eq!(signal.specifier, "../dto/missing");
        assert_eq!(signal.containing_file, "src/service/order.ts");
    }

    #[test]
    fn architecture_collapse_set_on_layer_boundary_violation() {
        let verdict = HeavyValidationVerdict {
            ok: false,
            blocking_count: 1,
            warning_count: 0,
            summary: "layer violation".into(),
            checks: vec![],
            failures: vec![failure(
                    "architecture",
                    "src/domain/order.ts",
                    "layer boundary violation: domain importing from infra",
            )],
            logs: String::new(),
        };
        let profile = interpret(&verdict);
        assert!(profile.architecture_collapse);
        assert_eq!(profile.planner_mode_override.as_deref(), Some("architecture_reconstruction"));
    }

    #[test]
    fn passing_verdict_never_recommends_auto_correct() {
        let verdict = HeavyValidationVerdict {
            ok: true,
            blocking_count: 0,
            warning_count: 0,
            summary: "all green".into(),
            checks: vec![],
            failures: vec![],
            logs: String::new(),
        };
        let profile = interpret(&verdict);
        assert!(!profile.should_auto_correct);
        assert!(profile.clusters.is_empty());
    }

    #[test]
    fn extract_ts_code_parses_code() {
        assert_eq!(extract_ts_code("TS2307: Cannot find module 'x'"), Some("TS2307".to_string()));
        assert_eq!(extract_ts_code("no code here"), None);
    }
}
