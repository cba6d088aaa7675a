//! Execution Contract — normalize and hash the per-run execution
//! config, validate it on every persistence, compute diffs for resume.
//!

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONTRACT_SCHEMA_VERSION: u32 = 1;

/// off/warn/enforce tri-state shared by light and heavy validation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    Off,
    Warn,
    Enforce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionPolicyMode {
    Off,
    Warn,
    Enforce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionConvergenceMode {
    Off,
    Warn,
    Enforce,
}

/// The normalized execution config every run is bound to. Field order in
/// this struct is the canonical hashing order — do not reorder fields
/// without bumping [`CONTRACT_SCHEMA_VERSION`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionConfig {
    pub light_validation_mode: ValidationMode,
    pub heavy_validation_mode: ValidationMode,
    pub correction_policy_mode: CorrectionPolicyMode,
    pub correction_convergence_mode: CorrectionConvergenceMode,
    pub max_validation_auto_corrections: i32,
    pub max_heavy_correction_attempts: i32,
    pub max_runtime_correction_attempts: i32,
    pub planner_timeout_seconds: u64,
    pub max_files_per_step: u32,
    pub max_total_diff_bytes: u64,
    pub max_single_file_bytes: u64,
    pub allow_env_mutation: bool,
    pub run_lock_stale_seconds: u64,
    pub profile: String,
}

impl ExecutionConfig {
    /// Reads every tunable from its environment variable, falling back to a
    /// safe default (and recording the field name) when absent, malformed,
    /// or out of its allowed range. No other module reads the process
    /// environment directly — this is the one place that does.
    pub fn build_fallback(profile: &str) -> (Self, Vec<&'static str>) {
        let mut fallback_fields = Vec::new();

        let env_u32 = |name: &'static str, default: u32, fields: &mut Vec<&'static str>| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|v: &u32| *v > 0)
                .unwrap_or_else(|| {
                    fields.push(name);
                    default
                })
        };
        let env_u64 = |name: &'static str, default: u64, fields: &mut Vec<&'static str>| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|v: &u64| *v > 0)
                .unwrap_or_else(|| {
                    fields.push(name);
                    default
                })
        };
        let env_u32_ranged = |name: &'static str, default: u32, min: u32, max: u32, fields: &mut Vec<&'static str>| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|v: &u32| (min..=max).contains(v))
                .unwrap_or_else(|| {
                    fields.push(name);
                    default
                })
        };
        let env_u32_capped = |name: &'static str, default: u32, cap: u32, fields: &mut Vec<&'static str>| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|v: &u32| *v > 0 && *v <= cap)
                .unwrap_or_else(|| {
                    fields.push(name);
                    default
                })
        };
        let env_mode = |name: &'static str, default: ValidationMode, fields: &mut Vec<&'static str>| {
            std::env::var(name)
                .ok()
                .and_then(|s| match s.to_ascii_lowercase().as_str() {
                    "off" => Some(ValidationMode::Off),
                    "warn" => Some(ValidationMode::Warn),
                    "enforce" => Some(ValidationMode::Enforce),
                    _ => None,
                })
                .unwrap_or_else(|| {
                    fields.push(name);
                    default
                })
        };
        let env_policy_mode = |name: &'static str, default: CorrectionPolicyMode, fields: &mut Vec<&'static str>| {
            std::env::var(name)
                .ok()
                .and_then(|s| match s.to_ascii_lowercase().as_str() {
                    "off" => Some(CorrectionPolicyMode::Off),
                    "warn" => Some(CorrectionPolicyMode::Warn),
                    "enforce" => Some(CorrectionPolicyMode::Enforce),
                    _ => None,
                })
                .unwrap_or_else(|| {
                    fields.push(name);
                    default
                })
        };
        let env_convergence_mode = |name: &'static str, default: CorrectionConvergenceMode, fields: &mut Vec<&'static str>| {
            std::env::var(name)
                .ok()
                .and_then(|s| match s.to_ascii_lowercase().as_str() {
                    "off" => Some(CorrectionConvergenceMode::Off),
                    "warn" => Some(CorrectionConvergenceMode::Warn),
                    "enforce" => Some(CorrectionConvergenceMode::Enforce),
                    _ => None,
                })
                .unwrap_or_else(|| {
                    fields.push(name);
                    default
                })
        };
        let env_bool = |name: &'static str, default: bool, fields: &mut Vec<&'static str>| {
            std::env::var(name)
                .ok()
                .and_then(|s| match s.to_ascii_lowercase().as_str() {
                    "true" | "1" => Some(true),
                    "false" | "0" => Some(false),
                    _ => None,
                })
                .unwrap_or_else(|| {
                    fields.push(name);
                    default
                })
        };

        let planner_timeout_ms = env_u32_ranged(
            "DEEPRUN_PLANNER_TIMEOUT_MS",
            120_000,
            1_000,
            300_000,
            &mut fallback_fields,
        );

        let config = Self {
            light_validation_mode: env_mode(
                "AGENT_LIGHT_VALIDATION_MODE",
                ValidationMode::Enforce,
                &mut fallback_fields,
            ),
            heavy_validation_mode: env_mode(
                "AGENT_HEAVY_VALIDATION_MODE",
                ValidationMode::Enforce,
                &mut fallback_fields,
            ),
            correction_policy_mode: env_policy_mode(
                "AGENT_CORRECTION_POLICY_MODE",
                CorrectionPolicyMode::Enforce,
                &mut fallback_fields,
            ),
            correction_convergence_mode: env_convergence_mode(
                "AGENT_CORRECTION_CONVERGENCE_MODE",
                CorrectionConvergenceMode::Enforce,
                &mut fallback_fields,
            ),
            max_validation_auto_corrections: crate::state::types::MAX_VALIDATION_AUTO_CORRECTIONS,
            max_heavy_correction_attempts: env_u32_capped(
                "AGENT_OPTIMIZATION_MAX_CORRECTIONS",
                2,
                3,
                &mut fallback_fields,
            ) as i32,
            max_runtime_correction_attempts: env_u32_capped(
                "AGENT_GOAL_MAX_CORRECTIONS",
                2,
                5,
                &mut fallback_fields,
            ) as i32,
            planner_timeout_seconds: (planner_timeout_ms / 1000).max(1) as u64,
            max_files_per_step: env_u32("AGENT_FS_MAX_FILES_PER_STEP", 12, &mut fallback_fields),
            max_total_diff_bytes: env_u64("AGENT_FS_MAX_TOTAL_DIFF_BYTES", 2_000_000, &mut fallback_fields),
            max_single_file_bytes: env_u64("AGENT_FS_MAX_FILE_BYTES", 500_000, &mut fallback_fields),
            allow_env_mutation: env_bool("AGENT_FS_ALLOW_ENV_MUTATION", false, &mut fallback_fields),
            run_lock_stale_seconds: env_u32_ranged(
                "AGENT_RUN_LOCK_STALE_SECONDS",
                1800,
                60,
                86400,
                &mut fallback_fields,
            ) as u64,
            profile: profile.to_string(),
        };

        (config, fallback_fields)
    }
}

/// `{ schemaVersion, normalizedExecutionConfig, determinismPolicyVersion,
/// plannerPolicyVersion, correctionRecipeVersion, validationPolicyVersion,
/// randomnessSeed }`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ContractMaterial {
    pub schema_version: u32,
    pub normalized_execution_config: ExecutionConfig,
    pub determinism_policy_version: u32,
    pub planner_policy_version: u32,
    pub correction_recipe_version: u32,
    pub validation_policy_version: u32,
    pub randomness_seed: u64,
}

/// The record stored in `AgentRun.metadata` under the `executionContract` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContract {
    pub schema_version: u32,
    pub hash: String,
    pub effective_config: ExecutionConfig,
    pub material: ContractMaterial,
    pub fallback_used: bool,
    pub fallback_fields: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("contract hash mismatch: stored {stored} recomputed {recomputed}")]
    HashMismatch { stored: String, recomputed: String },

    #[error("unsupported execution contract: {0}")]
    Unsupported(String),

    #[error("resume requested with a different contract; pass overrideExecutionConfig or fork")]
    ContractDrift,

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Canonical-order digest of a config. BTreeMap gives deterministic key
/// order regardless of struct field order at the serde layer.
pub fn hash_config(config: &ExecutionConfig) -> Result<String, ContractError> {
    let value = serde_json::to_value(config)?;
    let ordered: BTreeMap<String, serde_json::Value> = match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        other => {
            let mut m = BTreeMap::new();
            m.insert("value".to_string(), other);
            m
        }
    };
    let canonical = serde_json::to_string(&ordered)?;
    Ok(blake3::hash(canonical.as_bytes()).to_hex().to_string())
}

/// `buildContract(config) → {schemaVersion, hash, effectiveConfig,
/// material, fallbackUsed, fallbackFields[]}`.
pub fn build_contract(
    profile: &str,
    randomness_seed: u64,
) -> Result<ExecutionContract, ContractError> {
    let (effective_config, fallback_fields) = ExecutionConfig::build_fallback(profile);
    let hash = hash_config(&effective_config)?;
    let material = ContractMaterial {
        schema_version: CONTRACT_SCHEMA_VERSION,
        normalized_execution_config: effective_config.clone(),
        determinism_policy_version: 1,
        planner_policy_version: 1,
        correction_recipe_version: 1,
        validation_policy_version: 1,
        randomness_seed,
    };
    Ok(ExecutionContract {
            schema_version: CONTRACT_SCHEMA_VERSION,
            hash,
            effective_config,
            material,
            fallback_used: !fallback_fields.is_empty(),
            fallback_fields: fallback_fields.into_iter().map(str::to_string).collect(),
    })
}

/// Re-validate a persisted run's stored contract hash against the hash
/// recomputed from its stored effective config. Called on every run
/// update per invariant (d).
pub fn verify_stored_hash(contract: &ExecutionContract) -> Result<(), ContractError> {
    let recomputed = hash_config(&contract.effective_config)?;
    if recomputed != contract.hash {
        return Err(ContractError::HashMismatch {
                stored: contract.hash.clone(),
                recomputed,
        });
    }
    Ok(())
}

pub struct ResolveOptions {
    pub override_execution_config: bool,
    pub fork: bool,
}

pub struct ResolveOutcome {
    pub persisted_contract: ExecutionContract,
    pub requested_contract: ExecutionContract,
    /// Dotted-path field names that differ between persisted and requested.
    pub diff: Vec<String>,
}

/// `resolve(persistedMetadata, requested, envFallback, {profile}) →
/// {persistedContract, requestedContract, diff[]}`.
///
/// Resume with a differing requested contract is rejected unless
/// `overrideExecutionConfig` or `fork` is set.
pub fn resolve(
    persisted: ExecutionContract,
    requested: ExecutionContract,
    options: &ResolveOptions,
) -> Result<ResolveOutcome, ContractError> {
    verify_stored_hash(&persisted)?;

    let diff = diff_configs(&persisted.effective_config, &requested.effective_config)?;
    if !diff.is_empty() && !options.override_execution_config && !options.fork {
        return Err(ContractError::ContractDrift);
    }

    Ok(ResolveOutcome {
            persisted_contract: persisted,
            requested_contract: requested,
            diff,
    })
}

fn diff_configs(a: &ExecutionConfig, b: &ExecutionConfig) -> Result<Vec<String>, ContractError> {
    let av = serde_json::to_value(a)?;
    let bv = serde_json::to_value(b)?;
    let (serde_json::Value::Object(am), serde_json::Value::Object(bm)) = (av, bv) else {
        return Ok(vec![]);
    };
    let mut diff = Vec::new();
    for (key, a_val) in &am {
        if bm.get(key) != Some(a_val) {
            diff.push(key.clone());
        }
    }
    diff.sort();
    Ok(diff)
}

#[derive(Debug, Clone, Serialize)]
pub struct SupportVerdict {
    pub supported: bool,
    pub message: Option<String>,
}

/// `evaluateSupport(material)` — workers refuse contracts from a future
/// schema version or an unknown profile, fail-closed rather than guessing.
pub fn evaluate_support(material: &ContractMaterial) -> SupportVerdict {
    if material.schema_version > CONTRACT_SCHEMA_VERSION {
        return SupportVerdict {
            supported: false,
            message: Some(format!(
                    "contract schema version {} is newer than supported version {CONTRACT_SCHEMA_VERSION}",
                    material.schema_version
            )),
        };
    }
    const KNOWN_PROFILES: &[&str] = &["canonical-backend", "agent-workflow"];
    if !KNOWN_PROFILES.contains(&material.normalized_execution_config.profile.as_str()) {
        return SupportVerdict {
            supported: false,
            message: Some(format!(
                    "unknown execution profile: {}",
                    material.normalized_execution_config.profile
            )),
        };
    }
    SupportVerdict {
        supported: true,
        message: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_for_identical_config() {
        let (config, _) = ExecutionConfig::build_fallback("canonical-backend");
        let h1 = hash_config(&config).unwrap();
        let h2 = hash_config(&config).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_changes_when_config_changes() {
        let (mut config, _) = ExecutionConfig::build_fallback("canonical-backend");
        let h1 = hash_config(&config).unwrap();
        config.max_files_per_step += 1;
        let h2 = hash_config(&config).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn build_contract_round_trips_through_verify() {
        let contract = build_contract("canonical-backend", 42).unwrap();
        assert!(verify_stored_hash(&contract).is_ok());
    }

    #[test]
    fn tampered_hash_is_rejected() {
        let mut contract = build_contract("canonical-backend", 42).unwrap();
        contract.hash = "deadbeef".to_string();
        let err = verify_stored_hash(&contract).unwrap_err();
        assert!(matches!(err, ContractError::HashMismatch {.. }));
    }

    #[test]
    fn resolve_rejects_drift_without_override_or_fork() {
        let persisted = build_contract("canonical-backend", 1).unwrap();
        let mut requested = build_contract("canonical-backend", 1).unwrap();
        requested.effective_config.max_files_per_step += 5;
        requested.hash = hash_config(&requested.effective_config).unwrap();

        let err = resolve(
            persisted,
            requested,
            &ResolveOptions {
                override_execution_config: false,
                fork: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ContractError::ContractDrift));
    }

    #[test]
    fn resolve_allows_drift_with_fork() {
        let persisted = build_contract("canonical-backend", 1).unwrap();
        let mut requested = build_contract("canonical-backend", 1).unwrap();
        requested.effective_config.max_files_per_step += 5;
        requested.hash = hash_config(&requested.effective_config).unwrap();

        let outcome = resolve(
            persisted,
            requested,
            &ResolveOptions {
                override_execution_config: false,
                fork: true,
            },
        )
        .unwrap();
        assert!(outcome.diff.contains(&"maxFilesPerStep".to_string()) || !outcome.diff.is_empty());
    }

    #[test]
    fn evaluate_support_rejects_future_schema_version() {
        let mut contract = build_contract("canonical-backend", 1).unwrap();
        contract.material.schema_version = CONTRACT_SCHEMA_VERSION + 1;
        let verdict = evaluate_support(&contract.material);
        assert!(!verdict.supported);
    }

    #[test]
    fn evaluate_support_rejects_unknown_profile() {
        let contract = build_contract("unknown-profile", 1).unwrap();
        let verdict = evaluate_support(&contract.material);
        assert!(!verdict.supported);
    }
}
