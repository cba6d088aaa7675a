//! Planner Facade — the seam between the run lifecycle engine and
//! whatever produces plans and correction patches. No concrete AI-provider
//! implementation lives here (explicit non-goal); this module owns the
//! trait, the fail-closed response parsing discipline, and a
//! deterministic test double.
//!

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::correction::CorrectionConstraint;
use crate::state::types::Step;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner response was not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("planner returned an empty plan")]
    EmptyPlan,

    #[error("planner returned a patch touching a file outside the correction constraint: {0}")]
    PathOutsideConstraint(String),

    #[error("planner transport error: {0}")]
    Transport(String),
}

pub type PlannerResult<T> = Result<T, PlannerError>;

/// The goal-driven plan the planner proposes for a fresh run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlanResponse {
    pub steps: Vec<Step>,
    #[serde(default)]
    pub summary: String,
}

/// A bounded correction patch: the replacement steps to splice in at the
/// failing step, constrained to `CorrectionConstraint`'s file/byte caps.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CorrectionResponse {
    pub steps: Vec<Step>,
    #[serde(default)]
    pub rationale: String,
}

/// Context handed to the planner for a fresh-run plan request.
pub struct PlanRequest<'a> {
    pub goal: &'a str,
    pub project_template: &'a str,
    pub provider_id: &'a str,
    pub model: &'a str,
}

/// Context handed to the planner for a correction request — the failing
/// step, why it failed, and the bounded constraint classification
/// already derived for it.
pub struct CorrectionRequest<'a> {
    pub goal: &'a str,
    pub failed_step: &'a Step,
    pub failure_summary: &'a str,
    pub constraint: &'a CorrectionConstraint,
    pub provider_id: &'a str,
    pub model: &'a str,
}

/// Planner Facade: the only seam through which the engine asks for
/// new plan content. Implementations own the actual model call; this
/// trait only fixes the request/response shape and the fail-closed parse
/// contract described on [`parse_plan_response`]/[`parse_correction_response`].
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: PlanRequest<'_>) -> PlannerResult<PlanResponse>;

    /// Correction produced while still pursuing the original goal
    /// (`runtime-correction-*` / goal phase).
    async fn plan_runtime_correction(
        &self,
        request: CorrectionRequest<'_>,
    ) -> PlannerResult<CorrectionResponse>;

    /// Correction produced after the run reached `complete` and heavy
    /// validation failed (`validation-correction-*` / optimization phase).
    async fn plan_correction(&self, request: CorrectionRequest<'_>) -> PlannerResult<CorrectionResponse>;
}

/// Extract the first fenced ```json... ``` block, or the first top-level
/// `{...}`/`[...]` span if no fence is present, tolerating planner prose
/// wrapped around the payload.
pub fn extract_json_block(raw: &str) -> Option<&str> {
    if let Some(start) = raw.find("```json") {
        let after = &raw[start + 7..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim());
        }
    }
    if let Some(start) = raw.find("```") {
        let after = &raw[start + 3..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim());
        }
    }
    let first_brace = raw.find(['{', '[']);
    let last_brace = raw.rfind(['}', ']']);
    match (first_brace, last_brace) {
        (Some(s), Some(e)) if e > s => Some(raw[s..=e].trim()),
        _ => None,
    }
}

/// Parse a fresh-run plan response. Fail-closed: any JSON error or an
/// empty step list rejects the whole response rather than running a
/// partial plan.
pub fn parse_plan_response(raw: &str) -> PlannerResult<PlanResponse> {
    let json_str = extract_json_block(raw).unwrap_or(raw);
    let plan: PlanResponse = serde_json::from_str(json_str)?;
    if plan.steps.is_empty() {
        return Err(PlannerError::EmptyPlan);
    }
    Ok(plan)
}

/// Parse a correction response and enforce the classifier's bounded
/// constraint before accepting it: every mutating step's target path
/// must match one of `constraint.allowed_path_prefixes`, unless the
/// constraint allows the whole project (an empty-string prefix).
pub fn parse_correction_response(
    raw: &str,
    constraint: &CorrectionConstraint,
) -> PlannerResult<CorrectionResponse> {
    let json_str = extract_json_block(raw).unwrap_or(raw);
    let response: CorrectionResponse = serde_json::from_str(json_str)?;
    if response.steps.is_empty() {
        return Err(PlannerError::EmptyPlan);
    }

    let allows_any_path = constraint.allowed_path_prefixes.iter().any(|p| p.is_empty());
    if !allows_any_path {
        for step in &response.steps {
            if !step.mutates() {
                continue;
            }
            if let Some(path) = step.input.get("path").and_then(|v| v.as_str()) {
                let matches = constraint.allowed_path_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()));
                if !matches {
                    return Err(PlannerError::PathOutsideConstraint(path.to_string()));
                }
            }
        }
    }

    Ok(response)
}

/// Deterministic test double: returns a fixed single-step plan/correction
/// without any transport, for exercising the engine's planner-seam
/// wiring without a real provider.
pub struct NullPlanner {
    pub plan_steps: Vec<Step>,
    pub correction_steps: Vec<Step>,
}

#[async_trait]
impl Planner for NullPlanner {
    async fn plan(&self, _request: PlanRequest<'_>) -> PlannerResult<PlanResponse> {
        Ok(PlanResponse { steps: self.plan_steps.clone(), summary: "null planner fixed plan".to_string() })
    }

    async fn plan_runtime_correction(
        &self,
        _request: CorrectionRequest<'_>,
    ) -> PlannerResult<CorrectionResponse> {
        Ok(CorrectionResponse {
                steps: self.correction_steps.clone(),
                rationale: "null planner fixed correction".to_string(),
        })
    }

    async fn plan_correction(&self, request: CorrectionRequest<'_>) -> PlannerResult<CorrectionResponse> {
        self.plan_runtime_correction(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::CorrectionIntent;
    use crate::state::types::StepType;

    fn sample_step(id: &str, path: &str) -> Step {
        Step {
            id: id.to_string(),
            step_type: StepType::Modify,
            tool: "write_file".to_string(),
            input: serde_json::json!({"path": path}),
            correction: None,
        }
    }

    fn constraint(prefixes: Vec<String>) -> CorrectionConstraint {
        CorrectionConstraint {
            intent: CorrectionIntent::TypescriptCompile,
            max_files: 2,
            max_total_diff_bytes: 1000,
            allowed_path_prefixes: prefixes,
            guidance: vec![],
        }
    }

    #[test]
    fn extracts_fenced_json_block() {
        let raw = "Here is the plan:\n```json\n{\"steps\": []}\n```\nDone.";
        assert_eq!(extract_json_block(raw), Some("{\"steps\": []}"));
    }

    #[test]
    fn plan_with_no_steps_is_rejected() {
        let raw = "{\"steps\": []}";
        assert!(matches!(parse_plan_response(raw), Err(PlannerError::EmptyPlan)));
    }

    #[test]
    fn malformed_plan_json_fails_closed() {
        let raw = "not json at all";
        assert!(matches!(parse_plan_response(raw), Err(PlannerError::InvalidJson(_))));
    }

    #[test]
    fn valid_plan_parses() {
        let raw = serde_json::json!({
                "steps": [{"id": "step-1", "type": "modify", "tool": "write_file", "input": {"path": "a.ts"}, "correction": null}],
                "summary": "add a.ts"
        })
        .to_string();
        let plan = parse_plan_response(&raw).unwrap();
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn correction_outside_constraint_is_rejected() {
        let raw = serde_json::json!({
                "steps": [{"id": "runtime-correction-1", "type": "modify", "tool": "write_file", "input": {"path": "src/other.ts"}, "correction": null}],
                "rationale": "fix"
        })
        .to_string();
        let result = parse_correction_response(&raw, &constraint(vec!["src/a.ts".to_string()]));
        assert!(matches!(result, Err(PlannerError::PathOutsideConstraint(_))));
    }

    #[test]
    fn correction_within_constraint_is_accepted() {
        let raw = serde_json::json!({
                "steps": [{"id": "runtime-correction-1", "type": "modify", "tool": "write_file", "input": {"path": "src/a.ts"}, "correction": null}],
                "rationale": "fix"
        })
        .to_string();
        let result = parse_correction_response(&raw, &constraint(vec!["src/a.ts".to_string()])).unwrap();
        assert_eq!(result.steps.len(), 1);
    }

    #[tokio::test]
    async fn null_planner_returns_fixed_steps() {
        let planner = NullPlanner {
            plan_steps: vec![sample_step("step-1", "a.ts")],
            correction_steps: vec![sample_step("runtime-correction-1", "a.ts")],
        };
        let request = PlanRequest { goal: "add a.ts", project_template: "agent-workflow", provider_id: "test", model: "test" };
        let plan = planner.plan(request).await.unwrap();
        assert_eq!(plan.steps.len(), 1);
    }
}
