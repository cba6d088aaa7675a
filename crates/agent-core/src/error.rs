//! Structured error shape shared by every module's error enum.
//!

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    pub code: String,
    pub message: String,
    pub recovery_action: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub retryable: bool,
}

impl StructuredError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, recovery_action: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recovery_action: recovery_action.into(),
            context: HashMap::new(),
            retryable: false,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StructuredError {}

/// Convert a [`StructuredError`] into the run's `errorDetails` shape
/// (: `version: 1`, `source: "agent_kernel"`).
pub fn to_error_details(
    structured: &StructuredError,
    category: coordination::state::ErrorCategory,
) -> coordination::state::ErrorDetails {
    coordination::state::ErrorDetails::new(category)
    .with_context("code", structured.code.clone())
    .with_context("message", structured.message.clone())
    .with_context("recovery_action", structured.recovery_action.clone())
    .with_context("retryable", structured.retryable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let err = StructuredError::new("X", "bad thing", "do good thing");
        assert_eq!(err.to_string(), "[X] bad thing");
    }

    #[test]
    fn to_error_details_carries_code_in_context() {
        let err = StructuredError::new("VCS_GIT_ERROR", "boom", "retry").retryable();
        let details = to_error_details(&err, coordination::state::ErrorCategory::StepExecution);
        assert_eq!(details.context.get("code").unwrap(), "VCS_GIT_ERROR");
        assert_eq!(details.context.get("retryable").unwrap(), true);
    }
}
