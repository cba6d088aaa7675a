//! Learning Telemetry — append-only JSONL history per run, periodic
//! state snapshots, and the stub-debt ledger, plus the outcome
//! classification the Run Lifecycle Engine uses to stamp each
//! [`LearningEvent`] before it's persisted via [`crate::state::RunStore`].
//!

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::correction::{StubDebtRecord, StubDebtStatus};
use crate::state::types::{Id, LearningEvent, LearningOutcome};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },

    #[error("snapshot already exists at {0}")]
    SnapshotExists(PathBuf),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Root of the on-disk learning history for one project checkout
/// (`.deeprun/learning/...`).
pub struct LearningTelemetry {
    root: PathBuf,
}

impl LearningTelemetry {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self { root: project_root.into().join(".deeprun").join("learning") }
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    fn stub_debt_dir(&self) -> PathBuf {
        self.root.join("stub-debt")
    }

    /// Append one event to `.deeprun/learning/runs/<runId>.jsonl`. Creates
    /// the file and its parent directories on first write.
    pub fn append_run_event(&self, run_id: &Id, event: &LearningEvent) -> TelemetryResult<()> {
        let dir = self.runs_dir();
        std::fs::create_dir_all(&dir).map_err(|e| TelemetryError::Write { path: dir.clone(), source: e })?;

        let path = dir.join(format!("{run_id}.jsonl"));
        let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| TelemetryError::Write { path: path.clone(), source: e })?;

        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}").map_err(|e| TelemetryError::Write { path, source: e })
    }

    /// Read back every event recorded for a run, in append order.
    pub fn read_run_events(&self, run_id: &Id) -> TelemetryResult<Vec<LearningEvent>> {
        let path = self.runs_dir().join(format!("{run_id}.jsonl"));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| TelemetryError::Read { path, source: e })?;
        content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(TelemetryError::Json))
        .collect()
    }

    fn snapshot_path(&self, run_id: &Id, step_index: i32, attempt: i32) -> PathBuf {
        self.snapshots_dir().join(format!("{run_id}_{step_index}_{attempt}.json"))
    }

    /// Write an immutable state snapshot. Fails with
    /// [`TelemetryError::SnapshotExists`] rather than overwriting — each
    /// `(runId, stepIndex, attempt)` triple is written at most once.
    pub fn write_snapshot<T: serde::Serialize>(
        &self,
        run_id: &Id,
        step_index: i32,
        attempt: i32,
        snapshot: &T,
    ) -> TelemetryResult<PathBuf> {
        let dir = self.snapshots_dir();
        std::fs::create_dir_all(&dir).map_err(|e| TelemetryError::Write { path: dir.clone(), source: e })?;

        let path = self.snapshot_path(run_id, step_index, attempt);
        let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&path)
        .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    TelemetryError::SnapshotExists(path.clone())
                } else {
                    TelemetryError::Write { path: path.clone(), source: e }
                }
        })?;

        let data = serde_json::to_vec_pretty(snapshot)?;
        file.write_all(&data).map_err(|e| TelemetryError::Write { path: path.clone(), source: e })?;
        Ok(path)
    }

    fn stub_debt_path(&self, run_id: &Id, step_index: i32, attempt: i32) -> PathBuf {
        self.stub_debt_dir().join(format!("{run_id}_{step_index}_{attempt}.json"))
    }

    /// Record a newly-materialized stub by opening its ledger entry.
    pub fn open_stub_debt(&self, record: &StubDebtRecord) -> TelemetryResult<()> {
        let dir = self.stub_debt_dir();
        std::fs::create_dir_all(&dir).map_err(|e| TelemetryError::Write { path: dir.clone(), source: e })?;

        let path = self.stub_debt_path(&record.run_id, record.step_index, record.attempt);
        let data = serde_json::to_vec_pretty(record)?;
        std::fs::write(&path, data).map_err(|e| TelemetryError::Write { path, source: e })
    }

    /// Close a ledger entry once the debt-resolution recipe pays it down.
    pub fn close_stub_debt(&self, run_id: &Id, step_index: i32, attempt: i32) -> TelemetryResult<()> {
        let path = self.stub_debt_path(run_id, step_index, attempt);
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| TelemetryError::Read { path: path.clone(), source: e })?;
        let mut record: StubDebtRecord = serde_json::from_str(&content)?;
        record.status = StubDebtStatus::Closed;
        let data = serde_json::to_vec_pretty(&record)?;
        std::fs::write(&path, data).map_err(|e| TelemetryError::Write { path, source: e })
    }

    /// Close whichever open ledger entry for `run_id` tracks `stub_path`,
    /// regardless of which step/attempt originally opened it. The
    /// debt-resolution step that pays a stub off runs at its own
    /// `(step_index, attempt)`, distinct from the one that opened the
    /// debt, so closing has to key off the tracked path rather than
    /// recomputing the original filename.
    pub fn close_stub_debt_by_path(&self, run_id: &Id, stub_path: &str) -> TelemetryResult<()> {
        let dir = self.stub_debt_dir();
        if !dir.exists() {
            return Ok(());
        }
        let prefix = format!("{run_id}_");
        for entry in std::fs::read_dir(&dir).map_err(|e| TelemetryError::Read { path: dir.clone(), source: e })? {
            let entry = entry.map_err(|e| TelemetryError::Read { path: dir.clone(), source: e })?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !file_name.starts_with(&prefix) {
                continue;
            }
            let path = entry.path();
            let content = std::fs::read_to_string(&path).map_err(|e| TelemetryError::Read { path: path.clone(), source: e })?;
            let mut record: StubDebtRecord = serde_json::from_str(&content)?;
            if record.stub_path == stub_path && record.status == StubDebtStatus::Open {
                record.status = StubDebtStatus::Closed;
                let data = serde_json::to_vec_pretty(&record)?;
                std::fs::write(&path, data).map_err(|e| TelemetryError::Write { path, source: e })?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// List every ledger entry currently open for a run, scanning
    /// `.deeprun/learning/stub-debt/<runId>_*.json`.
    pub fn open_stub_debts(&self, run_id: &Id) -> TelemetryResult<Vec<StubDebtRecord>> {
        let dir = self.stub_debt_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut open = Vec::new();
        let prefix = format!("{run_id}_");
        for entry in std::fs::read_dir(&dir).map_err(|e| TelemetryError::Read { path: dir.clone(), source: e })? {
            let entry = entry.map_err(|e| TelemetryError::Read { path: dir.clone(), source: e })?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !file_name.starts_with(&prefix) {
                continue;
            }
            let content = std::fs::read_to_string(entry.path())
            .map_err(|e| TelemetryError::Read { path: entry.path(), source: e })?;
            let record: StubDebtRecord = serde_json::from_str(&content)?;
            if record.status == StubDebtStatus::Open {
                open.push(record);
            }
        }
        Ok(open)
    }
}

/// Which recipe produced the attempt whose outcome is being classified —
/// needed to resolve `provisionally_fixed` vs `success`: convergence
/// (`blockingAfter == 0`) reached by materializing a stub leaves debt
/// behind and is only ever `provisionally_fixed`; convergence reached any
/// other way (including a debt-resolution attempt that just paid an
/// existing stub off) is `success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Normal,
    ImportResolutionStub,
    DebtResolution,
}

/// Classify the outcome of one correction attempt.
/// `exhausted` overrides everything else: once the correction-attempt
/// budget for this phase is spent, the run's last attempt is `failed`
/// regardless of the delta it produced.
pub fn classify_outcome(
    blocking_before: i32,
    blocking_after: i32,
    attempt_phase: AttemptPhase,
    exhausted: bool,
) -> LearningOutcome {
    if exhausted {
        return LearningOutcome::Failed;
    }
    if blocking_after > blocking_before {
        return LearningOutcome::Regressed;
    }
    if blocking_after == blocking_before {
        return if blocking_after == 0 { LearningOutcome::Noop } else { LearningOutcome::Stalled };
    }
    if blocking_after == 0 {
        return if attempt_phase == AttemptPhase::ImportResolutionStub {
            LearningOutcome::ProvisionallyFixed
        } else {
            LearningOutcome::Success
        };
    }
    LearningOutcome::Improved
}

/// Path the file-session's staged change provenance lives at for a given
/// project, exposed so the engine can construct a [`LearningTelemetry`]
/// without re-deriving the `.deeprun` convention.
pub fn learning_root(project_root: &Path) -> PathBuf {
    project_root.join(".deeprun").join("learning")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::new_id;
    use chrono::Utc;

    fn sample_event(run_id: &Id) -> LearningEvent {
        LearningEvent::new(
            run_id.clone(),
            "proj-1".to_string(),
            0,
            "runtime_verify_failed",
            "goal",
            serde_json::json!([]),
            3,
            0,
            false,
            0,
            serde_json::json!({}),
            LearningOutcome::Success,
        )
    }

    #[test]
    fn append_and_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = LearningTelemetry::new(dir.path());
        let run_id = new_id();

        telemetry.append_run_event(&run_id, &sample_event(&run_id)).unwrap();
        telemetry.append_run_event(&run_id, &sample_event(&run_id)).unwrap();

        let events = telemetry.read_run_events(&run_id).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn missing_run_history_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = LearningTelemetry::new(dir.path());
        let events = telemetry.read_run_events(&new_id()).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn snapshot_is_written_once_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = LearningTelemetry::new(dir.path());
        let run_id = new_id();

        telemetry.write_snapshot(&run_id, 0, 1, &serde_json::json!({"a": 1})).unwrap();
        let err = telemetry.write_snapshot(&run_id, 0, 1, &serde_json::json!({"a": 2})).unwrap_err();
        assert!(matches!(err, TelemetryError::SnapshotExists(_)));
    }

    #[test]
    fn stub_debt_open_then_close_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = LearningTelemetry::new(dir.path());
        let run_id = new_id();

        let record = StubDebtRecord {
            run_id: run_id.clone(),
            step_index: 2,
            attempt: 1,
            stub_path: "src/dto/missing.ts".to_string(),
            exports: crate::correction::StubExportsSummary {
                default: false,
                named: vec!["OrderDto".to_string()],
                namespace: false,
                type_only: false,
            },
            status: StubDebtStatus::Open,
            created_at: Utc::now(),
        };
        telemetry.open_stub_debt(&record).unwrap();
        assert_eq!(telemetry.open_stub_debts(&run_id).unwrap().len(), 1);

        telemetry.close_stub_debt(&run_id, 2, 1).unwrap();
        assert!(telemetry.open_stub_debts(&run_id).unwrap().is_empty());
    }

    #[test]
    fn close_stub_debt_by_path_finds_the_entry_opened_under_a_different_step() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = LearningTelemetry::new(dir.path());
        let run_id = new_id();

        let record = StubDebtRecord {
            run_id: run_id.clone(),
            step_index: 2,
            attempt: 1,
            stub_path: "src/dto/missing.ts".to_string(),
            exports: crate::correction::StubExportsSummary {
                default: false,
                named: vec!["OrderDto".to_string()],
                namespace: false,
                type_only: false,
            },
            status: StubDebtStatus::Open,
            created_at: Utc::now(),
        };
        telemetry.open_stub_debt(&record).unwrap();

        // The debt-resolution step that pays this off runs at a later,
        // unrelated (step_index, attempt); closing must still find it.
        telemetry.close_stub_debt_by_path(&run_id, "src/dto/missing.ts").unwrap();
        assert!(telemetry.open_stub_debts(&run_id).unwrap().is_empty());
    }

    #[test]
    fn classify_outcome_distinguishes_provisional_from_real_success() {
        assert_eq!(
            classify_outcome(3, 0, AttemptPhase::ImportResolutionStub, false),
            LearningOutcome::ProvisionallyFixed
        );
        assert_eq!(
            classify_outcome(3, 0, AttemptPhase::DebtResolution, false),
            LearningOutcome::Success
        );
        assert_eq!(classify_outcome(3, 0, AttemptPhase::Normal, false), LearningOutcome::Success);
    }

    #[test]
    fn classify_outcome_regression_and_stall() {
        assert_eq!(classify_outcome(1, 2, AttemptPhase::Normal, false), LearningOutcome::Regressed);
        assert_eq!(classify_outcome(2, 2, AttemptPhase::Normal, false), LearningOutcome::Stalled);
        assert_eq!(classify_outcome(0, 0, AttemptPhase::Normal, false), LearningOutcome::Noop);
    }

    #[test]
    fn exhausted_always_classifies_as_failed() {
        assert_eq!(classify_outcome(3, 0, AttemptPhase::Normal, true), LearningOutcome::Failed);
    }
}
