//! File Session — stage proposed file mutations for one step under
//! caps, apply them atomically, commit via the Version-Control Adapter, and
//! expose diffs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use coordination::state::ProposedChange;

use crate::vcs::VcsAdapter;

#[derive(Debug, Error)]
pub enum FileSessionError {
    #[error("path traversal or escape from project root rejected: {0}")]
    PathEscape(String),

    #[error("refusing to mutate environment file without allowEnvMutation: {0}")]
    EnvMutationForbidden(String),

    #[error("create target already exists: {0}")]
    CreateTargetExists(String),

    #[error("update target does not exist: {0}")]
    UpdateTargetMissing(String),

    #[error("update target is unchanged: {0}")]
    UpdateNoop(String),

    #[error("delete target does not exist: {0}")]
    DeleteTargetMissing(String),

    #[error("too many files in one step: {count} > max {max}")]
    TooManyFiles { count: usize, max: u32 },

    #[error("file exceeds per-file byte cap: {path} is {bytes} bytes > max {max}")]
    FileTooLarge { path: String, bytes: u64, max: u64 },

    #[error("staged diff exceeds total byte cap: {bytes} > max {max}")]
    TotalDiffTooLarge { bytes: u64, max: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Vcs(#[from] crate::vcs::VcsError),
}

pub type FileSessionResult<T> = Result<T, FileSessionError>;

impl FileSessionError {
    pub fn to_structured(&self) -> crate::error::StructuredError {
        let code = match self {
            Self::PathEscape(_) => "FS_PATH_ESCAPE",
            Self::EnvMutationForbidden(_) => "FS_ENV_MUTATION_FORBIDDEN",
            Self::CreateTargetExists(_) => "FS_CREATE_TARGET_EXISTS",
            Self::UpdateTargetMissing(_) => "FS_UPDATE_TARGET_MISSING",
            Self::UpdateNoop(_) => "FS_UPDATE_NOOP",
            Self::DeleteTargetMissing(_) => "FS_DELETE_TARGET_MISSING",
            Self::TooManyFiles {.. } => "FS_TOO_MANY_FILES",
            Self::FileTooLarge {.. } => "FS_FILE_TOO_LARGE",
            Self::TotalDiffTooLarge {.. } => "FS_TOTAL_DIFF_TOO_LARGE",
            Self::Io(_) => "FS_IO_ERROR",
            Self::Vcs(_) => "FS_VCS_ERROR",
        };
        crate::error::StructuredError::new(code, self.to_string(), "reduce the step's scope or split it into smaller steps")
    }
}

/// Per-step caps sealed into the run's execution contract.
#[derive(Debug, Clone, Copy)]
pub struct SessionCaps {
    pub max_files_per_step: u32,
    pub max_file_bytes: u64,
    pub max_total_diff_bytes: u64,
    pub allow_env_mutation: bool,
}

/// A change staged but not yet written to disk.
#[derive(Debug, Clone)]
struct Staged {
    change: ProposedChange,
    abs_path: PathBuf,
    diff_bytes: u64,
}

/// One line of `getStagedDiffs()` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedDiff {
    pub path: String,
    pub action: String,
    pub diff_bytes: u64,
}

/// Stages proposed file changes for a single step, enforces caps, and
/// commits atomically. One `FileSession` per step attempt.
pub struct FileSession {
    project_root: PathBuf,
    step_id: String,
    step_index: i32,
    caps: SessionCaps,
    staged: Vec<Staged>,
    seen_paths: HashSet<String>,
}

impl FileSession {
    pub fn begin(project_root: impl AsRef<Path>, step_id: impl Into<String>, step_index: i32, caps: SessionCaps) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
            step_id: step_id.into(),
            step_index,
            caps,
            staged: Vec::new(),
            seen_paths: HashSet::new(),
        }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn step_index(&self) -> i32 {
        self.step_index
    }

    fn resolve(&self, rel_path: &str) -> FileSessionResult<PathBuf> {
        if Path::new(rel_path).is_absolute() {
            return Err(FileSessionError::PathEscape(rel_path.to_string()));
        }
        let joined = self.project_root.join(rel_path);
        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                std::path::Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(FileSessionError::PathEscape(rel_path.to_string()));
                    }
                }
                std::path::Component::CurDir => {}
                other => normalized.push(other),
            }
        }
        if !normalized.starts_with(&self.project_root) {
            return Err(FileSessionError::PathEscape(rel_path.to_string()));
        }
        Ok(normalized)
    }

    fn is_env_file(rel_path: &str) -> bool {
        Path::new(rel_path)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n == ".env" || n.starts_with(".env."))
        .unwrap_or(false)
    }

    /// Stage one proposed change. Enforces path-traversal rejection,
    /// `.env*` protection, create/update/delete existence rules, and the
    /// per-file byte cap incrementally (the total cap is re-checked in
    /// [`Self::validate`]).
    pub fn stage(&mut self, change: ProposedChange) -> FileSessionResult<()> {
        let path = change.path().to_string();

        if Self::is_env_file(&path) && !self.caps.allow_env_mutation {
            return Err(FileSessionError::EnvMutationForbidden(path));
        }

        let abs_path = self.resolve(&path)?;

        match &change {
            ProposedChange::Create { content,.. } => {
                if abs_path.exists() {
                    return Err(FileSessionError::CreateTargetExists(path));
                }
                self.check_file_bytes(&path, content.len() as u64)?;
            }
            ProposedChange::Update { content,.. } => {
                if !abs_path.exists() {
                    return Err(FileSessionError::UpdateTargetMissing(path));
                }
                let existing = std::fs::read_to_string(&abs_path).unwrap_or_default();
                if &existing == content {
                    return Err(FileSessionError::UpdateNoop(path));
                }
                self.check_file_bytes(&path, content.len() as u64)?;
            }
            ProposedChange::Delete {.. } => {
                if !abs_path.exists() {
                    return Err(FileSessionError::DeleteTargetMissing(path));
                }
            }
        }

        if self.seen_paths.insert(path.clone())
        && self.seen_paths.len() > self.caps.max_files_per_step as usize
        {
            return Err(FileSessionError::TooManyFiles {
                    count: self.seen_paths.len(),
                    max: self.caps.max_files_per_step,
            });
        }

        let diff_bytes = diff_byte_estimate(&change, &abs_path);
        self.staged.push(Staged { change, abs_path, diff_bytes });
        Ok(())
    }

    fn check_file_bytes(&self, path: &str, bytes: u64) -> FileSessionResult<()> {
        if bytes > self.caps.max_file_bytes {
            return Err(FileSessionError::FileTooLarge {
                    path: path.to_string(),
                    bytes,
                    max: self.caps.max_file_bytes,
            });
        }
        Ok(())
    }

    pub fn get_staged_diffs(&self) -> Vec<StagedDiff> {
        self.staged
        .iter()
        .map(|s| StagedDiff {
                path: s.change.path().to_string(),
                action: action_name(&s.change).to_string(),
                diff_bytes: s.diff_bytes,
        })
        .collect()
    }

    /// Re-validate caps across the whole staged set (total diff bytes),
    /// called before [`Self::apply`].
    pub fn validate(&self) -> FileSessionResult<()> {
        let total: u64 = self.staged.iter().map(|s| s.diff_bytes).sum();
        if total > self.caps.max_total_diff_bytes {
            return Err(FileSessionError::TotalDiffTooLarge {
                    bytes: total,
                    max: self.caps.max_total_diff_bytes,
            });
        }
        Ok(())
    }

    /// Write every staged change to disk. All-or-nothing in spirit: caller
    /// should call [`Self::validate`] first so writes only happen once caps
    /// are known to hold.
    pub fn apply(&self) -> FileSessionResult<()> {
        self.validate()?;
        for staged in &self.staged {
            match &staged.change {
                ProposedChange::Create { content,.. } | ProposedChange::Update { content,.. } => {
                    if let Some(parent) = staged.abs_path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&staged.abs_path, content)?;
                }
                ProposedChange::Delete {.. } => {
                    std::fs::remove_file(&staged.abs_path)?;
                }
            }
        }
        Ok(())
    }

    /// Apply then commit via the VCS adapter with the deterministic summary
    /// `<stepId> (<tool>) :: <goalSummary-64>`. Returns `None` if
    /// nothing actually changed on disk (legal only for non-correction steps
    /// — the caller enforces that).
    pub fn commit(&self, vcs: &VcsAdapter, tool: &str, goal: &str) -> FileSessionResult<Option<String>> {
        self.apply()?;
        let summary = commit_summary(&self.step_id, tool, goal);
        Ok(vcs.commit_all(&summary)?)
    }

    /// Discard staged changes without writing anything.
    pub fn abort(self) {
        drop(self);
    }

    pub fn staged_paths(&self) -> Vec<String> {
        self.staged.iter().map(|s| s.change.path().to_string()).collect()
    }
}

fn action_name(change: &ProposedChange) -> &'static str {
    match change {
        ProposedChange::Create {.. } => "create",
        ProposedChange::Update {.. } => "update",
        ProposedChange::Delete {.. } => "delete",
    }
}

fn diff_byte_estimate(change: &ProposedChange, existing_path: &Path) -> u64 {
    match change {
        ProposedChange::Create { content,.. } => content.len() as u64,
        ProposedChange::Update { content,.. } => {
            let before = std::fs::metadata(existing_path).map(|m| m.len()).unwrap_or(0);
            (content.len() as u64).saturating_add(before)
        }
        ProposedChange::Delete {.. } => std::fs::metadata(existing_path).map(|m| m.len()).unwrap_or(0),
    }
}

/// `<stepId> (<tool>) :: <goalSummary>` where goalSummary is the run goal
/// normalized (collapsed whitespace) and truncated to 64 characters.
pub fn commit_summary(step_id: &str, tool: &str, goal: &str) -> String {
    let normalized: String = goal.split_whitespace().collect::<Vec<_>>().join(" ");
    let truncated: String = normalized.chars().take(64).collect();
    format!("{step_id} ({tool}) :: {truncated}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn default_caps() -> SessionCaps {
        SessionCaps {
            max_files_per_step: 2,
            max_file_bytes: 1_000,
            max_total_diff_bytes: 2_000,
            allow_env_mutation: false,
        }
    }

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "t@t.com"],
            vec!["config", "user.name", "T"],
        ] {
            Command::new("git").args(&args).current_dir(dir.path()).output().unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "hello").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["commit", "-m", "init"]).current_dir(dir.path()).output().unwrap();
        dir
    }

    #[test]
    fn stage_create_rejects_existing_path() {
        let dir = init_repo();
        let mut session = FileSession::begin(dir.path(), "step-1", 0, default_caps());
        let err = session
        .stage(ProposedChange::Create {
                path: "README.md".into(),
                content: "x".into(),
        })
        .unwrap_err();
        assert!(matches!(err, FileSessionError::CreateTargetExists(_)));
    }

    #[test]
    fn stage_rejects_path_traversal() {
        let dir = init_repo();
        let mut session = FileSession::begin(dir.path(), "step-1", 0, default_caps());
        let err = session
        .stage(ProposedChange::Create {
                path: "../escape.txt".into(),
                content: "x".into(),
        })
        .unwrap_err();
        assert!(matches!(err, FileSessionError::PathEscape(_)));
    }

    #[test]
    fn stage_rejects_env_file_by_default() {
        let dir = init_repo();
        let mut session = FileSession::begin(dir.path(), "step-1", 0, default_caps());
        let err = session
        .stage(ProposedChange::Create {
                path: ".env".into(),
                content: "SECRET=1".into(),
        })
        .unwrap_err();
        assert!(matches!(err, FileSessionError::EnvMutationForbidden(_)));
    }

    #[test]
    fn stage_enforces_max_files_per_step() {
        let dir = init_repo();
        let mut session = FileSession::begin(dir.path(), "step-1", 0, default_caps());
        session
        .stage(ProposedChange::Create { path: "a.txt".into(), content: "a".into() })
        .unwrap();
        session
        .stage(ProposedChange::Create { path: "b.txt".into(), content: "b".into() })
        .unwrap();
        let err = session
        .stage(ProposedChange::Create { path: "c.txt".into(), content: "c".into() })
        .unwrap_err();
        assert!(matches!(err, FileSessionError::TooManyFiles {.. }));
    }

    #[test]
    fn apply_and_commit_writes_file_and_commits() {
        let dir = init_repo();
        let mut session = FileSession::begin(dir.path(), "step-1", 0, default_caps());
        session
        .stage(ProposedChange::Create { path: "new.txt".into(), content: "hi".into() })
        .unwrap();
        let vcs = VcsAdapter::new(dir.path());
        let hash = session.commit(&vcs, "write_file", "add a readme explaining things").unwrap();
        assert!(hash.is_some());
        assert_eq!(std::fs::read_to_string(dir.path().join("new.txt")).unwrap(), "hi");
    }

    #[test]
    fn commit_summary_truncates_goal_to_64_chars() {
        let goal = "x".repeat(100);
        let summary = commit_summary("step-1", "write_file", &goal);
        assert!(summary.starts_with("step-1 (write_file) :: "));
        let goal_part = summary.split("::").nth(1).unwrap().trim();
        assert_eq!(goal_part.len(), 64);
    }

    #[test]
    fn update_noop_rejected_when_content_identical() {
        let dir = init_repo();
        let mut session = FileSession::begin(dir.path(), "step-1", 0, default_caps());
        let err = session
        .stage(ProposedChange::Update { path: "README.md".into(), content: "hello".into() })
        .unwrap_err();
        assert!(matches!(err, FileSessionError::UpdateNoop(_)));
    }
}
