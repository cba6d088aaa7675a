//! Version-Control Adapter — init repo, create/attach run branch +
//! worktree, commit, diff, reset, list commits.
//!

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;
const MAX_RUN_ID_LEN: usize = 100;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git {operation} failed: {message}")]
    Git { operation: String, message: String },

    #[error("invalid run branch name {0:?}: must be `run/<id>`, <=100 chars after the prefix, no path separators")]
    InvalidBranchName(String),

    #[error("worktree is dirty and no recovery commit is available (lastValid, current, base all empty)")]
    NoRecoveryRef,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VcsResult<T> = Result<T, VcsError>;

impl VcsError {
    fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Transient lock/contention failures are retryable; everything else is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Git { message,.. } => {
                let lower = message.to_lowercase();
                lower.contains("lock") || lower.contains("another git process") || lower.contains("timeout")
            }
            _ => false,
        }
    }

    pub fn to_structured(&self) -> crate::error::StructuredError {
        let code = match self {
            Self::Git {.. } => "VCS_GIT_ERROR",
            Self::InvalidBranchName(_) => "VCS_INVALID_BRANCH_NAME",
            Self::NoRecoveryRef => "VCS_NO_RECOVERY_REF",
            Self::Io(_) => "VCS_IO_ERROR",
        };
        let mut s = crate::error::StructuredError::new(code, self.to_string(), recovery_for(self));
        if self.is_retryable() {
            s = s.retryable();
        }
        s
    }
}

fn recovery_for(err: &VcsError) -> String {
    match err {
        VcsError::Git { message,.. } if message.to_lowercase().contains("lock") => {
            "wait and retry, or remove the stale.git/index.lock".to_string()
        }
        VcsError::InvalidBranchName(_) => {
            "sanitize the run id to <=100 chars with no `/` or whitespace".to_string()
        }
        VcsError::NoRecoveryRef => {
            "the run has no base/current/lastValid commit pointer; this run cannot be resumed"
            .to_string()
        }
        _ => "check git state with `git status`".to_string(),
    }
}

/// Validate `run/<sanitized-runId>`: prefix `run/`, the id
/// portion <=100 chars, no `/` or whitespace inside the id (it would be
/// ambiguous with nested refs).
pub fn validate_branch_name(branch: &str) -> VcsResult<()> {
    let Some(id) = branch.strip_prefix("run/") else {
        return Err(VcsError::InvalidBranchName(branch.to_string()));
    };
    if id.is_empty()
    || id.len() > MAX_RUN_ID_LEN
    || id.contains('/')
    || id.chars().any(|c| c.is_whitespace())
    {
        return Err(VcsError::InvalidBranchName(branch.to_string()));
    }
    Ok(())
}

pub fn run_branch_name(run_id: &str) -> String {
    format!("run/{run_id}")
}

/// A single commit's metadata, per `recent_commits`/`list_commits`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
}

/// Thin subprocess wrapper over `git`, scoped to one working directory
/// (either the project's main repo root or a run's worktree).
pub struct VcsAdapter {
    working_dir: PathBuf,
    max_retries: u32,
}

impl VcsAdapter {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn run(&self, args: &[&str]) -> VcsResult<String> {
        let output = Command::new("git")
        .args(args)
        .current_dir(&self.working_dir)
        .output()
        .map_err(|e| VcsError::git("execute", e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::git(args.join(" "), stderr.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_with_retry(&self, args: &[&str]) -> VcsResult<String> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            match self.run(args) {
                Ok(out) => return Ok(out),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    std::thread::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS * (1 << attempt)));
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| VcsError::git("retry", "max retries exceeded")))
    }

    /// Initialize a bare project repo if one doesn't already exist.
    pub fn init_repo(root: &Path) -> VcsResult<()> {
        std::fs::create_dir_all(root)?;
        if root.join(".git").exists() {
            return Ok(());
        }
        let output = Command::new("git")
        .args(["init"])
        .current_dir(root)
        .output()
        .map_err(|e| VcsError::git("init", e.to_string()))?;
        if !output.status.success() {
            return Err(VcsError::git("init", String::from_utf8_lossy(&output.stderr).to_string()));
        }
        Ok(())
    }

    pub fn current_commit(&self) -> VcsResult<String> {
        self.run(&["rev-parse", "HEAD"])
    }

    pub fn current_branch(&self) -> VcsResult<String> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn is_dirty(&self) -> VcsResult<bool> {
        Ok(!self.run(&["status", "--porcelain"])?.is_empty())
    }

    pub fn diff_stat(&self, from: &str, to: &str) -> VcsResult<String> {
        self.run(&["diff", "--stat", from, to])
    }

    /// Total added+removed bytes between two commits, used by the File
    /// Session and correction policy to enforce diff-byte caps.
    pub fn diff_bytes(&self, from: &str, to: &str) -> VcsResult<u64> {
        let numstat = self.run(&["diff", "--numstat", from, to])?;
        let mut total = 0u64;
        for line in numstat.lines() {
            let mut parts = line.split_whitespace();
            let added = parts.next().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
            let removed = parts.next().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
            total += added + removed;
        }
        Ok(total)
    }

    pub fn list_commits(&self, limit: usize) -> VcsResult<Vec<CommitInfo>> {
        let output = self.run(&["log", "--format=%H|%s", &format!("-{limit}")])?;
        Ok(output
            .lines()
            .filter_map(|line| {
                    let (hash, message) = line.split_once('|')?;
                    Some(CommitInfo {
                            hash: hash.to_string(),
                            message: message.to_string(),
                    })
            })
            .collect())
    }

    /// Reset hard to `commit`, discarding all working-tree state. Used for
    /// dirty-workspace recovery and rollback-to-last-valid.
    pub fn reset_hard(&self, commit: &str) -> VcsResult<()> {
        self.run(&["cat-file", "-t", commit])?;
        self.run_with_retry(&["reset", "--hard", commit])?;
        Ok(())
    }

    /// Stage everything and create a commit with the given message. Returns
    /// `None` if nothing changed (no-op commit — legal only for non-correction
    /// steps, enforced by the caller).
    pub fn commit_all(&self, message: &str) -> VcsResult<Option<String>> {
        self.run_with_retry(&["add", "-A"])?;
        if !self.is_dirty()? {
            return Ok(None);
        }
        self.run_with_retry(&["commit", "-m", message])?;
        Ok(Some(self.current_commit()?))
    }

    /// Create a new worktree at `path` on a fresh branch, rooted at `base_commit`.
    pub fn add_worktree(&self, path: &Path, branch: &str, base_commit: &str) -> VcsResult<()> {
        validate_branch_name(branch)?;
        self.run(&[
                "worktree",
                "add",
                "-b",
                branch,
                &path.display().to_string(),
                base_commit,
        ])?;
        Ok(())
    }

    /// Remove a worktree (force, since the caller has already verified state
    /// it no longer needs).
    pub fn remove_worktree(&self, path: &Path) -> VcsResult<()> {
        self.run(&["worktree", "remove", "--force", &path.display().to_string()])
        .map(|_| ())
        .or_else(|e| {
                // Already gone from disk but still tracked, or vice versa — both are fine to ignore.
                if !path.exists() {
                    Ok(())
                } else {
                    Err(e)
                }
        })
    }

    pub fn list_worktrees(&self) -> VcsResult<Vec<PathBuf>> {
        let output = self.run(&["worktree", "list", "--porcelain"])?;
        Ok(output
            .lines()
            .filter_map(|l| l.strip_prefix("worktree ").map(PathBuf::from))
            .collect())
    }
}

/// Ensure the isolated execution context for a run.
///
/// If a worktree already exists at `worktree_path` and is on `expected_branch`,
/// it is kept as-is (caller is responsible for dirty-workspace recovery).
/// Otherwise it is removed (if present) and recreated fresh at `base_commit`.
pub fn ensure_worktree(
    repo: &VcsAdapter,
    worktree_path: &Path,
    expected_branch: &str,
    base_commit: &str,
) -> VcsResult<()> {
    validate_branch_name(expected_branch)?;

    if worktree_path.exists() {
        let wt = VcsAdapter::new(worktree_path);
        if wt.current_branch().ok().as_deref() == Some(expected_branch) {
            return Ok(());
        }
        repo.remove_worktree(worktree_path)?;
        let _ = std::fs::remove_dir_all(worktree_path);
    }
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    repo.add_worktree(worktree_path, expected_branch, base_commit)
}

/// Dirty-workspace recovery policy: reset hard to the first ref available
/// among last-valid, current, base. Absence of all three is fatal.
pub fn recover_dirty_worktree(
    worktree: &VcsAdapter,
    last_valid: Option<&str>,
    current: Option<&str>,
    base: Option<&str>,
) -> VcsResult<String> {
    let recovery_ref = last_valid.or(current).or(base).ok_or(VcsError::NoRecoveryRef)?;
    worktree.reset_hard(recovery_ref)?;
    Ok(recovery_ref.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_test_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            StdCommand::new("git").args(&args).current_dir(dir.path()).output().unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "hello").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        StdCommand::new("git")
        .args(["commit", "-m", "init"])
        .current_dir(dir.path())
        .output()
        .unwrap();
        dir
    }

    #[test]
    fn branch_name_validation_accepts_well_formed() {
        assert!(validate_branch_name("run/abc-123").is_ok());
    }

    #[test]
    fn branch_name_validation_rejects_missing_prefix() {
        assert!(validate_branch_name("feature/abc").is_err());
    }

    #[test]
    fn branch_name_validation_rejects_too_long() {
        let long_id = "a".repeat(MAX_RUN_ID_LEN + 1);
        assert!(validate_branch_name(&format!("run/{long_id}")).is_err());
    }

    #[test]
    fn branch_name_validation_rejects_nested_slash() {
        assert!(validate_branch_name("run/abc/def").is_err());
    }

    #[test]
    fn commit_all_returns_none_when_nothing_changed() {
        let dir = init_test_repo();
        let adapter = VcsAdapter::new(dir.path());
        assert_eq!(adapter.commit_all("no-op").unwrap(), None);
    }

    #[test]
    fn commit_all_returns_hash_when_something_changed() {
        let dir = init_test_repo();
        let adapter = VcsAdapter::new(dir.path());
        std::fs::write(dir.path().join("new.txt"), "content").unwrap();
        let hash = adapter.commit_all("step-1 (write_file) :: test").unwrap();
        assert!(hash.is_some());
    }

    #[test]
    fn ensure_worktree_creates_fresh_when_absent() {
        let dir = init_test_repo();
        let adapter = VcsAdapter::new(dir.path());
        let base = adapter.current_commit().unwrap();
        let wt_path = dir.path().join(".deeprun/worktrees/run-1");
        ensure_worktree(&adapter, &wt_path, "run/run-1", &base).unwrap();
        assert!(wt_path.exists());
        let wt = VcsAdapter::new(&wt_path);
        assert_eq!(wt.current_branch().unwrap(), "run/run-1");
    }

    #[test]
    fn recover_dirty_worktree_prefers_last_valid() {
        let dir = init_test_repo();
        let adapter = VcsAdapter::new(dir.path());
        let base = adapter.current_commit().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let c1 = adapter.commit_all("a").unwrap().unwrap();
        std::fs::write(dir.path().join("dirty.txt"), "dirty").unwrap();

        let recovered = recover_dirty_worktree(&adapter, Some(&c1), None, Some(&base)).unwrap();
        assert_eq!(recovered, c1);
        assert!(!adapter.is_dirty().unwrap());
    }

    #[test]
    fn recover_dirty_worktree_fatal_without_any_ref() {
        let dir = init_test_repo();
        let adapter = VcsAdapter::new(dir.path());
        let err = recover_dirty_worktree(&adapter, None, None, None).unwrap_err();
        assert!(matches!(err, VcsError::NoRecoveryRef));
    }
}
