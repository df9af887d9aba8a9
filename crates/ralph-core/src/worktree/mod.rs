//! Worktree Manager (spec §4.7).
//!
//! Each task runs in its own git worktree under a managed root with the
//! layout `<root>/<repo-key>/slot-<N>/<issue>/<task-key>`, created via
//! `git worktree add --detach`. Git does not support concurrent worktree
//! operations on the same repository (it takes a lock file on the shared
//! object store), so all mutating git invocations are serialised through an
//! internal mutex.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A caller asked for a worktree path that is not a strict child of the
    /// managed root, or that resolves to the repo root itself — refused per
    /// the worktree-path-safety invariant.
    #[error("refusing unsafe worktree path: {0}")]
    UnsafePath(PathBuf),

    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// A single entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Identifies where a task's worktree lives in the managed root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeSlot {
    pub repo_key: String,
    pub slot: u32,
    pub issue_number: i64,
    pub task_key: String,
}

impl WorktreeSlot {
    /// Relative path fragment under the managed root, e.g.
    /// `acme-foo/slot-0/42/default`.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "{}/slot-{}/{}/{}",
            self.repo_key, self.slot, self.issue_number, self.task_key
        ))
    }
}

/// A dedicated worktree path for the merge-conflict recovery lane (spec
/// §4.9): `<root>/<repo-key>/merge-conflict/<issue>/attempt-<N>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflictSlot {
    pub repo_key: String,
    pub issue_number: i64,
    pub attempt: u32,
}

impl MergeConflictSlot {
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "{}/merge-conflict/{}/attempt-{}",
            self.repo_key, self.issue_number, self.attempt
        ))
    }
}

/// Normalize a raw configured concurrency slot count to a valid value.
/// Anything not a positive integer normalizes to a single slot (`0`),
/// per spec §4.7's "concurrency slot normalization to 0 on invalid".
pub fn normalize_slot_count(configured: i64) -> u32 {
    if configured > 0 {
        configured as u32
    } else {
        0
    }
}

/// Manages worktrees under a managed root directory, one main git
/// repository at a time.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    managed_root: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            managed_root: self.managed_root.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    pub fn new(repo_path: impl Into<PathBuf>, managed_root: impl Into<PathBuf>) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .arg("rev-parse")
            .arg("--git-dir")
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        Ok(Self {
            repo_path,
            managed_root: managed_root.into(),
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn managed_root(&self) -> &Path {
        &self.managed_root
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Whether the repo root itself (not a worktree) has uncommitted
    /// changes, per `git status --porcelain`. Used by preflight's
    /// dirty-repo check, which runs before any worktree for a task
    /// exists.
    pub fn repo_is_dirty(&self) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git status --porcelain".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "status --porcelain".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(!output.stdout.is_empty())
    }

    /// Resolve a slot to an absolute path, refusing anything that would
    /// not land strictly under the managed root or would resolve to the
    /// repo root itself.
    fn resolve_path(&self, relative: &Path) -> Result<PathBuf, WorktreeError> {
        if relative.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(WorktreeError::UnsafePath(relative.to_path_buf()));
        }

        let resolved = self.managed_root.join(relative);

        if resolved == self.repo_path || resolved == self.managed_root {
            return Err(WorktreeError::UnsafePath(resolved));
        }

        if !resolved.starts_with(&self.managed_root) {
            return Err(WorktreeError::UnsafePath(resolved));
        }

        Ok(resolved)
    }

    /// Create (or return, if already present and healthy) the worktree for
    /// a task slot, detached at the current HEAD of `base_branch`.
    pub fn create_worktree(
        &self,
        slot: &WorktreeSlot,
        base_branch: &str,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let path = self.resolve_path(&slot.relative_path())?;
        self.create_detached_at(&path, base_branch)
    }

    /// Create the dedicated merge-conflict recovery worktree.
    pub fn create_merge_conflict_worktree(
        &self,
        slot: &MergeConflictSlot,
        base_branch: &str,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let path = self.resolve_path(&slot.relative_path())?;
        self.create_detached_at(&path, base_branch)
    }

    fn create_detached_at(&self, path: &Path, base_branch: &str) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.health_check(path).is_ok() {
            return self.find_worktree_by_path(path);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to create parent directory: {}", parent.display()),
                source: e,
            })?;
        }

        let output = Command::new("git")
            .args(["worktree", "add", "--detach"])
            .arg(path)
            .arg(base_branch)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree add --detach".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(path);
            return Err(WorktreeError::GitExit {
                command: "worktree add --detach".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        self.find_worktree_by_path(path)
    }

    /// Health check: the path exists and has a `.git` marker file/dir, and
    /// is registered as a worktree of this repo.
    pub fn health_check(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        if !path.exists() || !path.join(".git").exists() {
            return Err(WorktreeError::ParseError(format!(
                "{} is missing or has no .git marker",
                path.display()
            )));
        }
        self.find_worktree_by_path(path)
    }

    pub fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.find_worktree_by_path(path).is_err() {
            if path.exists() {
                tracing::warn!(path = %path.display(), "directory not registered as worktree, removing contents");
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        parse_porcelain_output(&String::from_utf8_lossy(&output.stdout))
    }

    fn find_worktree_by_path(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.list_worktrees()?
            .into_iter()
            .find(|w| {
                std::fs::canonicalize(&w.path)
                    .map(|c| c == canonical)
                    .unwrap_or_else(|_| w.path == path)
            })
            .ok_or_else(|| WorktreeError::ParseError(format!("worktree not found: {}", path.display())))
    }

    /// Startup pruning: clean up stale worktree registrations and scan the
    /// managed root for orphaned directories (present on disk but not
    /// registered with git).
    pub fn prune_and_scan_orphans(&self) -> Result<Vec<PathBuf>, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree prune".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let registered: Vec<PathBuf> = self.list_worktrees()?.into_iter().map(|w| w.path).collect();
        let mut orphans = Vec::new();

        if self.managed_root.exists() {
            for repo_dir in std::fs::read_dir(&self.managed_root).into_iter().flatten().flatten() {
                scan_dir_for_orphans(&repo_dir.path(), &registered, &mut orphans);
            }
        }

        Ok(orphans)
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            let _ = std::fs::remove_dir_all(path);
        }
    }
}

fn scan_dir_for_orphans(dir: &Path, registered: &[PathBuf], orphans: &mut Vec<PathBuf>) {
    if !dir.is_dir() {
        return;
    }
    // Leaf directories (no further subdirectories) are candidate worktree
    // roots; anything not in the registered list and carrying no `.git`
    // marker is orphaned.
    let entries: Vec<_> = std::fs::read_dir(dir).into_iter().flatten().flatten().collect();
    let subdirs: Vec<_> = entries.iter().filter(|e| e.path().is_dir()).collect();

    if subdirs.is_empty() {
        if !registered.iter().any(|p| p == dir) && !dir.join(".git").exists() {
            orphans.push(dir.to_path_buf());
        }
        return;
    }

    for sub in subdirs {
        scan_dir_for_orphans(&sub.path(), registered, orphans);
    }
}

fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head: Option<String> = None;
    let mut branch: Option<String> = None;

    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("worktree ") {
            if let Some(p) = path.take() {
                worktrees.push(WorktreeInfo {
                    path: p,
                    branch: branch.take(),
                    head_commit: head.take().unwrap_or_default(),
                });
            }
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(rest.trim_start_matches("refs/heads/").to_string());
        } else if line.is_empty() {
            continue;
        }
    }

    if let Some(p) = path.take() {
        worktrees.push(WorktreeInfo {
            path: p,
            branch: branch.take(),
            head_commit: head.take().unwrap_or_default(),
        });
    }

    Ok(worktrees)
}
