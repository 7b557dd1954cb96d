//! `git`-CLI-backed implementation of [`super::VcsDriver`] (§4.2).
//!
//! Every operation shells out to `git`, matching the teacher's preference
//! for wrapping the CLI rather than embedding a library. Nothing here
//! retries or interprets run/task semantics — that lives in the worktree
//! manager and scheduler above it.

use std::path::{Path, PathBuf};
use std::process::Command;

use glob::Pattern;

use super::VcsError;
use crate::ids::{ItemId, RunId};
use crate::model::worktree_info::WorktreeInfo;
use crate::time::now_iso8601;

use super::VcsDriver;

/// A [`VcsDriver`] backed by the `git` binary on `$PATH`.
pub struct GitCliDriver {
    root: PathBuf,
}

impl GitCliDriver {
    /// Build a driver rooted at `root` (the repository's working directory).
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn git(&self, dir: &Path, args: &[&str]) -> Result<std::process::Output, VcsError> {
        Command::new("git").args(args).current_dir(dir).output().map_err(VcsError::from)
    }

    fn run_ok(&self, dir: &Path, args: &[&str]) -> Result<String, VcsError> {
        let output = self.git(dir, args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(VcsError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
                exit_code: output.status.code(),
            })
        }
    }

    fn root_run_ok(&self, args: &[&str]) -> Result<String, VcsError> {
        self.run_ok(&self.root, args)
    }
}

impl VcsDriver for GitCliDriver {
    fn current_branch(&self) -> Result<String, VcsError> {
        Ok(self.root_run_ok(&["rev-parse", "--abbrev-ref", "HEAD"])?.trim().to_owned())
    }

    fn ensure_clean(&self, allowed_dirty: &[String]) -> Result<(), VcsError> {
        let status = self.root_run_ok(&["status", "--porcelain"])?;
        let patterns: Vec<Pattern> = allowed_dirty
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .collect();

        let offending: Vec<&str> = status
            .lines()
            .filter(|line| line.len() > 3)
            .filter(|line| {
                let path = line[3..].trim();
                !patterns.iter().any(|p| p.matches(path))
            })
            .collect();

        if offending.is_empty() {
            Ok(())
        } else {
            Err(VcsError::DirtyWorktree {
                path: self.root.clone(),
                message: format!("tracked changes outside allowed-dirty list: {}", offending.join(", ")),
            })
        }
    }

    fn create_run_branch(
        &self,
        run_id: &RunId,
        base: &str,
        prefix: &str,
    ) -> Result<String, VcsError> {
        let branch = format!("{prefix}/run-{run_id}");
        self.root_run_ok(&["branch", "--force", &branch, base])?;
        Ok(branch)
    }

    fn create_worktree(
        &self,
        state_dir: &Path,
        run_id: &RunId,
        item_id: ItemId,
        run_branch: &str,
    ) -> Result<WorktreeInfo, VcsError> {
        let path = WorktreeInfo::path_for(state_dir, run_id, item_id);
        let branch = WorktreeInfo::branch_for(run_branch, item_id);

        // Tear down any same-named artifacts from a previous, interrupted
        // attempt before creating fresh ones.
        self.remove_worktree(&path, Some(&branch))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().into_owned();
        self.root_run_ok(&[
            "worktree", "add", "-b", &branch, &path_str, run_branch,
        ])?;

        Ok(WorktreeInfo {
            item_id,
            run_id: run_id.clone(),
            path,
            branch,
            created_at: now_iso8601(),
        })
    }

    fn remove_worktree(&self, path: &Path, branch: Option<&str>) -> Result<(), VcsError> {
        if path.exists() {
            let path_str = path.to_string_lossy().into_owned();
            let removed = self.git(&self.root, &["worktree", "remove", "--force", &path_str])?;
            if !removed.status.success() {
                // Fall back to a plain filesystem delete if git refuses —
                // e.g. a worktree whose admin metadata is already gone.
                std::fs::remove_dir_all(path)?;
            }
        }
        let _ = self.git(&self.root, &["worktree", "prune"]);

        if let Some(branch) = branch {
            let _ = self.git(&self.root, &["branch", "-D", branch]);
        }

        Ok(())
    }

    fn verify_worker_merge(&self, branch: &str, run_branch: &str) -> Result<(), VcsError> {
        let output = self.git(
            &self.root,
            &["merge-base", "--is-ancestor", branch, run_branch],
        )?;
        if output.status.success() {
            return Ok(());
        }

        let recent = self.recent_commits(run_branch, 5).unwrap_or_default();
        Err(VcsError::MergeNotVerified {
            branch: branch.to_owned(),
            run_branch: run_branch.to_owned(),
            detail: format!(
                "`{branch}` tip is not an ancestor of `{run_branch}` tip; recent commits: {}",
                recent.join(" | ")
            ),
        })
    }

    fn merge_run_branch(
        &self,
        run_branch: &str,
        target: &str,
        transient_files: &[&str],
    ) -> Result<(), VcsError> {
        self.root_run_ok(&["checkout", target])?;
        self.root_run_ok(&[
            "merge", "--no-edit", "--no-ff", run_branch,
        ])?;

        let existing: Vec<&str> = transient_files
            .iter()
            .copied()
            .filter(|f| self.root.join(f).exists())
            .collect();

        if !existing.is_empty() {
            let mut rm_args = vec!["rm", "-f", "--ignore-unmatch"];
            rm_args.extend(existing.iter().copied());
            self.root_run_ok(&rm_args)?;
            self.root_run_ok(&[
                "commit", "-m", "chore: remove transient worker contract files",
            ])?;
        }

        Ok(())
    }

    fn restore_branch(&self, name: &str) -> Result<(), VcsError> {
        let _ = self.git(&self.root, &["merge", "--abort"]);
        let _ = self.git(&self.root, &["rebase", "--abort"]);
        self.root_run_ok(&["checkout", "--force", name])?;
        self.root_run_ok(&["clean", "-fd"])?;
        Ok(())
    }

    fn recent_commits(&self, run_branch: &str, limit: usize) -> Result<Vec<String>, VcsError> {
        let limit_arg = format!("-{limit}");
        let output = self.root_run_ok(&["log", &limit_arg, "--oneline", run_branch])?;
        Ok(output.lines().map(ToOwned::to_owned).collect())
    }

    fn close_without_work(
        &self,
        worktree_path: &Path,
        branch: &str,
        run_branch: &str,
    ) -> Result<String, VcsError> {
        self.run_ok(worktree_path, &["commit", "--allow-empty", "-m", "chore: no work needed"])?;
        self.root_run_ok(&["checkout", run_branch])?;
        self.root_run_ok(&["merge", "--ff-only", branch])?;
        Ok(self.root_run_ok(&["rev-parse", "HEAD"])?.trim().to_owned())
    }

    fn delete_branch(&self, branch: &str) -> Result<(), VcsError> {
        let _ = self.git(&self.root, &["branch", "-D", branch]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let status = StdCommand::new("git")
                .args(args)
                .current_dir(dir.path())
                .status()
                .unwrap();
            assert!(status.success());
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "test"]);
        std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "initial"]);
        dir
    }

    #[test]
    fn current_branch_reports_main() {
        let dir = init_repo();
        let driver = GitCliDriver::new(dir.path().to_owned());
        assert_eq!(driver.current_branch().unwrap(), "main");
    }

    #[test]
    fn ensure_clean_passes_on_pristine_repo() {
        let dir = init_repo();
        let driver = GitCliDriver::new(dir.path().to_owned());
        driver.ensure_clean(&[]).unwrap();
    }

    #[test]
    fn ensure_clean_rejects_tracked_dirty_file() {
        let dir = init_repo();
        std::fs::write(dir.path().join("README.md"), "changed\n").unwrap();
        let driver = GitCliDriver::new(dir.path().to_owned());
        assert!(driver.ensure_clean(&[]).is_err());
    }

    #[test]
    fn ensure_clean_allows_globbed_dirty_file() {
        let dir = init_repo();
        std::fs::write(dir.path().join("NOTES.generated.md"), "x").unwrap();
        StdCommand::new("git")
            .args(["add", "NOTES.generated.md"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        let driver = GitCliDriver::new(dir.path().to_owned());
        driver.ensure_clean(&["*.generated.md".to_owned()]).unwrap();
    }

    #[test]
    fn create_run_branch_and_worktree_roundtrip() {
        let dir = init_repo();
        let driver = GitCliDriver::new(dir.path().to_owned());
        let run_id = RunId::new("testrun1").unwrap();
        let run_branch = driver.create_run_branch(&run_id, "main", "dagwork").unwrap();
        assert_eq!(run_branch, "dagwork/run-testrun1");

        let item_id = ItemId::new(1).unwrap();
        let state_dir = dir.path().join(".dagwork");
        let info = driver
            .create_worktree(&state_dir, &run_id, item_id, &run_branch)
            .unwrap();
        assert!(info.path.exists());
        assert_eq!(info.branch, "dagwork/run-testrun1-item-1");

        driver.remove_worktree(&info.path, Some(&info.branch)).unwrap();
        assert!(!info.path.exists());
    }

    #[test]
    fn remove_worktree_is_idempotent() {
        let dir = init_repo();
        let driver = GitCliDriver::new(dir.path().to_owned());
        let path = dir.path().join(".dagwork/worktrees/nonexistent");
        driver.remove_worktree(&path, None).unwrap();
        driver.remove_worktree(&path, None).unwrap();
    }

    #[test]
    fn verify_worker_merge_fails_when_not_ancestor() {
        let dir = init_repo();
        let driver = GitCliDriver::new(dir.path().to_owned());
        StdCommand::new("git")
            .args(["branch", "other"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        std::fs::write(dir.path().join("other.txt"), "x").unwrap();
        StdCommand::new("git")
            .args(["checkout", "-q", "other"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        StdCommand::new("git")
            .args(["add", "."])
            .current_dir(dir.path())
            .status()
            .unwrap();
        StdCommand::new("git")
            .args(["commit", "-q", "-m", "diverge"])
            .current_dir(dir.path())
            .status()
            .unwrap();

        let err = driver.verify_worker_merge("other", "main").unwrap_err();
        assert!(matches!(err, VcsError::MergeNotVerified { .. }));
    }

    #[test]
    fn delete_branch_is_idempotent() {
        let dir = init_repo();
        let driver = GitCliDriver::new(dir.path().to_owned());
        StdCommand::new("git").args(["branch", "throwaway"]).current_dir(dir.path()).status().unwrap();
        driver.delete_branch("throwaway").unwrap();
        driver.delete_branch("throwaway").unwrap();
    }

    #[test]
    fn close_without_work_fast_forwards_run_branch() {
        let dir = init_repo();
        let driver = GitCliDriver::new(dir.path().to_owned());
        let run_id = RunId::new("testrun2").unwrap();
        let run_branch = driver.create_run_branch(&run_id, "main", "dagwork").unwrap();
        let item_id = ItemId::new(1).unwrap();
        let state_dir = dir.path().join(".dagwork");
        let info = driver.create_worktree(&state_dir, &run_id, item_id, &run_branch).unwrap();

        let before = driver.recent_commits(&run_branch, 1).unwrap();
        let hash = driver.close_without_work(&info.path, &info.branch, &run_branch).unwrap();
        let after = driver.recent_commits(&run_branch, 1).unwrap();

        assert_ne!(before, after);
        assert!(!hash.is_empty());
        driver.remove_worktree(&info.path, Some(&info.branch)).unwrap();
    }
}
