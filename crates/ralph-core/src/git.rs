//! Small, explicit wrapper around `git` subprocess calls.
//!
//! The core only checks out or creates the loop branch at start and performs
//! the optional merge-target action at completion; all other git activity
//! (commits within a story) belongs to the agent.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::{debug, info, warn};

use crate::error::{RalphError, RalphResult};

/// Executes git commands in a fixed working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn run(&self, args: &[&str]) -> RalphResult<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .map_err(|e| RalphError::Git(format!("failed to run git {}: {e}", args.join(" "))))
    }

    fn run_capture(&self, args: &[&str]) -> RalphResult<String> {
        let out = self.run(args)?;
        if !out.status.success() {
            return Err(RalphError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn run_checked(&self, args: &[&str]) -> RalphResult<()> {
        self.run_capture(args).map(|_| ())
    }

    /// Repository toplevel for a directory, if it is inside a git repo.
    pub fn toplevel(from: &Path) -> Option<PathBuf> {
        let out = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(from)
            .output()
            .ok()?;
        if !out.status.success() {
            return None;
        }
        Some(PathBuf::from(
            String::from_utf8_lossy(&out.stdout).trim().to_string(),
        ))
    }

    pub fn current_branch(&self) -> RalphResult<String> {
        let name = self
            .run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string();
        if name == "HEAD" {
            return Err(RalphError::Git("detached HEAD (refuse to run)".into()));
        }
        Ok(name)
    }

    /// The repository's default branch: `origin/HEAD` when set, otherwise
    /// the first of `main`/`master` that exists.
    pub fn default_branch(&self) -> RalphResult<String> {
        if let Ok(sym) = self.run_capture(&["symbolic-ref", "refs/remotes/origin/HEAD"]) {
            if let Some(name) = sym.trim().strip_prefix("refs/remotes/origin/") {
                return Ok(name.to_string());
            }
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate)? {
                return Ok(candidate.to_string());
            }
        }
        Err(RalphError::Git("cannot determine default branch".into()))
    }

    pub fn branch_exists(&self, branch: &str) -> RalphResult<bool> {
        let out = self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(out.status.success())
    }

    /// Tracked modifications present (untracked files are allowed: the agent
    /// leaves scratch files around and they don't conflict with checkout).
    pub fn has_tracked_changes(&self) -> RalphResult<bool> {
        let out = self.run_capture(&["status", "--porcelain=v1"])?;
        Ok(out.lines().any(|l| !l.trim().is_empty() && !l.starts_with("??")))
    }

    /// Ensure the working tree is on `branch`: check it out when it exists,
    /// create it from the default branch when it doesn't. Fails with a clear
    /// error when switching would clobber uncommitted tracked changes.
    pub fn ensure_branch(&self, branch: &str) -> RalphResult<()> {
        let current = self.current_branch()?;
        if current == branch {
            debug!(branch, "already on loop branch");
            return Ok(());
        }

        if self.has_tracked_changes()? {
            return Err(RalphError::Git(format!(
                "uncommitted changes on '{current}' would conflict with checking out \
                 '{branch}'; commit or stash them first"
            )));
        }

        if self.branch_exists(branch)? {
            info!(branch, "checking out existing loop branch");
            self.run_checked(&["checkout", branch])
        } else {
            let base = self.default_branch()?;
            info!(branch, %base, "creating loop branch");
            self.run_checked(&["checkout", "-b", branch, &base])
        }
    }

    /// Merge `branch` into `target`: fast-forward when possible, a merge
    /// commit otherwise. Leaves the tree on `target`; the caller reports.
    pub fn merge_into(&self, branch: &str, target: &str) -> RalphResult<String> {
        self.run_checked(&["checkout", target])?;

        let ff = self.run(&["merge", "--ff-only", branch])?;
        if ff.status.success() {
            info!(branch, target, "fast-forward merge");
            return Ok("fast-forward".to_string());
        }

        let merge = self.run(&[
            "merge",
            "--no-ff",
            "-m",
            &format!("Merge branch '{branch}' into {target}"),
            branch,
        ])?;
        if merge.status.success() {
            info!(branch, target, "merge commit created");
            Ok("merge-commit".to_string())
        } else {
            warn!(branch, target, "merge failed");
            Err(RalphError::Git(format!(
                "merge of '{branch}' into '{target}' failed: {}",
                String::from_utf8_lossy(&merge.stderr).trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_repo() -> (tempfile::TempDir, Git) {
        let dir = tempfile::tempdir().unwrap();
        let git = Git::new(dir.path());
        let sh = |args: &[&str]| {
            let out = Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap();
            assert!(out.status.success(), "git {args:?} failed");
        };
        sh(&["init", "-b", "main"]);
        sh(&["config", "user.email", "test@example.com"]);
        sh(&["config", "user.name", "Test"]);
        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        sh(&["add", "."]);
        sh(&["commit", "-m", "init"]);
        (dir, git)
    }

    #[test]
    fn ensure_branch_creates_and_reuses() {
        let (_dir, git) = init_repo();

        git.ensure_branch("ralph/feature-x").unwrap();
        assert_eq!(git.current_branch().unwrap(), "ralph/feature-x");

        // Back to main, then ensure checks out the existing branch.
        git.run_checked(&["checkout", "main"]).unwrap();
        git.ensure_branch("ralph/feature-x").unwrap();
        assert_eq!(git.current_branch().unwrap(), "ralph/feature-x");
    }

    #[test]
    fn dirty_tree_blocks_branch_switch() {
        let (dir, git) = init_repo();
        fs::write(dir.path().join("README.md"), "dirty\n").unwrap();
        let err = git.ensure_branch("ralph/other").unwrap_err();
        assert!(err.to_string().contains("uncommitted changes"));
    }

    #[test]
    fn untracked_files_do_not_block() {
        let (dir, git) = init_repo();
        fs::write(dir.path().join("scratch.txt"), "notes\n").unwrap();
        git.ensure_branch("ralph/ok").unwrap();
    }

    #[test]
    fn merge_fast_forwards_when_possible() {
        let (dir, git) = init_repo();
        git.ensure_branch("ralph/work").unwrap();
        fs::write(dir.path().join("new.txt"), "work\n").unwrap();
        git.run_checked(&["add", "."]).unwrap();
        git.run_checked(&["commit", "-m", "work"]).unwrap();

        let kind = git.merge_into("ralph/work", "main").unwrap();
        assert_eq!(kind, "fast-forward");
        assert_eq!(git.current_branch().unwrap(), "main");
    }

    #[test]
    fn merge_creates_commit_on_divergence() {
        let (dir, git) = init_repo();
        git.ensure_branch("ralph/work").unwrap();
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        git.run_checked(&["add", "."]).unwrap();
        git.run_checked(&["commit", "-m", "a"]).unwrap();

        git.run_checked(&["checkout", "main"]).unwrap();
        fs::write(dir.path().join("b.txt"), "b\n").unwrap();
        git.run_checked(&["add", "."]).unwrap();
        git.run_checked(&["commit", "-m", "b"]).unwrap();

        let kind = git.merge_into("ralph/work", "main").unwrap();
        assert_eq!(kind, "merge-commit");
    }
}
