//! Git gateway for checkpoint, commit, and rollback.
//!
//! Every invocation runs with the project root as working directory and
//! pathspecs constrained to `.`, so an engine driving a sub-package of a
//! monorepo never stages or reverts sibling packages.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Git operations scoped to one project directory.
pub struct GitGateway {
    project_root: PathBuf,
}

impl GitGateway {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
        }
    }

    fn run(&self, args: &[&str]) -> EngineResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.project_root)
            .output()
            .map_err(|e| EngineError::git("execute", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::git(args.join(" "), stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Whether the project root is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out == "true")
            .unwrap_or(false)
    }

    pub fn current_branch(&self) -> EngineResult<String> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn head_sha(&self) -> EngineResult<String> {
        self.run(&["rev-parse", "--short", "HEAD"])
    }

    /// Whether the package subtree has uncommitted changes (staged,
    /// unstaged, or untracked).
    pub fn has_changes(&self) -> EngineResult<bool> {
        let status = self.run(&["status", "--porcelain", "--untracked-files=all", "--", "."])?;
        Ok(!status.is_empty())
    }

    /// Paths with uncommitted changes, relative to the repository root.
    /// `--untracked-files=all` expands new directories into the individual
    /// files so boundary checks see every path.
    pub fn changed_files(&self) -> EngineResult<Vec<String>> {
        let status = self.run(&["status", "--porcelain", "--untracked-files=all", "--", "."])?;
        let mut files = Vec::new();
        for line in status.lines() {
            if line.len() < 4 {
                continue;
            }
            let path = &line[3..];
            // Renames show as "old -> new"; the new path is what changed.
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            files.push(path.trim_matches('"').to_string());
        }
        Ok(files)
    }

    fn stash_count(&self) -> EngineResult<usize> {
        Ok(self.run(&["stash", "list"])?.lines().count())
    }

    /// `git stash push -u -m <label>`. Returns whether an entry was actually
    /// created (a clean tree stashes nothing).
    pub fn stash_push(&self, label: &str) -> EngineResult<bool> {
        let before = self.stash_count()?;
        self.run(&["stash", "push", "-u", "-m", label])?;
        let created = self.stash_count()? > before;
        debug!(label, created, "stash push");
        Ok(created)
    }

    pub fn stash_pop(&self) -> EngineResult<()> {
        self.run(&["stash", "pop"])?;
        Ok(())
    }

    /// Drop the most recent stash entry whose message carries `label`.
    pub fn stash_drop(&self, label: &str) -> EngineResult<()> {
        let list = self.run(&["stash", "list"])?;
        for (index, line) in list.lines().enumerate() {
            if line.contains(label) {
                self.run(&["stash", "drop", &format!("stash@{{{index}}}")])?;
                return Ok(());
            }
        }
        warn!(label, "no stash entry found to drop");
        Ok(())
    }

    /// Stage and commit everything under the package. Returns the short SHA.
    pub fn commit(&self, message: &str, author: Option<&str>) -> EngineResult<String> {
        self.run(&["add", "-A", "--", "."])?;
        let mut args = vec!["commit", "-m", message];
        if let Some(author) = author {
            args.push("--author");
            args.push(author);
        }
        self.run(&args)?;
        let sha = self.head_sha()?;
        info!(sha, "committed");
        Ok(sha)
    }

    pub fn create_branch(&self, name: &str) -> EngineResult<()> {
        self.run(&["checkout", "-b", name])?;
        Ok(())
    }

    pub fn checkout_branch(&self, name: &str) -> EngineResult<()> {
        self.run(&["checkout", name])?;
        Ok(())
    }

    pub fn push_branch(&self, name: &str) -> EngineResult<()> {
        self.run(&["push", "-u", "origin", name])?;
        Ok(())
    }

    /// Discard every uncommitted change in the package subtree, then restore
    /// the pre-cycle stash when one was taken.
    ///
    /// Order is fixed: `checkout -- .`, `clean -fd -- .`, `stash pop`. A
    /// failure here is fatal to the run — the tree is in an unknown state.
    pub fn revert(&self, stash_was_created: bool) -> EngineResult<()> {
        let steps: [&[&str]; 2] = [&["checkout", "--", "."], &["clean", "-fd", "--", "."]];
        for step in steps {
            self.run(step).map_err(|e| EngineError::RevertFailed {
                message: e.to_string(),
            })?;
        }
        if stash_was_created {
            self.stash_pop().map_err(|e| EngineError::RevertFailed {
                message: e.to_string(),
            })?;
        }
        info!(stash_was_created, "working tree reverted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    fn setup_repo() -> (tempfile::TempDir, GitGateway) {
        let dir = tempdir().unwrap();
        let run = |args: &[&str]| {
            let out = Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap();
            assert!(out.status.success(), "git {args:?} failed");
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@test.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "initial"]);
        let gateway = GitGateway::new(dir.path());
        (dir, gateway)
    }

    #[test]
    fn detects_changes_and_files() {
        let (dir, git) = setup_repo();
        assert!(git.is_repo());
        assert!(!git.has_changes().unwrap());

        std::fs::write(dir.path().join("new.txt"), "content").unwrap();
        assert!(git.has_changes().unwrap());
        assert_eq!(git.changed_files().unwrap(), vec!["new.txt"]);
    }

    #[test]
    fn commit_returns_sha() {
        let (dir, git) = setup_repo();
        std::fs::write(dir.path().join("feature.rs"), "fn f() {}\n").unwrap();
        let sha = git.commit("add feature", None).unwrap();
        assert!(sha.len() >= 7);
        assert!(!git.has_changes().unwrap());
    }

    #[test]
    fn stash_on_clean_tree_creates_nothing() {
        let (_dir, git) = setup_repo();
        assert!(!git.stash_push("cycle-1").unwrap());
    }

    #[test]
    fn revert_restores_pre_cycle_tree_exactly() {
        let (dir, git) = setup_repo();

        // Pre-existing uncommitted work the engine must preserve.
        std::fs::write(dir.path().join("wip.txt"), "user work\n").unwrap();
        let stashed = git.stash_push("cycle-7").unwrap();
        assert!(stashed);

        // The failed cycle's damage: an edit and a stray new file.
        std::fs::write(dir.path().join("README.md"), "# Broken\n").unwrap();
        std::fs::write(dir.path().join("junk.rs"), "oops").unwrap();

        git.revert(stashed).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "# Test\n"
        );
        assert!(!dir.path().join("junk.rs").exists());
        // The user's stashed work came back.
        assert_eq!(
            std::fs::read_to_string(dir.path().join("wip.txt")).unwrap(),
            "user work\n"
        );
    }

    #[test]
    fn stash_drop_by_label() {
        let (dir, git) = setup_repo();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        git.stash_push("cycle-1").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        git.stash_push("cycle-2").unwrap();

        git.stash_drop("cycle-1").unwrap();
        let list = git.run(&["stash", "list"]).unwrap();
        assert!(list.contains("cycle-2"));
        assert!(!list.contains("cycle-1"));
    }

    #[test]
    fn branch_round_trip() {
        let (dir, git) = setup_repo();
        let original = git.current_branch().unwrap();
        std::fs::write(dir.path().join("x.rs"), "x").unwrap();
        git.create_branch("evonest/7-fix-parser").unwrap();
        git.commit("fix parser", None).unwrap();
        assert_eq!(git.current_branch().unwrap(), "evonest/7-fix-parser");
        git.checkout_branch(&original).unwrap();
        assert_eq!(git.current_branch().unwrap(), original);
    }
}
