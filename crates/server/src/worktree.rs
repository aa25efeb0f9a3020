//! Git working-copy management
//!
//! Creates and removes per-session worktrees, resolves the main branch, and
//! runs the rebase/squash/pull/push sequences against it. Every mutating
//! operation either fully succeeds or leaves the working copy in a
//! git-reported, inspectable state and returns the failing command with its
//! raw output — callers surface that detail, never summarize it away.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Hash of git's empty tree, used as the parent of root commits so
/// diff/rebase math still works.
pub const EMPTY_TREE_HASH: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Errors from git subprocess execution, with full diagnostic context
#[derive(Debug, Error)]
pub enum GitError {
    #[error("`{command}` failed in {workdir}: {stderr}")]
    CommandFailed {
        command: String,
        workdir: PathBuf,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("merge conflict from `{command}` in {workdir}: {stderr}")]
    MergeConflict {
        command: String,
        workdir: PathBuf,
        stdout: String,
        stderr: String,
    },

    #[error("commit hook rejected `{command}` in {workdir}: {stderr}")]
    HookFailed {
        command: String,
        workdir: PathBuf,
        stdout: String,
        stderr: String,
    },

    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    pub fn is_merge_conflict(&self) -> bool {
        matches!(self, GitError::MergeConflict { .. })
    }

    pub fn is_hook_failure(&self) -> bool {
        matches!(self, GitError::HookFailed { .. })
    }
}

/// Run a git command, returning trimmed stdout on success.
pub async fn run_git(args: &[&str], cwd: &Path) -> Result<String, GitError> {
    let command = format!("git {}", args.join(" "));
    debug!(
        component = "worktree",
        event = "git.run",
        command = %command,
        cwd = %cwd.display(),
    );

    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if output.status.success() {
        return Ok(stdout.trim().to_string());
    }

    Err(classify_failure(
        command,
        cwd.to_path_buf(),
        output.status.code(),
        stdout,
        stderr,
    ))
}

/// Classify a failed git invocation into the tagged error taxonomy.
fn classify_failure(
    command: String,
    workdir: PathBuf,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
) -> GitError {
    let combined = format!("{stdout}\n{stderr}");

    const CONFLICT_MARKERS: &[&str] = &[
        "CONFLICT",
        "Automatic merge failed",
        "could not apply",
        "needs merge",
        "Resolve all conflicts",
    ];
    if CONFLICT_MARKERS.iter().any(|m| combined.contains(m)) {
        return GitError::MergeConflict {
            command,
            workdir,
            stdout,
            stderr,
        };
    }

    const HOOK_MARKERS: &[&str] = &["pre-commit hook", "commit-msg hook", "husky", "lefthook"];
    if HOOK_MARKERS.iter().any(|m| combined.contains(m)) {
        return GitError::HookFailed {
            command,
            workdir,
            stdout,
            stderr,
        };
    }

    GitError::CommandFailed {
        command,
        workdir,
        exit_code,
        stdout,
        stderr,
    }
}

/// Manages per-session git worktrees for any number of repositories.
///
/// History-mutating operations are serialized per working-copy path through
/// an internal lock map; concurrent sessions on different paths proceed
/// independently.
pub struct WorktreeManager {
    main_branch_cache: DashMap<PathBuf, String>,
    path_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl WorktreeManager {
    pub fn new() -> Self {
        Self {
            main_branch_cache: DashMap::new(),
            path_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.path_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create an isolated worktree for a new session.
    ///
    /// The branch name comes from `branch_template` with a numeric suffix
    /// appended on collision; the worktree lands under
    /// `<repo>/worktrees/<branch>`. Returns the worktree path and the branch
    /// name actually used.
    pub async fn create_working_copy(
        &self,
        repo_path: &Path,
        branch_template: &str,
        base_branch: &str,
    ) -> Result<(PathBuf, String), GitError> {
        let lock = self.lock_for(repo_path);
        let _guard = lock.lock().await;

        let worktrees_dir = repo_path.join("worktrees");
        tokio::fs::create_dir_all(&worktrees_dir).await?;

        let template = sanitize_branch_name(branch_template);
        let branch = self
            .find_unique_branch(repo_path, &worktrees_dir, &template)
            .await?;
        let path = worktrees_dir.join(&branch);

        run_git(
            &[
                "worktree",
                "add",
                "-b",
                &branch,
                path.to_str().unwrap_or_default(),
                base_branch,
            ],
            repo_path,
        )
        .await?;

        info!(
            component = "worktree",
            event = "worktree.created",
            repo = %repo_path.display(),
            branch = %branch,
            path = %path.display(),
        );
        Ok((path, branch))
    }

    async fn find_unique_branch(
        &self,
        repo_path: &Path,
        worktrees_dir: &Path,
        template: &str,
    ) -> Result<String, GitError> {
        for n in 1..=100u32 {
            let candidate = if n == 1 {
                template.to_string()
            } else {
                format!("{template}-{n}")
            };
            let branch_taken = run_git(
                &["rev-parse", "--verify", &format!("refs/heads/{candidate}")],
                repo_path,
            )
            .await
            .is_ok();
            if !branch_taken && !worktrees_dir.join(&candidate).exists() {
                return Ok(candidate);
            }
        }
        Err(GitError::CommandFailed {
            command: "branch name selection".to_string(),
            workdir: repo_path.to_path_buf(),
            exit_code: None,
            stdout: String::new(),
            stderr: format!("no unique branch name available for template {template:?}"),
        })
    }

    /// Remove a session's worktree and best-effort delete its branch.
    pub async fn remove_working_copy(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
    ) -> Result<(), GitError> {
        let lock = self.lock_for(repo_path);
        let _guard = lock.lock().await;

        let branch = self.current_branch(worktree_path).await.ok();

        run_git(
            &[
                "worktree",
                "remove",
                "--force",
                worktree_path.to_str().unwrap_or_default(),
            ],
            repo_path,
        )
        .await?;
        run_git(&["worktree", "prune"], repo_path).await?;

        if let Some(branch) = branch {
            if let Err(e) = run_git(&["branch", "-D", &branch], repo_path).await {
                warn!(
                    component = "worktree",
                    event = "worktree.branch_delete_failed",
                    branch = %branch,
                    error = %e,
                    "Leaving session branch behind"
                );
            }
        }

        info!(
            component = "worktree",
            event = "worktree.removed",
            path = %worktree_path.display(),
        );
        Ok(())
    }

    /// Resolve the repository's main branch.
    ///
    /// An explicit per-project override wins; otherwise the detected default
    /// branch. Detection is cached per repository path.
    pub async fn detect_main_branch(
        &self,
        repo_path: &Path,
        override_branch: Option<&str>,
    ) -> Result<String, GitError> {
        if let Some(b) = override_branch {
            return Ok(b.to_string());
        }
        if let Some(cached) = self.main_branch_cache.get(repo_path) {
            return Ok(cached.clone());
        }

        let detected = self.detect_default_branch(repo_path).await?;
        self.main_branch_cache
            .insert(repo_path.to_path_buf(), detected.clone());
        Ok(detected)
    }

    async fn detect_default_branch(&self, repo_path: &Path) -> Result<String, GitError> {
        if let Ok(head) = run_git(&["symbolic-ref", "refs/remotes/origin/HEAD"], repo_path).await {
            if let Some(branch) = head.strip_prefix("refs/remotes/origin/") {
                return Ok(branch.to_string());
            }
        }
        for candidate in ["main", "master"] {
            if run_git(
                &["rev-parse", "--verify", &format!("refs/heads/{candidate}")],
                repo_path,
            )
            .await
            .is_ok()
            {
                return Ok(candidate.to_string());
            }
        }
        // Last resort: whatever HEAD currently points at.
        run_git(&["rev-parse", "--abbrev-ref", "HEAD"], repo_path).await
    }

    /// Rebase the main branch's new commits into a session's worktree.
    pub async fn rebase_main_into(
        &self,
        worktree_path: &Path,
        main_branch: &str,
    ) -> Result<(), GitError> {
        let lock = self.lock_for(worktree_path);
        let _guard = lock.lock().await;
        run_git(&["rebase", main_branch], worktree_path).await?;
        Ok(())
    }

    /// Abort a mid-rebase state, restoring the pre-rebase head.
    pub async fn abort_rebase(&self, worktree_path: &Path) -> Result<(), GitError> {
        let lock = self.lock_for(worktree_path);
        let _guard = lock.lock().await;
        run_git(&["rebase", "--abort"], worktree_path).await?;
        Ok(())
    }

    /// Collapse the worktree's history into one commit, rebase onto main,
    /// and fast-forward main to it. Returns the final commit hash.
    pub async fn squash_and_rebase_to_main(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        main_branch: &str,
        message: &str,
    ) -> Result<String, GitError> {
        let lock = self.lock_for(worktree_path);
        let _guard = lock.lock().await;

        let merge_base = run_git(&["merge-base", main_branch, "HEAD"], worktree_path).await?;
        run_git(&["reset", "--soft", &merge_base], worktree_path).await?;
        run_git(&["commit", "-m", message], worktree_path).await?;
        run_git(&["rebase", main_branch], worktree_path).await?;

        let branch = self.current_branch(worktree_path).await?;
        if branch != main_branch {
            self.fast_forward_main(repo_path, &branch).await?;
        }

        run_git(&["rev-parse", "HEAD"], worktree_path).await
    }

    /// Integrate the worktree's history into main without squashing.
    pub async fn rebase_to_main(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        main_branch: &str,
    ) -> Result<String, GitError> {
        let lock = self.lock_for(worktree_path);
        let _guard = lock.lock().await;

        run_git(&["rebase", main_branch], worktree_path).await?;
        let branch = self.current_branch(worktree_path).await?;
        if branch != main_branch {
            self.fast_forward_main(repo_path, &branch).await?;
        }
        run_git(&["rev-parse", "HEAD"], worktree_path).await
    }

    async fn fast_forward_main(&self, repo_path: &Path, branch: &str) -> Result<(), GitError> {
        let lock = self.lock_for(repo_path);
        let _guard = lock.lock().await;
        run_git(&["merge", "--ff-only", branch], repo_path).await?;
        Ok(())
    }

    pub async fn pull(&self, worktree_path: &Path) -> Result<(), GitError> {
        let lock = self.lock_for(worktree_path);
        let _guard = lock.lock().await;
        run_git(&["pull"], worktree_path).await?;
        Ok(())
    }

    pub async fn push(&self, worktree_path: &Path) -> Result<(), GitError> {
        run_git(&["push"], worktree_path).await?;
        Ok(())
    }

    /// Does the worktree carry anything main doesn't have — commits ahead of
    /// it, or uncommitted changes?
    pub async fn has_changes_to_rebase(
        &self,
        worktree_path: &Path,
        main_branch: &str,
    ) -> Result<bool, GitError> {
        let ahead = run_git(
            &["rev-list", "--count", &format!("{main_branch}..HEAD")],
            worktree_path,
        )
        .await?;
        if ahead.parse::<u64>().unwrap_or(0) > 0 {
            return Ok(true);
        }
        Ok(!self.status_porcelain(worktree_path).await?.is_empty())
    }

    /// The literal command sequence `rebase_main_into` executes, for
    /// display/audit.
    pub fn generate_rebase_commands(&self, main_branch: &str) -> Vec<String> {
        vec![format!("git rebase {main_branch}")]
    }

    /// The literal command sequence `squash_and_rebase_to_main` executes,
    /// for display/audit.
    pub fn generate_squash_commands(&self, main_branch: &str, message: &str) -> Vec<String> {
        vec![
            format!("git merge-base {main_branch} HEAD"),
            "git reset --soft <merge-base>".to_string(),
            format!("git commit -m {message:?}"),
            format!("git rebase {main_branch}"),
            "git merge --ff-only <session-branch>".to_string(),
        ]
    }

    /// Parent of a commit, substituting the empty tree for root commits.
    pub async fn parent_of(&self, worktree_path: &Path, commit: &str) -> Result<String, GitError> {
        match run_git(&["rev-parse", &format!("{commit}^")], worktree_path).await {
            Ok(parent) => Ok(parent),
            Err(_) => Ok(EMPTY_TREE_HASH.to_string()),
        }
    }

    pub async fn current_branch(&self, worktree_path: &Path) -> Result<String, GitError> {
        run_git(&["rev-parse", "--abbrev-ref", "HEAD"], worktree_path).await
    }

    pub async fn head_hash(&self, worktree_path: &Path) -> Result<String, GitError> {
        run_git(&["rev-parse", "HEAD"], worktree_path).await
    }

    /// `git status --porcelain` output; empty string means a clean tree.
    pub async fn status_porcelain(&self, worktree_path: &Path) -> Result<String, GitError> {
        run_git(&["status", "--porcelain"], worktree_path).await
    }
}

impl Default for WorktreeManager {
    fn default() -> Self {
        Self::new()
    }
}

fn sanitize_branch_name(template: &str) -> String {
    let cleaned: String = template
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '/' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "session".to_string()
    } else {
        trimmed.to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_and_remove_working_copy() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();

        let (path, branch) = mgr
            .create_working_copy(tmp.path(), "feature-x", "main")
            .await
            .unwrap();
        assert!(path.exists());
        assert_eq!(branch, "feature-x");
        assert_eq!(mgr.current_branch(&path).await.unwrap(), "feature-x");

        mgr.remove_working_copy(tmp.path(), &path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn second_working_copy_gets_unique_branch() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();

        let (_, first) = mgr
            .create_working_copy(tmp.path(), "task", "main")
            .await
            .unwrap();
        let (_, second) = mgr
            .create_working_copy(tmp.path(), "task", "main")
            .await
            .unwrap();
        assert_eq!(first, "task");
        assert_eq!(second, "task-2");
    }

    #[tokio::test]
    async fn detect_main_branch_prefers_override() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();

        assert_eq!(
            mgr.detect_main_branch(tmp.path(), Some("develop"))
                .await
                .unwrap(),
            "develop"
        );
        assert_eq!(mgr.detect_main_branch(tmp.path(), None).await.unwrap(), "main");
    }

    #[tokio::test]
    async fn has_changes_to_rebase_tracks_commits_and_dirt() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();
        let (wt, _) = mgr
            .create_working_copy(tmp.path(), "work", "main")
            .await
            .unwrap();

        assert!(!mgr.has_changes_to_rebase(&wt, "main").await.unwrap());

        tokio::fs::write(wt.join("dirty.txt"), "x").await.unwrap();
        assert!(mgr.has_changes_to_rebase(&wt, "main").await.unwrap());

        commit_file(&wt, "dirty.txt", "x", "work in progress").await;
        assert!(mgr.has_changes_to_rebase(&wt, "main").await.unwrap());
    }

    #[tokio::test]
    async fn squash_collapses_history_onto_main() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();
        let (wt, _) = mgr
            .create_working_copy(tmp.path(), "feat", "main")
            .await
            .unwrap();

        commit_file(&wt, "a.txt", "a", "step one").await;
        commit_file(&wt, "b.txt", "b", "step two").await;

        let hash = mgr
            .squash_and_rebase_to_main(tmp.path(), &wt, "main", "feat: one squashed commit")
            .await
            .unwrap();

        let main_head = run_git(&["rev-parse", "main"], tmp.path()).await.unwrap();
        assert_eq!(hash, main_head);

        let subject = run_git(&["log", "-1", "--format=%s", "main"], tmp.path())
            .await
            .unwrap();
        assert_eq!(subject, "feat: one squashed commit");

        // Both worktree commits collapsed into one on top of the base.
        let count = run_git(&["rev-list", "--count", "main"], tmp.path())
            .await
            .unwrap();
        assert_eq!(count, "2");
    }

    #[tokio::test]
    async fn conflicting_rebase_is_tagged_and_abortable() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();
        let (wt, _) = mgr
            .create_working_copy(tmp.path(), "conflict", "main")
            .await
            .unwrap();

        commit_file(tmp.path(), "shared.txt", "main version\n", "main edit").await;
        commit_file(&wt, "shared.txt", "session version\n", "session edit").await;

        let err = mgr.rebase_main_into(&wt, "main").await.unwrap_err();
        assert!(err.is_merge_conflict(), "expected conflict, got: {err}");

        mgr.abort_rebase(&wt).await.unwrap();
        assert!(mgr.status_porcelain(&wt).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn parent_of_root_commit_is_empty_tree() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();

        let root = run_git(&["rev-list", "--max-parents=0", "HEAD"], tmp.path())
            .await
            .unwrap();
        assert_eq!(
            mgr.parent_of(tmp.path(), &root).await.unwrap(),
            EMPTY_TREE_HASH
        );

        commit_file(tmp.path(), "x.txt", "x", "second").await;
        let head = mgr.head_hash(tmp.path()).await.unwrap();
        assert_eq!(mgr.parent_of(tmp.path(), &head).await.unwrap(), root);
    }

    #[test]
    fn sanitize_branch_names() {
        assert_eq!(sanitize_branch_name("fix login"), "fix-login");
        assert_eq!(sanitize_branch_name("--weird--"), "weird");
        assert_eq!(sanitize_branch_name(""), "session");
    }

    #[test]
    fn generated_squash_commands_mention_every_step() {
        let mgr = WorktreeManager::new();
        let cmds = mgr.generate_squash_commands("main", "final message");
        assert!(cmds.iter().any(|c| c.contains("merge-base")));
        assert!(cmds.iter().any(|c| c.contains("reset --soft")));
        assert!(cmds.iter().any(|c| c.contains("commit -m")));
        assert!(cmds.iter().any(|c| c.contains("rebase main")));
        assert!(cmds.iter().any(|c| c.contains("--ff-only")));
    }
}
