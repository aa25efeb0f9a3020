//! Commit-mode controller
//!
//! Decides whether and how to auto-commit after each agent turn, and
//! finalizes a session's history before merge. Checkpoint commits bypass
//! repository hooks (they are working snapshots, not final history), which
//! is why `should_warn_about_checkpoint_mode` exists.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use drydock_protocol::{CommitMode, CommitModeSettings};

use crate::worktree::{run_git, GitError, WorktreeManager};

/// Maximum prompt characters carried into a checkpoint commit message
const CHECKPOINT_MESSAGE_MAX: usize = 50;

/// Interval between working-copy polls in structured mode
const STRUCTURED_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Result of a post-prompt commit attempt
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub success: bool,
    pub commit_hash: Option<String>,
    pub error: Option<String>,
}

impl CommitOutcome {
    fn ok(commit_hash: Option<String>) -> Self {
        Self {
            success: true,
            commit_hash,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            commit_hash: None,
            error: Some(error),
        }
    }
}

/// Options for [`CommitModeController::finalize_session`]
#[derive(Debug, Clone, Default)]
pub struct FinalizeOptions {
    /// Collapse the session's history to one commit at the merge-base
    pub squash: bool,
    pub message: String,
    /// Shell commands run in the worktree after the finalizing commit
    pub post_commands: Vec<String>,
}

pub struct CommitModeController;

impl CommitModeController {
    /// Apply the configured commit mode after one agent turn.
    pub async fn handle_post_prompt_commit(
        worktrees: &WorktreeManager,
        worktree_path: &Path,
        settings: &CommitModeSettings,
        prompt_text: &str,
        sequence: u64,
    ) -> CommitOutcome {
        match settings.mode {
            CommitMode::Disabled => CommitOutcome::ok(None),

            CommitMode::Checkpoint => {
                match Self::checkpoint_commit(worktrees, worktree_path, settings, prompt_text)
                    .await
                {
                    Ok(hash) => {
                        if let Some(ref h) = hash {
                            info!(
                                component = "commit",
                                event = "commit.checkpoint_created",
                                worktree = %worktree_path.display(),
                                sequence = sequence,
                                hash = %h,
                            );
                        }
                        CommitOutcome::ok(hash)
                    }
                    Err(e) => CommitOutcome::failed(e.to_string()),
                }
            }

            CommitMode::Structured => {
                // The agent does the committing; optionally wait for its
                // commit to land by polling until the tree is clean.
                let Some(timeout_secs) = settings.confirm_commit_timeout_secs else {
                    return CommitOutcome::ok(None);
                };
                Self::await_agent_commit(
                    worktrees,
                    worktree_path,
                    Duration::from_secs(timeout_secs),
                )
                .await
            }
        }
    }

    async fn checkpoint_commit(
        worktrees: &WorktreeManager,
        worktree_path: &Path,
        settings: &CommitModeSettings,
        prompt_text: &str,
    ) -> Result<Option<String>, GitError> {
        if worktrees.status_porcelain(worktree_path).await?.is_empty() {
            debug!(
                component = "commit",
                event = "commit.checkpoint_skipped_clean",
                worktree = %worktree_path.display(),
            );
            return Ok(None);
        }

        let message = format!(
            "{}{}",
            settings.checkpoint_prefix,
            truncate_prompt(prompt_text)
        );
        run_git(&["add", "-A"], worktree_path).await?;
        run_git(&["commit", "--no-verify", "-m", &message], worktree_path).await?;
        Ok(Some(worktrees.head_hash(worktree_path).await?))
    }

    async fn await_agent_commit(
        worktrees: &WorktreeManager,
        worktree_path: &Path,
        timeout: Duration,
    ) -> CommitOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match worktrees.status_porcelain(worktree_path).await {
                Ok(status) if status.is_empty() => {
                    return match worktrees.head_hash(worktree_path).await {
                        Ok(hash) => CommitOutcome::ok(Some(hash)),
                        Err(e) => CommitOutcome::failed(e.to_string()),
                    };
                }
                Ok(status) => {
                    if tokio::time::Instant::now() >= deadline {
                        return CommitOutcome::failed(format!(
                            "agent did not commit before timeout; working copy still dirty:\n{status}"
                        ));
                    }
                }
                Err(e) => return CommitOutcome::failed(e.to_string()),
            }
            tokio::time::sleep(STRUCTURED_POLL_INTERVAL.min(timeout)).await;
        }
    }

    /// Instruction appended to prompts when the session runs in structured
    /// mode, telling the agent it owns the commit.
    pub fn structured_prompt_suffix(settings: &CommitModeSettings) -> Option<String> {
        if settings.mode != CommitMode::Structured {
            return None;
        }
        Some(settings.structured_instructions.clone().unwrap_or_else(|| {
            "\n\nAfter completing the work above, commit all of your changes \
             with a clear, conventional commit message."
                .to_string()
        }))
    }

    /// Finalize a session's history before merge. With `squash`, soft-reset
    /// to the merge-base with the main branch and create one commit with the
    /// caller's message. Returns the resulting HEAD hash.
    pub async fn finalize_session(
        worktrees: &WorktreeManager,
        worktree_path: &Path,
        main_branch: &str,
        options: &FinalizeOptions,
    ) -> Result<String, GitError> {
        if options.squash {
            let merge_base =
                run_git(&["merge-base", main_branch, "HEAD"], worktree_path).await?;
            run_git(&["reset", "--soft", &merge_base], worktree_path).await?;
            run_git(&["commit", "-m", &options.message], worktree_path).await?;
        }

        for command in &options.post_commands {
            debug!(
                component = "commit",
                event = "commit.post_command",
                command = %command,
            );
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(worktree_path)
                .output()
                .await?;
            if !output.status.success() {
                warn!(
                    component = "commit",
                    event = "commit.post_command_failed",
                    command = %command,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                );
            }
        }

        worktrees.head_hash(worktree_path).await
    }

    /// Checkpoint commits bypass hooks; flag working copies where hook
    /// tooling is present so the user learns that before it surprises them.
    pub async fn should_warn_about_checkpoint_mode(worktree_path: &Path) -> bool {
        const HOOK_TOOLING: &[&str] = &[
            ".husky",
            ".pre-commit-config.yaml",
            "lefthook.yml",
            ".lefthook.yml",
            ".changeset",
        ];
        for marker in HOOK_TOOLING {
            if worktree_path.join(marker).exists() {
                return true;
            }
        }
        worktree_path.join(".git/hooks/pre-commit").exists()
    }
}

/// Truncate prompt text for a checkpoint message: one line, at most
/// [`CHECKPOINT_MESSAGE_MAX`] characters, with `...` appended when cut.
pub fn truncate_prompt(text: &str) -> String {
    let one_line = text.replace(['\n', '\r'], " ");
    let one_line = one_line.trim();
    if one_line.chars().count() <= CHECKPOINT_MESSAGE_MAX {
        one_line.to_string()
    } else {
        let cut: String = one_line.chars().take(CHECKPOINT_MESSAGE_MAX).collect();
        format!("{}...", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worktree::test_support::*;
    use drydock_protocol::CommitModeSettings;
    use tempfile::TempDir;

    fn settings(mode: CommitMode) -> CommitModeSettings {
        CommitModeSettings {
            mode,
            ..CommitModeSettings::default()
        }
    }

    #[test]
    fn short_prompts_pass_through_untruncated() {
        assert_eq!(truncate_prompt("fix the login bug"), "fix the login bug");
    }

    #[test]
    fn long_prompts_truncate_to_fifty_chars_plus_ellipsis() {
        let long = "a".repeat(120);
        let out = truncate_prompt(&long);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), CHECKPOINT_MESSAGE_MAX + 3);
    }

    #[test]
    fn truncation_bound_holds_for_many_lengths() {
        for len in 0..200 {
            let text = "x".repeat(len);
            let out = truncate_prompt(&text);
            assert!(out.chars().count() <= CHECKPOINT_MESSAGE_MAX + 3);
            if len > CHECKPOINT_MESSAGE_MAX {
                assert!(out.ends_with("..."));
            } else {
                assert!(!out.ends_with("..."));
            }
        }
    }

    #[test]
    fn newlines_collapse_into_one_line() {
        let out = truncate_prompt("first line\nsecond line");
        assert_eq!(out, "first line second line");
    }

    #[tokio::test]
    async fn checkpoint_commits_dirty_tree_with_prefixed_message() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();

        tokio::fs::write(tmp.path().join("work.txt"), "changes")
            .await
            .unwrap();

        let outcome = CommitModeController::handle_post_prompt_commit(
            &mgr,
            tmp.path(),
            &settings(CommitMode::Checkpoint),
            "add a work file please",
            1,
        )
        .await;

        assert!(outcome.success);
        assert!(outcome.commit_hash.is_some());

        let subject = run_git(&["log", "-1", "--format=%s"], tmp.path())
            .await
            .unwrap();
        assert_eq!(subject, "checkpoint: add a work file please");
        assert!(mgr.status_porcelain(tmp.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn checkpoint_on_clean_tree_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();

        let before = mgr.head_hash(tmp.path()).await.unwrap();
        let outcome = CommitModeController::handle_post_prompt_commit(
            &mgr,
            tmp.path(),
            &settings(CommitMode::Checkpoint),
            "nothing changed",
            1,
        )
        .await;

        assert!(outcome.success);
        assert!(outcome.commit_hash.is_none());
        assert_eq!(mgr.head_hash(tmp.path()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn checkpoint_bypasses_failing_pre_commit_hook() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();

        let hook = tmp.path().join(".git/hooks/pre-commit");
        tokio::fs::write(&hook, "#!/bin/sh\nexit 1\n").await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        tokio::fs::write(tmp.path().join("w.txt"), "w").await.unwrap();
        let outcome = CommitModeController::handle_post_prompt_commit(
            &mgr,
            tmp.path(),
            &settings(CommitMode::Checkpoint),
            "hook should not block this",
            1,
        )
        .await;
        assert!(outcome.success, "hook bypass failed: {:?}", outcome.error);
    }

    #[tokio::test]
    async fn disabled_mode_always_succeeds() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();
        tokio::fs::write(tmp.path().join("dirty.txt"), "x").await.unwrap();

        let outcome = CommitModeController::handle_post_prompt_commit(
            &mgr,
            tmp.path(),
            &settings(CommitMode::Disabled),
            "anything",
            1,
        )
        .await;
        assert!(outcome.success);
        assert!(outcome.commit_hash.is_none());
        // The dirt stays; disabled means hands off.
        assert!(!mgr.status_porcelain(tmp.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn structured_mode_without_polling_defers_to_the_agent() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();

        let outcome = CommitModeController::handle_post_prompt_commit(
            &mgr,
            tmp.path(),
            &settings(CommitMode::Structured),
            "anything",
            1,
        )
        .await;
        assert!(outcome.success);
        assert!(outcome.commit_hash.is_none());
    }

    #[tokio::test]
    async fn structured_polling_times_out_on_a_dirty_tree() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();
        tokio::fs::write(tmp.path().join("never-committed.txt"), "x")
            .await
            .unwrap();

        let mut s = settings(CommitMode::Structured);
        s.confirm_commit_timeout_secs = Some(0);

        let outcome =
            CommitModeController::handle_post_prompt_commit(&mgr, tmp.path(), &s, "p", 1).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("did not commit"));
    }

    #[test]
    fn structured_suffix_only_in_structured_mode() {
        assert!(CommitModeController::structured_prompt_suffix(&settings(
            CommitMode::Structured
        ))
        .is_some());
        assert!(CommitModeController::structured_prompt_suffix(&settings(
            CommitMode::Checkpoint
        ))
        .is_none());
    }

    #[tokio::test]
    async fn finalize_squashes_to_single_commit_with_message() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new();
        let (wt, _) = mgr
            .create_working_copy(tmp.path(), "final", "main")
            .await
            .unwrap();

        commit_file(&wt, "a.txt", "a", "step 1").await;
        commit_file(&wt, "b.txt", "b", "step 2").await;

        let hash = CommitModeController::finalize_session(
            &mgr,
            &wt,
            "main",
            &FinalizeOptions {
                squash: true,
                message: "feat: the whole session".to_string(),
                post_commands: vec![],
            },
        )
        .await
        .unwrap();

        let subject = run_git(&["log", "-1", "--format=%s", &hash], &wt).await.unwrap();
        assert_eq!(subject, "feat: the whole session");

        let ahead = run_git(&["rev-list", "--count", "main..HEAD"], &wt)
            .await
            .unwrap();
        assert_eq!(ahead, "1");
    }

    #[tokio::test]
    async fn hook_tooling_is_flagged_for_checkpoint_mode() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        assert!(!CommitModeController::should_warn_about_checkpoint_mode(tmp.path()).await);

        tokio::fs::create_dir_all(tmp.path().join(".husky"))
            .await
            .unwrap();
        assert!(CommitModeController::should_warn_about_checkpoint_mode(tmp.path()).await);
    }
}
