//! Derived commit lists and diff computation
//!
//! Nothing here is stored: commit records are computed on demand from the
//! working copy's git history plus working-directory status. Sequence
//! numbers are 1-based over commits ordered newest-first; sequence 0 is the
//! synthetic "uncommitted changes" entry when the tree is dirty.

use std::path::Path;

use chrono::{DateTime, Utc};

use drydock_protocol::{CommitRecord, DiffStats, UNCOMMITTED};

use crate::worktree::{run_git, GitError, WorktreeManager};

/// What a diff is computed against on the newer side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffTarget {
    /// The working directory, including uncommitted changes
    WorkingTree,
    Commit(String),
}

/// The base (older side) of a diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffBase {
    /// The parent of this commit (empty tree for roots)
    ParentOf(String),
    Commit(String),
}

/// A resolved diff span ready for `git diff`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffSpan {
    pub base: DiffBase,
    pub target: DiffTarget,
}

/// Resolve a combined-diff selection against a derived commit list.
///
/// Selection semantics (sequence numbers refer to `commits`):
/// - `[]` — everything from the working copy's first commit through any
///   uncommitted changes;
/// - `[0]` — uncommitted changes only;
/// - two elements with one `0` — from the other selected commit through the
///   working directory;
/// - two real sequence numbers — from the parent of the older commit
///   through the newer commit;
/// - more than two ids — collapsed to a range from the oldest to the newest
///   selected id.
pub fn resolve_selection(selection: &[u32], commits: &[CommitRecord]) -> Option<DiffSpan> {
    let hash_of = |seq: u32| -> Option<String> {
        commits
            .iter()
            .find(|c| c.sequence == seq && !c.is_uncommitted())
            .map(|c| c.hash.clone())
    };
    let oldest_real = commits
        .iter()
        .filter(|c| !c.is_uncommitted())
        .max_by_key(|c| c.sequence);

    if selection.is_empty() {
        // Whole history through the working tree. With no commits at all
        // there is still the dirty tree against HEAD (if any).
        return Some(match oldest_real {
            Some(oldest) => DiffSpan {
                base: DiffBase::ParentOf(oldest.hash.clone()),
                target: DiffTarget::WorkingTree,
            },
            None => DiffSpan {
                base: DiffBase::Commit("HEAD".to_string()),
                target: DiffTarget::WorkingTree,
            },
        });
    }

    if selection == [0] {
        return Some(DiffSpan {
            base: DiffBase::Commit("HEAD".to_string()),
            target: DiffTarget::WorkingTree,
        });
    }

    if selection.len() == 1 {
        let hash = hash_of(selection[0])?;
        return Some(DiffSpan {
            base: DiffBase::ParentOf(hash.clone()),
            target: DiffTarget::Commit(hash),
        });
    }

    // Two or more ids collapse to oldest..newest of the selection.
    let includes_working_tree = selection.contains(&0);
    let real: Vec<u32> = selection.iter().copied().filter(|&s| s != 0).collect();
    if real.is_empty() {
        return Some(DiffSpan {
            base: DiffBase::Commit("HEAD".to_string()),
            target: DiffTarget::WorkingTree,
        });
    }

    // Larger sequence number = older commit (newest-first numbering).
    let oldest_seq = *real.iter().max()?;
    let newest_seq = *real.iter().min()?;
    let base = DiffBase::ParentOf(hash_of(oldest_seq)?);

    let target = if includes_working_tree {
        DiffTarget::WorkingTree
    } else {
        DiffTarget::Commit(hash_of(newest_seq)?)
    };

    Some(DiffSpan { base, target })
}

/// List the working copy's commits ahead of `main_branch`, newest first,
/// with a synthetic uncommitted entry at sequence 0 when the tree is dirty.
pub async fn execution_diffs(
    worktrees: &WorktreeManager,
    worktree_path: &Path,
    main_branch: &str,
    limit: usize,
) -> Result<Vec<CommitRecord>, GitError> {
    let mut records = Vec::new();

    let dirty = !worktrees.status_porcelain(worktree_path).await?.is_empty();
    if dirty {
        records.push(CommitRecord {
            sequence: 0,
            hash: UNCOMMITTED.to_string(),
            message: "Uncommitted changes".to_string(),
            author: String::new(),
            stats: numstat(worktree_path, &["diff", "--numstat", "HEAD"]).await?,
            timestamp: Utc::now(),
        });
    }

    let range = format!("{main_branch}..HEAD");
    let log = run_git(
        &[
            "log",
            "--format=%H%x1f%s%x1f%an%x1f%aI",
            "-n",
            &limit.to_string(),
            &range,
        ],
        worktree_path,
    )
    .await?;

    for (i, line) in log.lines().filter(|l| !l.is_empty()).enumerate() {
        let mut fields = line.split('\u{1f}');
        let hash = fields.next().unwrap_or_default().to_string();
        let message = fields.next().unwrap_or_default().to_string();
        let author = fields.next().unwrap_or_default().to_string();
        let timestamp = fields
            .next()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let parent = worktrees.parent_of(worktree_path, &hash).await?;
        let stats = numstat(worktree_path, &["diff", "--numstat", &parent, &hash]).await?;

        records.push(CommitRecord {
            sequence: (i + 1) as u32,
            hash,
            message,
            author,
            stats,
            timestamp,
        });
    }

    Ok(records)
}

/// Produce the patch text for a resolved combined-diff selection.
pub async fn combined_diff(
    worktrees: &WorktreeManager,
    worktree_path: &Path,
    selection: &[u32],
    main_branch: &str,
) -> Result<String, GitError> {
    let commits = execution_diffs(worktrees, worktree_path, main_branch, 1000).await?;
    let span = match resolve_selection(selection, &commits) {
        Some(span) => span,
        None => return Ok(String::new()),
    };
    diff_for_span(worktrees, worktree_path, &span).await
}

/// Run `git diff` for one resolved span.
pub async fn diff_for_span(
    worktrees: &WorktreeManager,
    worktree_path: &Path,
    span: &DiffSpan,
) -> Result<String, GitError> {
    let base = match &span.base {
        DiffBase::Commit(hash) => hash.clone(),
        DiffBase::ParentOf(hash) => worktrees.parent_of(worktree_path, hash).await?,
    };

    match &span.target {
        DiffTarget::WorkingTree => run_git(&["diff", &base], worktree_path).await,
        DiffTarget::Commit(hash) => run_git(&["diff", &base, hash], worktree_path).await,
    }
}

async fn numstat(worktree_path: &Path, args: &[&str]) -> Result<DiffStats, GitError> {
    let out = run_git(args, worktree_path).await?;
    let mut stats = DiffStats::default();
    for line in out.lines() {
        let mut fields = line.split_whitespace();
        let additions = fields.next().unwrap_or("0");
        let deletions = fields.next().unwrap_or("0");
        // Binary files show "-" for both counts; they still count as changed.
        stats.additions += additions.parse::<u64>().unwrap_or(0);
        stats.deletions += deletions.parse::<u64>().unwrap_or(0);
        stats.files_changed += 1;
    }
    Ok(stats)
}
