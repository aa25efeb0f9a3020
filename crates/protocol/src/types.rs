//! Core types shared across the protocol

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Running,
    Waiting,
    CompletedUnviewed,
    Stopped,
    Error,
}

impl SessionStatus {
    /// A terminal status — the agent process is no longer running.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::CompletedUnviewed | SessionStatus::Stopped | SessionStatus::Error
        )
    }
}

/// How agent tool calls are gated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Every dangerous tool call round-trips through the approval gateway
    Approve,
    /// Tool calls run without asking
    Ignore,
}

/// Commit behavior applied after each agent turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Auto-commit a hook-bypassing snapshot when the working copy is dirty
    Checkpoint,
    /// The agent itself commits; the orchestrator only instructs it to
    Structured,
    /// No automatic commits
    Disabled,
}

impl FromStr for CommitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkpoint" => Ok(CommitMode::Checkpoint),
            "structured" => Ok(CommitMode::Structured),
            "disabled" => Ok(CommitMode::Disabled),
            other => Err(format!("unrecognized commit mode: {other:?}")),
        }
    }
}

/// Per-session commit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitModeSettings {
    pub mode: CommitMode,
    /// Prepended to checkpoint commit messages
    pub checkpoint_prefix: String,
    /// Extra instruction appended to prompts in structured mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_instructions: Option<String>,
    /// In structured mode, poll the working copy for this many seconds
    /// waiting for the agent's commit to land. None disables polling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_commit_timeout_secs: Option<u64>,
}

impl Default for CommitModeSettings {
    fn default() -> Self {
        Self {
            mode: CommitMode::Checkpoint,
            checkpoint_prefix: "checkpoint: ".to_string(),
            structured_instructions: None,
            confirm_commit_timeout_secs: None,
        }
    }
}

/// An isolated coding-agent session bound to one working copy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub worktree_path: PathBuf,
    pub initial_prompt: String,
    pub status: SessionStatus,
    /// OS process id of the agent while it runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub permission_mode: PermissionMode,
    pub auto_commit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub archived: bool,
    /// The designated main-repository session has no disposable working copy
    pub is_main_repo: bool,
    /// The agent's own session id, captured from its init event for resume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_viewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A repository a group of sessions works against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub repo_path: PathBuf,
    /// Overrides detected main-branch resolution when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_script: Option<String>,
    pub default_permission_mode: PermissionMode,
}

/// Ordered record of one user prompt within a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMarker {
    pub sequence: u64,
    pub prompt_text: String,
    /// Index into the session's output stream where this prompt's output begins
    pub output_index: u64,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Conversation role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// One (role, content) pair in a session's conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub sequence: u64,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Sentinel hash for the synthetic "uncommitted changes" record
pub const UNCOMMITTED: &str = "UNCOMMITTED";

/// Line-count stats for one commit or diff span
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub additions: u64,
    pub deletions: u64,
    pub files_changed: u64,
}

/// One entry in a working copy's derived commit list.
///
/// Sequence numbers are 1-based over commits ordered newest-first; sequence 0
/// is reserved for uncommitted changes when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub sequence: u32,
    /// Commit hash, or [`UNCOMMITTED`] for sequence 0
    pub hash: String,
    pub message: String,
    pub author: String,
    pub stats: DiffStats,
    pub timestamp: DateTime<Utc>,
}

impl CommitRecord {
    pub fn is_uncommitted(&self) -> bool {
        self.hash == UNCOMMITTED
    }
}

/// An in-flight tool-permission request awaiting a decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_mode_parses_known_modes() {
        assert_eq!("checkpoint".parse::<CommitMode>(), Ok(CommitMode::Checkpoint));
        assert_eq!("structured".parse::<CommitMode>(), Ok(CommitMode::Structured));
        assert_eq!("disabled".parse::<CommitMode>(), Ok(CommitMode::Disabled));
    }

    #[test]
    fn commit_mode_rejects_unknown_mode() {
        let err = "yolo".parse::<CommitMode>().unwrap_err();
        assert!(err.contains("unrecognized commit mode"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::CompletedUnviewed.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Waiting.is_terminal());
        assert!(!SessionStatus::Initializing.is_terminal());
    }

    #[test]
    fn session_status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::CompletedUnviewed).unwrap();
        assert_eq!(json, "\"completed_unviewed\"");
    }
}
