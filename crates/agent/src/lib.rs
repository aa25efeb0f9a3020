//! Drydock agent connector
//!
//! Spawns the external coding-agent CLI as a subprocess bound to a session's
//! working copy and translates its NDJSON stdout stream into typed events.

pub mod supervisor;

pub use supervisor::{AgentHandle, AgentSupervisor};

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while driving the agent binary
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent binary not found: set DRYDOCK_AGENT_BIN or install the agent CLI on PATH")]
    BinaryNotFound,

    #[error("failed to spawn agent process {binary:?}: {source}")]
    SpawnFailed {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("process communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no running agent process for session {0}")]
    SessionNotFound(String),

    #[error("agent stdin channel closed")]
    ChannelClosed,
}

/// Events emitted by a supervised agent process
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// One raw line of agent stdout, structured or plain text, in stream order
    OutputLine { line: String },

    /// The agent reported its own session id (from `system/init`)
    Initialized {
        agent_session_id: String,
        model: Option<String>,
    },

    /// An assistant message content block
    AssistantMessage { text: String },

    /// An echoed user message
    UserMessage { text: String },

    /// The current turn finished (`system/result`)
    TurnCompleted { is_error: bool },

    /// The process exited
    Exited {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },

    /// Spawn-time or runtime failure
    Error { message: String },
}

/// Resolve the agent binary path. Called once at startup; the result is
/// injected everywhere else.
///
/// 1. `DRYDOCK_AGENT_BIN` env var
/// 2. `~/.claude/local/claude`
/// 3. Search PATH via `which`
pub fn resolve_agent_binary() -> Result<PathBuf, AgentError> {
    if let Ok(path) = std::env::var("DRYDOCK_AGENT_BIN") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            component = "agent",
            event = "agent.binary.env_not_found",
            path = %path.display(),
            "DRYDOCK_AGENT_BIN path does not exist, trying fallbacks"
        );
    }

    if let Ok(home) = std::env::var("HOME") {
        let local_path = PathBuf::from(home).join(".claude/local/claude");
        if local_path.exists() {
            return Ok(local_path);
        }
    }

    if let Ok(output) = std::process::Command::new("which").arg("claude").output() {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() && std::path::Path::new(&path).exists() {
                return Ok(PathBuf::from(path));
            }
        }
    }

    Err(AgentError::BinaryNotFound)
}
