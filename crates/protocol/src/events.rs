//! Events published by the orchestrator core
//!
//! Every component reports back through one typed event stream that the
//! UI layer (and tests) subscribe to. Payloads are serializable so a thin
//! transport adapter can forward them without translation.

use serde::{Deserialize, Serialize};

use crate::approval::PermissionBehavior;
use crate::types::*;

/// State of a queued creation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

/// Events emitted by the orchestration core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DockEvent {
    // Session lifecycle
    SessionCreated {
        session: Session,
    },
    SessionStatusChanged {
        session_id: String,
        status: SessionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SessionArchived {
        session_id: String,
    },

    // Agent output
    /// One raw line of agent output (structured JSON or plain text)
    SessionOutput {
        session_id: String,
        line: String,
    },
    ConversationAppended {
        session_id: String,
        message: ConversationMessage,
    },
    PromptSubmitted {
        session_id: String,
        marker: PromptMarker,
    },
    PromptCompleted {
        session_id: String,
        sequence: u64,
    },
    AgentExited {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },

    // Interactive terminals
    TerminalOutput {
        session_id: String,
        data: String,
    },
    TerminalClosed {
        session_id: String,
    },
    /// Tree termination left survivors behind; manual cleanup may be needed
    ZombieProcessesDetected {
        session_id: String,
        pids: Vec<u32>,
    },

    // Run-script slot
    ScriptStarted {
        session_id: String,
        pid: u32,
    },
    ScriptStopped {
        session_id: String,
    },

    // Approvals
    PermissionRequested {
        request: PermissionRequest,
    },
    PermissionResolved {
        request_id: String,
        behavior: PermissionBehavior,
    },

    // Commits
    CommitCreated {
        session_id: String,
        hash: String,
        mode: CommitMode,
    },

    // Creation job queue
    JobStateChanged {
        job_id: u64,
        state: JobState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_status_changed() {
        let msg = DockEvent::SessionStatusChanged {
            session_id: "sess-1".to_string(),
            status: SessionStatus::CompletedUnviewed,
            error: None,
        };

        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"session_status_changed\""));
        let reparsed: DockEvent = serde_json::from_str(&json).expect("deserialize");
        match reparsed {
            DockEvent::SessionStatusChanged {
                session_id, status, ..
            } => {
                assert_eq!(session_id, "sess-1");
                assert_eq!(status, SessionStatus::CompletedUnviewed);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn roundtrip_zombie_warning() {
        let msg = DockEvent::ZombieProcessesDetected {
            session_id: "sess-2".to_string(),
            pids: vec![101, 202],
        };

        let json = serde_json::to_string(&msg).expect("serialize");
        let reparsed: DockEvent = serde_json::from_str(&json).expect("deserialize");
        match reparsed {
            DockEvent::ZombieProcessesDetected { session_id, pids } => {
                assert_eq!(session_id, "sess-2");
                assert_eq!(pids, vec![101, 202]);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
