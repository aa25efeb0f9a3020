//! Agent process supervisor
//!
//! One supervised subprocess per session. Stdout is read line-by-line and
//! translated into [`AgentEvent`]s; stdin writes go through a dedicated
//! writer task so callers never block on the child's pipe.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use drydock_protocol::{ConversationMessage, MessageRole, PermissionMode};

use crate::{AgentError, AgentEvent};

/// Stdin messages (supervisor → agent CLI)
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdinMessage {
    User { message: UserMessagePayload },
}

#[derive(Debug, Serialize)]
struct UserMessagePayload {
    role: &'static str,
    content: Vec<UserContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserContentBlock {
    Text { text: String },
}

/// A running agent process owned by the supervisor
struct AgentProcess {
    pid: u32,
    stdin_tx: mpsc::Sender<String>,
}

/// Handle returned to the caller when a session's agent starts
pub struct AgentHandle {
    pub pid: u32,
    pub events: mpsc::Receiver<AgentEvent>,
}

/// Spawns and supervises one agent subprocess per session
pub struct AgentSupervisor {
    binary: PathBuf,
    procs: DashMap<String, AgentProcess>,
}

impl AgentSupervisor {
    /// Create a supervisor around an already-resolved agent binary.
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            procs: DashMap::new(),
        }
    }

    /// Start the agent for a brand-new session: no prior context to load.
    pub async fn start(
        &self,
        session_id: &str,
        worktree: &Path,
        prompt: &str,
        permission_mode: PermissionMode,
        model: Option<&str>,
    ) -> Result<AgentHandle, AgentError> {
        let args = build_args(permission_mode, model, None);
        self.spawn(session_id, worktree, prompt, args).await
    }

    /// Continue a session with a follow-up prompt.
    ///
    /// When the agent's own session id was captured from its init event the
    /// process restarts with `--resume`; otherwise prior conversation history
    /// is replayed into the prompt text, because the binary has no other way
    /// to learn that context exists.
    pub async fn continue_session(
        &self,
        session_id: &str,
        worktree: &Path,
        prompt: &str,
        agent_session_id: Option<&str>,
        history: &[ConversationMessage],
        permission_mode: PermissionMode,
        model: Option<&str>,
    ) -> Result<AgentHandle, AgentError> {
        let args = build_args(permission_mode, model, agent_session_id);
        let prompt = if agent_session_id.is_none() && !history.is_empty() {
            format!("{}{}", replay_preamble(history), prompt)
        } else {
            prompt.to_string()
        };
        self.spawn(session_id, worktree, &prompt, args).await
    }

    /// Send follow-up input to a running session.
    pub async fn send_input(&self, session_id: &str, text: &str) -> Result<(), AgentError> {
        let proc = self
            .procs
            .get(session_id)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        let json = serde_json::to_string(&user_message(text))?;
        proc.stdin_tx
            .send(json)
            .await
            .map_err(|_| AgentError::ChannelClosed)
    }

    /// OS process id of a session's agent, if one is running.
    pub fn pid(&self, session_id: &str) -> Option<u32> {
        self.procs.get(session_id).map(|p| p.pid)
    }

    /// Detach a session's process entry, returning its pid.
    ///
    /// The caller is responsible for terminating the whole process tree
    /// through the reaper; the supervisor only forgets the handle. Dropping
    /// the stdin sender closes the pipe, which tells the CLI to wind down.
    pub fn stop(&self, session_id: &str) -> Option<u32> {
        self.procs.remove(session_id).map(|(_, p)| p.pid)
    }

    async fn spawn(
        &self,
        session_id: &str,
        worktree: &Path,
        prompt: &str,
        args: Vec<String>,
    ) -> Result<AgentHandle, AgentError> {
        info!(
            component = "agent",
            event = "agent.spawn",
            session_id = %session_id,
            cwd = %worktree.display(),
            binary = %self.binary.display(),
            "Spawning agent process"
        );

        let mut child = tokio::process::Command::new(&self.binary)
            .args(&args)
            .current_dir(worktree)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("DRYDOCK_SESSION_ID", session_id)
            .spawn()
            .map_err(|source| AgentError::SpawnFailed {
                binary: self.binary.clone(),
                source,
            })?;

        let pid = child.id().ok_or_else(|| AgentError::SpawnFailed {
            binary: self.binary.clone(),
            source: std::io::Error::other("child exited before pid could be read"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            AgentError::Io(std::io::Error::other("no stdin handle on agent child"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AgentError::Io(std::io::Error::other("no stdout handle on agent child"))
        })?;

        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(256);
        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);

        if let Some(stderr) = child.stderr.take() {
            let sid = session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "agent",
                        event = "agent.stderr",
                        session_id = %sid,
                        line = %line,
                        "Agent stderr"
                    );
                }
            });
        }

        tokio::spawn(stdin_writer(stdin, stdin_rx));

        let sid = session_id.to_string();
        tokio::spawn(async move {
            read_loop(stdout, &event_tx, &sid).await;
            // Stdout EOF: collect the exit status before reporting.
            match child.wait().await {
                Ok(status) => {
                    let exit_code = status.code();
                    let signal = exit_signal(&status);
                    info!(
                        component = "agent",
                        event = "agent.exited",
                        session_id = %sid,
                        exit_code = ?exit_code,
                        signal = ?signal,
                        "Agent process exited"
                    );
                    let _ = event_tx.send(AgentEvent::Exited { exit_code, signal }).await;
                }
                Err(e) => {
                    error!(
                        component = "agent",
                        event = "agent.wait_error",
                        session_id = %sid,
                        error = %e,
                        "Failed to collect agent exit status"
                    );
                    let _ = event_tx
                        .send(AgentEvent::Error {
                            message: format!("failed to collect exit status: {e}"),
                        })
                        .await;
                }
            }
        });

        // Deliver the prompt as the first user message.
        let json = serde_json::to_string(&user_message(prompt))?;
        stdin_tx.send(json).await.map_err(|_| AgentError::ChannelClosed)?;

        self.procs.insert(
            session_id.to_string(),
            AgentProcess {
                pid,
                stdin_tx,
            },
        );

        Ok(AgentHandle {
            pid,
            events: event_rx,
        })
    }
}

/// Build CLI arguments for one spawn.
fn build_args(
    permission_mode: PermissionMode,
    model: Option<&str>,
    resume_id: Option<&str>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--output-format".into(),
        "stream-json".into(),
        "--input-format".into(),
        "stream-json".into(),
        "--verbose".into(),
    ];
    match permission_mode {
        PermissionMode::Approve => {
            args.push("--permission-prompt-tool".into());
            args.push("drydock-gateway".into());
        }
        PermissionMode::Ignore => {
            args.push("--dangerously-skip-permissions".into());
        }
    }
    if let Some(m) = model {
        args.push("--model".into());
        args.push(m.into());
    }
    if let Some(id) = resume_id {
        args.push("--resume".into());
        args.push(id.into());
    }
    args
}

fn user_message(text: &str) -> StdinMessage {
    StdinMessage::User {
        message: UserMessagePayload {
            role: "user",
            content: vec![UserContentBlock::Text {
                text: text.to_string(),
            }],
        },
    }
}

/// Format prior conversation history as a prompt preamble for resume
/// without an agent session id.
fn replay_preamble(history: &[ConversationMessage]) -> String {
    let mut out = String::from("Previous conversation history:\n\n");
    for msg in history {
        let role = match msg.role {
            MessageRole::User => "User",
            MessageRole::Assistant => "Assistant",
            MessageRole::System => "System",
        };
        out.push_str(role);
        out.push_str(": ");
        out.push_str(&msg.content);
        out.push_str("\n\n");
    }
    out.push_str("Continue from the conversation above.\n\n");
    out
}

/// Dedicated stdin writer task — reads from channel, writes to child stdin.
async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(
                component = "agent",
                event = "agent.stdin.write_error",
                error = %e,
                "Failed to write to agent stdin"
            );
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(
                component = "agent",
                event = "agent.stdin.flush_error",
                error = %e,
                "Failed to flush agent stdin"
            );
            break;
        }
    }
    debug!(
        component = "agent",
        event = "agent.stdin.closed",
        "Stdin writer task ended"
    );
}

/// Read stdout line-by-line until EOF, forwarding raw lines and parsed events.
async fn read_loop(
    stdout: tokio::process::ChildStdout,
    event_tx: &mpsc::Sender<AgentEvent>,
    session_id: &str,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if event_tx
                    .send(AgentEvent::OutputLine { line: line.clone() })
                    .await
                    .is_err()
                {
                    return;
                }
                for ev in parse_line(&line) {
                    if event_tx.send(ev).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) => {
                info!(
                    component = "agent",
                    event = "agent.stdout.eof",
                    session_id = %session_id,
                    "Agent stdout EOF"
                );
                return;
            }
            Err(e) => {
                error!(
                    component = "agent",
                    event = "agent.stdout.read_error",
                    session_id = %session_id,
                    error = %e,
                    "Error reading agent stdout"
                );
                let _ = event_tx
                    .send(AgentEvent::Error {
                        message: format!("stdout read error: {e}"),
                    })
                    .await;
                return;
            }
        }
    }
}

/// Translate one stdout line into semantic events. Plain text and unknown
/// message types produce nothing; the raw line has already been forwarded.
fn parse_line(line: &str) -> Vec<AgentEvent> {
    let raw: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return vec![],
    };

    let msg_type = raw.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match msg_type {
        "system" => {
            if raw.get("subtype").and_then(|v| v.as_str()) == Some("init") {
                if let Some(sid) = raw.get("session_id").and_then(|v| v.as_str()) {
                    return vec![AgentEvent::Initialized {
                        agent_session_id: sid.to_string(),
                        model: raw
                            .get("model")
                            .and_then(|v| v.as_str())
                            .map(String::from),
                    }];
                }
            }
            vec![]
        }
        "assistant" => text_blocks(&raw)
            .into_iter()
            .map(|text| AgentEvent::AssistantMessage { text })
            .collect(),
        "user" => {
            // Replayed history echoes are not new conversation content.
            if raw
                .get("isReplay")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                return vec![];
            }
            text_blocks(&raw)
                .into_iter()
                .map(|text| AgentEvent::UserMessage { text })
                .collect()
        }
        "result" => {
            let subtype = raw.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
            let is_error = raw
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
                || subtype.starts_with("error");
            vec![AgentEvent::TurnCompleted { is_error }]
        }
        other => {
            debug!(
                component = "agent",
                event = "agent.stdout.unknown_type",
                msg_type = %other,
                "Unknown stdout message type"
            );
            vec![]
        }
    }
}

/// Extract the text content blocks of an assistant/user message.
fn text_blocks(raw: &Value) -> Vec<String> {
    let message = match raw.get("message") {
        Some(m) => m,
        None => return vec![],
    };
    match message.get("content") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()).map(String::from))
            .collect(),
        _ => vec![],
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(role: MessageRole, content: &str) -> ConversationMessage {
        ConversationMessage {
            sequence: 0,
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn parse_init_captures_agent_session_id() {
        let events = parse_line(
            r#"{"type":"system","subtype":"init","session_id":"abc-123","model":"opus"}"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            AgentEvent::Initialized {
                agent_session_id,
                model,
            } => {
                assert_eq!(agent_session_id, "abc-123");
                assert_eq!(model.as_deref(), Some("opus"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parse_assistant_text_blocks() {
        let events = parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"},{"type":"tool_use","name":"Bash"}]}}"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            AgentEvent::AssistantMessage { text } => assert_eq!(text, "hello"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parse_user_string_content() {
        let events = parse_line(r#"{"type":"user","message":{"content":"do the thing"}}"#);
        assert_eq!(events.len(), 1);
        match &events[0] {
            AgentEvent::UserMessage { text } => assert_eq!(text, "do the thing"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parse_skips_replayed_user_messages() {
        let events =
            parse_line(r#"{"type":"user","isReplay":true,"message":{"content":"old"}}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn parse_result_error_subtypes() {
        let ok = parse_line(r#"{"type":"result","subtype":"success"}"#);
        assert!(matches!(ok[0], AgentEvent::TurnCompleted { is_error: false }));

        let err = parse_line(r#"{"type":"result","subtype":"error_max_turns"}"#);
        assert!(matches!(err[0], AgentEvent::TurnCompleted { is_error: true }));

        let flagged = parse_line(r#"{"type":"result","is_error":true}"#);
        assert!(matches!(flagged[0], AgentEvent::TurnCompleted { is_error: true }));
    }

    #[test]
    fn parse_plain_text_produces_no_semantic_events() {
        assert!(parse_line("building project...").is_empty());
    }

    #[test]
    fn build_args_permission_modes() {
        let approve = build_args(PermissionMode::Approve, None, None);
        assert!(approve.contains(&"--permission-prompt-tool".to_string()));
        assert!(!approve.contains(&"--dangerously-skip-permissions".to_string()));

        let ignore = build_args(PermissionMode::Ignore, None, None);
        assert!(ignore.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn build_args_resume() {
        let args = build_args(PermissionMode::Ignore, Some("opus"), Some("abc"));
        let resume_at = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume_at + 1], "abc");
        let model_at = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[model_at + 1], "opus");
    }

    #[test]
    fn replay_preamble_labels_roles_in_order() {
        let history = vec![
            msg(MessageRole::User, "add a login page"),
            msg(MessageRole::Assistant, "done, see login.rs"),
        ];
        let preamble = replay_preamble(&history);
        let user_at = preamble.find("User: add a login page").unwrap();
        let asst_at = preamble.find("Assistant: done, see login.rs").unwrap();
        assert!(user_at < asst_at);
        assert!(preamble.ends_with("Continue from the conversation above.\n\n"));
    }
}
