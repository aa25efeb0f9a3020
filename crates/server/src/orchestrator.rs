//! Session orchestrator
//!
//! The top-level state holder: owns session records and their status state
//! machine, prompt/conversation bookkeeping, the single running-script
//! slot, and composes the worktree manager, agent supervisor, shell pool,
//! commit controller, approval registry, and creation job queue. Status
//! mutation happens in exactly one method so the invariants derived from it
//! ("completed but unviewed") cannot drift.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use drydock_agent::{AgentError, AgentEvent, AgentHandle, AgentSupervisor};
use drydock_protocol::{
    new_id, CommitModeSettings, ConversationMessage, DockEvent, MessageRole, PermissionDecision,
    PermissionMode, Project, PromptMarker, Session, SessionStatus,
};

use crate::approval::PendingApprovals;
use crate::commit::{CommitModeController, CommitOutcome, FinalizeOptions};
use crate::config::ServerConfig;
use crate::diffs;
use crate::events::EventBus;
use crate::job_queue::{CreationJobQueue, JobHandle};
use crate::reaper::ProcessTreeReaper;
use crate::shell_pool::{ShellError, ShellPool};
use crate::store::StoreCommand;
use crate::worktree::{GitError, WorktreeManager};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Parameters for one create-sessions request
#[derive(Debug, Clone)]
pub struct CreateSessionParams {
    pub project_id: String,
    pub prompt: String,
    pub permission_mode: Option<PermissionMode>,
    pub model: Option<String>,
    pub commit_settings: CommitModeSettings,
    pub auto_commit: bool,
}

struct SessionEntry {
    session: Session,
    commit_settings: CommitModeSettings,
    markers: Vec<PromptMarker>,
    conversation: Vec<ConversationMessage>,
    output: Vec<String>,
    stop_requested: bool,
}

impl SessionEntry {
    fn output_index(&self) -> u64 {
        self.output.len() as u64
    }
}

struct RunningScript {
    session_id: String,
    pid: u32,
}

struct Inner {
    events: EventBus,
    store_tx: mpsc::Sender<StoreCommand>,
    worktrees: WorktreeManager,
    supervisor: AgentSupervisor,
    reaper: Arc<ProcessTreeReaper>,
    shells: ShellPool,
    pending_approvals: Arc<PendingApprovals>,
    projects: DashMap<String, Project>,
    sessions: DashMap<String, SessionEntry>,
    running_script: Mutex<Option<RunningScript>>,
    jobs: CreationJobQueue,
}

#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ServerConfig,
        events: EventBus,
        store_tx: mpsc::Sender<StoreCommand>,
        supervisor: AgentSupervisor,
        reaper: Arc<ProcessTreeReaper>,
        shells: ShellPool,
        pending_approvals: Arc<PendingApprovals>,
    ) -> Self {
        let jobs = CreationJobQueue::new(config.job_concurrency, events.clone());
        Self {
            inner: Arc::new(Inner {
                events,
                store_tx,
                worktrees: WorktreeManager::new(),
                supervisor,
                reaper,
                shells,
                pending_approvals,
                projects: DashMap::new(),
                sessions: DashMap::new(),
                running_script: Mutex::new(None),
                jobs,
            }),
        }
    }

    // -- Projects -----------------------------------------------------------

    pub fn register_project(&self, project: Project) {
        self.inner.projects.insert(project.id.clone(), project);
    }

    pub fn project(&self, id: &str) -> Option<Project> {
        self.inner.projects.get(id).map(|p| p.clone())
    }

    /// Register the designated main-repository session: it works directly in
    /// the repository root and never owns a disposable working copy.
    pub async fn register_main_repo_session(
        &self,
        project_id: &str,
    ) -> Result<String, OrchestratorError> {
        let project = self
            .project(project_id)
            .ok_or_else(|| OrchestratorError::ProjectNotFound(project_id.to_string()))?;

        let now = Utc::now();
        let session = Session {
            id: new_id(),
            name: "main".to_string(),
            project_id: project_id.to_string(),
            worktree_path: project.repo_path.clone(),
            initial_prompt: String::new(),
            status: SessionStatus::Waiting,
            pid: None,
            permission_mode: project.default_permission_mode,
            auto_commit: false,
            model: None,
            archived: false,
            is_main_repo: true,
            agent_session_id: None,
            error_message: None,
            last_viewed_at: None,
            created_at: now,
            updated_at: now,
        };
        let id = session.id.clone();
        self.insert_session(session, CommitModeSettings::default()).await;
        Ok(id)
    }

    // -- Session creation ---------------------------------------------------

    /// Fan a single prompt out into `count` independent sessions through the
    /// bounded creation queue.
    pub fn create_sessions(&self, params: CreateSessionParams, count: usize) -> Vec<JobHandle> {
        (0..count.max(1))
            .map(|_| {
                let this = self.clone();
                let params = params.clone();
                self.inner.jobs.enqueue(move || async move {
                    this.create_session(params)
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                })
            })
            .collect()
    }

    /// Create one session: isolate a working copy, record the session, and
    /// launch the agent on the initial prompt.
    pub async fn create_session(
        &self,
        params: CreateSessionParams,
    ) -> Result<String, OrchestratorError> {
        let project = self
            .project(&params.project_id)
            .ok_or_else(|| OrchestratorError::ProjectNotFound(params.project_id.clone()))?;

        let main_branch = self
            .inner
            .worktrees
            .detect_main_branch(&project.repo_path, project.main_branch.as_deref())
            .await?;

        let template = slug_from_prompt(&params.prompt);
        let (worktree_path, branch) = self
            .inner
            .worktrees
            .create_working_copy(&project.repo_path, &template, &main_branch)
            .await?;

        let now = Utc::now();
        let session = Session {
            id: new_id(),
            name: branch,
            project_id: params.project_id.clone(),
            worktree_path,
            initial_prompt: params.prompt.clone(),
            status: SessionStatus::Initializing,
            pid: None,
            permission_mode: params
                .permission_mode
                .unwrap_or(project.default_permission_mode),
            auto_commit: params.auto_commit,
            model: params.model.clone(),
            archived: false,
            is_main_repo: false,
            agent_session_id: None,
            error_message: None,
            last_viewed_at: None,
            created_at: now,
            updated_at: now,
        };
        let session_id = session.id.clone();
        self.insert_session(session, params.commit_settings.clone())
            .await;

        if let Err(e) = self.launch_agent(&session_id, &params.prompt).await {
            self.set_status(&session_id, SessionStatus::Error, Some(e.to_string()))
                .await;
            return Err(e);
        }
        Ok(session_id)
    }

    async fn insert_session(&self, session: Session, commit_settings: CommitModeSettings) {
        let id = session.id.clone();
        self.inner.events.publish(DockEvent::SessionCreated {
            session: session.clone(),
        });
        let upsert = StoreCommand::SessionUpsert {
            session: session.clone(),
        };
        self.inner.sessions.insert(
            id,
            SessionEntry {
                session,
                commit_settings,
                markers: Vec::new(),
                conversation: Vec::new(),
                output: Vec::new(),
                stop_requested: false,
            },
        );
        let _ = self.inner.store_tx.send(upsert).await;
    }

    // -- Agent lifecycle ----------------------------------------------------

    async fn launch_agent(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<(), OrchestratorError> {
        let (worktree, permission_mode, model, suffix) = {
            let entry = self.entry(session_id)?;
            (
                entry.session.worktree_path.clone(),
                entry.session.permission_mode,
                entry.session.model.clone(),
                CommitModeController::structured_prompt_suffix(&entry.commit_settings),
            )
        };

        let full_prompt = match suffix {
            Some(suffix) => format!("{prompt}{suffix}"),
            None => prompt.to_string(),
        };
        self.submit_prompt_marker(session_id, prompt).await?;

        let handle = self
            .inner
            .supervisor
            .start(
                session_id,
                &worktree,
                &full_prompt,
                permission_mode,
                model.as_deref(),
            )
            .await?;
        self.attach_agent(session_id, handle);
        Ok(())
    }

    /// Continue a conversation. A live agent gets the prompt on stdin; a
    /// stopped session re-invokes the agent, resuming by agent session id
    /// when one was captured and replaying history otherwise.
    pub async fn continue_conversation(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<(), OrchestratorError> {
        let (worktree, permission_mode, model, agent_sid, history, suffix, live) = {
            let entry = self.entry(session_id)?;
            (
                entry.session.worktree_path.clone(),
                entry.session.permission_mode,
                entry.session.model.clone(),
                entry.session.agent_session_id.clone(),
                entry.conversation.clone(),
                CommitModeController::structured_prompt_suffix(&entry.commit_settings),
                self.inner.supervisor.pid(session_id).is_some(),
            )
        };

        let full_prompt = match suffix {
            Some(suffix) => format!("{prompt}{suffix}"),
            None => prompt.to_string(),
        };
        self.submit_prompt_marker(session_id, prompt).await?;

        if live {
            self.inner
                .supervisor
                .send_input(session_id, &full_prompt)
                .await?;
            self.set_status(session_id, SessionStatus::Running, None).await;
            return Ok(());
        }

        {
            let mut entry = self.entry_mut(session_id)?;
            entry.stop_requested = false;
        }
        let handle = self
            .inner
            .supervisor
            .continue_session(
                session_id,
                &worktree,
                &full_prompt,
                agent_sid.as_deref(),
                &history,
                permission_mode,
                model.as_deref(),
            )
            .await?;
        self.attach_agent(session_id, handle);
        Ok(())
    }

    /// Forward raw follow-up input (answers, confirmations) to a running
    /// agent. Unlike a prompt, this opens no prompt marker.
    pub async fn send_input(&self, session_id: &str, text: &str) -> Result<(), OrchestratorError> {
        self.entry(session_id)?;
        self.inner.supervisor.send_input(session_id, text).await?;
        Ok(())
    }

    /// Stop a session's agent and reap its whole process tree.
    pub async fn stop_session(&self, session_id: &str) -> Result<(), OrchestratorError> {
        {
            let mut entry = self.entry_mut(session_id)?;
            entry.stop_requested = true;
        }

        if let Some(pid) = self.inner.supervisor.stop(session_id) {
            let outcome = self.inner.reaper.kill_tree(pid).await;
            if !outcome.clean {
                self.inner.events.publish(DockEvent::ZombieProcessesDetected {
                    session_id: session_id.to_string(),
                    pids: outcome.survivors,
                });
            }
        }

        let already_terminal = {
            let entry = self.entry(session_id)?;
            entry.session.status.is_terminal()
        };
        if !already_terminal {
            self.set_status(session_id, SessionStatus::Stopped, None).await;
        }
        Ok(())
    }

    fn attach_agent(&self, session_id: &str, mut handle: AgentHandle) {
        if let Ok(mut entry) = self.entry_mut(session_id) {
            entry.session.pid = Some(handle.pid);
        }
        let this = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            while let Some(ev) = handle.events.recv().await {
                this.on_agent_event(&session_id, ev).await;
            }
        });
    }

    async fn on_agent_event(&self, session_id: &str, ev: AgentEvent) {
        match ev {
            AgentEvent::OutputLine { line } => {
                if let Ok(mut entry) = self.entry_mut(session_id) {
                    entry.output.push(line.clone());
                }
                self.inner.events.publish(DockEvent::SessionOutput {
                    session_id: session_id.to_string(),
                    line,
                });
            }

            AgentEvent::Initialized {
                agent_session_id,
                model,
            } => {
                if let Ok(mut entry) = self.entry_mut(session_id) {
                    entry.session.agent_session_id = Some(agent_session_id);
                    if entry.session.model.is_none() {
                        entry.session.model = model;
                    }
                }
                self.set_status(session_id, SessionStatus::Running, None).await;
            }

            AgentEvent::AssistantMessage { text } => {
                self.append_conversation(session_id, MessageRole::Assistant, text)
                    .await;
            }

            AgentEvent::UserMessage { text } => {
                self.append_conversation(session_id, MessageRole::User, text)
                    .await;
            }

            AgentEvent::TurnCompleted { is_error } => {
                self.complete_current_prompt(session_id).await;
                if is_error {
                    self.set_status(
                        session_id,
                        SessionStatus::Error,
                        Some("agent reported an error result".to_string()),
                    )
                    .await;
                } else {
                    self.set_status(session_id, SessionStatus::Waiting, None).await;
                    self.run_post_prompt_commit(session_id).await;
                }
            }

            AgentEvent::Exited { exit_code, signal } => {
                self.inner.events.publish(DockEvent::AgentExited {
                    session_id: session_id.to_string(),
                    exit_code,
                    signal,
                });
                self.inner.supervisor.stop(session_id);

                let (stop_requested, status) = match self.entry_mut(session_id) {
                    Ok(mut entry) => {
                        entry.session.pid = None;
                        (entry.stop_requested, entry.session.status)
                    }
                    Err(_) => return,
                };

                if stop_requested {
                    self.set_status(session_id, SessionStatus::Stopped, None).await;
                } else if status != SessionStatus::Error {
                    self.complete_session(session_id).await;
                }
            }

            AgentEvent::Error { message } => {
                error!(
                    component = "orchestrator",
                    event = "session.agent_error",
                    session_id = %session_id,
                    message = %message,
                );
                self.set_status(session_id, SessionStatus::Error, Some(message))
                    .await;
            }
        }
    }

    async fn run_post_prompt_commit(&self, session_id: &str) {
        let (auto_commit, worktree, settings, prompt, sequence) = {
            let Ok(entry) = self.entry(session_id) else { return };
            let Some(marker) = entry.markers.last() else { return };
            (
                entry.session.auto_commit,
                entry.session.worktree_path.clone(),
                entry.commit_settings.clone(),
                marker.prompt_text.clone(),
                marker.sequence,
            )
        };
        if !auto_commit {
            return;
        }

        let outcome = CommitModeController::handle_post_prompt_commit(
            &self.inner.worktrees,
            &worktree,
            &settings,
            &prompt,
            sequence,
        )
        .await;

        if let Some(hash) = outcome.commit_hash {
            self.inner.events.publish(DockEvent::CommitCreated {
                session_id: session_id.to_string(),
                hash,
                mode: settings.mode,
            });
        } else if let Some(error) = outcome.error {
            warn!(
                component = "orchestrator",
                event = "session.post_prompt_commit_failed",
                session_id = %session_id,
                error = %error,
            );
        }
    }

    /// Explicit commit request from the UI: apply the session's commit mode
    /// to whatever the working copy holds right now.
    pub async fn commit(&self, session_id: &str) -> Result<CommitOutcome, OrchestratorError> {
        let (worktree, settings, prompt, sequence) = {
            let entry = self.entry(session_id)?;
            let (prompt, sequence) = entry
                .markers
                .last()
                .map(|m| (m.prompt_text.clone(), m.sequence))
                .unwrap_or_else(|| (entry.session.initial_prompt.clone(), 0));
            (
                entry.session.worktree_path.clone(),
                entry.commit_settings.clone(),
                prompt,
                sequence,
            )
        };

        let outcome = CommitModeController::handle_post_prompt_commit(
            &self.inner.worktrees,
            &worktree,
            &settings,
            &prompt,
            sequence,
        )
        .await;

        if let Some(ref hash) = outcome.commit_hash {
            self.inner.events.publish(DockEvent::CommitCreated {
                session_id: session_id.to_string(),
                hash: hash.clone(),
                mode: settings.mode,
            });
        }
        Ok(outcome)
    }

    // -- Status state machine ----------------------------------------------

    /// The single status mutation point. No other code touches
    /// `session.status`.
    async fn set_status(&self, session_id: &str, status: SessionStatus, error: Option<String>) {
        let changed = {
            let Ok(mut entry) = self.entry_mut(session_id) else {
                return;
            };
            if entry.session.status == status && entry.session.error_message == error {
                false
            } else {
                entry.session.status = status;
                entry.session.error_message = error.clone();
                entry.session.updated_at = Utc::now();
                true
            }
        };
        if !changed {
            return;
        }

        info!(
            component = "orchestrator",
            event = "session.status",
            session_id = %session_id,
            status = ?status,
        );
        let _ = self
            .inner
            .store_tx
            .send(StoreCommand::SessionStatus {
                id: session_id.to_string(),
                status,
                error: error.clone(),
            })
            .await;
        self.inner.events.publish(DockEvent::SessionStatusChanged {
            session_id: session_id.to_string(),
            status,
            error,
        });
    }

    /// Clean agent exit: completed, promoted to `completed_unviewed` when
    /// the session has not been viewed since its last update.
    async fn complete_session(&self, session_id: &str) {
        let viewed_since_update = {
            let Ok(entry) = self.entry(session_id) else { return };
            match entry.session.last_viewed_at {
                Some(viewed) => viewed >= entry.session.updated_at,
                None => false,
            }
        };
        let status = if viewed_since_update {
            SessionStatus::Stopped
        } else {
            SessionStatus::CompletedUnviewed
        };
        self.set_status(session_id, status, None).await;
    }

    /// Clear the unviewed flag without touching prompt/commit history.
    pub async fn mark_viewed(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let was_unviewed = {
            let mut entry = self.entry_mut(session_id)?;
            entry.session.last_viewed_at = Some(Utc::now());
            entry.session.status == SessionStatus::CompletedUnviewed
        };
        if was_unviewed {
            self.set_status(session_id, SessionStatus::Stopped, None).await;
        }
        Ok(())
    }

    // -- Prompt / conversation bookkeeping ----------------------------------

    async fn submit_prompt_marker(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<(), OrchestratorError> {
        let marker = {
            let mut entry = self.entry_mut(session_id)?;
            let marker = PromptMarker {
                sequence: entry.markers.len() as u64 + 1,
                prompt_text: prompt.to_string(),
                output_index: entry.output_index(),
                submitted_at: Utc::now(),
                completed_at: None,
            };
            entry.markers.push(marker.clone());
            marker
        };

        let _ = self
            .inner
            .store_tx
            .send(StoreCommand::PromptMarkerAppend {
                session_id: session_id.to_string(),
                marker: marker.clone(),
            })
            .await;
        self.inner.events.publish(DockEvent::PromptSubmitted {
            session_id: session_id.to_string(),
            marker,
        });
        Ok(())
    }

    async fn complete_current_prompt(&self, session_id: &str) {
        let completed = {
            let Ok(mut entry) = self.entry_mut(session_id) else {
                return;
            };
            let now = Utc::now();
            entry
                .markers
                .iter_mut()
                .rev()
                .find(|m| m.completed_at.is_none())
                .map(|marker| {
                    marker.completed_at = Some(now);
                    (marker.sequence, now)
                })
        };
        let Some((sequence, completed_at)) = completed else {
            return;
        };

        let _ = self
            .inner
            .store_tx
            .send(StoreCommand::PromptMarkerComplete {
                session_id: session_id.to_string(),
                sequence,
                completed_at,
            })
            .await;
        self.inner.events.publish(DockEvent::PromptCompleted {
            session_id: session_id.to_string(),
            sequence,
        });
    }

    async fn append_conversation(&self, session_id: &str, role: MessageRole, content: String) {
        let message = {
            let Ok(mut entry) = self.entry_mut(session_id) else {
                return;
            };
            let message = ConversationMessage {
                sequence: entry.conversation.len() as u64 + 1,
                role,
                content,
                timestamp: Utc::now(),
            };
            entry.conversation.push(message.clone());
            message
        };

        let _ = self
            .inner
            .store_tx
            .send(StoreCommand::ConversationAppend {
                session_id: session_id.to_string(),
                message: message.clone(),
            })
            .await;
        self.inner.events.publish(DockEvent::ConversationAppended {
            session_id: session_id.to_string(),
            message,
        });
    }

    // -- Queries ------------------------------------------------------------

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.inner
            .sessions
            .get(session_id)
            .map(|e| e.session.clone())
    }

    pub fn list_sessions(&self, include_archived: bool) -> Vec<Session> {
        self.inner
            .sessions
            .iter()
            .filter(|e| include_archived || !e.session.archived)
            .map(|e| e.session.clone())
            .collect()
    }

    pub fn prompt_history(&self, session_id: &str) -> Vec<PromptMarker> {
        self.inner
            .sessions
            .get(session_id)
            .map(|e| e.markers.clone())
            .unwrap_or_default()
    }

    pub fn conversation_history(&self, session_id: &str) -> Vec<ConversationMessage> {
        self.inner
            .sessions
            .get(session_id)
            .map(|e| e.conversation.clone())
            .unwrap_or_default()
    }

    /// The session's raw output stream, in arrival order. PromptMarker
    /// `output_index` values point into this list.
    pub fn output_history(&self, session_id: &str) -> Vec<String> {
        self.inner
            .sessions
            .get(session_id)
            .map(|e| e.output.clone())
            .unwrap_or_default()
    }

    // -- Archive ------------------------------------------------------------

    /// Archive a session: stop anything still running, remove the working
    /// copy (never for the main-repository session), and detach it from the
    /// active set while preserving its history.
    pub async fn archive_session(&self, session_id: &str) -> Result<(), OrchestratorError> {
        if self.inner.supervisor.pid(session_id).is_some() {
            self.stop_session(session_id).await?;
        }
        self.inner.shells.close(session_id).await;

        let (is_main, worktree, project_id) = {
            let entry = self.entry(session_id)?;
            (
                entry.session.is_main_repo,
                entry.session.worktree_path.clone(),
                entry.session.project_id.clone(),
            )
        };

        if !is_main {
            let repo_path = self
                .project(&project_id)
                .ok_or_else(|| OrchestratorError::ProjectNotFound(project_id.clone()))?
                .repo_path;
            self.inner
                .worktrees
                .remove_working_copy(&repo_path, &worktree)
                .await?;
        }

        {
            let mut entry = self.entry_mut(session_id)?;
            entry.session.archived = true;
            entry.session.updated_at = Utc::now();
        }
        let _ = self
            .inner
            .store_tx
            .send(StoreCommand::SessionArchived {
                id: session_id.to_string(),
            })
            .await;
        self.inner.events.publish(DockEvent::SessionArchived {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    // -- Run-script slot ----------------------------------------------------

    /// Run an ad-hoc script for a session. At most one script process exists
    /// process-wide: any current occupant is stopped — and its tree fully
    /// reaped — before the next one starts.
    pub async fn run_script(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<u32, OrchestratorError> {
        let cwd = {
            let entry = self.entry(session_id)?;
            entry.session.worktree_path.clone()
        };

        let mut slot = self.inner.running_script.lock().await;
        if let Some(prev) = slot.take() {
            let outcome = self.inner.reaper.kill_tree(prev.pid).await;
            if !outcome.clean {
                self.inner.events.publish(DockEvent::ZombieProcessesDetected {
                    session_id: prev.session_id.clone(),
                    pids: outcome.survivors,
                });
            }
            self.inner.events.publish(DockEvent::ScriptStopped {
                session_id: prev.session_id,
            });
        }

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&cwd);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .map_err(|e| OrchestratorError::InvalidState(format!("failed to spawn script: {e}")))?;
        let pid = child.id().ok_or_else(|| {
            OrchestratorError::InvalidState("script exited before pid could be read".to_string())
        })?;

        *slot = Some(RunningScript {
            session_id: session_id.to_string(),
            pid,
        });
        drop(slot);

        self.inner.events.publish(DockEvent::ScriptStarted {
            session_id: session_id.to_string(),
            pid,
        });

        // Reap the child and free the slot when it exits on its own.
        let this = self.clone();
        let sid = session_id.to_string();
        tokio::spawn(async move {
            let _ = child.wait().await;
            let mut slot = this.inner.running_script.lock().await;
            if slot.as_ref().map(|s| s.pid) == Some(pid) {
                *slot = None;
                drop(slot);
                this.inner
                    .events
                    .publish(DockEvent::ScriptStopped { session_id: sid });
            }
        });

        Ok(pid)
    }

    /// Stop the currently running script, if any.
    pub async fn stop_script(&self) {
        let occupant = self.inner.running_script.lock().await.take();
        if let Some(script) = occupant {
            let outcome = self.inner.reaper.kill_tree(script.pid).await;
            if !outcome.clean {
                self.inner.events.publish(DockEvent::ZombieProcessesDetected {
                    session_id: script.session_id.clone(),
                    pids: outcome.survivors,
                });
            }
            self.inner.events.publish(DockEvent::ScriptStopped {
                session_id: script.session_id,
            });
        }
    }

    /// Pid of the currently running script, if any.
    pub async fn running_script_pid(&self) -> Option<u32> {
        self.inner.running_script.lock().await.as_ref().map(|s| s.pid)
    }

    // -- Interactive terminals ----------------------------------------------

    pub fn terminal_ensure(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let cwd = {
            let entry = self.entry(session_id)?;
            entry.session.worktree_path.clone()
        };
        self.inner.shells.ensure_session(session_id, &cwd)?;
        Ok(())
    }

    pub fn terminal_send_command(
        &self,
        session_id: &str,
        line: &str,
    ) -> Result<(), OrchestratorError> {
        self.inner.shells.send_command(session_id, line)?;
        Ok(())
    }

    pub fn terminal_send_raw(
        &self,
        session_id: &str,
        bytes: &[u8],
    ) -> Result<(), OrchestratorError> {
        self.inner.shells.send_raw_input(session_id, bytes)?;
        Ok(())
    }

    pub fn terminal_resize(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), OrchestratorError> {
        self.inner.shells.resize(session_id, cols, rows)?;
        Ok(())
    }

    pub async fn terminal_close(&self, session_id: &str) {
        self.inner.shells.close(session_id).await;
    }

    // -- Approvals ----------------------------------------------------------

    /// Resolve a pending permission request from the UI's decision.
    pub fn respond_permission(&self, request_id: &str, decision: PermissionDecision) -> bool {
        let behavior = decision.behavior;
        let resolved = self.inner.pending_approvals.resolve(request_id, decision);
        if resolved {
            self.inner.events.publish(DockEvent::PermissionResolved {
                request_id: request_id.to_string(),
                behavior,
            });
        } else {
            debug!(
                component = "orchestrator",
                event = "approval.already_resolved",
                request_id = %request_id,
            );
        }
        resolved
    }

    // -- Git operations -----------------------------------------------------

    async fn session_git_context(
        &self,
        session_id: &str,
    ) -> Result<(PathBuf, PathBuf, String), OrchestratorError> {
        let (worktree, project_id) = {
            let entry = self.entry(session_id)?;
            (
                entry.session.worktree_path.clone(),
                entry.session.project_id.clone(),
            )
        };
        let project = self
            .project(&project_id)
            .ok_or_else(|| OrchestratorError::ProjectNotFound(project_id))?;
        let main_branch = self
            .inner
            .worktrees
            .detect_main_branch(&project.repo_path, project.main_branch.as_deref())
            .await?;
        Ok((project.repo_path, worktree, main_branch))
    }

    pub async fn rebase_main_into_worktree(
        &self,
        session_id: &str,
    ) -> Result<(), OrchestratorError> {
        let (_, worktree, main_branch) = self.session_git_context(session_id).await?;
        self.inner
            .worktrees
            .rebase_main_into(&worktree, &main_branch)
            .await?;
        Ok(())
    }

    /// Abort a conflicted rebase, then hand the session back to the agent
    /// with a prompt describing what happened.
    pub async fn abort_rebase_and_resume(
        &self,
        session_id: &str,
        prompt: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let (_, worktree, main_branch) = self.session_git_context(session_id).await?;
        self.inner.worktrees.abort_rebase(&worktree).await?;
        if let Some(prompt) = prompt {
            self.continue_conversation(session_id, &prompt).await?;
        } else {
            let fallback = format!(
                "A rebase of {main_branch} into this working copy hit conflicts and was aborted. \
                 Review the recent changes on {main_branch} and reconcile this branch with them."
            );
            self.continue_conversation(session_id, &fallback).await?;
        }
        Ok(())
    }

    pub async fn squash_and_rebase_to_main(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<String, OrchestratorError> {
        let (repo, worktree, main_branch) = self.session_git_context(session_id).await?;
        Ok(self
            .inner
            .worktrees
            .squash_and_rebase_to_main(&repo, &worktree, &main_branch, message)
            .await?)
    }

    pub async fn rebase_to_main(&self, session_id: &str) -> Result<String, OrchestratorError> {
        let (repo, worktree, main_branch) = self.session_git_context(session_id).await?;
        Ok(self
            .inner
            .worktrees
            .rebase_to_main(&repo, &worktree, &main_branch)
            .await?)
    }

    pub async fn pull(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let (_, worktree, _) = self.session_git_context(session_id).await?;
        Ok(self.inner.worktrees.pull(&worktree).await?)
    }

    pub async fn push(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let (_, worktree, _) = self.session_git_context(session_id).await?;
        Ok(self.inner.worktrees.push(&worktree).await?)
    }

    pub async fn list_commits(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<drydock_protocol::CommitRecord>, OrchestratorError> {
        let (_, worktree, main_branch) = self.session_git_context(session_id).await?;
        Ok(diffs::execution_diffs(&self.inner.worktrees, &worktree, &main_branch, limit).await?)
    }

    pub async fn combined_diff(
        &self,
        session_id: &str,
        selection: &[u32],
    ) -> Result<String, OrchestratorError> {
        let (_, worktree, main_branch) = self.session_git_context(session_id).await?;
        Ok(diffs::combined_diff(&self.inner.worktrees, &worktree, selection, &main_branch).await?)
    }

    /// Finalize a session's history before merge (optionally squashing).
    pub async fn finalize_session(
        &self,
        session_id: &str,
        options: FinalizeOptions,
    ) -> Result<String, OrchestratorError> {
        let (_, worktree, main_branch) = self.session_git_context(session_id).await?;
        Ok(
            CommitModeController::finalize_session(
                &self.inner.worktrees,
                &worktree,
                &main_branch,
                &options,
            )
            .await?,
        )
    }

    pub async fn checkpoint_mode_warning(
        &self,
        session_id: &str,
    ) -> Result<bool, OrchestratorError> {
        let worktree = {
            let entry = self.entry(session_id)?;
            entry.session.worktree_path.clone()
        };
        Ok(CommitModeController::should_warn_about_checkpoint_mode(&worktree).await)
    }

    // -- Internals ----------------------------------------------------------

    fn entry(
        &self,
        session_id: &str,
    ) -> Result<dashmap::mapref::one::Ref<'_, String, SessionEntry>, OrchestratorError> {
        self.inner
            .sessions
            .get(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    fn entry_mut(
        &self,
        session_id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, SessionEntry>, OrchestratorError> {
        self.inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }
}

/// Derive a branch-name template from the first words of a prompt.
fn slug_from_prompt(prompt: &str) -> String {
    let words: Vec<String> = prompt
        .split_whitespace()
        .take(4)
        .map(|w| {
            w.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        "session".to_string()
    } else {
        let mut slug = words.join("-");
        slug.truncate(32);
        slug.trim_end_matches('-').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{create_store_channel, MemoryStore};
    use crate::worktree::test_support::init_repo;
    use std::time::Duration;
    use tempfile::TempDir;

    /// A stand-in agent CLI: emits an init event, waits for the prompt on
    /// stdin, streams a turn, then exits.
    const FAKE_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"agent-sess-1","model":"test-model"}'
read line
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"}]}}'
echo '{"type":"result","subtype":"success"}'
"#;

    /// Like FAKE_AGENT but dirties the working copy before finishing.
    const DIRTYING_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"agent-sess-2"}'
read line
echo "generated" > generated.txt
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"made a file"}]}}'
echo '{"type":"result","subtype":"success"}'
"#;

    /// An agent that hangs after init until it is killed.
    const HANGING_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"agent-sess-3"}'
sleep 600
"#;

    struct Fixture {
        orchestrator: SessionOrchestrator,
        store: Arc<MemoryStore>,
        project_id: String,
        _repo: TempDir,
        _bin_dir: TempDir,
    }

    async fn fixture(agent_script: &str) -> Fixture {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path()).await;

        let bin_dir = TempDir::new().unwrap();
        let agent_path = bin_dir.path().join("fake-agent");
        tokio::fs::write(&agent_path, agent_script).await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&agent_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let events = EventBus::new();
        let (store_tx, store_rx) = create_store_channel();
        let store = MemoryStore::new();
        tokio::spawn(store.clone().run(store_rx));

        let reaper = Arc::new(ProcessTreeReaper::new(Duration::from_millis(500)));
        let shells = ShellPool::new(events.clone(), reaper.clone());
        let pending = Arc::new(PendingApprovals::new());
        let supervisor = AgentSupervisor::new(agent_path);

        let orchestrator = SessionOrchestrator::new(
            &ServerConfig::default(),
            events,
            store_tx,
            supervisor,
            reaper,
            shells,
            pending,
        );

        let project_id = "proj-1".to_string();
        orchestrator.register_project(Project {
            id: project_id.clone(),
            repo_path: repo.path().to_path_buf(),
            main_branch: None,
            build_script: None,
            run_script: None,
            default_permission_mode: PermissionMode::Ignore,
        });

        Fixture {
            orchestrator,
            store,
            project_id,
            _repo: repo,
            _bin_dir: bin_dir,
        }
    }

    fn params(fx: &Fixture, prompt: &str) -> CreateSessionParams {
        CreateSessionParams {
            project_id: fx.project_id.clone(),
            prompt: prompt.to_string(),
            permission_mode: None,
            model: None,
            commit_settings: CommitModeSettings::default(),
            auto_commit: false,
        }
    }

    async fn wait_for_status(
        orchestrator: &SessionOrchestrator,
        session_id: &str,
        status: SessionStatus,
    ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            if orchestrator.get_session(session_id).map(|s| s.status) == Some(status) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "session never reached {status:?}; currently {:?}",
                    orchestrator.get_session(session_id).map(|s| s.status)
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn session_runs_to_completed_unviewed() {
        let fx = fixture(FAKE_AGENT).await;
        let id = fx
            .orchestrator
            .create_session(params(&fx, "add a login page"))
            .await
            .unwrap();

        wait_for_status(&fx.orchestrator, &id, SessionStatus::CompletedUnviewed).await;

        let session = fx.orchestrator.get_session(&id).unwrap();
        assert_eq!(session.agent_session_id.as_deref(), Some("agent-sess-1"));
        assert_eq!(session.model.as_deref(), Some("test-model"));
        assert!(session.worktree_path.exists());
        assert!(session.pid.is_none());

        let markers = fx.orchestrator.prompt_history(&id);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].prompt_text, "add a login page");
        let completed = markers[0].completed_at.expect("marker completed");
        assert!(completed >= markers[0].submitted_at);

        let conversation = fx.orchestrator.conversation_history(&id);
        assert!(conversation
            .iter()
            .any(|m| m.role == MessageRole::Assistant && m.content == "working on it"));
    }

    #[tokio::test]
    async fn mark_viewed_collapses_unviewed_without_touching_history() {
        let fx = fixture(FAKE_AGENT).await;
        let id = fx
            .orchestrator
            .create_session(params(&fx, "fix the flaky test"))
            .await
            .unwrap();
        wait_for_status(&fx.orchestrator, &id, SessionStatus::CompletedUnviewed).await;

        let markers_before = fx.orchestrator.prompt_history(&id);
        fx.orchestrator.mark_viewed(&id).await.unwrap();

        let session = fx.orchestrator.get_session(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Stopped);
        assert!(session.last_viewed_at.is_some());

        let markers_after = fx.orchestrator.prompt_history(&id);
        assert_eq!(markers_before.len(), markers_after.len());
        assert_eq!(markers_before[0].prompt_text, markers_after[0].prompt_text);
        assert_eq!(markers_before[0].completed_at, markers_after[0].completed_at);
    }

    #[tokio::test]
    async fn stop_session_reports_stopped_not_completed() {
        let fx = fixture(HANGING_AGENT).await;
        let id = fx
            .orchestrator
            .create_session(params(&fx, "long running work"))
            .await
            .unwrap();
        wait_for_status(&fx.orchestrator, &id, SessionStatus::Running).await;

        fx.orchestrator.stop_session(&id).await.unwrap();
        wait_for_status(&fx.orchestrator, &id, SessionStatus::Stopped).await;
    }

    #[tokio::test]
    async fn archive_removes_worktree_but_never_the_main_repo() {
        let fx = fixture(FAKE_AGENT).await;
        let id = fx
            .orchestrator
            .create_session(params(&fx, "archive me later"))
            .await
            .unwrap();
        wait_for_status(&fx.orchestrator, &id, SessionStatus::CompletedUnviewed).await;

        let worktree = fx.orchestrator.get_session(&id).unwrap().worktree_path;
        assert!(worktree.exists());

        fx.orchestrator.archive_session(&id).await.unwrap();
        assert!(!worktree.exists());
        assert!(fx.orchestrator.get_session(&id).unwrap().archived);
        assert!(!fx
            .orchestrator
            .list_sessions(false)
            .iter()
            .any(|s| s.id == id));
        // History survives archiving.
        assert_eq!(fx.orchestrator.prompt_history(&id).len(), 1);

        let main_id = fx
            .orchestrator
            .register_main_repo_session(&fx.project_id)
            .await
            .unwrap();
        let repo_root = fx.orchestrator.get_session(&main_id).unwrap().worktree_path;
        fx.orchestrator.archive_session(&main_id).await.unwrap();
        assert!(repo_root.exists(), "main repository must never be removed");
    }

    #[tokio::test]
    async fn one_running_script_process_wide() {
        let fx = fixture(FAKE_AGENT).await;
        let a = fx
            .orchestrator
            .create_session(params(&fx, "script session one"))
            .await
            .unwrap();
        let b = fx
            .orchestrator
            .create_session(params(&fx, "script session two"))
            .await
            .unwrap();
        wait_for_status(&fx.orchestrator, &a, SessionStatus::CompletedUnviewed).await;
        wait_for_status(&fx.orchestrator, &b, SessionStatus::CompletedUnviewed).await;

        let first_pid = fx.orchestrator.run_script(&a, "sleep 600").await.unwrap();
        let second_pid = fx.orchestrator.run_script(&b, "sleep 600").await.unwrap();
        assert_ne!(first_pid, second_pid);
        assert_eq!(fx.orchestrator.running_script_pid().await, Some(second_pid));

        // The first occupant is fully gone, not just replaced in the slot.
        #[cfg(unix)]
        {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            loop {
                let alive = unsafe { libc::kill(first_pid as i32, 0) } == 0;
                if !alive {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    panic!("first script process survived the handover");
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        fx.orchestrator.stop_script().await;
        assert_eq!(fx.orchestrator.running_script_pid().await, None);
    }

    #[tokio::test]
    async fn checkpoint_commit_lands_after_the_turn() {
        let fx = fixture(DIRTYING_AGENT).await;
        let mut p = params(&fx, "make a generated file");
        p.auto_commit = true;

        let id = fx.orchestrator.create_session(p).await.unwrap();
        wait_for_status(&fx.orchestrator, &id, SessionStatus::CompletedUnviewed).await;

        let worktree = fx.orchestrator.get_session(&id).unwrap().worktree_path;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let subject =
                crate::worktree::run_git(&["log", "-1", "--format=%s"], &worktree).await;
            if let Ok(subject) = subject {
                if subject == "checkpoint: make a generated file" {
                    break;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("checkpoint commit never appeared");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn spawn_failure_flips_session_to_error() {
        let fx = fixture(FAKE_AGENT).await;
        // Point the supervisor at a binary that does not exist.
        let missing = PathBuf::from("/nonexistent/agent-binary");
        let events = EventBus::new();
        let (store_tx, _store_rx) = create_store_channel();
        let reaper = Arc::new(ProcessTreeReaper::new(Duration::from_millis(200)));
        let shells = ShellPool::new(events.clone(), reaper.clone());
        let broken = SessionOrchestrator::new(
            &ServerConfig::default(),
            events,
            store_tx,
            AgentSupervisor::new(missing),
            reaper,
            shells,
            Arc::new(PendingApprovals::new()),
        );
        broken.register_project(fx.orchestrator.project(&fx.project_id).unwrap());

        let err = broken
            .create_session(params(&fx, "doomed session"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Agent(_)));

        let session = broken.list_sessions(false).into_iter().next().unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.error_message.unwrap().contains("spawn"));
    }

    #[tokio::test]
    async fn create_sessions_fans_out_under_the_queue() {
        let fx = fixture(FAKE_AGENT).await;
        let handles = fx.orchestrator.create_sessions(params(&fx, "parallel work"), 3);
        for handle in handles {
            handle.join().await.unwrap();
        }

        let sessions = fx.orchestrator.list_sessions(false);
        assert_eq!(sessions.len(), 3);

        // Each session got its own working copy.
        let mut paths: Vec<_> = sessions.iter().map(|s| s.worktree_path.clone()).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 3);
    }

    #[tokio::test]
    async fn store_mirrors_session_records() {
        let fx = fixture(FAKE_AGENT).await;
        let id = fx
            .orchestrator
            .create_session(params(&fx, "store me"))
            .await
            .unwrap();
        wait_for_status(&fx.orchestrator, &id, SessionStatus::CompletedUnviewed).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let stored = fx.store.sessions.get(&id).map(|s| s.status);
            if stored == Some(SessionStatus::CompletedUnviewed) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("store never saw the final status; has {stored:?}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(fx.store.markers.get(&id).unwrap().len(), 1);
    }

    #[test]
    fn slug_from_prompt_shapes_branch_templates() {
        assert_eq!(slug_from_prompt("Add a login page!"), "add-a-login-page");
        assert_eq!(slug_from_prompt(""), "session");
        assert_eq!(
            slug_from_prompt("Fix the #1 most-annoying bug in the tracker"),
            "fix-the-1-mostannoying"
        );
    }
}
