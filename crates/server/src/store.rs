//! Store channel
//!
//! The external persisted store is the system of record for session,
//! prompt-marker, and conversation records. The core only ever talks to it
//! through this command channel; an in-memory store task serves as the
//! default sink and as the test double.

use std::sync::Arc;

use dashmap::DashMap;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};

use drydock_protocol::{ConversationMessage, PromptMarker, Session, SessionStatus};

/// Commands mirrored to the external store
#[derive(Debug, Clone)]
pub enum StoreCommand {
    /// Create or replace a session record
    SessionUpsert { session: Session },

    /// Update a session's status (and error message, for error states)
    SessionStatus {
        id: String,
        status: SessionStatus,
        error: Option<String>,
    },

    /// Mark a session archived
    SessionArchived { id: String },

    /// Append a prompt marker
    PromptMarkerAppend {
        session_id: String,
        marker: PromptMarker,
    },

    /// Record a prompt marker's completion time
    PromptMarkerComplete {
        session_id: String,
        sequence: u64,
        completed_at: DateTime<Utc>,
    },

    /// Append a conversation message
    ConversationAppend {
        session_id: String,
        message: ConversationMessage,
    },
}

pub fn create_store_channel() -> (mpsc::Sender<StoreCommand>, mpsc::Receiver<StoreCommand>) {
    mpsc::channel(256)
}

/// In-memory sink behind the store channel
#[derive(Default)]
pub struct MemoryStore {
    pub sessions: DashMap<String, Session>,
    pub markers: DashMap<String, Vec<PromptMarker>>,
    pub conversations: DashMap<String, Vec<ConversationMessage>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain the channel into the store (call from `tokio::spawn`).
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<StoreCommand>) {
        info!(component = "store", event = "store.started");
        while let Some(cmd) = rx.recv().await {
            self.apply(cmd);
        }
        info!(component = "store", event = "store.stopped");
    }

    fn apply(&self, cmd: StoreCommand) {
        debug!(component = "store", event = "store.apply", cmd = ?cmd);
        match cmd {
            StoreCommand::SessionUpsert { session } => {
                self.sessions.insert(session.id.clone(), session);
            }
            StoreCommand::SessionStatus { id, status, error } => {
                if let Some(mut session) = self.sessions.get_mut(&id) {
                    session.status = status;
                    session.error_message = error;
                    session.updated_at = Utc::now();
                }
            }
            StoreCommand::SessionArchived { id } => {
                if let Some(mut session) = self.sessions.get_mut(&id) {
                    session.archived = true;
                    session.updated_at = Utc::now();
                }
            }
            StoreCommand::PromptMarkerAppend { session_id, marker } => {
                self.markers.entry(session_id).or_default().push(marker);
            }
            StoreCommand::PromptMarkerComplete {
                session_id,
                sequence,
                completed_at,
            } => {
                if let Some(mut markers) = self.markers.get_mut(&session_id) {
                    if let Some(marker) = markers.iter_mut().find(|m| m.sequence == sequence) {
                        marker.completed_at = Some(completed_at);
                    }
                }
            }
            StoreCommand::ConversationAppend {
                session_id,
                message,
            } => {
                self.conversations
                    .entry(session_id)
                    .or_default()
                    .push(message);
            }
        }
    }
}
