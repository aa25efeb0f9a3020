//! Approval gateway
//!
//! A long-lived unix-socket server brokering "may this tool call run?"
//! requests from the agent's tool layer. Each request registers a oneshot
//! in the pending registry; the UI resolves it through the orchestrator and
//! the decision travels back on the same connection. Every request is
//! answered exactly once — internal failures resolve as deny, never as a
//! hang, and a disconnecting client sweeps its own pending entries.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use drydock_protocol::{
    DockEvent, GatewayMessage, PermissionDecision, PermissionRequest, PROTOCOL_VERSION,
};

use crate::events::EventBus;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind approval socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("gateway io error: {0}")]
    Io(#[from] std::io::Error),
}

/// In-flight permission requests, resolvable exactly once by request id
#[derive(Default)]
pub struct PendingApprovals {
    waiters: DashMap<String, oneshot::Sender<PermissionDecision>>,
}

impl PendingApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, request_id: &str) -> oneshot::Receiver<PermissionDecision> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request_id.to_string(), tx);
        rx
    }

    /// Resolve a pending request. Returns false when the id is unknown
    /// (already resolved, or its client disconnected).
    pub fn resolve(&self, request_id: &str, decision: PermissionDecision) -> bool {
        match self.waiters.remove(request_id) {
            Some((_, tx)) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    fn discard(&self, request_id: &str) {
        self.waiters.remove(request_id);
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.len()
    }
}

/// Unix-socket approval server
pub struct ApprovalGateway {
    socket_path: PathBuf,
    pending: Arc<PendingApprovals>,
    events: EventBus,
}

impl ApprovalGateway {
    pub fn new(socket_path: PathBuf, pending: Arc<PendingApprovals>, events: EventBus) -> Self {
        Self {
            socket_path,
            pending,
            events,
        }
    }

    /// Bind the socket and serve forever. Stale socket files from a previous
    /// run are removed first; no gateway state survives a restart.
    pub async fn run(self) -> Result<(), GatewayError> {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|source| {
            GatewayError::Bind {
                path: self.socket_path.clone(),
                source,
            }
        })?;

        info!(
            component = "approval",
            event = "gateway.listening",
            socket = %self.socket_path.display(),
        );

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let pending = self.pending.clone();
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, pending, events).await;
                    });
                }
                Err(e) => {
                    error!(
                        component = "approval",
                        event = "gateway.accept_error",
                        error = %e,
                    );
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    pending: Arc<PendingApprovals>,
    events: EventBus,
) {
    let (read_half, mut write_half) = stream.into_split();

    // All responses funnel through one writer task so concurrent requests
    // on the same connection cannot interleave partial lines.
    let (response_tx, mut response_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        while let Some(mut line) = response_rx.recv().await {
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    // Request ids opened by this connection, swept on disconnect.
    let conn_requests: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let msg: GatewayMessage = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "approval",
                    event = "gateway.parse_error",
                    error = %e,
                    "Dropping unparseable gateway message"
                );
                continue;
            }
        };

        match msg {
            GatewayMessage::PermissionRequest {
                v,
                request_id,
                session_id,
                tool_name,
                input,
            } => {
                if v != PROTOCOL_VERSION {
                    let _ = response_tx
                        .send(response_line(
                            &request_id,
                            PermissionDecision::deny(format!(
                                "unsupported protocol version {v}, expected {PROTOCOL_VERSION}"
                            )),
                        ))
                        .await;
                    continue;
                }

                debug!(
                    component = "approval",
                    event = "gateway.request",
                    request_id = %request_id,
                    session_id = %session_id,
                    tool_name = %tool_name,
                );

                let rx = pending.register(&request_id);
                conn_requests.lock().await.insert(request_id.clone());
                events.publish(DockEvent::PermissionRequested {
                    request: PermissionRequest {
                        request_id: request_id.clone(),
                        session_id,
                        tool_name,
                        input,
                    },
                });

                let response_tx = response_tx.clone();
                let conn_requests = conn_requests.clone();
                tokio::spawn(async move {
                    // A dropped sender (registry sweep, internal failure)
                    // must still produce an answer: deny, with the reason.
                    let decision = match rx.await {
                        Ok(decision) => decision,
                        Err(_) => PermissionDecision::deny(
                            "approval broker failed while awaiting a decision",
                        ),
                    };
                    conn_requests.lock().await.remove(&request_id);
                    let _ = response_tx.send(response_line(&request_id, decision)).await;
                });
            }

            GatewayMessage::PermissionResponse { request_id, .. } => {
                warn!(
                    component = "approval",
                    event = "gateway.unexpected_response",
                    request_id = %request_id,
                    "Clients do not send permission responses"
                );
            }
        }
    }

    // Client hung up: anything it still has in flight must not leak.
    let orphaned: Vec<String> = conn_requests.lock().await.drain().collect();
    for request_id in orphaned {
        debug!(
            component = "approval",
            event = "gateway.sweep_on_disconnect",
            request_id = %request_id,
        );
        pending.discard(&request_id);
    }

    drop(response_tx);
    let _ = writer.await;
    debug!(
        component = "approval",
        event = "gateway.connection_closed",
    );
}

fn response_line(request_id: &str, decision: PermissionDecision) -> String {
    let msg = GatewayMessage::PermissionResponse {
        v: PROTOCOL_VERSION,
        request_id: request_id.to_string(),
        response: decision,
    };
    // GatewayMessage contains no non-serializable values.
    serde_json::to_string(&msg).unwrap_or_default()
}
