//! Drydock Protocol
//!
//! Shared types for communication between the Drydock orchestrator core and
//! the layers around it (UI adapters, the approval gateway's clients, the
//! external store). Everything here serializes as JSON.

use uuid::Uuid;

pub mod approval;
pub mod events;
pub mod types;

pub use approval::{GatewayMessage, PermissionBehavior, PermissionDecision, PROTOCOL_VERSION};
pub use events::{DockEvent, JobState};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
