//! Approval gateway wire protocol
//!
//! Newline-delimited JSON over a local socket. Every message carries an
//! explicit protocol version so clients can be rejected loudly instead of
//! misparsed silently. Request/response pairing is by `request_id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current gateway protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Allow or deny a tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

/// The resolution of one permission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub behavior: PermissionBehavior,
    /// Edited tool parameters to run with instead of the original input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    /// Reason shown to the agent (deny) or note attached to the decision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self {
            behavior: PermissionBehavior::Allow,
            updated_input: None,
            message: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: PermissionBehavior::Deny,
            updated_input: None,
            message: Some(message.into()),
        }
    }
}

/// Messages exchanged with the approval gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GatewayMessage {
    /// Agent tool layer → gateway: may this tool call run?
    PermissionRequest {
        v: u32,
        request_id: String,
        session_id: String,
        tool_name: String,
        input: Value,
    },
    /// Gateway → agent tool layer: the decision, exactly once per request
    PermissionResponse {
        v: u32,
        request_id: String,
        response: PermissionDecision,
    },
}
