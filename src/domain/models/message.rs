//! Mailbox message model.
//!
//! One record per JSON line in an agent's mailbox file. Ordering within a
//! mailbox is append order; metadata carries small structured fields such
//! as `taskId` or `approved`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Recipient name that fans out to every mailbox except the sender's.
pub const BROADCAST: &str = "*";

/// The lead's well-known agent ID.
pub const LEAD_ID: &str = "lead";

/// Kind of a mailbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Text,
    StatusUpdate,
    ShutdownRequest,
    ShutdownResponse,
    PlanSubmission,
    PlanApproval,
    TaskAssignment,
    Broadcast,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::StatusUpdate => "StatusUpdate",
            Self::ShutdownRequest => "ShutdownRequest",
            Self::ShutdownResponse => "ShutdownResponse",
            Self::PlanSubmission => "PlanSubmission",
            Self::PlanApproval => "PlanApproval",
            Self::TaskAssignment => "TaskAssignment",
            Self::Broadcast => "Broadcast",
        }
    }
}

/// A record in an agent's mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// 12-character unique token.
    pub message_id: String,
    pub from_agent_id: String,
    /// Target agent, or [`BROADCAST`] for fan-out.
    pub to_agent_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Human-readable body.
    pub content: String,
    /// Short structured fields (e.g. `taskId`, `approved`).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            from_agent_id: from.into(),
            to_agent_id: to.into(),
            message_type,
            content: content.into(),
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Metadata convenience accessor.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Parse a `"true"`/`"false"` metadata flag; anything else is false.
    pub fn meta_flag(&self, key: &str) -> bool {
        self.meta(key) == Some("true")
    }
}

/// Generate a 12-character unique message token.
fn new_message_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_is_twelve_chars() {
        let msg = Message::new("a", "b", MessageType::Text, "hi");
        assert_eq!(msg.message_id.len(), 12);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Message::new("a", "b", MessageType::Text, "x");
        let b = Message::new("a", "b", MessageType::Text, "x");
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_type_field_renamed_in_json() {
        let msg = Message::new("a", "lead", MessageType::PlanSubmission, "plan body")
            .with_meta("taskId", "task-3");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"PlanSubmission\""));

        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_type, MessageType::PlanSubmission);
        assert_eq!(back.meta("taskId"), Some("task-3"));
    }

    #[test]
    fn test_meta_flag() {
        let msg = Message::new("lead", "a", MessageType::PlanApproval, "ok")
            .with_meta("approved", "true");
        assert!(msg.meta_flag("approved"));
        assert!(!msg.meta_flag("missing"));
    }
}
