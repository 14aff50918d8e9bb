//! Bus message types.
//!
//! Messages are ephemeral: they exist only between `publish` and delivery,
//! never persisted beyond the broker queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic carrying freshly ingested diagnostics.
pub const TOPIC_NEW_DIAGNOSIS: &str = "new_diagnosis";
/// Topic carrying freshly ingested action plans.
pub const TOPIC_NEW_ACTION_PLAN: &str = "new_action_plan";

/// Delivery priority. Within a topic, higher priorities are always drained
/// before lower ones are considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// All priorities, highest first. The dispatch scan order.
    pub fn descending() -> [Priority; 4] {
        [
            Priority::Critical,
            Priority::High,
            Priority::Normal,
            Priority::Low,
        ]
    }
}

/// Transport selection for a message. Only the classical broker path is
/// implemented; new transports are added as variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Classical,
}

/// A routed event between components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub protocol: Protocol,
    pub priority: Priority,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(topic: &str, payload: serde_json::Value, priority: Priority, sender: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            payload,
            protocol: Protocol::Classical,
            priority,
            sender: sender.to_string(),
            timestamp: Utc::now(),
        }
    }
}
