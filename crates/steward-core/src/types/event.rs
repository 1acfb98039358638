use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Stage;

/// An immutable fact observed from the backend, either over the push
/// stream or inside a polled snapshot.
///
/// Two events with the same `id` are the same fact; whichever consumer
/// sees the duplicate second discards it. Events are never mutated
/// after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Opaque identifier, used only for de-duplication.
    pub id: String,
    /// Ordering and tie-break timestamp.
    pub created_at: DateTime<Utc>,
    /// Tracked entity this event pertains to (e.g. a task id), if any.
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Dotted classification string, e.g. `task.stage.completed`.
    pub topic: String,
    /// Lifecycle stage the event belongs to, if any.
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Payload fields beyond the known ones, passed through unmodified.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Event {
    /// Minimal constructor for events that carry nothing beyond
    /// identity, time, and topic. Callers fill in the rest.
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at,
            entity_id: None,
            topic: topic.into(),
            stage: None,
            status: None,
            service: None,
            message: None,
            metadata: serde_json::Value::Null,
        }
    }
}
