use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::tag::{EventCategory, EventTag};

/// One protocol message. Server-stamped with `seq` and `event_id` only on
/// egress, through the outbound channel — a freshly constructed
/// `Event` has both as `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event: EventTag,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl Event {
    pub fn new(tag: EventTag) -> Self {
        Self {
            event: tag,
            timestamp: Utc::now(),
            session_id: None,
            connection_id: None,
            step_id: None,
            content: Value::Null,
            metadata: Map::new(),
            seq: None,
            event_id: None,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<Value>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn category(&self) -> EventCategory {
        self.event.category()
    }

    /// Stamp the fields only the outbound channel is allowed to set.
    pub fn stamp(&mut self, connection_id: &str, seq: u64) {
        self.seq = Some(seq);
        self.connection_id = Some(connection_id.to_string());
        self.event_id = Some(format!("{connection_id}-{seq}"));
    }

    /// Short human-oriented rendering, used by CLI debug logging and the
    /// scenario recorder — never the wire format itself.
    pub fn display(&self) -> String {
        let content = match &self.content {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        if content.is_empty() {
            self.event.as_str().to_string()
        } else {
            format!("{} {content}", self.event.as_str())
        }
    }
}

/// Validation rules applied to inbound (client→server) events only,
/// before any session-specific dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundCheck {
    Ok,
    /// Tag is not in the user category — respond `system.error{unknown_event}`.
    NotUserEvent,
    /// Event requires a `session_id` that was not supplied.
    MissingSessionId,
    /// `user.response` without a `step_id`.
    MissingStepId,
}

impl Event {
    /// The bare structural checks the codec can make without session state
    /// (ownership of `session_id` by the current connection is checked by
    /// the connection manager, which has that context).
    pub fn check_inbound(&self) -> InboundCheck {
        if self.event.category() != EventCategory::User {
            return InboundCheck::NotUserEvent;
        }
        let session_exempt = matches!(
            self.event,
            EventTag::UserCreateSession
            | EventTag::UserReconnect
            | EventTag::UserReconnectWithState
            | EventTag::UserRequestState
            | EventTag::UserAck
        );
        if !session_exempt && self.session_id.is_none() {
            return InboundCheck::MissingSessionId;
        }
        if self.event == EventTag::UserResponse && self.step_id.is_none() {
            return InboundCheck::MissingStepId;
        }
        InboundCheck::Ok
    }
}
