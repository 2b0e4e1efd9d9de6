use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// The schema version this build signs and prefers to restore. `verify`
/// rejects any other value with `version_unsupported`.
pub const CURRENT_VERSION: u32 = 1;

/// The unsigned snapshot body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub session_id: Uuid,
    pub current_step: u64,
    pub agent_state: Value,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Serialized transcript, newest-last. Export truncates this to the
    /// configured message count and byte cap.
    pub memory_snapshot: Vec<Value>,
    /// Static tool configuration only — never secrets; export strips
    /// anything matching the sensitive-field patterns.
    pub tool_states: Value,
    pub pending_confirmations: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// The client-held signed envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub state: SnapshotState,
    pub timestamp: DateTime<Utc>,
    pub signature: String,
    pub version: u32,
    pub checksum: String,
}
