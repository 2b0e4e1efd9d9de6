use conduit_domain::config::StateConfig;
use conduit_domain::Result;
use regex::RegexSet;
use serde_json::Value;

use crate::canonical::canonical_value;
use crate::envelope::{sign, verify};
use crate::secret::StateSecret;
use crate::snapshot::{SignedEnvelope, SnapshotState};

/// Exports and restores signed session snapshots.
pub struct StateManager {
    secret: StateSecret,
    cfg: StateConfig,
    sensitive: RegexSet,
}

impl StateManager {
    pub fn new(cfg: StateConfig) -> Self {
        let secret = StateSecret::from_env(&cfg.secret_env);
        let sensitive = RegexSet::new(&cfg.sensitive_field_patterns)
        .expect("config validation rejects invalid sensitive_field_patterns before startup");
        Self {
            secret,
            cfg,
            sensitive,
        }
    }

    /// Sanitize and truncate a raw snapshot, then sign it into the
    /// envelope handed back to the client.
    pub fn export(&self, mut state: SnapshotState) -> SignedEnvelope {
        sanitize_value(&self.sensitive, &mut state.agent_state);
        sanitize_value(&self.sensitive, &mut state.tool_states);
        self.truncate_memory(&mut state.memory_snapshot);
        sign(&self.secret, state)
    }

    /// Verify a client-submitted envelope and return its snapshot.
    pub fn restore(&self, envelope: &SignedEnvelope) -> Result<SnapshotState> {
        verify(&self.secret, envelope, self.cfg.max_age_days)
    }

    fn truncate_memory(&self, memory: &mut Vec<Value>) {
        let keep = self.cfg.max_memory_snapshot_messages;
        if memory.len() > keep {
            let drop = memory.len() - keep;
            memory.drain(0..drop);
        }
        while !memory.is_empty() && total_bytes(memory) > self.cfg.max_state_bytes {
            memory.remove(0);
        }
    }
}

fn total_bytes(memory: &[Value]) -> usize {
    memory.iter().map(|m| canonical_value(m).len()).sum()
}

/// Recursively replace any object value whose key matches a sensitive
/// pattern with a redaction marker. Arrays and nested objects are walked;
/// scalars and already-redacted leaves are left alone.
fn sanitize_value(patterns: &RegexSet, value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if patterns.is_match(key) {
                    *v = Value::String("[redacted]".into());
                } else {
                    sanitize_value(patterns, v);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                sanitize_value(patterns, item);
            }
        }
        _ => {}
    }
}
