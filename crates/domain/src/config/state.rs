use serde::{Deserialize, Serialize};

/// State manager tuning: signing secret source, snapshot caps, and the
/// field-name patterns stripped before a snapshot leaves the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Environment variable holding the HMAC signing secret. If unset at
    /// startup, an ephemeral random secret is generated and a warning is
    /// logged; any state signed before a restart then fails to restore.
    #[serde(default = "d_secret_env")]
    pub secret_env: String,
    #[serde(default = "d_max_memory_snapshot_messages")]
    pub max_memory_snapshot_messages: usize,
    #[serde(default = "d_max_state_bytes")]
    pub max_state_bytes: usize,
    #[serde(default = "d_max_age_days")]
    pub max_age_days: i64,
    #[serde(default = "d_sensitive_field_patterns")]
    pub sensitive_field_patterns: Vec<String>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            secret_env: d_secret_env(),
            max_memory_snapshot_messages: d_max_memory_snapshot_messages(),
            max_state_bytes: d_max_state_bytes(),
            max_age_days: d_max_age_days(),
            sensitive_field_patterns: d_sensitive_field_patterns(),
        }
    }
}

fn d_secret_env() -> String {
    "CONDUIT_STATE_SECRET".into()
}
fn d_max_memory_snapshot_messages() -> usize {
    100
}
fn d_max_state_bytes() -> usize {
    100 * 1024
}
fn d_max_age_days() -> i64 {
    7
}
fn d_sensitive_field_patterns() -> Vec<String> {
    vec![
        r"(?i)api[_-]?key".into(),
        r"(?i)secret".into(),
        r"(?i)password".into(),
        r"(?i)token".into(),
        r"(?i)credential".into(),
    ]
}
