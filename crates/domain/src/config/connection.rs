use serde::{Deserialize, Serialize};

/// Connection manager tuning: heartbeat cadence, inbound frame limits, and
/// the reconnect grace period for detached sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "d_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,
    #[serde(default = "d_reconnect_grace_s")]
    pub reconnect_grace_s: u64,
    #[serde(default = "d_max_inbound_frame_bytes")]
    pub max_inbound_frame_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_s: d_heartbeat_interval_s(),
            reconnect_grace_s: d_reconnect_grace_s(),
            max_inbound_frame_bytes: d_max_inbound_frame_bytes(),
        }
    }
}

fn d_heartbeat_interval_s() -> u64 {
    60
}
fn d_reconnect_grace_s() -> u64 {
    120
}
fn d_max_inbound_frame_bytes() -> usize {
    1024 * 1024
}
