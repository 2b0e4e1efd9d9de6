use serde::{Deserialize, Serialize};

/// Per-connection outbound channel tuning: queue depth, coalescing window,
/// replay history size, and per-reconnect replay cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    #[serde(default = "d_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "d_coalesce_window_ms")]
    pub coalesce_window_ms: u64,
    #[serde(default = "d_history_ring_size")]
    pub history_ring_size: usize,
    #[serde(default = "d_replay_cap")]
    pub replay_cap: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            queue_capacity: d_queue_capacity(),
            coalesce_window_ms: d_coalesce_window_ms(),
            history_ring_size: d_history_ring_size(),
            replay_cap: d_replay_cap(),
        }
    }
}

fn d_queue_capacity() -> usize {
    1000
}
fn d_coalesce_window_ms() -> u64 {
    75
}
fn d_history_ring_size() -> usize {
    1000
}
fn d_replay_cap() -> usize {
    200
}
