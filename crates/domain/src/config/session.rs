use serde::{Deserialize, Serialize};

/// Session engine tuning: the confirmation gate timeout and whether raw
/// `agent.llm_message` events are forwarded to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "d_confirmation_timeout_s")]
    pub confirmation_timeout_s: u64,
    #[serde(default)]
    pub send_llm_message: bool,
    #[serde(default = "d_max_tool_loops")]
    pub max_tool_loops: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_s: d_confirmation_timeout_s(),
            send_llm_message: false,
            max_tool_loops: d_max_tool_loops(),
        }
    }
}

fn d_confirmation_timeout_s() -> u64 {
    300
}
fn d_max_tool_loops() -> u32 {
    25
}
