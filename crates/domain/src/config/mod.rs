mod connection;
mod outbound;
mod plan_solve;
mod server;
mod session;
mod state;

pub use connection::ConnectionConfig;
pub use outbound::OutboundConfig;
pub use plan_solve::PlanSolveConfig;
pub use server::ServerConfig;
pub use session::SessionConfig;
pub use state::StateConfig;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub plan_solve: PlanSolveConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good. Errors indicate the
    /// server should refuse to start; warnings are logged and ignored.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "server.port".into(),
                    message: "port must be greater than 0".into(),
            });
        }
        if self.server.host.is_empty() {
            errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "server.host".into(),
                    message: "host must not be empty".into(),
            });
        }

        if self.outbound.queue_capacity == 0 {
            errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "outbound.queue_capacity".into(),
                    message: "queue_capacity must be greater than 0".into(),
            });
        }
        if self.outbound.history_ring_size < 1000 {
            errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: "outbound.history_ring_size".into(),
                    message: "history_ring_size below the recommended minimum of 1000".into(),
            });
        }
        if self.outbound.replay_cap > self.outbound.history_ring_size {
            errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: "outbound.replay_cap".into(),
                    message: "replay_cap exceeds history_ring_size; replay can never use the full cap"
                    .into(),
            });
        }

        if self.state.secret_env.is_empty() {
            errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "state.secret_env".into(),
                    message: "secret_env must name an environment variable".into(),
            });
        }
        if std::env::var(&self.state.secret_env).is_err() {
            errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: "state.secret_env".into(),
                    message: format!(
                        "environment variable \"{}\" is unset; an ephemeral random signing key will be used",
                        self.state.secret_env
                    ),
            });
        }
        if self.state.max_memory_snapshot_messages == 0 {
            errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "state.max_memory_snapshot_messages".into(),
                    message: "max_memory_snapshot_messages must be greater than 0".into(),
            });
        }
        for (i, pattern) in self.state.sensitive_field_patterns.iter().enumerate() {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(ConfigError {
                        severity: ConfigSeverity::Error,
                        field: format!("state.sensitive_field_patterns[{i}]"),
                        message: format!("invalid regex \"{pattern}\": {e}"),
                });
            }
        }

        if self.plan_solve.max_concurrent_tasks == 0 {
            errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "plan_solve.max_concurrent_tasks".into(),
                    message: "max_concurrent_tasks must be greater than 0".into(),
            });
        }

        errors
    }
}
