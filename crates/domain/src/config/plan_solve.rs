use serde::{Deserialize, Serialize};

/// Plan-solve pipeline tuning: solver fan-out concurrency and whether a
/// plan must be explicitly confirmed by the user before solving starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSolveConfig {
    /// Maximum solver tasks running concurrently within one pipeline.
    /// Clamped to `1..=20`, mirroring the session engine's own
    /// concurrency guard.
    #[serde(default = "d_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub plan_confirmation_required: bool,
    #[serde(default = "d_plan_confirmation_timeout_s")]
    pub plan_confirmation_timeout_s: u64,
}

impl Default for PlanSolveConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: d_max_concurrent_tasks(),
            plan_confirmation_required: false,
            plan_confirmation_timeout_s: d_plan_confirmation_timeout_s(),
        }
    }
}

impl PlanSolveConfig {
    pub fn clamped(&self) -> Self {
        Self {
            max_concurrent_tasks: self.max_concurrent_tasks.clamp(1, 20),
            ..self.clone()
        }
    }
}

fn d_max_concurrent_tasks() -> usize {
    5
}
fn d_plan_confirmation_timeout_s() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_concurrent_is_five() {
        assert_eq!(PlanSolveConfig::default().max_concurrent_tasks, 5);
    }

    #[test]
    fn clamp_below_min() {
        let cfg = PlanSolveConfig {
            max_concurrent_tasks: 0,
            ..PlanSolveConfig::default()
        };
        assert_eq!(cfg.clamped().max_concurrent_tasks, 1);
    }

    #[test]
    fn clamp_above_max() {
        let cfg = PlanSolveConfig {
            max_concurrent_tasks: 100,
            ..PlanSolveConfig::default()
        };
        assert_eq!(cfg.clamped().max_concurrent_tasks, 20);
    }
}
