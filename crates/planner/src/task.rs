use serde::{Deserialize, Serialize};
use serde_json::Value;

use conduit_domain::Error;

/// One unit of solver work. `description` is opaque to the pipeline — it
/// is handed to the solver Agent verbatim as its `run` input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanTask {
    pub id: String,
    #[serde(default)]
    pub description: Value,
}

/// The planner's output, parsed out of its terminating `Final` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutput {
    pub tasks: Vec<PlanTask>,
    #[serde(default)]
    pub plan_summary: String,
}

/// Where a task currently sits. Exactly one of these holds for every task
/// at any time — there is no separate "failed" state: a
/// solver exception still produces a `Completed` task carrying an error
/// in its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: PlanTask,
    pub state: TaskState,
    pub result: Option<Value>,
    pub statistics: Vec<Value>,
}

impl TaskRecord {
    pub fn pending(task: PlanTask) -> Self {
        Self {
            task,
            state: TaskState::Pending,
            result: None,
            statistics: Vec::new(),
        }
    }
}

/// Parse a planner's raw `Final` content string into [`PlanOutput`]. A
/// malformed planner output is a planner failure (`plan_failed`), not a
/// coercion error — coercion is reserved for client-submitted task
/// overrides.
pub fn parse_plan_output(raw: &str) -> Result<PlanOutput, Error> {
    serde_json::from_str(raw).map_err(|e| Error::PlanFailed(format!("malformed planner output: {e}")))
}

/// Coerce a client-submitted task list (`payload.tasks` on a plan
/// confirmation response, or `user.solve_tasks.content.tasks`) into the
/// internal task type. Any single unparsable element fails the whole
/// list — all-or-nothing, reported as `coercion_error`.
pub fn coerce_tasks(raw: &Value) -> Result<Vec<PlanTask>, Error> {
    serde_json::from_value::<Vec<PlanTask>>(raw.clone())
    .map_err(|e| Error::CoercionError(e.to_string()))
}
