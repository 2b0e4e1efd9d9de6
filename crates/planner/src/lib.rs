pub mod pipeline;
pub mod roles;
pub mod task;

pub use pipeline::{Pipeline, PipelineConfig, PipelineState};
pub use task::{coerce_tasks, parse_plan_output, PlanOutput, PlanTask, TaskRecord, TaskState};
