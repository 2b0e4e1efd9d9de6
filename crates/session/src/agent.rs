use async_trait::async_trait;
use serde_json::Value;

/// One unit of progress reported by an [`Agent`] while it services a
/// `run` call. The Session translates each record into the matching
/// `agent.*` wire event.
#[derive(Debug, Clone)]
pub enum StepRecord {
    Thinking {
        content: String,
    },
    ToolCall {
        step_id: String,
        tool_name: String,
        tool_description: String,
        arguments: Value,
        requires_confirmation: bool,
    },
    ToolResult {
        step_id: String,
        tool_name: String,
        content: Value,
        is_error: bool,
    },
    Partial {
        content: String,
    },
    LlmMessage {
        content: Value,
    },
    Final {
        content: String,
        statistics: Vec<Value>,
    },
    Error {
        message: String,
    },
}

/// One turn of agent execution. Implementations stream
/// [`StepRecord`]s over `out` and resolve once the turn is finished;
/// the Session is the only caller and owns cancellation.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&mut self, input: &str, out: tokio::sync::mpsc::Sender<StepRecord>);

    /// Abort the in-flight `run`, if any. Idempotent.
    async fn cancel(&mut self);

    /// Serialize whatever the Agent needs to resume later.
    fn memory(&self) -> Value;

    /// Repopulate from a previously exported snapshot.
    fn restore_memory(&mut self, snapshot: Value);

    fn name(&self) -> &str;
    fn description(&self) -> &str;
}

/// Produces a fresh [`Agent`] per session.
pub trait AgentFactory: Send + Sync {
    fn create(&self) -> Box<dyn Agent>;
}
