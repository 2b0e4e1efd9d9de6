use std::sync::Arc;

use async_trait::async_trait;
use conduit_session::{Agent, AgentFactory, StepRecord};
use serde_json::{json, Value};
use uuid::Uuid;

/// A small built-in [`Agent`] standing in for a real LLM-backed one. The
/// external agent-factory contract is the integration seam; nothing in
/// this binary depends on any particular model provider, so `echo` is
/// what ships to make the server runnable out of the box.
///
/// It thinks once, requests confirmation before "running" any input that
/// mentions the word "confirm", and otherwise answers straight away by
/// echoing the input back.
pub struct EchoAgent {
    memory: Vec<Value>,
}

impl EchoAgent {
    pub fn new() -> Self {
        Self { memory: Vec::new() }
    }
}

impl Default for EchoAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for EchoAgent {
    async fn run(&mut self, input: &str, out: tokio::sync::mpsc::Sender<StepRecord>) {
        self.memory.push(json!({"role": "user", "content": input}));

        if out
        .send(StepRecord::Thinking {
                content: format!("considering \"{input}\""),
        })
        .await
        .is_err()
        {
            return;
        }

        if input.to_lowercase().contains("confirm") {
            let step_id = format!("echo-{}", Uuid::new_v4());
            let sent = out
            .send(StepRecord::ToolCall {
                    step_id: step_id.clone(),
                    tool_name: "echo_tool".into(),
                    tool_description: "echoes the input back verbatim".into(),
                    arguments: json!({ "input": input }),
                    requires_confirmation: true,
            })
            .await;
            if sent.is_err() {
                return;
            }
            let _ = out
            .send(StepRecord::ToolResult {
                    step_id,
                    tool_name: "echo_tool".into(),
                    content: json!({ "echoed": input }),
                    is_error: false,
            })
            .await;
        }

        let answer = format!("you said: {input}");
        self.memory.push(json!({"role": "assistant", "content": answer.clone()}));
        let _ = out
        .send(StepRecord::Final {
                content: answer,
                statistics: vec![json!({"input_tokens": input.len(), "output_tokens": 0})],
        })
        .await;
    }

    async fn cancel(&mut self) {}

    fn memory(&self) -> Value {
        Value::Array(self.memory.clone())
    }

    fn restore_memory(&mut self, snapshot: Value) {
        if let Value::Array(items) = snapshot {
            self.memory = items;
        }
    }

    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "echoes user input back, demonstrating the confirmation gate"
    }
}

pub struct EchoAgentFactory;

impl AgentFactory for EchoAgentFactory {
    fn create(&self) -> Box<dyn Agent> {
        Box::new(EchoAgent::new())
    }
}

/// A planner stand-in that always proposes a single task covering the
/// whole question, so `user.message` with `mode: "plan_solve"` has
/// something real to drive against without a model in the loop.
pub struct DemoPlannerAgent;

#[async_trait]
impl Agent for DemoPlannerAgent {
    async fn run(&mut self, input: &str, out: tokio::sync::mpsc::Sender<StepRecord>) {
        let plan = json!({
                "tasks": [{"id": "t1", "description": input}],
                "plan_summary": format!("one task covering: {input}"),
        });
        let _ = out
        .send(StepRecord::Final {
                content: plan.to_string(),
                statistics: vec![],
        })
        .await;
    }

    async fn cancel(&mut self) {}

    fn memory(&self) -> Value {
        Value::Null
    }

    fn restore_memory(&mut self, _snapshot: Value) {}

    fn name(&self) -> &str {
        "demo-planner"
    }

    fn description(&self) -> &str {
        "splits a question into a single demo task"
    }
}

pub struct DemoPlannerFactory;

impl AgentFactory for DemoPlannerFactory {
    fn create(&self) -> Box<dyn Agent> {
        Box::new(DemoPlannerAgent)
    }
}

/// Resolve the `--agent-factory` flag to a concrete [`AgentFactory`].
/// Only the built-in `echo` demo ships with this binary; a real
/// LLM-backed factory is an external collaborator, out of scope here.
pub fn resolve_agent_factory(id: &str) -> anyhow::Result<Arc<dyn AgentFactory>> {
    match id {
        "echo" => Ok(Arc::new(EchoAgentFactory)),
        other => anyhow::bail!("unknown agent factory \"{other}\"; only \"echo\" is built in"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn plain_input_echoes_without_confirmation() {
        let mut agent = EchoAgent::new();
        let (tx, mut rx) = mpsc::channel(8);
        agent.run("hello", tx).await;
        let mut steps = Vec::new();
        while let Some(s) = rx.recv().await {
            steps.push(s);
        }
        assert_eq!(steps.len(), 2);
        assert!(matches!(steps[0], StepRecord::Thinking { .. }));
        assert!(matches!(steps[1], StepRecord::Final { .. }));
    }

    #[tokio::test]
    async fn confirm_keyword_requests_confirmation_first() {
        let mut agent = EchoAgent::new();
        let (tx, mut rx) = mpsc::channel(8);
        agent.run("please confirm this", tx).await;
        let mut steps = Vec::new();
        while let Some(s) = rx.recv().await {
            steps.push(s);
        }
        assert!(matches!(
                steps[1],
                StepRecord::ToolCall {
                    requires_confirmation: true,
                    ..
                }
        ));
        assert!(matches!(steps.last().unwrap(), StepRecord::Final { .. }));
    }

    #[tokio::test]
    async fn memory_round_trips_through_export_and_restore() {
        let mut agent = EchoAgent::new();
        let (tx, mut rx) = mpsc::channel(8);
        agent.run("hi", tx).await;
        while rx.recv().await.is_some() {}
        let exported = agent.memory();

        let mut fresh = EchoAgent::new();
        fresh.restore_memory(exported.clone());
        assert_eq!(fresh.memory(), exported);
    }

    #[test]
    fn resolve_agent_factory_rejects_unknown_ids() {
        assert!(resolve_agent_factory("echo").is_ok());
        assert!(resolve_agent_factory("gpt-5").is_err());
    }
}
