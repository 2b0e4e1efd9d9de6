use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conduit_session::{Agent, AgentFactory, StepRecord};
use parking_lot::Mutex;
use serde_json::Value;

/// A scriptable [`Agent`]: sends a fixed sequence of [`StepRecord`]s and
/// returns. Used in place of a real LLM-backed agent in every scenario
/// test across the workspace.
pub struct ScriptedAgent {
    name: String,
    steps: VecDeque<StepRecord>,
    memory: Value,
    cancelled: Arc<AtomicBool>,
}

impl ScriptedAgent {
    pub fn new(name: impl Into<String>, steps: Vec<StepRecord>) -> Self {
        Self {
            name: name.into(),
            steps: steps.into(),
            memory: Value::Null,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn run(&mut self, _input: &str, out: tokio::sync::mpsc::Sender<StepRecord>) {
        while let Some(step) = self.steps.pop_front() {
            // Yield between records so a racing cancellation actually gets
            // a chance to win the select in the caller, matching how a
            // real agent's steps are interleaved with network/tool I/O.
            tokio::task::yield_now().await;
            if out.send(step).await.is_err() {
                return;
            }
        }
    }

    async fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn memory(&self) -> Value {
        self.memory.clone()
    }

    fn restore_memory(&mut self, snapshot: Value) {
        self.memory = snapshot;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted test agent"
    }
}

/// Produces a fresh [`ScriptedAgent`] replaying the same script every
/// time `create` is called, which is what a `user.restart_task` or a
/// fresh `SessionHandle::create` expects from a real factory.
pub struct ScriptedFactory {
    name: String,
    steps: Vec<StepRecord>,
}

impl ScriptedFactory {
    pub fn new(name: impl Into<String>, steps: Vec<StepRecord>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub fn arc(name: impl Into<String>, steps: Vec<StepRecord>) -> Arc<dyn AgentFactory> {
        Arc::new(Self::new(name, steps))
    }
}

impl AgentFactory for ScriptedFactory {
    fn create(&self) -> Box<dyn Agent> {
        Box::new(ScriptedAgent::new(self.name.clone(), self.steps.clone()))
    }
}

/// An agent whose `run` never resolves until `cancel` is called, for
/// exercising `user.cancel` / `user.cancel_task` against work that is
/// genuinely still in flight rather than already finished.
pub struct PendingAgent {
    pub started: Arc<AtomicBool>,
}

#[async_trait]
impl Agent for PendingAgent {
    async fn run(&mut self, _input: &str, _out: tokio::sync::mpsc::Sender<StepRecord>) {
        self.started.store(true, Ordering::SeqCst);
        std::future::pending::<()>().await;
    }

    async fn cancel(&mut self) {}

    fn memory(&self) -> Value {
        Value::Null
    }

    fn restore_memory(&mut self, _snapshot: Value) {}

    fn name(&self) -> &str {
        "pending"
    }

    fn description(&self) -> &str {
        "never completes on its own"
    }
}

pub struct PendingFactory {
    pub started: Arc<AtomicBool>,
}

impl PendingFactory {
    pub fn new() -> Self {
        Self {
            started: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for PendingFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentFactory for PendingFactory {
    fn create(&self) -> Box<dyn Agent> {
        Box::new(PendingAgent {
                started: Arc::clone(&self.started),
        })
    }
}

/// Shorthand for a well-formed single-turn script: some thinking, then a
/// final answer. Covers scenario 1 without repeating boilerplate in
/// every call site.
pub fn thinking_then_final(thought: &str, answer: &str) -> Vec<StepRecord> {
    vec![
        StepRecord::Thinking {
            content: thought.to_string(),
        },
        StepRecord::Final {
            content: answer.to_string(),
            statistics: vec![serde_json::json!({"input_tokens": 10, "output_tokens": 5})],
        },
    ]
}

/// Shorthand for scenario 2: a tool call that requires confirmation,
/// followed by a final answer once the caller resolves it.
pub fn tool_call_requiring_confirmation(
    step_id: &str,
    tool_name: &str,
    answer: &str,
) -> Vec<StepRecord> {
    vec![
        StepRecord::ToolCall {
            step_id: step_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_description: format!("the {tool_name} tool"),
            arguments: Value::Null,
            requires_confirmation: true,
        },
        StepRecord::ToolResult {
            step_id: step_id.to_string(),
            tool_name: tool_name.to_string(),
            content: serde_json::json!({"ok": true}),
            is_error: false,
        },
        StepRecord::Final {
            content: answer.to_string(),
            statistics: Vec::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn scripted_agent_replays_its_steps_in_order() {
        let mut agent = ScriptedAgent::new("t", thinking_then_final("hm", "hello"));
        let (tx, mut rx) = mpsc::channel(8);
        agent.run("hi", tx).await;
        let mut seen = Vec::new();
        while let Some(step) = rx.recv().await {
            seen.push(step);
        }
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], StepRecord::Thinking { .. }));
        assert!(matches!(seen[1], StepRecord::Final { .. }));
    }

    #[tokio::test]
    async fn factory_produces_independent_fresh_agents() {
        let factory = ScriptedFactory::new("t", thinking_then_final("a", "b"));
        let mut a1 = factory.create();
        let mut a2 = factory.create();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        a1.run("x", tx1).await;
        a2.run("x", tx2).await;
        let mut n1 = 0;
        while rx1.recv().await.is_some() {
            n1 += 1;
        }
        let mut n2 = 0;
        while rx2.recv().await.is_some() {
            n2 += 1;
        }
        assert_eq!(n1, n2);
    }
}
