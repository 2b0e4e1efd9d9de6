use conduit_session::{Agent, CancelToken, StepRecord};
use serde_json::Value;

/// How one agent-driven phase (planner, one solver, aggregator) of the
/// pipeline ended. Mirrors the terminal-event shape the session engine
/// uses for `user.message`, collapsed to what plan-solve actually
/// cares about: intermediate `thinking`/`tool_call`/`partial` records are
/// not surfaced as distinct wire events in plan-solve mode, only the terminating record matters.
pub enum PhaseOutcome {
    Final { content: String, statistics: Vec<Value> },
    Cancelled,
    Error(String),
}

/// Drive one `Agent::run` call to completion, honouring `cancel`. This is
/// the plan-solve analogue of `SessionHandle::run`'s select loop,
/// generalized to ignore step kinds the pipeline doesn't render.
pub async fn drive_agent(agent: &mut dyn Agent, input: &str, cancel: &CancelToken) -> PhaseOutcome {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<StepRecord>(32);
    let run_fut = agent.run(input, tx);
    tokio::pin!(run_fut);
    let mut agent_done = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                agent.cancel().await;
                return PhaseOutcome::Cancelled;
            }
            _ = &mut run_fut, if !agent_done => {
                agent_done = true;
            }
            step = rx.recv() => {
                match step {
                    Some(StepRecord::Final { content, statistics }) => {
                        return PhaseOutcome::Final { content, statistics };
                    }
                    Some(StepRecord::Error { message }) => return PhaseOutcome::Error(message),
                    Some(_) => continue,
                    None if agent_done => {
                        return PhaseOutcome::Final { content: String::new(), statistics: Vec::new() };
                    }
                    None => {}
                }
            }
        }
    }
}

/// Render a task's opaque `description` as the solver's `run` input.
pub fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Tag a batch of raw statistics records with their phase origin and the
/// sub-session name that produced them, per the `pipeline.completed`
/// statistics contract.
pub fn tag_statistics(raw: Vec<Value>, origin: &str, agent_name: &str) -> Vec<Value> {
    raw.into_iter()
    .map(|entry| match entry {
            Value::Object(mut map) => {
                map.insert("origin".into(), Value::String(origin.into()));
                map.insert("agent".into(), Value::String(agent_name.into()));
                Value::Object(map)
            }
            other => serde_json::json!({"origin": origin, "agent": agent_name, "value": other}),
    })
    .collect()
}
