use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_domain::trace::TraceEvent;
use conduit_domain::{Error, Result};
use conduit_protocol::{Event, EventTag};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::agent::{Agent, AgentFactory, StepRecord};
use crate::cancel::CancelToken;
use crate::confirmation::{ConfirmationGate, ConfirmationResponse};
use crate::sink::EventSink;

/// Session engine tuning (mirrors [`conduit_domain::config::SessionConfig`];
/// kept as a plain struct here so this crate doesn't need to depend on the
/// config layer's serde machinery).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub confirmation_timeout: Duration,
    pub send_llm_message: bool,
    pub max_tool_loops: u32,
}

struct Inner {
    agent: Box<dyn Agent>,
    current_step: u64,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    closed: bool,
}

enum ConfirmOutcome {
    Resolved(ConfirmationResponse),
    TimedOut,
    Cancelled,
}

enum TerminalOutcome {
    Final(String),
    Interrupted,
    Error(String, &'static str),
}

/// Owns one Agent and implements the confirmation gate. `run` is
/// serialized with an immediate-reject "busy" policy — a second concurrent
/// call observes `Err(Error::Busy)` rather than queueing, surfaced to the
/// client as `agent.error{busy}` on a second `user.message` while one
/// is already running. The replay-surviving history ring lives one layer up,
/// on the connection's [`conduit_outbound::OutboundChannel`] — every event
/// this session emits passes through that channel's writer, which is the
/// only place `seq` numbers are actually assigned.
pub struct SessionHandle {
    pub session_id: Uuid,
    inner: AsyncMutex<Inner>,
    active_cancel: Mutex<Option<CancelToken>>,
    confirm: Arc<ConfirmationGate>,
    cfg: SessionConfig,
}

impl SessionHandle {
    /// Create a fresh session from the factory and return it alongside
    /// the `agent.session_created` event the caller must emit.
    pub fn create(
        factory: &dyn AgentFactory,
        cfg: SessionConfig,
        session_id: Option<Uuid>,
    ) -> (Self, Event) {
        let agent = factory.create();
        let session_id = session_id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();
        let handle = Self {
            session_id,
            inner: AsyncMutex::new(Inner {
                    agent,
                    current_step: 0,
                    created_at: now,
                    last_active_at: now,
                    closed: false,
            }),
            active_cancel: Mutex::new(None),
            confirm: Arc::new(ConfirmationGate::new(cfg.confirmation_timeout)),
            cfg,
        };
        let created = Event::new(EventTag::AgentSessionCreated)
        .with_session(session_id)
        .with_content(json!({"session_id": session_id}));
        (handle, created)
    }

    /// Drive the Agent for one `user.message`. Returns `Err(Error::Busy)`
    /// immediately (without touching the Agent) if a `run` is already in
    /// flight for this session.
    pub async fn run(&self, user_input: &str, sink: &dyn EventSink) -> Result<()> {
        let mut inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Err(Error::Busy),
        };
        if inner.closed {
            return Err(Error::BadSession("session is closed".into()));
        }

        let run_token = CancelToken::new();
        *self.active_cancel.lock() = Some(run_token.clone());

        let (tx, mut rx) = tokio::sync::mpsc::channel::<StepRecord>(32);
        let mut statistics: Vec<Value> = Vec::new();
        let mut open_tool_calls: Vec<String> = Vec::new();
        // Steps the gate already resolved with a synthetic denial result.
        // An Agent has no way to learn the outcome mid-run (the trait
        // exposes no feedback channel), so it may still push its own
        // `ToolResult` for the same `step_id` after denial; that arrival
        // is swallowed rather than re-emitted as a second result.
        let mut denied_steps: Vec<String> = Vec::new();
        let mut loops: u32 = 0;

        let run_fut = inner.agent.run(user_input, tx);
        tokio::pin!(run_fut);
        let mut agent_done = false;

        let terminal = 'outer: loop {
            tokio::select! {
                biased;
                _ = run_token.cancelled() => {
                    inner.agent.cancel().await;
                    break 'outer TerminalOutcome::Interrupted;
                }
                _ = &mut run_fut, if !agent_done => {
                    agent_done = true;
                }
                step = rx.recv() => {
                    match step {
                        Some(StepRecord::Thinking { content }) => {
                            self.emit(sink, &mut inner, Event::new(EventTag::AgentThinking).with_content(content)).await;
                        }
                        Some(StepRecord::ToolCall { step_id, tool_name, tool_description, arguments, requires_confirmation }) => {
                            loops += 1;
                            if loops > self.cfg.max_tool_loops {
                                break 'outer TerminalOutcome::Error(
                                    "maximum tool-call loop count exceeded".into(),
                                    "internal_error",
                                );
                            }
                            open_tool_calls.push(step_id.clone());
                            TraceEvent::ToolCallStarted {
                                session_id: self.session_id.to_string(),
                                step_id: step_id.clone(),
                                tool_name: tool_name.clone(),
                                requires_confirmation,
                            }
                            .emit();
                            self.emit(sink, &mut inner, Event::new(EventTag::AgentToolCall)
                                .with_step(step_id.clone())
                                .with_content(json!({"tool_name": &tool_name, "arguments": &arguments}))
                            ).await;

                            if requires_confirmation {
                                let confirm_step = format!("confirm_{}_{}", Uuid::new_v4(), tool_name);
                                self.emit(sink, &mut inner, Event::new(EventTag::AgentUserConfirm)
                                    .with_step(confirm_step.clone())
                                    .with_metadata("tool_name", tool_name.clone())
                                    .with_metadata("tool_description", tool_description.clone())
                                    .with_metadata("tool_args", arguments.clone())
                                ).await;

                                let rx_confirm = self.confirm.wait(confirm_step.clone());
                                let outcome = tokio::select! {
                                    biased;
                                    _ = run_token.cancelled() => ConfirmOutcome::Cancelled,
                                    resp = rx_confirm => match resp {
                                        Ok(r) => ConfirmOutcome::Resolved(r),
                                        Err(_) => ConfirmOutcome::TimedOut,
                                    },
                                    _ = tokio::time::sleep(self.confirm.timeout()) => ConfirmOutcome::TimedOut,
                                };
                                self.confirm.cancel(&confirm_step);
                                TraceEvent::ConfirmationResolved {
                                    session_id: self.session_id.to_string(),
                                    step_id: confirm_step.clone(),
                                    confirmed: matches!(
                                        outcome,
                                        ConfirmOutcome::Resolved(ConfirmationResponse { confirmed: true, .. })
                                    ),
                                    timed_out: matches!(outcome, ConfirmOutcome::TimedOut),
                                }
                                .emit();

                                match outcome {
                                    ConfirmOutcome::Resolved(ConfirmationResponse { confirmed: true, .. }) => {}
                                    ConfirmOutcome::Resolved(ConfirmationResponse { confirmed: false, .. }) => {
                                        open_tool_calls.retain(|s| s != &step_id);
                                        denied_steps.push(step_id.clone());
                                        self.emit(sink, &mut inner, Event::new(EventTag::AgentToolResult)
                                            .with_step(step_id.clone())
                                            .with_content(json!({"denied_by_user": true}))
                                        ).await;
                                        continue;
                                    }
                                    ConfirmOutcome::Cancelled => {
                                        inner.agent.cancel().await;
                                        break 'outer TerminalOutcome::Interrupted;
                                    }
                                    ConfirmOutcome::TimedOut => {
                                        break 'outer TerminalOutcome::Error(
                                            "no user.response within the confirmation timeout".into(),
                                            "confirmation_timeout",
                                        );
                                    }
                                }
                            }
                        }
                        Some(StepRecord::ToolResult { step_id, content, is_error, .. }) => {
                            if denied_steps.iter().any(|s| s == &step_id) {
                                denied_steps.retain(|s| s != &step_id);
                                continue;
                            }
                            open_tool_calls.retain(|s| s != &step_id);
                            self.emit(sink, &mut inner, Event::new(EventTag::AgentToolResult)
                                .with_step(step_id)
                                .with_content(content)
                                .with_metadata("is_error", is_error)
                            ).await;
                        }
                        Some(StepRecord::Partial { content }) => {
                            self.emit(sink, &mut inner, Event::new(EventTag::AgentPartialAnswer).with_content(content)).await;
                        }
                        Some(StepRecord::LlmMessage { content }) => {
                            if self.cfg.send_llm_message {
                                self.emit(sink, &mut inner, Event::new(EventTag::AgentLlmMessage).with_content(content)).await;
                            }
                        }
                        Some(StepRecord::Final { content, statistics: s }) => {
                            statistics = s;
                            break 'outer TerminalOutcome::Final(content);
                        }
                        Some(StepRecord::Error { message }) => {
                            break 'outer TerminalOutcome::Error(message, "internal_error");
                        }
                        None if agent_done => break 'outer TerminalOutcome::Final(String::new()),
                        None => {}
                    }
                }
            }
        };

        // Every `agent.tool_call` left unmatched here is superseded by the
        // terminal event being emitted next.
        drop(open_tool_calls);

        let terminal_event = match terminal {
            TerminalOutcome::Final(content) => Event::new(EventTag::AgentFinalAnswer)
            .with_content(content)
            .with_metadata("statistics", statistics),
            TerminalOutcome::Interrupted => Event::new(EventTag::AgentInterrupted),
            TerminalOutcome::Error(message, kind) => Event::new(EventTag::AgentError)
            .with_metadata("error_kind", kind)
            .with_content(message),
        };
        self.emit(sink, &mut inner, terminal_event).await;
        inner.last_active_at = Utc::now();
        *self.active_cancel.lock() = None;
        Ok(())
    }

    /// Resolve a pending confirmation (`user.response`). Returns `false`
    /// if no confirmation with that `step_id` is outstanding.
    pub fn respond(&self, step_id: &str, confirmed: bool, tasks: Option<Value>) -> bool {
        self.confirm
        .respond(step_id, ConfirmationResponse { confirmed, tasks })
    }

    /// Cancel the in-flight `run`, if any. A no-op when idle.
    pub fn cancel(&self) {
        if let Some(token) = self.active_cancel.lock().as_ref() {
            token.cancel();
        }
    }

    pub async fn close(&self, sink: &dyn EventSink) {
        // Cancel before taking the run lock: if a request is in flight,
        // this lets it unwind promptly instead of making close() block
        // until it finishes on its own.
        self.cancel();
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.closed = true;
        TraceEvent::SessionClosed {
            session_id: self.session_id.to_string(),
            reason: "closed".into(),
        }
        .emit();
        self.emit(sink, &mut inner, Event::new(EventTag::AgentSessionEnd))
        .await;
    }

    /// Repopulate the agent and bookkeeping fields from a restored
    /// snapshot (`user.reconnect_with_state`). Caller must only call this
    /// before the session has served any `run` — it takes the run lock
    /// itself, so a concurrent `run` sees the usual `Busy` rejection.
    pub async fn restore_from_snapshot(
        &self,
        agent_state: Value,
        current_step: u64,
        created_at: DateTime<Utc>,
        last_active_at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.agent.restore_memory(agent_state);
        inner.current_step = current_step;
        inner.created_at = created_at;
        inner.last_active_at = last_active_at;
    }

    /// Snapshot the fields a `StateManager::export` needs. Takes the
    /// run lock, so the caller must only export while the session is idle
    /// (the dispatch layer enforces this — export requests are handled
    /// like any other `user.*` event and see `busy` if one is running).
    pub async fn export_fields(&self) -> SessionSnapshotFields {
        let inner = self.inner.lock().await;
        SessionSnapshotFields {
            agent_state: inner.agent.memory(),
            current_step: inner.current_step,
            created_at: inner.created_at,
            last_active_at: inner.last_active_at,
        }
    }

    async fn emit(&self, sink: &dyn EventSink, inner: &mut Inner, mut event: Event) {
        inner.current_step += 1;
        event.session_id.get_or_insert(self.session_id);
        sink.emit(event).await;
    }
}

/// Fields read out of a session for state export. The caller (state manager integration) fills in the remaining
/// envelope fields (`memory_snapshot`, `tool_states`, `pending_confirmations`).
pub struct SessionSnapshotFields {
    pub agent_state: Value,
    pub current_step: u64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::mpsc::Sender;

    /// A tiny scriptable agent local to this module — `conduit-testkit`
    /// depends on this crate, so it can't be reused here.
    struct ScriptAgent {
        steps: VecDeque<StepRecord>,
        cancelled: bool,
    }

    impl ScriptAgent {
        fn new(steps: Vec<StepRecord>) -> Self {
            Self {
                steps: steps.into(),
                cancelled: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl Agent for ScriptAgent {
        async fn run(&mut self, _input: &str, out: Sender<StepRecord>) {
            while let Some(step) = self.steps.pop_front() {
                tokio::task::yield_now().await;
                if out.send(step).await.is_err() {
                    return;
                }
            }
        }

        async fn cancel(&mut self) {
            self.cancelled = true;
        }

        fn memory(&self) -> Value {
            json!({"cancelled": self.cancelled})
        }

        fn restore_memory(&mut self, _snapshot: Value) {}

        fn name(&self) -> &str {
            "script"
        }

        fn description(&self) -> &str {
            "test double"
        }
    }

    struct ScriptFactory(Vec<StepRecord>);

    impl AgentFactory for ScriptFactory {
        fn create(&self) -> Box<dyn Agent> {
            Box::new(ScriptAgent::new(self.0.clone()))
        }
    }

    /// An agent that blocks forever once started, for cancel tests.
    struct StuckAgent;

    #[async_trait::async_trait]
    impl Agent for StuckAgent {
        async fn run(&mut self, _input: &str, _out: Sender<StepRecord>) {
            std::future::pending::<()>().await;
        }
        async fn cancel(&mut self) {}
        fn memory(&self) -> Value {
            Value::Null
        }
        fn restore_memory(&mut self, _snapshot: Value) {}
        fn name(&self) -> &str {
            "stuck"
        }
        fn description(&self) -> &str {
            "never finishes"
        }
    }

    struct StuckFactory;

    impl AgentFactory for StuckFactory {
        fn create(&self) -> Box<dyn Agent> {
            Box::new(StuckAgent)
        }
    }

    fn cfg() -> SessionConfig {
        SessionConfig {
            confirmation_timeout: Duration::from_millis(100),
            send_llm_message: false,
            max_tool_loops: 25,
        }
    }

    #[tokio::test]
    async fn happy_path_emits_thinking_then_final() {
        let factory = ScriptFactory(vec![
                StepRecord::Thinking {
                    content: "hm".into(),
                },
                StepRecord::Final {
                    content: "hello".into(),
                    statistics: vec![json!({"input_tokens": 1})],
                },
        ]);
        let (handle, created) = SessionHandle::create(&factory, cfg(), None);
        assert_eq!(created.event, EventTag::AgentSessionCreated);

        let sink = conduit_testkit_local::CaptureSink::default();
        handle.run("hi", &sink).await.unwrap();

        let tags: Vec<_> = sink.events().into_iter().map(|e| e.event).collect();
        assert_eq!(
            tags,
            vec![EventTag::AgentThinking, EventTag::AgentFinalAnswer]
        );
    }

    #[tokio::test]
    async fn second_concurrent_run_is_rejected_as_busy() {
        let handle = Arc::new(SessionHandle::create(&StuckFactory, cfg(), None).0);
        let sink1 = conduit_testkit_local::CaptureSink::default();
        let h2 = Arc::clone(&handle);
        let running = tokio::spawn(async move {
                let sink = conduit_testkit_local::CaptureSink::default();
                let _ = h2.run("go", &sink).await;
        });
        // Give the first run a chance to take the lock.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = handle.run("again", &sink1).await.unwrap_err();
        assert!(matches!(err, Error::Busy));
        handle.cancel();
        running.abort();
    }

    #[tokio::test]
    async fn cancel_produces_interrupted_terminal_event() {
        let handle = Arc::new(SessionHandle::create(&StuckFactory, cfg(), None).0);
        let h2 = Arc::clone(&handle);
        let sink = conduit_testkit_local::CaptureSink::default();
        let sink2 = sink.clone();
        let task = tokio::spawn(async move {
                let _ = h2.run("go", &sink2).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        task.await.unwrap();
        assert_eq!(
            sink.events().last().unwrap().event,
            EventTag::AgentInterrupted
        );
    }

    #[tokio::test]
    async fn confirmation_allow_resumes_to_final() {
        let factory = ScriptFactory(vec![
                StepRecord::ToolCall {
                    step_id: "s1".into(),
                    tool_name: "fs_write".into(),
                    tool_description: "writes a file".into(),
                    arguments: Value::Null,
                    requires_confirmation: true,
                },
                StepRecord::ToolResult {
                    step_id: "s1".into(),
                    tool_name: "fs_write".into(),
                    content: json!({"ok": true}),
                    is_error: false,
                },
                StepRecord::Final {
                    content: "done".into(),
                    statistics: vec![],
                },
        ]);
        let handle = Arc::new(SessionHandle::create(&factory, cfg(), None).0);
        let h2 = Arc::clone(&handle);
        let sink = conduit_testkit_local::CaptureSink::default();
        let sink2 = sink.clone();
        let task = tokio::spawn(async move {
                h2.run("do it", &sink2).await.unwrap();
        });

        // Wait for the agent.user_confirm event, then respond.
        let step_id = loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Some(evt) = sink
            .events()
            .into_iter()
            .find(|e| e.event == EventTag::AgentUserConfirm)
            {
                break evt.step_id.unwrap();
            }
        };
        assert!(handle.respond(&step_id, true, None));
        task.await.unwrap();

        let tags: Vec<_> = sink.events().into_iter().map(|e| e.event).collect();
        assert!(tags.contains(&EventTag::AgentToolCall));
        assert!(tags.contains(&EventTag::AgentUserConfirm));
        assert_eq!(*tags.last().unwrap(), EventTag::AgentFinalAnswer);
    }

    #[tokio::test]
    async fn confirmation_deny_skips_tool_and_continues() {
        let factory = ScriptFactory(vec![
                StepRecord::ToolCall {
                    step_id: "s1".into(),
                    tool_name: "fs_write".into(),
                    tool_description: "writes a file".into(),
                    arguments: Value::Null,
                    requires_confirmation: true,
                },
                StepRecord::Final {
                    content: "done anyway".into(),
                    statistics: vec![],
                },
        ]);
        let handle = Arc::new(SessionHandle::create(&factory, cfg(), None).0);
        let h2 = Arc::clone(&handle);
        let sink = conduit_testkit_local::CaptureSink::default();
        let sink2 = sink.clone();
        let task = tokio::spawn(async move {
                h2.run("do it", &sink2).await.unwrap();
        });

        let step_id = loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Some(evt) = sink
            .events()
            .into_iter()
            .find(|e| e.event == EventTag::AgentUserConfirm)
            {
                break evt.step_id.unwrap();
            }
        };
        assert!(handle.respond(&step_id, false, None));
        task.await.unwrap();

        let tags: Vec<_> = sink.events().into_iter().map(|e| e.event).collect();
        // Denied tool result (`denied_by_user`) then the final answer — no
        // separate agent-emitted tool result for the skipped call.
        assert_eq!(
            tags.iter()
            .filter(|t| **t == EventTag::AgentToolResult)
            .count(),
            1
        );
        assert_eq!(*tags.last().unwrap(), EventTag::AgentFinalAnswer);
    }

    #[tokio::test]
    async fn deny_then_agents_own_tool_result_is_swallowed_not_duplicated() {
        // Mirrors a real Agent that has no way to learn the deny decision
        // mid-run and unconditionally emits its own `ToolResult` right
        // after the `ToolCall` (the demo `EchoAgent` behaves this way).
        let factory = ScriptFactory(vec![
                StepRecord::ToolCall {
                    step_id: "s1".into(),
                    tool_name: "fs_write".into(),
                    tool_description: "writes a file".into(),
                    arguments: Value::Null,
                    requires_confirmation: true,
                },
                StepRecord::ToolResult {
                    step_id: "s1".into(),
                    tool_name: "fs_write".into(),
                    content: json!({"ok": true}),
                    is_error: false,
                },
                StepRecord::Final {
                    content: "done anyway".into(),
                    statistics: vec![],
                },
        ]);
        let handle = Arc::new(SessionHandle::create(&factory, cfg(), None).0);
        let h2 = Arc::clone(&handle);
        let sink = conduit_testkit_local::CaptureSink::default();
        let sink2 = sink.clone();
        let task = tokio::spawn(async move {
                h2.run("do it", &sink2).await.unwrap();
        });

        let step_id = loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Some(evt) = sink
            .events()
            .into_iter()
            .find(|e| e.event == EventTag::AgentUserConfirm)
            {
                break evt.step_id.unwrap();
            }
        };
        assert!(handle.respond(&step_id, false, None));
        task.await.unwrap();

        let tags: Vec<_> = sink.events().into_iter().map(|e| e.event).collect();
        // Only the synthetic denial result is emitted — the agent's own
        // (already-buffered) real `ToolResult` for the same step never
        // surfaces as a second `agent.tool_result`.
        assert_eq!(
            tags.iter()
            .filter(|t| **t == EventTag::AgentToolResult)
            .count(),
            1
        );
        let denial = sink
        .events()
        .into_iter()
        .find(|e| e.event == EventTag::AgentToolResult)
        .unwrap();
        assert_eq!(denial.content, json!({"denied_by_user": true}));
        assert_eq!(*tags.last().unwrap(), EventTag::AgentFinalAnswer);
    }

    #[tokio::test]
    async fn confirmation_timeout_produces_agent_error() {
        let factory = ScriptFactory(vec![StepRecord::ToolCall {
                    step_id: "s1".into(),
                    tool_name: "fs_write".into(),
                    tool_description: "writes a file".into(),
                    arguments: Value::Null,
                    requires_confirmation: true,
        }]);
        let mut c = cfg();
        c.confirmation_timeout = Duration::from_millis(30);
        let handle = SessionHandle::create(&factory, c, None).0;
        let sink = conduit_testkit_local::CaptureSink::default();
        handle.run("do it", &sink).await.unwrap();

        let last = sink.events().last().unwrap().clone();
        assert_eq!(last.event, EventTag::AgentError);
        assert_eq!(
            last.metadata.get("error_kind").and_then(|v| v.as_str()),
            Some("confirmation_timeout")
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_emits_session_end_once() {
        let factory = ScriptFactory(vec![]);
        let handle = SessionHandle::create(&factory, cfg(), None).0;
        let sink = conduit_testkit_local::CaptureSink::default();
        handle.close(&sink).await;
        handle.close(&sink).await;
        let ends = sink
        .events()
        .into_iter()
        .filter(|e| e.event == EventTag::AgentSessionEnd)
        .count();
        assert_eq!(ends, 1);
    }

    // Minimal local capture sink, avoiding a dependency on conduit-testkit
    // (which depends on this crate).
    mod conduit_testkit_local {
        use super::*;

        #[derive(Default, Clone)]
        pub struct CaptureSink {
            events: Arc<parking_lot::Mutex<Vec<Event>>>,
        }

        impl CaptureSink {
            pub fn events(&self) -> Vec<Event> {
                self.events.lock().clone()
            }
        }

        #[async_trait::async_trait]
        impl EventSink for CaptureSink {
            async fn emit(&self, event: Event) {
                self.events.lock().push(event);
            }
        }
    }
}
