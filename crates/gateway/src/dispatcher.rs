use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_connection::EventDispatcher;
use conduit_domain::trace::TraceEvent;
use conduit_domain::{Config, Error};
use conduit_outbound::OutboundChannel;
use conduit_planner::{coerce_tasks, Pipeline, PipelineConfig};
use conduit_protocol::{Event, EventTag};
use conduit_session::{AgentFactory, EventSink, SessionConfig, SessionHandle};
use conduit_state::{SignedEnvelope, SnapshotState, StateManager};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Everything the dispatcher tracks about one live session: the running
/// engine, its plan-solve pipeline (created lazily, on first use), and
/// which connection currently owns its output.
struct SessionEntry {
    handle: Arc<SessionHandle>,
    pipeline: Mutex<Option<Arc<Pipeline>>>,
    connection_id: Mutex<String>,
    outbound: Mutex<Arc<OutboundChannel>>,
    /// Events salvaged from the disconnected connection's outbound
    /// history while waiting out the reconnect grace window.
    detached_history: Mutex<Vec<Event>>,
    detach_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Bridges a [`SessionHandle`] or [`Pipeline`]'s event output onto
/// whichever connection is currently bound to the session — the same
/// wiring `conduit-testkit`'s `OutboundEventSink` exercises in scenario
/// tests, just re-bindable across a reconnect.
struct BoundSink {
    entry: Arc<SessionEntry>,
}

#[async_trait]
impl EventSink for BoundSink {
    async fn emit(&self, event: Event) {
        let outbound = self.entry.outbound.lock().clone();
        let _ = outbound.enqueue(event).await;
    }
}

/// The production [`EventDispatcher`]: owns every live session, routes
/// inbound wire events to the session engine or the plan-solve pipeline,
/// and manages reconnect/detach lifecycle.
pub struct GatewayDispatcher {
    sessions: Arc<Mutex<HashMap<Uuid, Arc<SessionEntry>>>>,
    agent_factory: Arc<dyn AgentFactory>,
    planner_factory: Arc<dyn AgentFactory>,
    solver_factory: Arc<dyn AgentFactory>,
    aggregator_factory: Option<Arc<dyn AgentFactory>>,
    state_manager: Arc<StateManager>,
    session_cfg: SessionConfig,
    pipeline_cfg: PipelineConfig,
    reconnect_grace: Duration,
    replay_cap: usize,
    max_memory_snapshot_messages: usize,
}

impl GatewayDispatcher {
    pub fn new(
        agent_factory: Arc<dyn AgentFactory>,
        planner_factory: Arc<dyn AgentFactory>,
        solver_factory: Arc<dyn AgentFactory>,
        aggregator_factory: Option<Arc<dyn AgentFactory>>,
        state_manager: Arc<StateManager>,
        config: &Config,
    ) -> Self {
        let plan_solve = config.plan_solve.clamped();
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            agent_factory,
            planner_factory,
            solver_factory,
            aggregator_factory,
            state_manager,
            session_cfg: SessionConfig {
                confirmation_timeout: Duration::from_secs(config.session.confirmation_timeout_s),
                send_llm_message: config.session.send_llm_message,
                max_tool_loops: config.session.max_tool_loops,
            },
            pipeline_cfg: PipelineConfig {
                max_concurrent_tasks: plan_solve.max_concurrent_tasks,
                plan_confirmation_required: plan_solve.plan_confirmation_required,
                plan_confirmation_timeout: Duration::from_secs(
                    plan_solve.plan_confirmation_timeout_s,
                ),
            },
            reconnect_grace: Duration::from_secs(config.connection.reconnect_grace_s.max(1)),
            replay_cap: config.outbound.replay_cap,
            max_memory_snapshot_messages: config.state.max_memory_snapshot_messages,
        }
    }

    fn lookup(&self, session_id: Uuid) -> Option<Arc<SessionEntry>> {
        self.sessions.lock().get(&session_id).cloned()
    }

    fn ensure_pipeline(&self, entry: &Arc<SessionEntry>) -> Arc<Pipeline> {
        let mut guard = entry.pipeline.lock();
        if let Some(p) = guard.as_ref() {
            return p.clone();
        }
        let sink: Arc<dyn EventSink> = Arc::new(BoundSink {
                entry: entry.clone(),
        });
        let pipeline = Pipeline::new(
            entry.handle.session_id,
            self.pipeline_cfg.clone(),
            sink,
            self.planner_factory.clone(),
            self.solver_factory.clone(),
            self.aggregator_factory.clone(),
        );
        *guard = Some(pipeline.clone());
        pipeline
    }

    fn cancel_detach_timer(&self, entry: &SessionEntry) {
        if let Some(timer) = entry.detach_timer.lock().take() {
            timer.abort();
        }
    }

    async fn handle_create_session(&self, connection_id: &str, outbound: Arc<OutboundChannel>) {
        let (handle, created) = SessionHandle::create(&*self.agent_factory, self.session_cfg.clone(), None);
        let handle = Arc::new(handle);
        let entry = Arc::new(SessionEntry {
                handle: handle.clone(),
                pipeline: Mutex::new(None),
                connection_id: Mutex::new(connection_id.to_string()),
                outbound: Mutex::new(outbound.clone()),
                detached_history: Mutex::new(Vec::new()),
                detach_timer: Mutex::new(None),
        });
        self.sessions.lock().insert(handle.session_id, entry);
        TraceEvent::SessionCreated {
            session_id: handle.session_id.to_string(),
            connection_id: connection_id.to_string(),
        }
        .emit();
        let _ = outbound.enqueue(created).await;
    }

    async fn handle_message(&self, connection_id: &str, outbound: Arc<OutboundChannel>, evt: Event) {
        let session_id = match evt.session_id {
            Some(id) => id,
            None => return,
        };
        let entry = match self.lookup(session_id) {
            Some(e) => e,
            None => {
                let _ = outbound
                .enqueue(system_error(connection_id, "bad_session", "unknown session_id"))
                .await;
                return;
            }
        };
        self.rebind(&entry, connection_id, &outbound);

        let is_plan_solve = evt.content.get("mode").and_then(|v| v.as_str()) == Some("plan_solve");
        if is_plan_solve {
            let question = evt
            .content
            .get("question")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
            TraceEvent::PipelineStarted {
                session_id: session_id.to_string(),
                question_chars: question.chars().count(),
            }
            .emit();
            let pipeline = self.ensure_pipeline(&entry);
            tokio::spawn(async move {
                    pipeline.start(question).await;
            });
            return;
        }

        let input = match &evt.content {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let sink = Arc::new(BoundSink {
                entry: entry.clone(),
        });
        let handle = entry.handle.clone();
        tokio::spawn(async move {
                if let Err(e) = handle.run(&input, sink.as_ref()).await {
                    sink.emit(agent_error(handle.session_id, &e)).await;
                }
        });
    }

    fn rebind(&self, entry: &Arc<SessionEntry>, connection_id: &str, outbound: &Arc<OutboundChannel>) {
        let old_connection_id = std::mem::replace(&mut *entry.connection_id.lock(), connection_id.to_string());
        *entry.outbound.lock() = outbound.clone();
        self.cancel_detach_timer(entry);
        if old_connection_id != connection_id {
            TraceEvent::SessionRebound {
                session_id: entry.handle.session_id.to_string(),
                old_connection_id,
                new_connection_id: connection_id.to_string(),
            }
            .emit();
        }
    }

    async fn handle_response(&self, connection_id: &str, outbound: Arc<OutboundChannel>, evt: Event) {
        let session_id = match evt.session_id {
            Some(id) => id,
            None => return,
        };
        let entry = match self.lookup(session_id) {
            Some(e) => e,
            None => {
                let _ = outbound
                .enqueue(system_error(connection_id, "bad_session", "unknown session_id"))
                .await;
                return;
            }
        };
        self.rebind(&entry, connection_id, &outbound);

        let step_id = evt.step_id.clone().unwrap_or_default();
        let confirmed = evt.content.get("confirmed").and_then(|v| v.as_bool()).unwrap_or(false);
        let tasks = evt.content.get("tasks").cloned();

        let pipeline = entry.pipeline.lock().clone();
        let handled = match pipeline {
            Some(p) if step_id == p.confirmation_step_id() => p.respond(&step_id, confirmed, tasks),
            _ => entry.handle.respond(&step_id, confirmed, tasks),
        };
        if !handled {
            let _ = outbound
            .enqueue(system_error(connection_id, "bad_session", "unknown step_id"))
            .await;
        }
    }

    async fn handle_cancel(&self, evt: Event) {
        let Some(session_id) = evt.session_id else { return };
        let Some(entry) = self.lookup(session_id) else { return };
        if let Some(p) = entry.pipeline.lock().clone() {
            tokio::spawn(async move {
                    p.cancel_all().await;
            });
        }
        entry.handle.cancel();
    }

    async fn handle_reconnect(&self, connection_id: &str, outbound: Arc<OutboundChannel>, evt: Event) {
        let Some(target) = evt
        .content
        .get("session_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        else {
            let _ = outbound
            .enqueue(system_error(connection_id, "bad_session", "reconnect requires session_id"))
            .await;
            return;
        };
        let Some(entry) = self.lookup(target) else {
            let _ = outbound
            .enqueue(system_error(connection_id, "bad_session", "no such session"))
            .await;
            return;
        };
        self.rebind(&entry, connection_id, &outbound);

        let from_seq = reconnect_checkpoint(&evt.content);
        self.replay_detached(&entry, &outbound, from_seq).await;
    }

    async fn handle_reconnect_with_state(&self, connection_id: &str, outbound: Arc<OutboundChannel>, evt: Event) {
        let Some(envelope_value) = evt.content.get("envelope").cloned() else {
            let _ = outbound
            .enqueue(system_error(connection_id, "bad_session", "reconnect_with_state requires envelope"))
            .await;
            return;
        };
        let envelope: SignedEnvelope = match serde_json::from_value(envelope_value) {
            Ok(e) => e,
            Err(_) => {
                let _ = outbound
                .enqueue(system_error(connection_id, "invalid_frame", "malformed state envelope"))
                .await;
                return;
            }
        };
        let restored = match self.state_manager.restore(&envelope) {
            Ok(s) => s,
            Err(e) => {
                TraceEvent::StateRejected {
                    reason: e.to_string(),
                }
                .emit();
                let _ = outbound
                .enqueue(system_error(connection_id, e.kind().as_str(), &e.to_string()))
                .await;
                return;
            }
        };
        let previous_session_id = restored.session_id;

        let (new_handle, created) = SessionHandle::create(&*self.agent_factory, self.session_cfg.clone(), None);
        let new_handle = Arc::new(new_handle);
        new_handle
        .restore_from_snapshot(
            restored.agent_state.clone(),
            restored.current_step,
            restored.created_at,
            restored.last_active_at,
        )
        .await;

        let entry = Arc::new(SessionEntry {
                handle: new_handle.clone(),
                pipeline: Mutex::new(None),
                connection_id: Mutex::new(connection_id.to_string()),
                outbound: Mutex::new(outbound.clone()),
                detached_history: Mutex::new(Vec::new()),
                detach_timer: Mutex::new(None),
        });

        let stash = {
            let mut sessions = self.sessions.lock();
            sessions.insert(new_handle.session_id, entry.clone());
            match sessions.remove(&previous_session_id) {
                Some(old_entry) => {
                    self.cancel_detach_timer(&old_entry);
                    old_entry.detached_history.lock().clone()
                }
                None => Vec::new(),
            }
        };

        TraceEvent::StateRestored {
            previous_session_id: previous_session_id.to_string(),
            new_session_id: new_handle.session_id.to_string(),
        }
        .emit();
        let _ = outbound.enqueue(created).await;
        let restored_evt = Event::new(EventTag::AgentStateRestored)
        .with_session(new_handle.session_id)
        .with_metadata("previous_session_id", previous_session_id.to_string());
        let _ = outbound.enqueue(restored_evt).await;

        let from_seq = reconnect_checkpoint(&evt.content);
        *entry.detached_history.lock() = stash;
        self.replay_detached(&entry, &outbound, from_seq).await;
    }

    async fn replay_detached(&self, entry: &Arc<SessionEntry>, outbound: &Arc<OutboundChannel>, from_seq: u64) {
        let stash = entry.detached_history.lock().clone();
        if stash.is_empty() {
            if from_seq > 0 {
                let notice = Event::new(EventTag::SystemNotice)
                .with_session(entry.handle.session_id)
                .with_metadata("recovery", "no_history");
                let _ = outbound.enqueue(notice).await;
            }
            return;
        }
        let (events, truncated) = replay_from_stash(&stash, from_seq, self.replay_cap);
        TraceEvent::ReplayPerformed {
            connection_id: entry.connection_id.lock().clone(),
            from_seq,
            events_replayed: events.len(),
            truncated,
        }
        .emit();
        for event in events {
            let _ = outbound.enqueue(event).await;
        }
        if truncated {
            let notice = Event::new(EventTag::SystemNotice)
            .with_session(entry.handle.session_id)
            .with_metadata("recovery", "truncated");
            let _ = outbound.enqueue(notice).await;
        }
    }

    async fn handle_request_state(&self, connection_id: &str, outbound: Arc<OutboundChannel>, evt: Event) {
        let session_id = evt.session_id.or_else(|| {
                evt.content
                .get("session_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
        });
        let Some(session_id) = session_id else {
            let _ = outbound
            .enqueue(system_error(connection_id, "bad_session", "request_state requires session_id"))
            .await;
            return;
        };
        let Some(entry) = self.lookup(session_id) else {
            let _ = outbound
            .enqueue(system_error(connection_id, "bad_session", "unknown session_id"))
            .await;
            return;
        };
        self.rebind(&entry, connection_id, &outbound);

        let fields = entry.handle.export_fields().await;
        let memory_snapshot = match &fields.agent_state {
            Value::Array(items) => {
                let keep = self.max_memory_snapshot_messages.min(items.len());
                items[items.len() - keep..].to_vec()
            }
            _ => Vec::new(),
        };
        let snapshot = SnapshotState {
            session_id,
            current_step: fields.current_step,
            agent_state: fields.agent_state,
            created_at: fields.created_at,
            last_active_at: fields.last_active_at,
            memory_snapshot,
            tool_states: Value::Null,
            pending_confirmations: Vec::new(),
            metadata: Map::new(),
        };
        let envelope = self.state_manager.export(snapshot);
        TraceEvent::StateExported {
            session_id: session_id.to_string(),
            state_bytes: serde_json::to_vec(&envelope).map(|v| v.len()).unwrap_or(0),
        }
        .emit();
        let evt_out = Event::new(EventTag::AgentStateExported)
        .with_session(session_id)
        .with_content(serde_json::to_value(&envelope).unwrap_or(Value::Null));
        let _ = outbound.enqueue(evt_out).await;
    }

    async fn handle_solve_tasks(&self, connection_id: &str, outbound: Arc<OutboundChannel>, evt: Event) {
        let Some(session_id) = evt.session_id else { return };
        let Some(entry) = self.lookup(session_id) else {
            let _ = outbound
            .enqueue(system_error(connection_id, "bad_session", "unknown session_id"))
            .await;
            return;
        };
        self.rebind(&entry, connection_id, &outbound);

        let raw = evt.content.get("tasks").cloned().unwrap_or(Value::Null);
        let tasks = match coerce_tasks(&raw) {
            Ok(t) => t,
            Err(e) => {
                let err = Event::new(EventTag::PlanCoercionError)
                .with_session(session_id)
                .with_content(e.to_string());
                let _ = outbound.enqueue(err).await;
                return;
            }
        };
        TraceEvent::PipelineStarted {
            session_id: session_id.to_string(),
            question_chars: 0,
        }
        .emit();
        let pipeline = self.ensure_pipeline(&entry);
        tokio::spawn(async move {
                pipeline.solve_tasks(tasks).await;
        });
    }

    async fn handle_cancel_task(&self, evt: Event) {
        let Some(session_id) = evt.session_id else { return };
        let Some(entry) = self.lookup(session_id) else { return };
        let Some(task_id) = evt.content.get("task_id").and_then(|v| v.as_str()).map(str::to_string) else {
            return;
        };
        if let Some(p) = entry.pipeline.lock().clone() {
            p.cancel_task(&task_id).await;
        }
    }

    async fn handle_restart_task(&self, evt: Event) {
        let Some(session_id) = evt.session_id else { return };
        let Some(entry) = self.lookup(session_id) else { return };
        let Some(task_id) = evt.content.get("task_id").and_then(|v| v.as_str()).map(str::to_string) else {
            return;
        };
        if let Some(p) = entry.pipeline.lock().clone() {
            tokio::spawn(async move {
                    p.restart_task(&task_id).await;
            });
        }
    }

    async fn handle_cancel_plan(&self, evt: Event) {
        let Some(session_id) = evt.session_id else { return };
        let Some(entry) = self.lookup(session_id) else { return };
        if let Some(p) = entry.pipeline.lock().clone() {
            p.cancel_plan().await;
        }
    }

    async fn handle_replan(&self, evt: Event) {
        let Some(session_id) = evt.session_id else { return };
        let Some(entry) = self.lookup(session_id) else { return };
        let question = evt.content.get("question").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        if let Some(p) = entry.pipeline.lock().clone() {
            tokio::spawn(async move {
                    p.replan(question).await;
            });
        }
    }
}

#[async_trait]
impl EventDispatcher for GatewayDispatcher {
    async fn dispatch(&self, connection_id: &str, outbound: Arc<OutboundChannel>, evt: Event) {
        match evt.event {
            EventTag::UserCreateSession => self.handle_create_session(connection_id, outbound).await,
            EventTag::UserMessage => self.handle_message(connection_id, outbound, evt).await,
            EventTag::UserResponse => self.handle_response(connection_id, outbound, evt).await,
            EventTag::UserCancel => self.handle_cancel(evt).await,
            EventTag::UserReconnect => self.handle_reconnect(connection_id, outbound, evt).await,
            EventTag::UserReconnectWithState => {
                self.handle_reconnect_with_state(connection_id, outbound, evt).await
            }
            EventTag::UserRequestState => self.handle_request_state(connection_id, outbound, evt).await,
            EventTag::UserSolveTasks => self.handle_solve_tasks(connection_id, outbound, evt).await,
            EventTag::UserCancelTask => self.handle_cancel_task(evt).await,
            EventTag::UserRestartTask => self.handle_restart_task(evt).await,
            EventTag::UserCancelPlan => self.handle_cancel_plan(evt).await,
            EventTag::UserReplan => self.handle_replan(evt).await,
            // user.ack is intercepted by the connection manager and never
            // reaches the dispatcher; anything else here is not
            // client-originated and is rejected by `check_inbound` first.
            _ => {}
        }
    }

    async fn on_disconnect(&self, connection_id: &str) {
        let entry = {
            let sessions = self.sessions.lock();
            sessions
            .values()
            .find(|e| *e.connection_id.lock() == connection_id)
            .cloned()
        };
        let Some(entry) = entry else { return };

        let (stash, _truncated) = entry.outbound.lock().replay(0, usize::MAX);
        *entry.detached_history.lock() = stash;

        let sessions_map = self.sessions.clone();
        let session_id = entry.handle.session_id;
        let stale_connection_id = connection_id.to_string();
        let grace = self.reconnect_grace;
        let timer = tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let maybe_entry = {
                    let map = sessions_map.lock();
                    map.get(&session_id).cloned()
                };
                if let Some(e) = maybe_entry {
                    if *e.connection_id.lock() == stale_connection_id {
                        e.handle.close(&DiscardSink).await;
                        sessions_map.lock().remove(&session_id);
                    }
                }
        });
        *entry.detach_timer.lock() = Some(timer);
    }

    fn active_session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// A sink for terminal events with nowhere left to go — the connection
/// that would have received them is long gone by the time the reconnect
/// grace window expires.
struct DiscardSink;

#[async_trait]
impl EventSink for DiscardSink {
    async fn emit(&self, _event: Event) {}
}

fn reconnect_checkpoint(content: &Value) -> u64 {
    if let Some(seq) = content.get("last_seq").and_then(|v| v.as_u64()) {
        return seq;
    }
    content
    .get("last_event_id")
    .and_then(|v| v.as_str())
    .and_then(|id| id.rsplit('-').next())
    .and_then(|s| s.parse().ok())
    .unwrap_or(0)
}

fn replay_from_stash(stash: &[Event], from_seq: u64, cap: usize) -> (Vec<Event>, bool) {
    let matching: Vec<Event> = stash
    .iter()
    .filter(|e| e.seq.is_some_and(|s| s > from_seq))
    .cloned()
    .collect();
    let truncated = matching.len() > cap;
    (matching.into_iter().take(cap).collect(), truncated)
}

fn system_error(connection_id: &str, kind: &str, message: &str) -> Event {
    Event::new(EventTag::SystemError)
    .with_metadata("error_kind", kind)
    .with_metadata("connection_id", connection_id.to_string())
    .with_content(message)
}

fn agent_error(session_id: Uuid, e: &Error) -> Event {
    Event::new(EventTag::AgentError)
    .with_session(session_id)
    .with_metadata("error_kind", e.kind().as_str())
    .with_content(e.to_string())
}
