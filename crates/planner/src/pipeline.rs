use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conduit_domain::trace::TraceEvent;
use conduit_protocol::{Event, EventTag};
use conduit_session::{AgentFactory, CancelMap, ConfirmationGate, ConfirmationResponse, EventSink};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use crate::roles::{describe, drive_agent, tag_statistics, PhaseOutcome};
use crate::task::{coerce_tasks, parse_plan_output, PlanTask, TaskRecord, TaskState};

/// Tuning knobs for one pipeline run, lifted out of
/// `conduit_domain::config::PlanSolveConfig` by the caller so this crate
/// doesn't carry a `serde`/`toml` dependency of its own.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_concurrent_tasks: usize,
    pub plan_confirmation_required: bool,
    pub plan_confirmation_timeout: Duration,
}

/// Where the pipeline currently is. There is no separate "failed"
/// terminal distinct from `Done` at the wire level — `Failed` exists here
/// only so a caller inspecting the pipeline mid-flight can tell a clean
/// finish from an aborted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Planning,
    ConfirmingPlan,
    Solving,
    Aggregating,
    Done,
    Cancelled,
    Failed,
}

const PLAN_KEY: &str = "plan";

fn confirm_step_id(session_id: Uuid) -> String {
    format!("confirm_plan_{session_id}")
}

/// Drives one plan→solve→aggregate run end to end. Reuses
/// `conduit_session`'s `CancelMap`/`ConfirmationGate` rather than
/// inventing parallel machinery — a pipeline task is, to the rest of the
/// system, just another agent-driven sub-session.
pub struct Pipeline {
    session_id: Uuid,
    cfg: PipelineConfig,
    planner_factory: Arc<dyn AgentFactory>,
    solver_factory: Arc<dyn AgentFactory>,
    aggregator_factory: Option<Arc<dyn AgentFactory>>,
    sink: Arc<dyn EventSink>,

    state: Mutex<PipelineState>,
    tasks: Mutex<HashMap<String, TaskRecord>>,
    task_order: Mutex<Vec<String>>,
    running: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    statistics: Mutex<Vec<Value>>,
    plan_summary: Mutex<String>,

    cancel_map: Arc<CancelMap>,
    plan_confirm: ConfirmationGate,
    semaphore: Arc<Semaphore>,
    task_state_changed: Notify,
}

impl Pipeline {
    pub fn new(
        session_id: Uuid,
        cfg: PipelineConfig,
        sink: Arc<dyn EventSink>,
        planner_factory: Arc<dyn AgentFactory>,
        solver_factory: Arc<dyn AgentFactory>,
        aggregator_factory: Option<Arc<dyn AgentFactory>>,
    ) -> Arc<Self> {
        let permits = cfg.max_concurrent_tasks.clamp(1, 20);
        Arc::new(Self {
                session_id,
                cfg,
                planner_factory,
                solver_factory,
                aggregator_factory,
                sink,
                state: Mutex::new(PipelineState::Planning),
                tasks: Mutex::new(HashMap::new()),
                task_order: Mutex::new(Vec::new()),
                running: Mutex::new(HashMap::new()),
                statistics: Mutex::new(Vec::new()),
                plan_summary: Mutex::new(String::new()),
                cancel_map: Arc::new(CancelMap::new()),
                plan_confirm: ConfirmationGate::new(Duration::from_secs(0)),
                semaphore: Arc::new(Semaphore::new(permits)),
                task_state_changed: Notify::new(),
        })
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    fn set_state(&self, s: PipelineState) {
        *self.state.lock() = s;
    }

    async fn emit(&self, event: Event) {
        self.sink.emit(event.with_session(self.session_id)).await;
    }

    fn push_statistics(&self, entries: Vec<Value>) {
        self.statistics.lock().extend(entries);
    }

    fn trace_completed(&self, outcome: &str) {
        TraceEvent::PipelineCompleted {
            session_id: self.session_id.to_string(),
            task_count: self.task_order.lock().len(),
            outcome: outcome.into(),
        }
        .emit();
    }

    // -- planning -----------------------------------------------------

    pub async fn start(self: &Arc<Self>, question: String) {
        self.set_state(PipelineState::Planning);
        self.emit(Event::new(EventTag::PlanStart).with_content(question.clone())).await;

        let token = self.cancel_map.register(PLAN_KEY);
        let mut agent = self.planner_factory.create();
        let outcome = drive_agent(agent.as_mut(), &question, &token).await;
        self.cancel_map.remove(PLAN_KEY);

        match outcome {
            PhaseOutcome::Cancelled => {
                self.emit(Event::new(EventTag::PlanCancelled)).await;
                self.set_state(PipelineState::Cancelled);
                self.trace_completed("plan_cancelled");
            }
            PhaseOutcome::Error(message) => {
                self.fail_plan(message).await;
            }
            PhaseOutcome::Final { content, statistics } => match parse_plan_output(&content) {
                Err(e) => self.fail_plan(e.to_string()).await,
                Ok(plan) => {
                    let tagged_statistics = tag_statistics(statistics, "plan", agent.name());
                    self.push_statistics(tagged_statistics.clone());
                    *self.plan_summary.lock() = plan.plan_summary.clone();
                    self.install_tasks(plan.tasks.clone());

                    let tasks_json: Vec<Value> = plan
                    .tasks
                    .iter()
                    .map(|t| serde_json::json!({"id": t.id, "description": t.description}))
                    .collect();
                    self.emit(
                        Event::new(EventTag::PlanCompleted)
                        .with_metadata("tasks", Value::Array(tasks_json))
                        .with_metadata("plan_summary", plan.plan_summary.clone())
                        .with_metadata("statistics", Value::Array(tagged_statistics)),
                    )
                    .await;

                    if self.cfg.plan_confirmation_required {
                        self.await_plan_confirmation().await;
                    } else {
                        self.enter_solving().await;
                    }
                }
            },
        }
    }

    async fn fail_plan(self: &Arc<Self>, message: String) {
        self.emit(
            Event::new(EventTag::AgentError)
            .with_content(message)
            .with_metadata("kind", "plan_failed"),
        )
        .await;
        self.set_state(PipelineState::Failed);
        self.trace_completed("plan_failed");
    }

    fn install_tasks(&self, plan_tasks: Vec<PlanTask>) {
        let mut tasks = self.tasks.lock();
        let mut order = self.task_order.lock();
        tasks.clear();
        order.clear();
        for t in plan_tasks {
            order.push(t.id.clone());
            tasks.insert(t.id.clone(), TaskRecord::pending(t));
        }
    }

    async fn await_plan_confirmation(self: &Arc<Self>) {
        self.set_state(PipelineState::ConfirmingPlan);
        let step_id = confirm_step_id(self.session_id);
        let rx = self.plan_confirm.wait(step_id.clone());

        let tasks_json: Vec<Value> = self
        .task_order
        .lock()
        .iter()
        .filter_map(|id| self.tasks.lock().get(id).map(|r| r.task.clone()))
        .map(|t| serde_json::json!({"id": t.id, "description": t.description}))
        .collect();
        self.emit(
            Event::new(EventTag::AgentUserConfirm)
            .with_step(step_id.clone())
            .with_metadata("scope", "plan")
            .with_metadata("tasks", Value::Array(tasks_json))
            .with_metadata("plan_summary", self.plan_summary.lock().clone()),
        )
        .await;

        let resolved = tokio::time::timeout(self.cfg.plan_confirmation_timeout, rx).await;
        self.plan_confirm.cancel(&step_id);

        match resolved {
            Err(_elapsed) => self.deny_plan("plan confirmation timed out").await,
            Ok(Err(_closed)) => {
                self.emit(Event::new(EventTag::PlanCancelled)).await;
                self.set_state(PipelineState::Cancelled);
            }
            Ok(Ok(ConfirmationResponse { confirmed: false, .. })) => {
                self.deny_plan("plan declined by client").await;
            }
            Ok(Ok(ConfirmationResponse { confirmed: true, tasks: Some(raw) })) => {
                match coerce_tasks(&raw) {
                    Err(e) => {
                        self.emit(
                            Event::new(EventTag::PlanCoercionError).with_content(e.to_string()),
                        )
                        .await;
                        self.set_state(PipelineState::Failed);
                    }
                    Ok(overridden) => {
                        self.install_tasks(overridden);
                        self.enter_solving().await;
                    }
                }
            }
            Ok(Ok(ConfirmationResponse { confirmed: true, tasks: None })) => {
                self.enter_solving().await;
            }
        }
    }

    async fn deny_plan(self: &Arc<Self>, reason: &str) {
        self.emit(
            Event::new(EventTag::AgentFinalAnswer).with_content(reason.to_string()),
        )
        .await;
        self.set_state(PipelineState::Done);
        self.trace_completed("plan_denied");
    }

    // -- solving --------------------------------------------------------

    async fn enter_solving(self: &Arc<Self>) {
        self.set_state(PipelineState::Solving);
        let ids: Vec<String> = self.task_order.lock().clone();
        for id in ids {
            self.spawn_task(id);
        }
        self.wait_for_all_terminal().await;

        if self.all_cancelled() {
            self.emit(
                Event::new(EventTag::SystemNotice)
                .with_metadata("reason", "all_tasks_cancelled"),
            )
            .await;
            self.set_state(PipelineState::Done);
            self.trace_completed("all_tasks_cancelled");
            return;
        }

        self.run_aggregation().await;
    }

    fn all_cancelled(&self) -> bool {
        let tasks = self.tasks.lock();
        !tasks.is_empty() && tasks.values().all(|t| t.state == TaskState::Cancelled)
    }

    fn all_terminal(&self) -> bool {
        self.tasks
        .lock()
        .values()
        .all(|t| matches!(t.state, TaskState::Completed | TaskState::Cancelled))
    }

    async fn wait_for_all_terminal(self: &Arc<Self>) {
        loop {
            let notified = self.task_state_changed.notified();
            if self.all_terminal() {
                return;
            }
            notified.await;
        }
    }

    /// Spawn (or respawn, for `restart_task`) the solver run for one task,
    /// bounded by the shared fan-out semaphore.
    fn spawn_task(self: &Arc<Self>, task_id: String) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
                let permit = this.semaphore.clone().acquire_owned().await;
                {
                    let mut tasks = this.tasks.lock();
                    if let Some(rec) = tasks.get_mut(&task_id) {
                        rec.state = TaskState::Running;
                    }
                }
                TraceEvent::PipelineTaskTransition {
                    session_id: this.session_id.to_string(),
                    task_id: task_id.clone(),
                    from: "pending".into(),
                    to: "running".into(),
                }
                .emit();
                let token = this.cancel_map.register(&task_id);
                this.cancel_map.add_to_group("pipeline", &task_id);

                let task = this
                .tasks
                .lock()
                .get(&task_id)
                .map(|r| r.task.clone())
                .unwrap_or_else(|| PlanTask { id: task_id.clone(), description: Value::Null });
                let task_json = serde_json::json!({"id": task.id, "description": task.description});
                let input = describe(&task.description);

                this.emit(Event::new(EventTag::SolverStart).with_metadata("task", task_json.clone()))
                .await;

                let mut agent = this.solver_factory.create();
                let outcome = drive_agent(agent.as_mut(), &input, &token).await;

                this.cancel_map.remove(&task_id);
                this.cancel_map.remove_from_group("pipeline", &task_id);
                drop(permit);

                match outcome {
                    PhaseOutcome::Cancelled => {
                        let mut tasks = this.tasks.lock();
                        if let Some(rec) = tasks.get_mut(&task_id) {
                            rec.state = TaskState::Cancelled;
                        }
                        drop(tasks);
                        TraceEvent::PipelineTaskTransition {
                            session_id: this.session_id.to_string(),
                            task_id: task_id.clone(),
                            from: "running".into(),
                            to: "cancelled".into(),
                        }
                        .emit();
                        this.emit(
                            Event::new(EventTag::SolverCancelled)
                            .with_metadata("task_id", task_id.clone()),
                        )
                        .await;
                    }
                    PhaseOutcome::Error(message) => {
                        let result = serde_json::json!({"error": message});
                        let mut tasks = this.tasks.lock();
                        if let Some(rec) = tasks.get_mut(&task_id) {
                            rec.state = TaskState::Completed;
                            rec.result = Some(result.clone());
                        }
                        drop(tasks);
                        TraceEvent::PipelineTaskTransition {
                            session_id: this.session_id.to_string(),
                            task_id: task_id.clone(),
                            from: "running".into(),
                            to: "completed_error".into(),
                        }
                        .emit();
                        this.emit(
                            Event::new(EventTag::SolverCompleted)
                            .with_metadata("task", task_json.clone())
                            .with_metadata("result", result),
                        )
                        .await;
                    }
                    PhaseOutcome::Final { content, statistics } => {
                        let result = serde_json::json!({"content": content});
                        let tagged_statistics = tag_statistics(statistics, "solver", agent.name());
                        this.push_statistics(tagged_statistics.clone());
                        let mut tasks = this.tasks.lock();
                        if let Some(rec) = tasks.get_mut(&task_id) {
                            rec.state = TaskState::Completed;
                            rec.result = Some(result.clone());
                            rec.statistics = tagged_statistics.clone();
                        }
                        drop(tasks);
                        TraceEvent::PipelineTaskTransition {
                            session_id: this.session_id.to_string(),
                            task_id: task_id.clone(),
                            from: "running".into(),
                            to: "completed".into(),
                        }
                        .emit();
                        this.emit(
                            Event::new(EventTag::SolverCompleted)
                            .with_metadata("task", task_json.clone())
                            .with_metadata("result", result)
                            .with_metadata("statistics", Value::Array(tagged_statistics)),
                        )
                        .await;
                    }
                }

                this.running.lock().remove(&task_id);
                this.task_state_changed.notify_waiters();
        });
        self.running.lock().insert(task_id, handle);
    }

    async fn run_aggregation(self: &Arc<Self>) {
        self.set_state(PipelineState::Aggregating);
        self.emit(Event::new(EventTag::AggregateStart)).await;

        let results: Vec<Value> = {
            let tasks = self.tasks.lock();
            self.task_order
            .lock()
            .iter()
            .filter_map(|id| tasks.get(id))
            .filter(|rec| rec.state == TaskState::Completed)
            .map(|rec| {
                    serde_json::json!({"task_id": rec.task.id, "result": rec.result.clone().unwrap_or(Value::Null)})
            })
            .collect()
        };

        let aggregated = if let Some(factory) = &self.aggregator_factory {
            let token = self.cancel_map.register("aggregate");
            let mut agent = factory.create();
            let input = serde_json::to_string(&results).unwrap_or_default();
            let outcome = drive_agent(agent.as_mut(), &input, &token).await;
            self.cancel_map.remove("aggregate");
            match outcome {
                PhaseOutcome::Final { content, statistics } => {
                    self.push_statistics(tag_statistics(statistics, "aggregate", agent.name()));
                    content
                }
                PhaseOutcome::Error(message) => {
                    self.emit(
                        Event::new(EventTag::AgentError)
                        .with_content(message)
                        .with_metadata("kind", "aggregate_failed"),
                    )
                    .await;
                    self.set_state(PipelineState::Failed);
                    self.trace_completed("aggregate_failed");
                    return;
                }
                PhaseOutcome::Cancelled => {
                    self.emit(Event::new(EventTag::PlanCancelled)).await;
                    self.set_state(PipelineState::Cancelled);
                    self.trace_completed("aggregate_cancelled");
                    return;
                }
            }
        } else {
            serde_json::to_string(&results).unwrap_or_default()
        };

        self.emit(
            Event::new(EventTag::AggregateCompleted).with_content(aggregated.clone()),
        )
        .await;

        let statistics = self.statistics.lock().clone();
        self.emit(
            Event::new(EventTag::PipelineCompleted)
            .with_metadata("statistics", Value::Array(statistics))
            .with_metadata("schema_version", 1),
        )
        .await;
        self.emit(Event::new(EventTag::AgentFinalAnswer).with_content(aggregated)).await;
        self.set_state(PipelineState::Done);
        self.trace_completed("completed");
    }

    // -- bypass: user.solve_tasks ----------------------------------------

    pub async fn solve_tasks(self: &Arc<Self>, tasks: Vec<PlanTask>) {
        self.install_tasks(tasks);
        self.set_state(PipelineState::Solving);
        let ids: Vec<String> = self.task_order.lock().clone();
        for id in ids {
            self.spawn_task(id);
        }
        self.wait_for_all_terminal().await;
        self.set_state(PipelineState::Done);
    }

    // -- control operations ----------------------------------------------

    /// Ack-then-act: the caller gets an immediate `ok` while the solver's
    /// own `solver.cancelled` follows asynchronously once its loop
    /// notices the token.
    pub async fn cancel_task(&self, task_id: &str) {
        let already_terminal = matches!(
            self.tasks.lock().get(task_id).map(|t| t.state),
            Some(TaskState::Completed) | Some(TaskState::Cancelled)
        );
        let ok = already_terminal || self.cancel_map.cancel(task_id);
        self.emit(
            Event::new(EventTag::SystemNotice)
            .with_metadata("action", "cancel_task")
            .with_metadata("task_id", task_id.to_string())
            .with_metadata("ok", ok),
        )
        .await;
    }

    pub async fn restart_task(self: &Arc<Self>, task_id: &str) {
        if !self.tasks.lock().contains_key(task_id) {
            self.emit(
                Event::new(EventTag::SystemNotice)
                .with_metadata("action", "restart_task")
                .with_metadata("task_id", task_id.to_string())
                .with_metadata("ok", false),
            )
            .await;
            return;
        }

        let old_handle = {
            let was_running = self.cancel_map.cancel(task_id);
            if was_running {
                self.running.lock().remove(task_id)
            } else {
                None
            }
        };

        self.emit(
            Event::new(EventTag::SystemNotice)
            .with_metadata("action", "restart_task")
            .with_metadata("task_id", task_id.to_string())
            .with_metadata("ok", true),
        )
        .await;

        if let Some(rec) = self.tasks.lock().get_mut(task_id) {
            rec.state = TaskState::Pending;
        }

        let this = Arc::clone(self);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
                if let Some(handle) = old_handle {
                    let _ = handle.await;
                }
                this.emit(
                    Event::new(EventTag::SolverRestarted).with_metadata("task_id", task_id.clone()),
                )
                .await;
                this.spawn_task(task_id);
        });
    }

    pub async fn cancel_plan(&self) {
        let state = self.state();
        if !matches!(state, PipelineState::Planning | PipelineState::ConfirmingPlan) {
            return;
        }
        self.cancel_map.cancel(PLAN_KEY);
        let step_id = confirm_step_id(self.session_id);
        self.plan_confirm.cancel(&step_id);
        self.emit(Event::new(EventTag::PlanCancelled)).await;
        self.set_state(PipelineState::Cancelled);
        self.trace_completed("plan_cancelled_by_user");
    }

    pub async fn replan(self: &Arc<Self>, question: String) {
        let state = self.state();
        if !matches!(state, PipelineState::Planning | PipelineState::ConfirmingPlan) {
            return;
        }
        self.cancel_map.cancel(PLAN_KEY);
        let step_id = confirm_step_id(self.session_id);
        self.plan_confirm.cancel(&step_id);

        let this = Arc::clone(self);
        tokio::spawn(async move {
                this.start(question).await;
        });
    }

    /// The `step_id` a plan-confirmation response must carry to reach
    /// this pipeline (`confirm_plan_{session_id}`), so the gateway can
    /// route an inbound `user.response` to whichever of session or
    /// pipeline actually owns the pending confirmation.
    pub fn confirmation_step_id(&self) -> String {
        confirm_step_id(self.session_id)
    }

    /// Resolve the plan confirmation. Returns `false` if `step_id` isn't
    /// the one this pipeline is waiting on.
    pub fn respond(&self, step_id: &str, confirmed: bool, tasks: Option<Value>) -> bool {
        self.plan_confirm
        .respond(step_id, ConfirmationResponse { confirmed, tasks })
    }

    pub fn task_snapshot(&self) -> Vec<(String, TaskState)> {
        self.task_order
        .lock()
        .iter()
        .filter_map(|id| self.tasks.lock().get(id).map(|r| (id.clone(), r.state)))
        .collect()
    }

    /// A pipeline-wide cancel (`user.cancel` while plan-solve is active):
    /// during planning this is equivalent to `cancel_plan`; during solving
    /// it cascades to every in-flight solver via the `"pipeline"` group.
    pub async fn cancel_all(&self) {
        match self.state() {
            PipelineState::Planning | PipelineState::ConfirmingPlan => self.cancel_plan().await,
            PipelineState::Solving => {
                self.cancel_map.cancel("pipeline");
                self.emit(
                    Event::new(EventTag::SystemNotice).with_metadata("action", "cancel_all_tasks"),
                )
                .await;
            }
            _ => {}
        }
    }
}
