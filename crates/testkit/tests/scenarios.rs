//! End-to-end scenario tests wiring several crates together without a
//! real socket, covering cases no single crate's own unit tests exercise
//! in combination: state export feeding a reconnect's replay, the
//! plan-confirmation allow/deny/coerce paths, the `user.solve_tasks`
//! bypass, and a task surviving a restart.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_planner::{Pipeline, PipelineConfig, PipelineState, PlanTask, TaskState};
use conduit_protocol::EventTag;
use conduit_domain::config::StateConfig;
use conduit_session::{Agent, AgentFactory, SessionConfig, SessionHandle, StepRecord};
use conduit_state::{SnapshotState, StateManager};
use conduit_testkit::{thinking_then_final, CaptureSink, ScriptedFactory};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

fn session_cfg() -> SessionConfig {
    SessionConfig {
        confirmation_timeout: Duration::from_millis(200),
        send_llm_message: false,
        max_tool_loops: 25,
    }
}

fn pipeline_cfg(confirmation_required: bool) -> PipelineConfig {
    PipelineConfig {
        max_concurrent_tasks: 5,
        plan_confirmation_required: confirmation_required,
        plan_confirmation_timeout: Duration::from_millis(200),
    }
}

/// Scenario: reconnect with state — a session runs, exports a signed
/// snapshot, and a brand new `SessionHandle` (standing in for the process
/// having restarted) restores from it and resumes serving `user.message`
/// with its prior memory intact.
#[tokio::test]
async fn reconnect_with_state_restores_agent_memory() {
    let factory = ScriptedFactory::new("echo", thinking_then_final("thinking", "first answer"));
    let (handle, _created) = SessionHandle::create(&factory, session_cfg(), None);
    let sink = CaptureSink::new();
    handle.run("hello", &sink).await.unwrap();

    let fields = handle.export_fields().await;
    let manager = StateManager::new(StateConfig::default());
    let envelope = manager.export(SnapshotState {
            session_id: handle.session_id,
            current_step: fields.current_step,
            agent_state: fields.agent_state,
            created_at: fields.created_at,
            last_active_at: fields.last_active_at,
            memory_snapshot: vec![json!({"role": "user", "content": "hello"})],
            tool_states: Value::Null,
            pending_confirmations: vec![],
            metadata: Map::new(),
    });

    // Simulate the process restarting: a fresh session, created with the
    // same session_id, restored from the signed envelope.
    let restored_state = manager.restore(&envelope).unwrap();
    let (new_handle, _) = SessionHandle::create(&factory, session_cfg(), Some(restored_state.session_id));
    new_handle
    .restore_from_snapshot(
        restored_state.agent_state,
        restored_state.current_step,
        restored_state.created_at,
        restored_state.last_active_at,
    )
    .await;

    assert_eq!(new_handle.session_id, handle.session_id);
    let new_sink = CaptureSink::new();
    new_handle.run("again", &new_sink).await.unwrap();
    let tags: Vec<_> = new_sink.events().into_iter().map(|e| e.event).collect();
    assert_eq!(tags.last(), Some(&EventTag::AgentFinalAnswer));
}

/// Scenario: reconnect (no state) — history produced on the original
/// connection's outbound channel replays onto a fresh one, the way the
/// connection manager re-materialises missed events after a socket drop.
#[tokio::test]
async fn reconnect_replays_missed_events_onto_a_new_connection() {
    let (original, original_sink, original_handle) = conduit_testkit::capturing_channel("conn-orig");
    for _ in 0..4 {
        original
        .enqueue(conduit_protocol::Event::new(EventTag::AgentToolCall))
        .await
        .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    original.ack(1);
    let (replayed, truncated) = original.replay(0, 200);
    assert!(!truncated);
    assert_eq!(replayed.len(), 3);

    let (fresh, fresh_sink, fresh_handle) = conduit_testkit::capturing_channel("conn-new");
    for evt in replayed {
        fresh.enqueue(evt).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fresh_sink.decoded().len(), 3);

    original.close();
    fresh.close();
    drop(original);
    drop(fresh);
    original_handle.await.unwrap();
    fresh_handle.await.unwrap();
    let _ = original_sink;
}

/// Scenario: plan confirmation — `plan_confirmation_required` true, the
/// client confirms without overriding tasks, and the pipeline proceeds
/// through solving/aggregation as normal.
#[tokio::test]
async fn plan_confirmation_allow_proceeds_to_solving() {
    let sink = Arc::new(CaptureSink::new());
    let planner = ScriptedFactory::arc(
        "planner",
        vec![StepRecord::Final {
                content: r#"{"tasks":[{"id":"t1","description":"a"}],"plan_summary":"one"}"#.into(),
                statistics: vec![],
        }],
    );
    let solver = ScriptedFactory::arc(
        "solver",
        vec![StepRecord::Final {
                content: "done".into(),
                statistics: vec![],
        }],
    );

    let pipeline = Pipeline::new(Uuid::new_v4(), pipeline_cfg(true), sink.clone(), planner, solver, None);
    let p2 = Arc::clone(&pipeline);
    let run = tokio::spawn(async move { p2.start("do it".into()).await });

    let step_id = pipeline.confirmation_step_id();
    // Wait for the plan-confirmation prompt to appear before responding.
    for _ in 0..50 {
        if sink
        .events()
        .iter()
        .any(|e| e.event == EventTag::AgentUserConfirm)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(pipeline.respond(&step_id, true, None));
    run.await.unwrap();

    assert_eq!(pipeline.state(), PipelineState::Done);
    let tags: Vec<_> = sink.events().into_iter().map(|e| e.event).collect();
    assert!(tags.contains(&EventTag::SolverStart));
    assert!(tags.contains(&EventTag::PipelineCompleted));
}

/// Scenario: plan confirmation — the client declines the plan outright;
/// the pipeline finishes without ever entering Solving.
#[tokio::test]
async fn plan_confirmation_deny_skips_solving() {
    let sink = Arc::new(CaptureSink::new());
    let planner = ScriptedFactory::arc(
        "planner",
        vec![StepRecord::Final {
                content: r#"{"tasks":[{"id":"t1","description":"a"}],"plan_summary":"one"}"#.into(),
                statistics: vec![],
        }],
    );
    let solver = ScriptedFactory::arc(
        "solver",
        vec![StepRecord::Final {
                content: "done".into(),
                statistics: vec![],
        }],
    );
    let pipeline = Pipeline::new(Uuid::new_v4(), pipeline_cfg(true), sink.clone(), planner, solver, None);
    let p2 = Arc::clone(&pipeline);
    let run = tokio::spawn(async move { p2.start("do it".into()).await });

    let step_id = pipeline.confirmation_step_id();
    for _ in 0..50 {
        if sink
        .events()
        .iter()
        .any(|e| e.event == EventTag::AgentUserConfirm)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(pipeline.respond(&step_id, false, None));
    run.await.unwrap();

    assert_eq!(pipeline.state(), PipelineState::Done);
    let tags: Vec<_> = sink.events().into_iter().map(|e| e.event).collect();
    assert!(!tags.contains(&EventTag::SolverStart));
}

/// Scenario: plan confirmation — the client confirms but submits a task
/// override that fails to coerce; the pipeline fails rather than solving
/// a half-understood task list.
#[tokio::test]
async fn plan_confirmation_with_bad_task_override_is_a_coercion_error() {
    let sink = Arc::new(CaptureSink::new());
    let planner = ScriptedFactory::arc(
        "planner",
        vec![StepRecord::Final {
                content: r#"{"tasks":[{"id":"t1","description":"a"}],"plan_summary":"one"}"#.into(),
                statistics: vec![],
        }],
    );
    let solver = ScriptedFactory::arc(
        "solver",
        vec![StepRecord::Final {
                content: "done".into(),
                statistics: vec![],
        }],
    );
    let pipeline = Pipeline::new(Uuid::new_v4(), pipeline_cfg(true), sink.clone(), planner, solver, None);
    let p2 = Arc::clone(&pipeline);
    let run = tokio::spawn(async move { p2.start("do it".into()).await });

    let step_id = pipeline.confirmation_step_id();
    for _ in 0..50 {
        if sink
        .events()
        .iter()
        .any(|e| e.event == EventTag::AgentUserConfirm)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let bad_tasks = json!([{"description": "missing an id"}]);
    assert!(pipeline.respond(&step_id, true, Some(bad_tasks)));
    run.await.unwrap();

    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert!(sink
        .events()
        .iter()
        .any(|e| e.event == EventTag::PlanCoercionError));
}

/// Scenario: `user.solve_tasks` bypass — the client supplies a task list
/// directly, skipping the planner phase entirely.
#[tokio::test]
async fn solve_tasks_bypasses_planning() {
    let sink = Arc::new(CaptureSink::new());
    let planner = ScriptedFactory::arc(
        "planner",
        vec![StepRecord::Final {
                content: "should never run".into(),
                statistics: vec![],
        }],
    );
    let solver = ScriptedFactory::arc(
        "solver",
        vec![StepRecord::Final {
                content: "done".into(),
                statistics: vec![],
        }],
    );
    let pipeline = Pipeline::new(Uuid::new_v4(), pipeline_cfg(false), sink.clone(), planner, solver, None);
    pipeline
    .solve_tasks(vec![
            PlanTask {
                id: "a".into(),
                description: json!("task a"),
            },
            PlanTask {
                id: "b".into(),
                description: json!("task b"),
            },
    ])
    .await;

    assert_eq!(pipeline.state(), PipelineState::Done);
    let tags: Vec<_> = sink.events().into_iter().map(|e| e.event).collect();
    assert!(!tags.contains(&EventTag::PlanStart));
    assert_eq!(tags.iter().filter(|t| **t == EventTag::SolverCompleted).count(), 2);
}

/// An agent whose first run gets stuck forever and whose second (and
/// later) run finishes immediately — standing in for "the same task,
/// retried after a restart, now succeeds".
struct FlakyOnceAgent {
    attempt: usize,
    started: Arc<AtomicUsize>,
}

#[async_trait]
impl Agent for FlakyOnceAgent {
    async fn run(&mut self, _input: &str, out: Sender<StepRecord>) {
        self.started.fetch_add(1, Ordering::SeqCst);
        if self.attempt == 1 {
            std::future::pending::<()>().await;
        } else {
            let _ = out
            .send(StepRecord::Final {
                    content: "recovered".into(),
                    statistics: vec![],
            })
            .await;
        }
    }
    async fn cancel(&mut self) {}
    fn memory(&self) -> Value {
        Value::Null
    }
    fn restore_memory(&mut self, _snapshot: Value) {}
    fn name(&self) -> &str {
        "flaky"
    }
    fn description(&self) -> &str {
        "fails its first attempt"
    }
}

struct FlakyOnceFactory {
    attempts: AtomicUsize,
    started: Arc<AtomicUsize>,
}

impl AgentFactory for FlakyOnceFactory {
    fn create(&self) -> Box<dyn Agent> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Box::new(FlakyOnceAgent {
                attempt,
                started: Arc::clone(&self.started),
        })
    }
}

/// Scenario: plan-solve with per-task restart — a task stuck on its first
/// attempt is restarted and completes on the second.
#[tokio::test]
async fn restart_task_recovers_a_stuck_task() {
    let sink = Arc::new(CaptureSink::new());
    let planner = ScriptedFactory::arc(
        "planner",
        vec![StepRecord::Final {
                content: r#"{"tasks":[{"id":"only","description":"a"}],"plan_summary":"one"}"#.into(),
                statistics: vec![],
        }],
    );
    let started = Arc::new(AtomicUsize::new(0));
    let solver: Arc<dyn AgentFactory> = Arc::new(FlakyOnceFactory {
            attempts: AtomicUsize::new(0),
            started: Arc::clone(&started),
    });

    let pipeline = Pipeline::new(Uuid::new_v4(), pipeline_cfg(false), sink.clone(), planner, solver, None);
    let p2 = Arc::clone(&pipeline);
    let run = tokio::spawn(async move { p2.start("q".into()).await });

    for _ in 0..50 {
        if started.load(Ordering::SeqCst) >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    pipeline.restart_task("only").await;

    for _ in 0..50 {
        if started.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    run.await.unwrap();

    assert_eq!(pipeline.state(), PipelineState::Done);
    let snapshot = pipeline.task_snapshot();
    assert_eq!(snapshot[0].1, TaskState::Completed);
    let tags: Vec<_> = sink.events().into_iter().map(|e| e.event).collect();
    assert!(tags.contains(&EventTag::SolverRestarted));
}
