use std::sync::Arc;
use std::time::Duration;

use conduit_connection::EventDispatcher;
use conduit_domain::Config;
use conduit_protocol::{Event, EventTag};
use conduit_state::StateManager;
use conduit_gateway::demo_agent;
use conduit_gateway::dispatcher::GatewayDispatcher;
use conduit_testkit::capturing_channel;
use serde_json::json;
use uuid::Uuid;

fn build_dispatcher() -> GatewayDispatcher {
    let config = Config::default();
    let agent_factory = Arc::new(demo_agent::EchoAgentFactory);
    let planner_factory = Arc::new(demo_agent::DemoPlannerFactory);
    let solver_factory: Arc<dyn conduit_session::AgentFactory> = agent_factory.clone();
    let state_manager = Arc::new(StateManager::new(config.state.clone()));
    GatewayDispatcher::new(agent_factory, planner_factory, solver_factory, None, state_manager, &config)
}

async fn wait_for_tag(sink: &conduit_testkit::CaptureFrameSink, tag: EventTag) -> Event {
    tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(evt) = sink.decoded().into_iter().rev().find(|e| e.event == tag) {
                    return evt;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
    })
    .await
    .expect("expected event did not arrive in time")
}

#[tokio::test]
async fn create_session_then_message_produces_final_answer() {
    let dispatcher = build_dispatcher();
    let (outbound, sink, _writer) = capturing_channel("conn-1");

    dispatcher
    .dispatch("conn-1", outbound.clone(), Event::new(EventTag::UserCreateSession))
    .await;
    let created = wait_for_tag(&sink, EventTag::AgentSessionCreated).await;
    let session_id = created.session_id.expect("session_created carries session_id");

    let message = Event::new(EventTag::UserMessage)
    .with_session(session_id)
    .with_content("hello there");
    dispatcher.dispatch("conn-1", outbound.clone(), message).await;

    let final_answer = wait_for_tag(&sink, EventTag::AgentFinalAnswer).await;
    assert_eq!(final_answer.content.as_str().unwrap(), "you said: hello there");
    assert_eq!(dispatcher.active_session_count(), 1);
}

#[tokio::test]
async fn unknown_session_id_on_message_yields_system_error() {
    let dispatcher = build_dispatcher();
    let (outbound, sink, _writer) = capturing_channel("conn-2");

    let message = Event::new(EventTag::UserMessage)
    .with_session(Uuid::new_v4())
    .with_content("hi");
    dispatcher.dispatch("conn-2", outbound.clone(), message).await;

    let err = wait_for_tag(&sink, EventTag::SystemError).await;
    assert_eq!(err.metadata.get("error_kind").and_then(|v| v.as_str()), Some("bad_session"));
}

#[tokio::test]
async fn plan_solve_mode_drives_pipeline_to_completion() {
    let dispatcher = build_dispatcher();
    let (outbound, sink, _writer) = capturing_channel("conn-3");

    dispatcher
    .dispatch("conn-3", outbound.clone(), Event::new(EventTag::UserCreateSession))
    .await;
    let created = wait_for_tag(&sink, EventTag::AgentSessionCreated).await;
    let session_id = created.session_id.unwrap();

    let message = Event::new(EventTag::UserMessage)
    .with_session(session_id)
    .with_content(json!({"mode": "plan_solve", "question": "plan a trip"}));
    dispatcher.dispatch("conn-3", outbound.clone(), message).await;

    wait_for_tag(&sink, EventTag::PipelineCompleted).await;
}

#[tokio::test]
async fn reconnect_with_unknown_session_is_rejected() {
    let dispatcher = build_dispatcher();
    let (outbound, sink, _writer) = capturing_channel("conn-4");

    let reconnect = Event::new(EventTag::UserReconnect).with_content(json!({
                "session_id": Uuid::new_v4().to_string(),
                "last_seq": 0,
    }));
    dispatcher.dispatch("conn-4", outbound.clone(), reconnect).await;

    let err = wait_for_tag(&sink, EventTag::SystemError).await;
    assert_eq!(err.metadata.get("error_kind").and_then(|v| v.as_str()), Some("bad_session"));
}

#[tokio::test]
async fn disconnect_then_reconnect_replays_missed_events() {
    let dispatcher = build_dispatcher();
    let (outbound_a, sink_a, _writer_a) = capturing_channel("conn-5");

    dispatcher
    .dispatch("conn-5", outbound_a.clone(), Event::new(EventTag::UserCreateSession))
    .await;
    let created = wait_for_tag(&sink_a, EventTag::AgentSessionCreated).await;
    let session_id = created.session_id.unwrap();

    let message = Event::new(EventTag::UserMessage)
    .with_session(session_id)
    .with_content("first turn");
    dispatcher.dispatch("conn-5", outbound_a.clone(), message).await;
    wait_for_tag(&sink_a, EventTag::AgentFinalAnswer).await;

    dispatcher.on_disconnect("conn-5").await;

    let (outbound_b, sink_b, _writer_b) = capturing_channel("conn-6");
    let reconnect = Event::new(EventTag::UserReconnect).with_content(json!({
                "session_id": session_id.to_string(),
                "last_seq": 0,
    }));
    dispatcher.dispatch("conn-6", outbound_b.clone(), reconnect).await;

    wait_for_tag(&sink_b, EventTag::AgentFinalAnswer).await;
}
