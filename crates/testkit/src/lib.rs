//! Deterministic test harness shared across the workspace: a scriptable
//! fake [`conduit_session::Agent`], event-capturing sinks, and the
//! session/outbound wiring needed to drive end-to-end scenarios without a
//! real socket.

pub mod capture;
pub mod fake_agent;

pub use capture::{capturing_channel, CaptureFrameSink, CaptureSink, OutboundEventSink};
pub use fake_agent::{
    thinking_then_final, tool_call_requiring_confirmation, PendingAgent, PendingFactory,
    ScriptedAgent, ScriptedFactory,
};
