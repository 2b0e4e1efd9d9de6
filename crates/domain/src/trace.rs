use serde::Serialize;

/// Structured trace events emitted across all conduit crates.
///
/// Distinct from the wire protocol's `Event` (conduit-protocol): these
/// are operator-facing log records, never sent to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    ConnectionAccepted {
        connection_id: String,
    },
    ConnectionClosed {
        connection_id: String,
        reason: String,
    },
    SessionCreated {
        session_id: String,
        connection_id: String,
    },
    SessionRebound {
        session_id: String,
        old_connection_id: String,
        new_connection_id: String,
    },
    SessionClosed {
        session_id: String,
        reason: String,
    },
    ToolCallStarted {
        session_id: String,
        step_id: String,
        tool_name: String,
        requires_confirmation: bool,
    },
    ConfirmationResolved {
        session_id: String,
        step_id: String,
        confirmed: bool,
        timed_out: bool,
    },
    StateExported {
        session_id: String,
        state_bytes: usize,
    },
    StateRestored {
        previous_session_id: String,
        new_session_id: String,
    },
    StateRejected {
        reason: String,
    },
    ReplayPerformed {
        connection_id: String,
        from_seq: u64,
        events_replayed: usize,
        truncated: bool,
    },
    SlowConsumerDisconnect {
        connection_id: String,
        queue_depth: usize,
    },
    PipelineStarted {
        session_id: String,
        question_chars: usize,
    },
    PipelineTaskTransition {
        session_id: String,
        task_id: String,
        from: String,
        to: String,
    },
    PipelineCompleted {
        session_id: String,
        task_count: usize,
        outcome: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "conduit_event");
    }
}
