use serde::{Deserialize, Serialize};

/// The closed set of event tags. Unknown tags on ingress are rejected by
/// the connection manager before this type is ever constructed — decoding
/// into `EventTag` is itself the "is this tag in the closed set" check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTag {
    #[serde(rename = "user.create_session")]
    UserCreateSession,
    #[serde(rename = "user.message")]
    UserMessage,
    #[serde(rename = "user.response")]
    UserResponse,
    #[serde(rename = "user.cancel")]
    UserCancel,
    #[serde(rename = "user.ack")]
    UserAck,
    #[serde(rename = "user.reconnect")]
    UserReconnect,
    #[serde(rename = "user.reconnect_with_state")]
    UserReconnectWithState,
    #[serde(rename = "user.request_state")]
    UserRequestState,
    #[serde(rename = "user.solve_tasks")]
    UserSolveTasks,
    #[serde(rename = "user.cancel_task")]
    UserCancelTask,
    #[serde(rename = "user.restart_task")]
    UserRestartTask,
    #[serde(rename = "user.cancel_plan")]
    UserCancelPlan,
    #[serde(rename = "user.replan")]
    UserReplan,

    #[serde(rename = "agent.session_created")]
    AgentSessionCreated,
    #[serde(rename = "agent.thinking")]
    AgentThinking,
    #[serde(rename = "agent.tool_call")]
    AgentToolCall,
    #[serde(rename = "agent.tool_result")]
    AgentToolResult,
    #[serde(rename = "agent.user_confirm")]
    AgentUserConfirm,
    #[serde(rename = "agent.partial_answer")]
    AgentPartialAnswer,
    #[serde(rename = "agent.llm_message")]
    AgentLlmMessage,
    #[serde(rename = "agent.final_answer")]
    AgentFinalAnswer,
    #[serde(rename = "agent.state_exported")]
    AgentStateExported,
    #[serde(rename = "agent.state_restored")]
    AgentStateRestored,
    #[serde(rename = "agent.error")]
    AgentError,
    #[serde(rename = "agent.timeout")]
    AgentTimeout,
    #[serde(rename = "agent.interrupted")]
    AgentInterrupted,
    #[serde(rename = "agent.session_end")]
    AgentSessionEnd,

    #[serde(rename = "plan.start")]
    PlanStart,
    #[serde(rename = "plan.completed")]
    PlanCompleted,
    #[serde(rename = "plan.cancelled")]
    PlanCancelled,
    #[serde(rename = "plan.coercion_error")]
    PlanCoercionError,
    #[serde(rename = "solver.start")]
    SolverStart,
    #[serde(rename = "solver.completed")]
    SolverCompleted,
    #[serde(rename = "solver.cancelled")]
    SolverCancelled,
    #[serde(rename = "solver.restarted")]
    SolverRestarted,
    #[serde(rename = "aggregate.start")]
    AggregateStart,
    #[serde(rename = "aggregate.completed")]
    AggregateCompleted,
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted,

    #[serde(rename = "system.connected")]
    SystemConnected,
    #[serde(rename = "system.heartbeat")]
    SystemHeartbeat,
    #[serde(rename = "system.notice")]
    SystemNotice,
    #[serde(rename = "system.error")]
    SystemError,
}

/// The four top-level categories a tag belongs to. System events never
/// carry `session_id`; all others do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    User,
    Agent,
    Plan,
    Solver,
    Aggregate,
    Pipeline,
    System,
}

impl EventTag {
    pub fn category(&self) -> EventCategory {
        use EventCategory::*;
        use EventTag::*;
        match self {
            UserCreateSession
            | UserMessage
            | UserResponse
            | UserCancel
            | UserAck
            | UserReconnect
            | UserReconnectWithState
            | UserRequestState
            | UserSolveTasks
            | UserCancelTask
            | UserRestartTask
            | UserCancelPlan
            | UserReplan => User,

            AgentSessionCreated
            | AgentThinking
            | AgentToolCall
            | AgentToolResult
            | AgentUserConfirm
            | AgentPartialAnswer
            | AgentLlmMessage
            | AgentFinalAnswer
            | AgentStateExported
            | AgentStateRestored
            | AgentError
            | AgentTimeout
            | AgentInterrupted
            | AgentSessionEnd => Agent,

            PlanStart | PlanCompleted | PlanCancelled | PlanCoercionError => Plan,
            SolverStart | SolverCompleted | SolverCancelled | SolverRestarted => Solver,
            AggregateStart | AggregateCompleted => Aggregate,
            PipelineCompleted => Pipeline,

            SystemConnected | SystemHeartbeat | SystemNotice | SystemError => System,
        }
    }

    /// Whether this tag's events are coalescable under a shared backlog
    /// window (see `conduit-outbound`). Only bulk-streaming tags qualify;
    /// terminating events are never coalesced.
    pub fn is_coalescable(&self) -> bool {
        matches!(self, EventTag::AgentPartialAnswer | EventTag::AgentLlmMessage)
    }

    /// Whether this tag terminates a session request (exactly one must be
    /// emitted per `user.message`).
    pub fn is_terminal_answer(&self) -> bool {
        matches!(
            self,
            EventTag::AgentFinalAnswer
            | EventTag::AgentTimeout
            | EventTag::AgentInterrupted
            | EventTag::AgentError
        )
    }

    /// The short machine name, as it appears on the wire (`"event"` field).
    pub fn as_str(&self) -> &'static str {
        use EventTag::*;
        match self {
            UserCreateSession => "user.create_session",
            UserMessage => "user.message",
            UserResponse => "user.response",
            UserCancel => "user.cancel",
            UserAck => "user.ack",
            UserReconnect => "user.reconnect",
            UserReconnectWithState => "user.reconnect_with_state",
            UserRequestState => "user.request_state",
            UserSolveTasks => "user.solve_tasks",
            UserCancelTask => "user.cancel_task",
            UserRestartTask => "user.restart_task",
            UserCancelPlan => "user.cancel_plan",
            UserReplan => "user.replan",

            AgentSessionCreated => "agent.session_created",
            AgentThinking => "agent.thinking",
            AgentToolCall => "agent.tool_call",
            AgentToolResult => "agent.tool_result",
            AgentUserConfirm => "agent.user_confirm",
            AgentPartialAnswer => "agent.partial_answer",
            AgentLlmMessage => "agent.llm_message",
            AgentFinalAnswer => "agent.final_answer",
            AgentStateExported => "agent.state_exported",
            AgentStateRestored => "agent.state_restored",
            AgentError => "agent.error",
            AgentTimeout => "agent.timeout",
            AgentInterrupted => "agent.interrupted",
            AgentSessionEnd => "agent.session_end",

            PlanStart => "plan.start",
            PlanCompleted => "plan.completed",
            PlanCancelled => "plan.cancelled",
            PlanCoercionError => "plan.coercion_error",
            SolverStart => "solver.start",
            SolverCompleted => "solver.completed",
            SolverCancelled => "solver.cancelled",
            SolverRestarted => "solver.restarted",
            AggregateStart => "aggregate.start",
            AggregateCompleted => "aggregate.completed",
            PipelineCompleted => "pipeline.completed",

            SystemConnected => "system.connected",
            SystemHeartbeat => "system.heartbeat",
            SystemNotice => "system.notice",
            SystemError => "system.error",
        }
    }
}

impl std::fmt::Display for EventTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
