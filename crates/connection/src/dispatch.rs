use std::sync::Arc;

use async_trait::async_trait;
use conduit_outbound::OutboundChannel;
use conduit_protocol::Event;

/// The connection manager's sole collaborator: everything past frame
/// validation (session lookup, the confirmation gate, plan-solve control)
/// belongs to the session engine and plan-solve pipeline, which the
/// gateway binary wires in behind this trait.
#[async_trait]
pub trait EventDispatcher: Send + Sync + 'static {
    /// Handle one validated inbound user event for `connection_id`.
    async fn dispatch(&self, connection_id: &str, outbound: Arc<OutboundChannel>, evt: Event);

    /// The connection's socket has closed. Implementations typically
    /// start the reconnect-grace countdown for any session still bound
    /// to this connection rather than closing it immediately.
    async fn on_disconnect(&self, connection_id: &str);

    /// Reported in `system.heartbeat.metadata.active_sessions`.
    fn active_session_count(&self) -> usize;
}
