use async_trait::async_trait;
use conduit_protocol::Event;

/// Where a Session sends the events it produces. Decouples the engine
/// from the outbound channel / connection crates so this crate can be
/// tested without a socket.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}
