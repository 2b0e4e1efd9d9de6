use async_trait::async_trait;
use conduit_domain::Error;

/// The write half of a connection, as seen by the outbound channel's
/// writer task. `conduit-connection` implements this over an axum
/// WebSocket sink; `conduit-testkit` implements it over a `Vec<String>`
/// capture buffer for in-process scenario tests.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_text(&mut self, frame: String) -> Result<(), Error>;

    /// Best-effort close; errors are logged, not propagated (the channel
    /// is tearing down regardless).
    async fn close(&mut self);
}
