use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use conduit_domain::Error;
use conduit_outbound::FrameSink;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;

/// Adapts the write half of an axum WebSocket to [`FrameSink`], so the
/// outbound channel's writer task is the single task that ever touches
/// the socket.
pub struct WsFrameSink(pub SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_text(&mut self, frame: String) -> Result<(), Error> {
        self.0
        .send(Message::Text(frame))
        .await
        .map_err(|e| Error::Other(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}
