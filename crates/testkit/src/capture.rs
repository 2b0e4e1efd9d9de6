use std::sync::Arc;

use async_trait::async_trait;
use conduit_domain::Error;
use conduit_outbound::{OutboundChannel, OutboundConfig};
use conduit_protocol::Event;
use conduit_session::EventSink;
use parking_lot::Mutex;

/// An [`EventSink`] that just records everything emitted through it, in
/// order, with no sequence stamping — for assertions that care about
/// causal order and content but not wire framing.
#[derive(Default, Clone)]
pub struct CaptureSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn tags(&self) -> Vec<conduit_protocol::EventTag> {
        self.events.lock().iter().map(|e| e.event).collect()
    }
}

#[async_trait]
impl EventSink for CaptureSink {
    async fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// A [`conduit_outbound::FrameSink`] that records every encoded JSON
/// frame instead of writing to a socket, for driving a real
/// [`OutboundChannel`] end to end (seq stamping, coalescing, history) in
/// a scenario test.
#[derive(Default, Clone)]
pub struct CaptureFrameSink {
    frames: Arc<Mutex<Vec<String>>>,
}

impl CaptureFrameSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    pub fn decoded(&self) -> Vec<Event> {
        self.frames
        .lock()
        .iter()
        .map(|f| conduit_protocol::decode(f).expect("capture sink only ever receives well-formed frames"))
        .collect()
    }
}

#[async_trait]
impl conduit_outbound::FrameSink for CaptureFrameSink {
    async fn send_text(&mut self, frame: String) -> Result<(), Error> {
        self.frames.lock().push(frame);
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Bridges a [`SessionHandle`]'s [`EventSink`] output into a real
/// [`OutboundChannel`], the same wiring the gateway binary performs in
/// production — so scenario tests get
/// genuine `seq`/`event_id` stamping and replay semantics rather than
/// asserting against bare [`Event`]s.
pub struct OutboundEventSink {
    pub outbound: Arc<OutboundChannel>,
}

#[async_trait]
impl EventSink for OutboundEventSink {
    async fn emit(&self, event: Event) {
        let _ = self.outbound.enqueue(event).await;
    }
}

/// Spawn an [`OutboundChannel`] over a [`CaptureFrameSink`] with
/// sensible default tuning, returning both halves for inspection.
pub fn capturing_channel(connection_id: &str) -> (Arc<OutboundChannel>, CaptureFrameSink, tokio::task::JoinHandle<()>) {
    let sink = CaptureFrameSink::new();
    let (chan, handle) = OutboundChannel::spawn(
        connection_id,
        OutboundConfig {
            queue_capacity: 1000,
            coalesce_window: std::time::Duration::from_millis(75),
            history_ring_size: 1000,
        },
        sink.clone(),
    );
    (Arc::new(chan), sink, handle)
}
