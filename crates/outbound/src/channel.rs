use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conduit_domain::Error;
use conduit_protocol::{Event, EventTag};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::history::HistoryRing;
use crate::sink::FrameSink;

/// How long `enqueue` waits on a full channel before giving up and
/// reporting a slow consumer — bounds how long a producer task can be
/// made to wait.
const BACKPRESSURE_GRACE: Duration = Duration::from_secs(2);

/// Per-connection single-writer outbound channel: bounded queue,
/// coalescing, sequence stamping, and replay history.
pub struct OutboundChannel {
    connection_id: String,
    tx: mpsc::Sender<Event>,
    history: Arc<Mutex<HistoryRing>>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    /// Fired exactly once, the moment a producer gives up waiting on a
    /// full queue. The connection manager selects on [`Self::poisoned`]
    /// alongside the socket read loop so a slow consumer gets the socket
    /// closed promptly instead of only on the client's next frame.
    poisoned: Arc<Notify>,
}

pub struct OutboundConfig {
    pub queue_capacity: usize,
    pub coalesce_window: Duration,
    pub history_ring_size: usize,
}

impl OutboundChannel {
    /// Spawn the writer task and return a handle producers can clone and
    /// enqueue into. The writer task owns `sink` exclusively — it is the
    /// single writer for this connection.
    pub fn spawn(
        connection_id: impl Into<String>,
        cfg: OutboundConfig,
        sink: impl FrameSink,
    ) -> (Self, JoinHandle<()>) {
        let connection_id = connection_id.into();
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let history = Arc::new(Mutex::new(HistoryRing::new(cfg.history_ring_size)));
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let poisoned = Arc::new(Notify::new());

        let writer = Writer {
            connection_id: connection_id.clone(),
            rx,
            sink,
            history: history.clone(),
            seq_counter: AtomicU64::new(0),
            coalesce_window: cfg.coalesce_window,
        };
        let handle = tokio::spawn(writer.run());

        (
            Self {
                connection_id,
                tx,
                history,
                closed,
                poisoned,
            },
            handle,
        )
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Number of events currently buffered in the bounded queue, for
    /// diagnostics (e.g. the slow-consumer trace log).
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Enqueue an event for delivery. Bulk-streaming tags and ordinary
    /// tags both go through the same bounded channel; the writer task is
    /// responsible for coalescing bulk tags before they reach the socket.
    ///
    /// On sustained overflow (the channel stays full past a short grace
    /// period) this returns `Error::SlowConsumer`; the caller (connection
    /// manager) must then close the socket.
    pub async fn enqueue(&self, evt: Event) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Other("outbound channel is closed".into()));
        }
        match self.tx.try_send(evt) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(Error::Other("outbound channel is closed".into())),
            Err(TrySendError::Full(evt)) => {
                match tokio::time::timeout(BACKPRESSURE_GRACE, self.tx.send(evt)).await {
                    Ok(Ok(())) => Ok(()),
                    _ => {
                        // A single waiter (the connection manager's read
                        // loop) consumes this; `notify_one` stores the
                        // permit even if nobody is awaiting it yet.
                        self.poisoned.notify_one();
                        Err(Error::SlowConsumer)
                    }
                }
            }
        }
    }

    /// Try to deliver one more event without waiting on backpressure —
    /// used for the best-effort `system.error{slow_consumer}` notice sent
    /// right before the connection manager tears the socket down. A full
    /// queue here simply means the notice doesn't make it, which is within
    /// the "best-effort" contract.
    pub fn try_enqueue_best_effort(&self, evt: Event) {
        let _ = self.tx.try_send(evt);
    }

    /// Resolves once a producer has given up waiting on a full queue.
    /// Never resolves for a channel that never overflows.
    pub async fn slow_consumer(&self) {
        self.poisoned.notified().await;
    }

    /// Release history up to `last_seq` (from `user.ack`).
    pub fn ack(&self, last_seq: u64) {
        self.history.lock().ack(last_seq);
    }

    /// Materialise the contiguous replay suffix for a reconnect, capped at
    /// `replay_cap`.
    pub fn replay(&self, from_seq: u64, replay_cap: usize) -> (Vec<Event>, bool) {
        self.history.lock().replay_from(from_seq, replay_cap)
    }

    /// Drain in-flight writes and discard history.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.history.lock().clear();
    }
}

struct Writer<S: FrameSink> {
    connection_id: String,
    rx: mpsc::Receiver<Event>,
    sink: S,
    history: Arc<Mutex<HistoryRing>>,
    seq_counter: AtomicU64,
    coalesce_window: Duration,
}

impl<S: FrameSink> Writer<S> {
    async fn run(mut self) {
        let mut pending: Option<Event> = None;
        loop {
            let received = if pending.is_some() {
                match tokio::time::timeout(self.coalesce_window, self.rx.recv()).await {
                    Ok(next) => next,
                    Err(_elapsed) => {
                        if let Some(evt) = pending.take() {
                            self.emit(evt).await;
                        }
                        continue;
                    }
                }
            } else {
                self.rx.recv().await
            };

            match received {
                None => break,
                Some(evt) => {
                    if evt.event.is_coalescable() {
                        match pending.take() {
                            Some(buf) if buf.event == evt.event => {
                                pending = Some(merge(buf, evt));
                            }
                            Some(buf) => {
                                self.emit(buf).await;
                                pending = Some(evt);
                            }
                            None => pending = Some(evt),
                        }
                    } else {
                        if let Some(buf) = pending.take() {
                            self.emit(buf).await;
                        }
                        self.emit(evt).await;
                    }
                }
            }
        }
        if let Some(evt) = pending.take() {
            self.emit(evt).await;
        }
        self.sink.close().await;
    }

    async fn emit(&mut self, mut evt: Event) {
        let seq = self.seq_counter.fetch_add(1, Ordering::AcqRel) + 1;
        evt.stamp(&self.connection_id, seq);
        self.history.lock().push(evt.clone());
        if let Ok(frame) = conduit_protocol::encode(&evt) {
            if let Err(e) = self.sink.send_text(frame).await {
                tracing::warn!(connection_id = %self.connection_id, error = %e, "outbound write failed");
            }
        }
    }
}

/// Merge a new coalescable event into a pending batch: concatenate
/// string content, shallow-merge metadata keeping the latest values, and
/// keep the first event's `step_id`.
fn merge(mut buf: Event, next: Event) -> Event {
    let prev_content = std::mem::take(&mut buf.content);
    buf.content = match (prev_content, next.content) {
        (Value::String(mut a), Value::String(b)) => {
            a.push_str(&b);
            Value::String(a)
        }
        (Value::Null, other) => other,
        (a, _) => a,
    };
    for (k, v) in next.metadata {
        buf.metadata.insert(k, v);
    }
    buf.timestamp = next.timestamp;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default, Clone)]
    struct CaptureSink(Arc<StdMutex<Vec<String>>>);

    #[async_trait]
    impl FrameSink for CaptureSink {
        async fn send_text(&mut self, frame: String) -> Result<(), Error> {
            self.0.lock().unwrap().push(frame);
            Ok(())
        }
        async fn close(&mut self) {}
    }

    fn cfg(queue_capacity: usize, coalesce_ms: u64, ring: usize) -> OutboundConfig {
        OutboundConfig {
            queue_capacity,
            coalesce_window: Duration::from_millis(coalesce_ms),
            history_ring_size: ring,
        }
    }

    #[tokio::test]
    async fn seq_is_strictly_increasing_and_gap_free() {
        let sink = CaptureSink::default();
        let (chan, handle) = OutboundChannel::spawn("conn-1", cfg(100, 5, 1000), sink);
        for _ in 0..5 {
            chan.enqueue(Event::new(EventTag::AgentThinking)).await.unwrap();
        }
        drop(chan);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn non_coalescable_events_pass_through_individually() {
        let sink = CaptureSink::default();
        let captured = sink.0.clone();
        let (chan, handle) = OutboundChannel::spawn("conn-1", cfg(100, 5, 1000), sink);
        chan.enqueue(Event::new(EventTag::AgentToolCall)).await.unwrap();
        chan.enqueue(Event::new(EventTag::AgentToolResult)).await.unwrap();
        drop(chan);
        handle.await.unwrap();
        assert_eq!(captured.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn coalescable_bursts_collapse_into_few_frames() {
        let sink = CaptureSink::default();
        let captured = sink.0.clone();
        let (chan, handle) = OutboundChannel::spawn("conn-1", cfg(1000, 30, 1000), sink);
        for i in 0..50 {
            chan.enqueue(
                Event::new(EventTag::AgentPartialAnswer).with_content(format!("{i}")),
            )
            .await
            .unwrap();
        }
        drop(chan);
        handle.await.unwrap();
        // All 50 enqueued faster than the coalesce window; they must
        // collapse to far fewer than 50 emitted frames.
        assert!(captured.lock().unwrap().len() < 10);
    }

    #[tokio::test]
    async fn ack_trims_history_and_replay_returns_the_rest() {
        let sink = CaptureSink::default();
        let (chan, handle) = OutboundChannel::spawn("conn-1", cfg(100, 5, 1000), sink);
        for _ in 0..5 {
            chan.enqueue(Event::new(EventTag::AgentToolCall)).await.unwrap();
        }
        // Let the writer drain the queue before inspecting history.
        tokio::time::sleep(Duration::from_millis(20)).await;
        chan.ack(2);
        let (events, truncated) = chan.replay(0, 200);
        assert_eq!(events.len(), 3);
        assert!(!truncated);
        drop(chan);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn slow_consumer_is_reported_when_queue_stays_full() {
        // A full channel with nobody draining it (writer blocked on a slow
        // sink) must eventually surface as a slow-consumer error rather
        // than hang forever.
        struct StuckSink;
        #[async_trait]
        impl FrameSink for StuckSink {
            async fn send_text(&mut self, _frame: String) -> Result<(), Error> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            async fn close(&mut self) {}
        }
        let (chan, _handle) = OutboundChannel::spawn("conn-1", cfg(1, 5, 1000), StuckSink);
        // First enqueue is picked up by the writer immediately and blocks
        // forever inside `send_text`; the channel itself now fills up.
        chan.enqueue(Event::new(EventTag::AgentToolCall)).await.unwrap();
        chan.enqueue(Event::new(EventTag::AgentToolCall)).await.unwrap();
        let result = chan.enqueue(Event::new(EventTag::AgentToolCall)).await;
        assert!(matches!(result, Err(Error::SlowConsumer)));

        // The connection manager's read loop waits on this to know it
        // must close the socket; it must resolve promptly once poisoned.
        tokio::time::timeout(Duration::from_millis(50), chan.slow_consumer())
        .await
        .expect("slow_consumer() must resolve once a producer gives up");
    }
}
