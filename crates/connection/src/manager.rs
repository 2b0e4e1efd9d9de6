use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use conduit_domain::config::{ConnectionConfig, OutboundConfig as DomainOutboundConfig};
use conduit_domain::trace::TraceEvent;
use conduit_outbound::{OutboundChannel, OutboundConfig};
use conduit_protocol::{decode, Event, EventTag, InboundCheck};
use futures_util::StreamExt;
use uuid::Uuid;

use crate::dispatch::EventDispatcher;
use crate::ws_sink::WsFrameSink;

/// Accept one already-upgraded WebSocket and run it to completion:
/// handshake, read loop, heartbeat, and teardown.
pub async fn serve_connection(
    socket: WebSocket,
    dispatcher: Arc<dyn EventDispatcher>,
    outbound_cfg: DomainOutboundConfig,
    conn_cfg: ConnectionConfig,
) {
    let connection_id = Uuid::new_v4().to_string();
    let (sink, mut stream) = socket.split();
    let (outbound, writer_handle) = OutboundChannel::spawn(
        connection_id.clone(),
        OutboundConfig {
            queue_capacity: outbound_cfg.queue_capacity,
            coalesce_window: Duration::from_millis(outbound_cfg.coalesce_window_ms),
            history_ring_size: outbound_cfg.history_ring_size,
        },
        WsFrameSink(sink),
    );
    let outbound = Arc::new(outbound);
    TraceEvent::ConnectionAccepted {
        connection_id: connection_id.clone(),
    }
    .emit();

    let mut hello = Event::new(EventTag::SystemConnected);
    hello.connection_id = Some(connection_id.clone());
    let hello = hello.with_metadata("connection_id", connection_id.clone());
    if outbound.enqueue(hello).await.is_err() {
        return;
    }

    let heartbeat_handle = spawn_heartbeat(
        connection_id.clone(),
        outbound.clone(),
        dispatcher.clone(),
        Duration::from_secs(conn_cfg.heartbeat_interval_s.max(1)),
    );

    let max_frame_bytes = conn_cfg.max_inbound_frame_bytes;
    let mut close_reason = "client_closed";
    loop {
        tokio::select! {
            biased;
            _ = outbound.slow_consumer() => {
                TraceEvent::SlowConsumerDisconnect {
                    connection_id: connection_id.clone(),
                    queue_depth: outbound.queue_depth(),
                }
                .emit();
                // Best-effort notice; the queue that just overflowed may
                // simply drop this too, which is within contract.
                outbound.try_enqueue_best_effort(system_error(
                    &connection_id,
                    "slow_consumer",
                    "outbound queue overflowed; closing connection",
                ));
                close_reason = "slow_consumer";
                break;
            }
            msg = stream.next() => {
                let Some(msg) = msg else {
                    close_reason = "stream_ended";
                    break;
                };
                let msg = match msg {
                    Ok(m) => m,
                    Err(_) => {
                        close_reason = "read_error";
                        break;
                    }
                };
                match msg {
                    Message::Text(text) => {
                        if text.len() > max_frame_bytes {
                            let err = system_error(
                                &connection_id,
                                "invalid_frame",
                                "frame exceeds max_inbound_frame_bytes",
                            );
                            let _ = outbound.enqueue(err).await;
                            continue;
                        }
                        handle_frame(&connection_id, &outbound, dispatcher.as_ref(), &text).await;
                    }
                    Message::Binary(bytes) => {
                        let kind = if bytes.len() > max_frame_bytes {
                            "frame exceeds max_inbound_frame_bytes"
                        } else {
                            "binary frames are not supported; the wire protocol is UTF-8 JSON text"
                        };
                        let err = system_error(&connection_id, "invalid_frame", kind);
                        let _ = outbound.enqueue(err).await;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => {
                        close_reason = "client_closed";
                        break;
                    }
                }
            }
        }
    }

    heartbeat_handle.abort();
    dispatcher.on_disconnect(&connection_id).await;
    outbound.close();
    let _ = writer_handle.await;
    TraceEvent::ConnectionClosed {
        connection_id,
        reason: close_reason.to_string(),
    }
    .emit();
}

fn spawn_heartbeat(
    connection_id: String,
    outbound: Arc<OutboundChannel>,
    dispatcher: Arc<dyn EventDispatcher>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let started_at = Instant::now();
    tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // swallow the immediate first tick
            loop {
                ticker.tick().await;
                let evt = Event::new(EventTag::SystemHeartbeat)
                .with_metadata("connection_id", connection_id.clone())
                .with_metadata(
                    "active_sessions",
                    dispatcher.active_session_count() as u64,
                )
                .with_metadata("uptime_s", started_at.elapsed().as_secs());
                if outbound.enqueue(evt).await.is_err() {
                    break;
                }
            }
    })
}

async fn handle_frame(
    connection_id: &str,
    outbound: &Arc<OutboundChannel>,
    dispatcher: &dyn EventDispatcher,
    text: &str,
) {
    let evt = match decode(text) {
        Ok(evt) => evt,
        Err(e) => {
            let err = system_error(connection_id, "invalid_frame", &e.to_string());
            let _ = outbound.enqueue(err).await;
            return;
        }
    };

    match evt.check_inbound() {
        InboundCheck::Ok => {}
        InboundCheck::NotUserEvent => {
            let err = system_error(
                connection_id,
                "unknown_event",
                &format!("{:?} is not a client-originated event", evt.event),
            );
            let _ = outbound.enqueue(err).await;
            return;
        }
        InboundCheck::MissingSessionId => {
            let err = system_error(connection_id, "bad_session", "event requires session_id");
            let _ = outbound.enqueue(err).await;
            return;
        }
        InboundCheck::MissingStepId => {
            let err = system_error(
                connection_id,
                "bad_session",
                "user.response requires step_id",
            );
            let _ = outbound.enqueue(err).await;
            return;
        }
    }

    if evt.event == EventTag::UserAck {
        if let Some(last_seq) = evt.content.get("last_seq").and_then(|v| v.as_u64()) {
            outbound.ack(last_seq);
        } else if let Some(last_event_id) =
        evt.content.get("last_event_id").and_then(|v| v.as_str())
        {
            if let Some((ack_connection_id, seq)) = parse_event_id(last_event_id) {
                if ack_connection_id == connection_id {
                    outbound.ack(seq);
                }
            }
        }
        return;
    }

    dispatcher.dispatch(connection_id, outbound.clone(), evt).await;
}

/// Split an `event_id` (`"{connection_id}-{seq}"`) into its two parts. A
/// stale `event_id` from a previous connection still parses fine here —
/// the caller is responsible for comparing `connection_id` against the
/// current connection before trimming history with `seq`.
fn parse_event_id(event_id: &str) -> Option<(String, u64)> {
    let mut parts = event_id.rsplitn(2, '-');
    let seq = parts.next()?.parse().ok()?;
    let connection_id = parts.next()?.to_string();
    Some((connection_id, seq))
}

fn system_error(connection_id: &str, kind: &str, message: &str) -> Event {
    Event::new(EventTag::SystemError)
    .with_metadata("error_kind", kind)
    .with_metadata("connection_id", connection_id.to_string())
    .with_content(message)
}
