use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use conductor_common::RunEvent;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};

use super::api::{ApiError, SharedState, parse_run_id};
use super::end_frame;
use crate::bus::Subscription;

/// Interval between server-initiated pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Close the connection if no pong arrives within this window.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Stream a run's events over a WebSocket, one JSON text frame per event.
pub async fn run_socket(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&id)?;
    let subscription = state.registry.subscribe(run_id)?;
    Ok(ws.on_upgrade(move |socket| async move {
        let (sender, receiver) = socket.split();
        run_socket_loop(sender, receiver, subscription).await;
    }))
}

pub(crate) fn event_frame(event: &RunEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(error = %e, seq = event.seq, "Failed to serialize run event");
            None
        }
    }
}

/// Forward bus events until the bus closes, the client goes away, or the
/// client stops answering pings.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut subscription: Subscription,
) {
    let run_id = subscription.run_id();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = tokio::time::Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::warn!(%run_id, "WebSocket pong timeout, closing connection");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        let Some(frame) = event_frame(&event) else { continue };
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let frame = end_frame(run_id).to_string();
                        let _ = sender.send(Message::Text(frame.into())).await;
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = tokio::time::Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%run_id, error = %e, "WebSocket receive error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    tracing::debug!(%run_id, "WebSocket subscriber detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conductor_common::{EventBody, RunId};

    #[test]
    fn test_event_frame_is_flat_json() {
        let event = RunEvent {
            seq: 2,
            ts: Utc::now(),
            body: EventBody::Exit {
                node: "research".into(),
            },
        };
        let frame: serde_json::Value = serde_json::from_str(&event_frame(&event).unwrap()).unwrap();
        assert_eq!(frame["seq"], 2);
        assert_eq!(frame["kind"], "exit");
        assert_eq!(frame["payload"]["node"], "research");
    }

    #[test]
    fn test_end_frame_names_run() {
        let id = RunId::new();
        let frame = end_frame(id);
        assert_eq!(frame["kind"], "end");
        assert_eq!(frame["run_id"], id.to_string());
    }

    #[test]
    fn test_timing_constants() {
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }
}
