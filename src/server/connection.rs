//! One task per WebSocket subscriber.
//!
//! The task owns the socket. It waits on the subscriber's feed and writes
//! each frame with a bounded timeout; a failed or slow write marks the
//! subscriber dead so the hub drops it without ever blocking on it.

use std::fmt;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{Sink, SinkExt, StreamExt};
use tracing::{debug, info, warn};

use super::{ConnectionGuard, ServerState};
use crate::hub::{DeliveryError, SubscriberFeed};

/// Why a connection task ended.
#[derive(Debug)]
enum Exit {
    ClientClosed,
    ClientGone(String),
    Delivery(DeliveryError),
    HubClosed,
    Shutdown,
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::ClientClosed => write!(f, "client closed"),
            Exit::ClientGone(msg) => write!(f, "client gone: {}", msg),
            Exit::Delivery(e) => write!(f, "delivery failed: {}", e),
            Exit::HubClosed => write!(f, "hub closed"),
            Exit::Shutdown => write!(f, "shutdown"),
        }
    }
}

pub(crate) async fn handle_upgrade(
    State(state): State<ServerState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(%rejection, "rejected websocket handshake");
            return rejection.into_response();
        }
    };
    if state.shutdown.is_triggered() || state.hub.is_closed() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let guard = state.connections.enter();
    ws.on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| serve_subscriber(socket, state, guard))
}

async fn serve_subscriber(socket: WebSocket, state: ServerState, _guard: ConnectionGuard) {
    let (mut sink, mut stream) = socket.split();
    let write_timeout = state.settings.write_timeout;

    let mut feed = match state.hub.register() {
        Ok(feed) => feed,
        Err(e) => {
            debug!(error = %e, "refusing subscriber");
            let _ = send_close(&mut sink, write_timeout).await;
            return;
        }
    };
    let id = feed.id();
    let mut shutdown = state.shutdown.clone();
    let ping_every = state.settings.ping_interval;
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => {
                let _ = send_close(&mut sink, write_timeout).await;
                break Exit::Shutdown;
            }
            frame = feed.recv() => {
                let Some(frame) = frame else {
                    let _ = send_close(&mut sink, write_timeout).await;
                    break Exit::HubClosed;
                };
                let msg = Message::Text(frame.payload.as_ref().into());
                if let Err(e) = deliver(&mut sink, &feed, msg, write_timeout).await {
                    break Exit::Delivery(e);
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) => break Exit::ClientClosed,
                // Inbound data carries no meaning.
                Some(Ok(_)) => {}
                Some(Err(e)) => break Exit::ClientGone(e.to_string()),
                None => break Exit::ClientGone("stream ended".into()),
            },
            _ = ping.tick() => {
                let msg = Message::Ping(Bytes::new());
                if let Err(e) = deliver(&mut sink, &feed, msg, write_timeout).await {
                    break Exit::Delivery(e);
                }
            }
        }
    };

    state.hub.unregister(id);
    match exit {
        Exit::Delivery(_) | Exit::ClientGone(_) => {
            warn!(subscriber = id, reason = %exit, "connection ended")
        }
        _ => info!(subscriber = id, reason = %exit, "connection ended"),
    }
}

/// Writes to a live subscriber. A failed or slow write marks it dead, so the
/// next publish drops it from the registry.
async fn deliver<S>(
    sink: &mut S,
    feed: &SubscriberFeed,
    msg: Message,
    limit: Duration,
) -> Result<(), DeliveryError>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let result = send_with_timeout(sink, msg, limit).await;
    if result.is_err() {
        feed.mark_dead();
    }
    result
}

async fn send_with_timeout<S>(
    sink: &mut S,
    msg: Message,
    limit: Duration,
) -> Result<(), DeliveryError>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    match tokio::time::timeout(limit, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DeliveryError::Transport(e.to_string())),
        Err(_) => Err(DeliveryError::Timeout(limit)),
    }
}

async fn send_close<S>(sink: &mut S, limit: Duration) -> Result<(), DeliveryError>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let frame = CloseFrame {
        code: close_code::AWAY,
        reason: "server shutting down".into(),
    };
    send_with_timeout(sink, Message::Close(Some(frame)), limit).await
}
