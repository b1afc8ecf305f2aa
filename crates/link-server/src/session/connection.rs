//! Connection driver: runs one session from upgrade through disconnect.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::FuturesUnordered;
use futures::{SinkExt, StreamExt};
use link_core::RpcError;
use link_core::jsonrpc::Response;
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{DeviceSession, Session, dispatch};
use crate::config::TransportConfig;
use crate::rpc::MethodRegistry;

/// Drive `session` over `socket` until either side closes it.
///
/// Inbound frames are dispatched concurrently, but each dispatch is first
/// polled in arrival order, so handlers that enqueue work synchronously see
/// requests in the order the client sent them. On exit the session is closed,
/// the device is shut down, in-flight handlers are drained, and whatever
/// Responses they produced are flushed before the Close frame.
#[instrument(skip_all, fields(session_id = %session.id(), kind = %session.kind()))]
pub async fn run_connection(
    socket: WebSocket,
    session: Arc<Session>,
    mut outbound: mpsc::Receiver<String>,
    registry: MethodRegistry,
    device: Arc<dyn DeviceSession>,
    transport: TransportConfig,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let started = std::time::Instant::now();
    info!("client connected");
    counter!("ws_connections_total", "kind" => session.kind().as_str()).increment(1);
    gauge!("ws_connections_active").increment(1.0);

    let finish = CancellationToken::new();
    let writer_finish = finish.clone();
    let writer_session = Arc::clone(&session);
    let heartbeat_interval = transport.heartbeat_interval;
    let heartbeat_timeout = transport.heartbeat_timeout;
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(heartbeat_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = ping.tick().await;

        loop {
            tokio::select! {
                biased;
                frame = outbound.recv() => {
                    let Some(text) = frame else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        let _ = writer_session.close("socket write failed");
                        break;
                    }
                }
                () = writer_finish.cancelled() => {
                    while let Ok(text) = outbound.try_recv() {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
                _ = ping.tick() => {
                    let client = writer_session.client();
                    if !client.check_alive() && client.last_seen_elapsed() > heartbeat_timeout {
                        warn!(silent_for = ?client.last_seen_elapsed(), "client unresponsive, disconnecting");
                        let _ = writer_session.close("heartbeat timeout");
                        break;
                    }
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        let _ = writer_session.close("socket write failed");
                        break;
                    }
                }
            }
        }
    });

    let cancel = session.cancellation();
    let mut inflight = FuturesUnordered::new();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(()) = inflight.next(), if !inflight.is_empty() => {}
            frame = ws_rx.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        debug!(error = %e, "socket read failed");
                        break;
                    }
                    None => break,
                };
                session.client().mark_alive();
                let text = match frame {
                    WsMessage::Text(text) => text.to_string(),
                    WsMessage::Binary(data) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!(len = data.len(), "ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    WsMessage::Close(_) => {
                        debug!("client sent close frame");
                        break;
                    }
                    WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                };
                if text.len() > transport.max_message_size {
                    warn!(size = text.len(), max = transport.max_message_size, "inbound frame too large");
                    counter!("ws_oversized_frames_total").increment(1);
                    let error = RpcError::message_too_large(text.len(), transport.max_message_size);
                    let _ = session.send_response(Response::failure(None, &error)).await;
                    continue;
                }
                inflight.push(dispatch(&session, &registry, text));
            }
        }
    }

    let _ = session.close("socket closed");
    device.shutdown().await;
    while inflight.next().await.is_some() {}
    finish.cancel();
    if let Err(e) = writer.await {
        warn!(error = %e, "writer task failed");
    }

    info!(dropped_frames = session.client().drop_count(), "client disconnected");
    counter!("ws_disconnections_total", "kind" => session.kind().as_str()).increment(1);
    gauge!("ws_connections_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(started.elapsed().as_secs_f64());
}
