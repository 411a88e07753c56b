// Notification websocket — registers the connection with the hub, then runs
// a writer (buffer drain + pings) and a reader (liveness only) until either
// side fails. Exactly one path deregisters from the hub.

use std::collections::HashMap;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{MAX_FRAME_BYTES, PING_INTERVAL, READ_DEADLINE, WRITE_DEADLINE};

use super::handler::GatewayState;

/// GET /ws/{id}
pub async fn notifications(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<GatewayState>,
) -> Response {
    upgrade(ws, state, resolve_client_id(Some(&id), &params))
}

/// GET /ws — the id may also arrive as a `clientId` query parameter.
pub async fn notifications_without_id(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<GatewayState>,
) -> Response {
    upgrade(ws, state, resolve_client_id(None, &params))
}

fn resolve_client_id(
    path_id: Option<&str>,
    params: &HashMap<String, String>,
) -> Option<String> {
    let from_path = path_id.map(str::trim).filter(|id| !id.is_empty());
    let from_query = params
        .get("clientId")
        .map(|id| id.trim())
        .filter(|id| !id.is_empty());
    from_path.or(from_query).map(str::to_string)
}

fn upgrade(ws: WebSocketUpgrade, state: GatewayState, client_id: Option<String>) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(state, socket, client_id))
}

async fn handle_socket(state: GatewayState, mut socket: WebSocket, client_id: Option<String>) {
    let Some(client_id) = client_id else {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "missing clientId".into(),
            })))
            .await;
        return;
    };

    info!("ws connected clientId={}", client_id);

    let feed = state.hub.subscribe(&client_id);
    let (sink, stream) = socket.split();

    tokio::spawn(write_loop(sink, feed.frames, client_id.clone()));
    read_loop(stream, feed.transport).await;

    // Sole deregistration path for this connection. Scoped to our conn id so
    // a reconnect that displaced us keeps its own registration.
    state.hub.remove_conn(&client_id, feed.conn_id);
    info!("ws disconnected clientId={}", client_id);
}

/// Drain the outbound buffer and keep the peer alive with pings. Exits when
/// the hub closes the buffer (after a close frame) or a write fails.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<String>,
    client_id: String,
) {
    let mut ping = interval(PING_INTERVAL);
    ping.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => {
                    match timeout(WRITE_DEADLINE, sink.send(Message::Text(frame.into()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            debug!("ws write failed clientId={}: {}", client_id, err);
                            return;
                        }
                        Err(_) => {
                            debug!("ws write deadline exceeded clientId={}", client_id);
                            return;
                        }
                    }
                }
                None => {
                    debug!("ws send channel closed clientId={}", client_id);
                    let _ = timeout(
                        WRITE_DEADLINE,
                        sink.send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "".into(),
                        }))),
                    )
                    .await;
                    return;
                }
            },
            _ = ping.tick() => {
                let ok = matches!(
                    timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new().into()))).await,
                    Ok(Ok(()))
                );
                if !ok {
                    debug!("ws ping failed clientId={}", client_id);
                    return;
                }
            }
        }
    }
}

/// Inbound frames are discarded — the protocol is server-push. The read
/// deadline is extended on every pong; silence means the peer is gone.
async fn read_loop(mut stream: SplitStream<WebSocket>, transport: CancellationToken) {
    let mut deadline = Instant::now() + READ_DEADLINE;

    loop {
        tokio::select! {
            _ = transport.cancelled() => return,
            _ = sleep_until(deadline) => {
                debug!("ws read deadline expired");
                return;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Pong(_))) => {
                    deadline = Instant::now() + READ_DEADLINE;
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!("ws read failed: {}", err);
                    return;
                }
            }
        }
    }
}
