//! WebSocket transport for runner and requester connections.
//!
//! Each text frame carries one JSON message. Outbound messages are queued
//! on a bounded channel and written by a dedicated task. The broker never
//! waits on that channel; a peer that lets it fill up is disconnected.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use taskbroker_core::{RequesterId, RunnerId};
use taskbroker_proto::{decode, decode_bytes, encode};

use crate::http::responses::{ConnectParams, ErrorResponse};
use crate::service::{ErrorBudget, PeerConnection, RequesterConnection, RunnerConnection};
use crate::state::Broker;

const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Runner WebSocket endpoint (`/runners/_ws?id=<runnerId>`).
pub async fn runner_ws(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(broker): State<Broker>,
) -> Response {
    let Some(id) = params.id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Missing runner id".to_string(),
            }),
        )
            .into_response();
    };

    ws.on_upgrade(move |socket| async move {
        let (tx, rx) = mpsc::channel(broker.config().outbound_buffer);
        let max_errors = broker.config().max_protocol_errors;
        let conn = RunnerConnection::open(broker, RunnerId::new(id), tx).await;
        serve_socket(socket, conn, rx, max_errors).await;
    })
}

/// Requester WebSocket endpoint (`/requesters/_ws[?id=<requesterId>]`).
///
/// A requester without an id is given a generated one.
pub async fn requester_ws(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(broker): State<Broker>,
) -> Response {
    let requester_id = params
        .id
        .filter(|id| !id.is_empty())
        .map(RequesterId::new)
        .unwrap_or_else(RequesterId::generate);

    ws.on_upgrade(move |socket| async move {
        let (tx, rx) = mpsc::channel(broker.config().outbound_buffer);
        let max_errors = broker.config().max_protocol_errors;
        let conn = RequesterConnection::open(broker, requester_id, tx).await;
        serve_socket(socket, conn, rx, max_errors).await;
    })
}

/// Pump frames between a socket and a connection until either side closes.
async fn serve_socket<C>(
    socket: WebSocket,
    mut conn: C,
    mut outbound: mpsc::Receiver<C::Outbound>,
    max_protocol_errors: u32,
) where
    C: PeerConnection + 'static,
{
    let peer = conn.peer();
    let (mut sink, mut stream) = socket.split();

    let writer_peer = peer.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let frame = match encode(&msg) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(peer = %writer_peer, error = %e, "Failed to encode message");
                    continue;
                }
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                debug!(peer = %writer_peer, "Socket closed while sending");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let closer = conn.closer();
    let mut budget = ErrorBudget::new(max_protocol_errors);
    loop {
        let result = tokio::select! {
            _ = closer.cancelled() => {
                warn!(peer = %peer, "Connection dropped by broker");
                break;
            }
            next = stream.next() => match next {
                Some(result) => result,
                None => break,
            },
        };
        let decoded = match result {
            Ok(Message::Text(text)) => decode::<C::Inbound>(&text),
            Ok(Message::Binary(bytes)) => decode_bytes::<C::Inbound>(&bytes),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(peer = %peer, error = %e, "WebSocket error");
                break;
            }
        };

        let failed = match decoded {
            Ok(msg) => match conn.handle(msg).await {
                Ok(()) => {
                    budget.success();
                    false
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Message dropped");
                    budget.failure()
                }
            },
            Err(e) => {
                warn!(peer = %peer, error = %e, "Malformed frame dropped");
                budget.failure()
            }
        };

        if failed {
            warn!(
                peer = %peer,
                errors = budget.consecutive(),
                "Too many protocol errors, closing connection"
            );
            break;
        }
    }

    // Dropping the connection's senders lets the writer flush and close.
    conn.close().await;
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    debug!(peer = %peer, "Connection closed");
}
