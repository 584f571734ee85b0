use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;

use super::AppState;
use crate::relay::Connection;

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    if !state.hub.registry.has_capacity() {
        log::warn!("Refusing {}: connection limit reached", remote);
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, remote, state))
}

/// Owns one peer from handshake to close: a writer task drains the peer's
/// outbound queue while this task reads and dispatches.
async fn handle_socket(socket: WebSocket, remote: SocketAddr, state: AppState) {
    let (conn, mut outbound) = Connection::new(remote, state.outbound_queue);
    if let Err(e) = state.hub.registry.register(conn.clone()) {
        log::warn!("Could not register {}: {}", remote, e);
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = sink.send(Message::Text(message.to_string())).await {
                log::debug!("Write to {} failed: {}", remote, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Err(e) = state.hub.dispatch_inbound(&conn, &text).await {
                    log::warn!("Error handling message from {}: {}", remote, e);
                }
            }
            Ok(Message::Binary(data)) => {
                log::debug!("Ignoring {}-byte binary frame from {}", data.len(), remote);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => conn.touch(),
            Err(e) => {
                log::debug!("Read from {} failed: {}", remote, e);
                break;
            }
        }
    }

    state.hub.registry.unregister(conn.id());
    writer.abort();
}
