use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use periscope_proto::{ClientMessage, ConnectionId, ServerMessage, SessionId, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::router::JoinRequest;
use crate::HubState;

/// WebSocket upgrade handler for `/signaling`.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<HubState>,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: HubState, remote_addr: Option<SocketAddr>) {
    let connection_id = ConnectionId::generate();
    let (mut sender, mut receiver) = socket.split();

    // The registry holds the only sender, so deregistering closes the socket.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state
        .router
        .connections()
        .register(connection_id.clone(), tx, remote_addr);

    let writer_id = connection_id.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => error!(connection = %writer_id, error = %err, "failed to encode message"),
            }
        }
        let _ = sender.send(Message::Close(None)).await;
        debug!(connection = %writer_id, "writer task ended");
    });

    info!(connection = %connection_id, remote = ?remote_addr, "signaling connection opened");

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection = %connection_id, error = %err, "websocket error");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(connection = %connection_id, "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => {
                debug!(connection = %connection_id, kind = message.kind(), "frame received");
                handle_client_message(&state, &connection_id, message).await;
            }
            Err(err) => {
                warn!(connection = %connection_id, error = %err, "invalid frame");
                state.router.connections().send(
                    &connection_id,
                    ServerMessage::error(format!("Invalid message format: {err}")),
                );
            }
        }
    }

    state.router.disconnect(&connection_id).await;
    info!(connection = %connection_id, "signaling connection closed");
}

async fn handle_client_message(state: &HubState, connection_id: &ConnectionId, message: ClientMessage) {
    let router = &state.router;
    match message {
        ClientMessage::JoinSession {
            session_id,
            user_id,
            user_name,
            device_id,
            role,
        } => {
            let request = JoinRequest {
                session_id,
                user_id,
                user_name,
                device_id,
                role,
            };
            if let Err(err) = router.on_join(connection_id, request).await {
                warn!(connection = %connection_id, error = %err, "join rejected");
                router
                    .connections()
                    .send(connection_id, ServerMessage::error(err.to_string()));
            }
        }
        ClientMessage::LeaveSession => {
            if let Err(err) = router.on_leave(connection_id).await {
                warn!(connection = %connection_id, error = %err, "leave failed");
            }
        }
        ClientMessage::Offer {
            to,
            sdp,
            session_id,
        } => {
            router
                .relay(SignalKind::Offer, connection_id, to, &session_id, sdp)
                .await
        }
        ClientMessage::Answer {
            to,
            sdp,
            session_id,
        } => {
            router
                .relay(SignalKind::Answer, connection_id, to, &session_id, sdp)
                .await
        }
        ClientMessage::IceCandidate {
            to,
            candidate,
            session_id,
        } => {
            router
                .relay(SignalKind::IceCandidate, connection_id, to, &session_id, candidate)
                .await
        }
        ClientMessage::ScreenShareStarted { session_id } => {
            screen_share(state, connection_id, &session_id, true).await
        }
        ClientMessage::ScreenShareStopped { session_id } => {
            screen_share(state, connection_id, &session_id, false).await
        }
        ClientMessage::Ping => {
            router.connections().touch(connection_id);
            router.connections().send(connection_id, ServerMessage::Pong);
        }
    }
}

async fn screen_share(
    state: &HubState,
    connection_id: &ConnectionId,
    session_id: &SessionId,
    started: bool,
) {
    if let Err(err) = state
        .router
        .broadcast_screen_share(connection_id, session_id, started)
        .await
    {
        warn!(connection = %connection_id, error = %err, "screen share announcement rejected");
        state
            .router
            .connections()
            .send(connection_id, ServerMessage::error(err.to_string()));
    }
}

/// Periodically disconnects connections that stopped sending pings.
pub fn spawn_heartbeat_monitor(state: HubState, every: Duration, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            for connection_id in state.router.connections().stale(timeout) {
                info!(connection = %connection_id, "removing stale connection (heartbeat timeout)");
                state.router.disconnect(&connection_id).await;
            }
        }
    })
}
