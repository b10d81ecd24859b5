use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use periscope_proto::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};

use crate::error::SignalingError;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket connection to the hub. Outgoing messages go through an
/// unbounded queue drained by a writer task; parsed hub messages are
/// delivered on the receiver returned from [`SignalingClient::connect`].
pub struct SignalingClient {
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingClient {
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>), SignalingError> {
        Self::connect_with_heartbeat(url, HEARTBEAT_INTERVAL).await
    }

    pub async fn connect_with_heartbeat(
        url: &str,
        heartbeat: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>), SignalingError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|err| SignalingError::Connect(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "signaling", url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "signaling", error = %err, "failed to encode message");
                        continue;
                    }
                };
                tracing::trace!(target = "signaling", event = "ws_out", kind = message.kind());
                if ws_write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "signaling", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "signaling", "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        tracing::trace!(target = "signaling", event = "ws_in", kind = message.kind());
                        if incoming_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "signaling", error = %err, "unparseable hub message");
                    }
                }
            }
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let client = Self {
            send_tx,
            tasks: vec![writer, reader, heartbeat],
        };
        Ok((client, incoming_rx))
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.send_tx.clone()
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        self.send_tx
            .send(message)
            .map_err(|_| SignalingError::ChannelClosed)
    }

    /// Stops the heartbeat and reader. The writer drains what is queued
    /// and closes the socket once every sender is dropped.
    pub fn shutdown(mut self) {
        let mut tasks = std::mem::take(&mut self.tasks).into_iter();
        drop(tasks.next());
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
