use std::net::IpAddr;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::{SinkExt, StreamExt};
use periscope_proto::{ClientMessage, Role, ServerMessage, SessionId};
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "periscope-hub")]
#[command(about = "Periscope signaling hub and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Listen port (overrides PERISCOPE_HUB_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Listen address (overrides PERISCOPE_HUB_BIND)
    #[arg(long, global = true)]
    pub bind: Option<IpAddr>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the hub (default)
    Serve,
    /// Join a session over WebSocket and print every message the hub sends
    Watch {
        /// Hub URL (e.g., ws://localhost:3001)
        #[arg(short, long, default_value = "ws://localhost:3001")]
        url: String,

        /// Session ID to join
        #[arg(short, long)]
        session: String,

        /// User ID to announce
        #[arg(long, default_value = "watcher")]
        user: String,

        /// Role to join as
        #[arg(long, value_enum, default_value_t = CliRole::Client)]
        role: CliRole,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum CliRole {
    Host,
    Client,
}

impl From<CliRole> for Role {
    fn from(role: CliRole) -> Self {
        match role {
            CliRole::Host => Role::Host,
            CliRole::Client => Role::Client,
        }
    }
}

impl Cli {
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        config
    }
}

pub fn signaling_url(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    let ws_base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };
    if ws_base.ends_with("/signaling") {
        ws_base
    } else {
        format!("{ws_base}/signaling")
    }
}

pub async fn run_watch_client(url: String, session: String, user: String, role: Role) -> Result<()> {
    let ws_url = signaling_url(&url);
    debug!("Connecting to {} for session {}", ws_url, session);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow!("Connection timeout - is the hub running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let join = ClientMessage::JoinSession {
        session_id: SessionId::from(session),
        user_id: user,
        user_name: None,
        device_id: None,
        role,
    };
    write
        .send(Message::Text(serde_json::to_string(&join)?.into()))
        .await?;

    let mut heartbeat = interval(Duration::from_secs(30));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let ping = serde_json::to_string(&ClientMessage::Ping)?;
                write.send(Message::Text(ping.into())).await?;
            }
            frame = read.next() => {
                let Some(frame) = frame else { break };
                match frame? {
                    Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::Pong) => {}
                        Ok(message) => {
                            println!("{}", serde_json::to_string(&message)?);
                            if matches!(message, ServerMessage::SessionEnded { .. }) {
                                break;
                            }
                        }
                        Err(e) => warn!("Unrecognised frame from hub: {}", e),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
    Ok(())
}
