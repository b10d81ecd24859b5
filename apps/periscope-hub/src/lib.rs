//! Periscope signaling hub.
//!
//! Tracks live connections and sessions, and relays negotiation payloads
//! between the members of a session without interpreting them.

pub mod cli;
pub mod config;
pub mod connections;
pub mod error;
pub mod handlers;
pub mod router;
pub mod routing;
pub mod sessions;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use config::Config;
pub use connections::ConnectionRegistry;
pub use error::HubError;
pub use router::{JoinRequest, RelayRouter};
pub use sessions::{Session, SessionRegistry, SessionStatus};

#[derive(Clone)]
pub struct HubState {
    pub config: Arc<Config>,
    pub router: Arc<RelayRouter>,
}

impl HubState {
    pub fn new(config: Config) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let sessions = Arc::new(SessionRegistry::new(connections.clone()));
        Self {
            config: Arc::new(config),
            router: Arc::new(RelayRouter::new(connections, sessions)),
        }
    }

    /// Starts the heartbeat monitor and the ended-session sweeper.
    pub fn spawn_maintenance(&self) {
        websocket::spawn_heartbeat_monitor(
            self.clone(),
            self.config.heartbeat_interval(),
            self.config.heartbeat_timeout(),
        );
        self.router.sessions().clone().spawn_sweeper(
            self.config.sweep_interval(),
            self.config.ended_retention(),
        );
    }
}

pub fn build_router(state: HubState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/sessions",
            post(handlers::create_session).get(handlers::list_sessions),
        )
        .route("/sessions/:id", get(handlers::get_session))
        .route("/sessions/:id/end", post(handlers::end_session))
        .route("/stats", get(handlers::stats))
        .route("/signaling", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves the hub on an already bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, state: HubState) -> anyhow::Result<()> {
    state.spawn_maintenance();
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let addr = config.listen_addr();
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "periscope hub listening");
    serve(listener, HubState::new(config)).await
}
