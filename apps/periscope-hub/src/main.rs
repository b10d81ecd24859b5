use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use periscope_hub::cli::{self, Cli, Commands};
use periscope_hub::Config;

#[tokio::main]
async fn main() {
    // Default to INFO when RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = cli.apply(Config::from_env());

    if let Some(Commands::Watch {
        url,
        session,
        user,
        role,
    }) = cli.command
    {
        if let Err(e) = cli::run_watch_client(url, session, user, role.into()).await {
            error!("Watch client error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    info!(
        port = config.port,
        heartbeat_timeout = config.heartbeat_timeout_seconds,
        ended_retention = config.ended_retention_seconds,
        "starting periscope hub"
    );

    if let Err(e) = periscope_hub::run(config).await {
        error!("Hub error: {}", e);
        std::process::exit(1);
    }
}
