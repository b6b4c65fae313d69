mod cli;

use anyhow::Context;
use attach_server::{config::Config, telemetry, AppState};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(&cli.log_level);

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if config.credentials.is_empty() && config.bootstrap_token.is_none() {
        warn!("no credentials configured; every API request will be rejected");
    }
    if config.sessions.is_empty() {
        warn!("no sessions configured; nothing can be attached");
    }

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(
        listen = %listener.local_addr()?,
        sessions = config.sessions.len(),
        lease_ms = config.driver_lease_ms,
        "attach-server listening"
    );

    attach_server::serve(listener, AppState::new(config))
        .await
        .context("server failed")?;
    Ok(())
}
