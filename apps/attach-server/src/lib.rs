//! Backend of the attach protocol: grants connection-scoped attach tokens,
//! arbitrates the driver lease per session and bridges websocket clients to
//! the session's terminal workload.

pub mod catalog;
pub mod config;
pub mod credentials;
pub mod error;
pub mod handlers;
pub mod lease;
pub mod session;
pub mod telemetry;
pub mod tokens;
pub mod websocket;
pub mod workload;

use axum::{
    routing::{get, patch, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::session::SessionHubs;
use crate::tokens::TokenStore;
use crate::workload::{SpecLauncher, WorkloadLauncher};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub credentials: Arc<CredentialStore>,
    pub tokens: Arc<TokenStore>,
    pub catalog: Arc<Catalog>,
    pub hubs: SessionHubs,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self::with_launcher(config, Arc::new(SpecLauncher))
    }

    pub fn with_launcher(config: Config, launcher: Arc<dyn WorkloadLauncher>) -> Self {
        let credentials =
            CredentialStore::from_config(&config.credentials, config.bootstrap_token.as_deref());
        let tokens = TokenStore::new(config.token_ttl());
        let catalog = Catalog::from_config(&config.sessions);
        let hubs = SessionHubs::new(launcher, config.driver_lease(), config.cleanup_grace());
        Self {
            config: Arc::new(config),
            credentials: Arc::new(credentials),
            tokens: Arc::new(tokens),
            catalog: Arc::new(catalog),
            hubs,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health_check))
        .route("/api/v1/attach-sessions/:id", get(handlers::get_session))
        .route(
            "/api/v1/attach-sessions/:id/attach-control",
            patch(handlers::update_attach_control),
        )
        .route(
            "/api/v1/attach-sessions/:id/attach-token",
            post(handlers::issue_attach_token),
        )
        .route(
            "/api/v1/attach-sessions/:id/attach-cookie",
            post(handlers::issue_attach_cookie),
        )
        .route(
            "/api/v1/attach-sessions/:id/attach",
            get(websocket::attach_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}
