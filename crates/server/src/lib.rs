//! ChatGate Server
//!
//! HTTP front end: serves the chat page and static assets, and forwards
//! `POST /chat` to the bounded-concurrency [`ChatService`].

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;

use chatgate_common::AppConfig;
use chatgate_worker::ChatService;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Build the router for `config` around an existing service
pub fn app(config: &AppConfig, service: Arc<ChatService>) -> axum::Router {
    let state = Arc::new(AppState::new(service, config));
    build_router(state, &config.server.static_dir)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(
    config: &AppConfig,
    service: Arc<ChatService>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app(config, service))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
