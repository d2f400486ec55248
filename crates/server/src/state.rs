//! Shared application state

use chatgate_common::AppConfig;
use chatgate_worker::ChatService;
use std::path::PathBuf;
use std::sync::Arc;

/// State handed to every handler
pub struct AppState {
    pub service: Arc<ChatService>,

    /// Directory holding `index.html`
    pub templates_dir: PathBuf,

    /// Whether `/metrics` is served
    pub metrics_enabled: bool,
}

impl AppState {
    pub fn new(service: Arc<ChatService>, config: &AppConfig) -> Self {
        Self {
            service,
            templates_dir: config.server.templates_dir.clone(),
            metrics_enabled: config.observability.enable_metrics,
        }
    }
}
