//! HTTP surface: the OpenAI-compatible inference routes and the management REST
//! surface, merged into one `axum::Router` (spec §2 "Ambient layers").

pub mod error;
pub mod inference;
pub mod management;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use llamafleet_registry::Registry;
use llamafleet_runtime::AppConfig;
use reqwest::Client;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler. Cloned cheaply (everything behind an `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Arc<AppConfig>,
    pub health_client: Client,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, config: Arc<AppConfig>) -> Self {
        let health_client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("building the health-check HTTP client");
        AppState {
            registry,
            config,
            health_client,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(inference::router())
        .merge(management::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
