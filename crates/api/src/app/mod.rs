//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: pipeline wiring (broker, progress sink, checkpoint store, consumer)
//! - `routes/`: health and metrics handlers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use agentexec_infra::JobConsumer;
use agentexec_observability::PipelineMetrics;

pub mod errors;
pub mod routes;
pub mod services;

/// Something whose liveness `/health` reports.
pub trait LivenessProbe: Send + Sync {
    fn is_live(&self) -> bool;
}

impl LivenessProbe for JobConsumer {
    fn is_live(&self) -> bool {
        self.health_check()
    }
}

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub probe: Arc<dyn LivenessProbe>,
    pub metrics: PipelineMetrics,
}

impl AppState {
    pub fn new(probe: Arc<dyn LivenessProbe>, metrics: PipelineMetrics) -> Self {
        Self { probe, metrics }
    }
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .route("/metrics", get(routes::system::metrics))
        .layer(ServiceBuilder::new().layer(Extension(state)))
}
