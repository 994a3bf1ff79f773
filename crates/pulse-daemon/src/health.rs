use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use pulse_core::config::HealthConfig;
use pulse_engine::scheduler::Scheduler;
use pulse_store::Store;

#[derive(Clone)]
pub struct HealthState {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<Store>,
}

/// GET /health — liveness probe for the monitoring daemon.
async fn health_handler(State(state): State<HealthState>) -> Json<Value> {
    let active_users = state
        .store
        .monitored_users()
        .map(|users| users.len())
        .unwrap_or(0);
    Json(json!({
        "status": "ok",
        "scheduler_running": state.scheduler.is_running(),
        "bot_running": false,
        "active_users": active_users,
    }))
}

pub async fn serve(config: HealthConfig, state: HealthState) {
    let app = Router::new()
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr, error = %e, "health endpoint bind failed");
            return;
        }
    };
    info!(addr, "health endpoint listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "health endpoint failed");
    }
}
