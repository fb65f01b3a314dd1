use axum::{Json, extract::State, response::IntoResponse};
use std::sync::Arc;
use crate::state::AppState;

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let healthy_upstreams = state.load_balancer.healthy_count();
    Json(serde_json::json!({
        "status": if healthy_upstreams > 0 { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "healthy_upstreams": healthy_upstreams,
        "tracked_clients": state.deflect.tracked_clients(),
        "blocked_clients": state.deflect.blocked_clients(),
    }))
}
