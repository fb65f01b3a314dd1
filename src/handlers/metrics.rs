use axum::http::StatusCode;

pub async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    deflect::metrics::render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
