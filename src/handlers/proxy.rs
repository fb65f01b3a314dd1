use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::response::Response;
use deflect::error::ProxyError;
use deflect::metrics::UPSTREAM_LATENCY;
use std::sync::Arc;
use std::time::Instant;
use crate::state::AppState;

// Connection-scoped headers, never forwarded
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers
}

// Forwards everything deflect lets through to the next healthy upstream
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response, ProxyError> {
    let upstream = state
        .load_balancer
        .get_upstream()
        .ok_or(ProxyError::NoHealthyUpstream)?;

    let (parts, body) = req.into_parts();
    let body = to_bytes(body, state.body_limit)
        .await
        .map_err(|e| ProxyError::Body(e.to_string()))?;

    let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let url = format!("{}{}", upstream.url, path);
    tracing::debug!(method = %parts.method, %url, "forwarding");

    let start_time = Instant::now();
    let result = state
        .client
        .request(parts.method, &url)
        .headers(strip_hop_by_hop(parts.headers))
        .body(body)
        .send()
        .await;

    let res = match result {
        Ok(res) => res,
        // Marking upstream as unhealthy on error, the health checker brings it back
        Err(source) => {
            upstream.set_healthy(false);
            tracing::warn!(upstream = %upstream.url, error = %source, "upstream failed, marked unhealthy");
            return Err(ProxyError::Upstream { url, source });
        }
    };

    let status = res.status();
    let headers = strip_hop_by_hop(res.headers().clone());
    let bytes = res
        .bytes()
        .await
        .map_err(|source| ProxyError::Upstream { url: url.clone(), source })?;

    UPSTREAM_LATENCY.observe(start_time.elapsed().as_secs_f64());

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
