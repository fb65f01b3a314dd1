use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, TextEncoder, register_counter, register_gauge, register_histogram};


lazy_static! {
    pub static ref REQUESTS_TOTAL: Counter =
        register_counter!("deflect_requests_total", "Total number of checked requests").unwrap();
    pub static ref REJECTED_TOTAL: Counter =
        register_counter!("deflect_rejected_total", "Requests answered with 403").unwrap();
    pub static ref BLOCKS_TOTAL: Counter =
        register_counter!("deflect_blocks_total", "Clients moved into the blocked state").unwrap();
    pub static ref RELEASES_TOTAL: Counter =
        register_counter!("deflect_releases_total", "Clients released after their block expired").unwrap();
    pub static ref TRACKED_CLIENTS: Gauge =
        register_gauge!("deflect_tracked_clients", "Current number of tracked clients").unwrap();
    pub static ref UPSTREAM_LATENCY: Histogram = register_histogram!(
        "gateway_upstream_latency_seconds",
        "Upstream request latency in seconds"
    )
    .unwrap();
}

// Text exposition of everything in the default registry
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
