mod handlers;
mod load_balancer;
mod state;

use axum::{Router, routing::get};
use clap::Parser; // for cli
use deflect::config::Args;
use deflect::{Deflect, DeflectLayer};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::handlers::{health_handler, metrics_handler, proxy_handler};
use crate::load_balancer::{LoadBalancer, health_checker};
use crate::state::AppState;

// this is main async function with tokio
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // parse cli arguments
    let args = Args::parse();

    // bad masks, formats or log paths stop us here, not on first request
    let deflect = Deflect::new(args.deflect_options()?)?;
    let load_balancer = Arc::new(LoadBalancer::new(&args.upstreams)?);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;

    // creating shared state
    let state = Arc::new(AppState {
        client: client.clone(),
        load_balancer: Arc::clone(&load_balancer),
        deflect: deflect.clone(),
        body_limit: args.body_limit,
    });

    // background tasks
    tokio::spawn(health_checker(
        load_balancer,
        client,
        args.health_path.clone(),
        Duration::from_secs(args.health_interval),
    ));
    deflect.spawn_sweeper();

    // every route goes through deflect, including /health and /metrics
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .with_state(state)
        .layer(DeflectLayer::new(deflect));

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Gateway running on http://localhost:{}", args.port);
    tracing::info!("Forwarding to {}", args.upstreams);
    tracing::info!(
        "Deflect: {} requests per {} seconds, blocking for {} seconds",
        args.request_threshold, args.interval, args.block_duration
    );

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
