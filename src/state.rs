use deflect::Deflect;
use std::sync::Arc;
use crate::load_balancer::LoadBalancer;
// app's shared state

pub struct AppState {
    pub client: reqwest::Client,
    pub load_balancer: Arc<LoadBalancer>,
    pub deflect: Deflect,
    pub body_limit: usize, // max bytes forwarded upstream
}
