use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::future::join_all;
use tokio::time::{Duration, interval};

use deflect::ConfigError;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// One upstream the gateway forwards allowed requests to.
#[derive(Debug)]
pub struct Upstream {
    pub url: String,
    healthy: AtomicBool,
}

impl Upstream {
    pub fn new(url: String) -> Self {
        Self {
            url,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    // Returns the previous state
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::Relaxed)
    }
}

// "host:port" or a full url, no trailing slash
fn normalize_url(raw: &str) -> String {
    let raw = raw.trim_end_matches('/');
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    }
}

/// Round-robin pool; unhealthy upstreams are skipped until a check revives them.
#[derive(Debug)]
pub struct LoadBalancer {
    upstreams: Vec<Arc<Upstream>>,
    current: AtomicUsize,
}

impl LoadBalancer {
    // Comma-separated list, e.g. "localhost:3000, https://10.0.0.2"
    pub fn new(list: &str) -> Result<Self, ConfigError> {
        let upstreams: Vec<Arc<Upstream>> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Arc::new(Upstream::new(normalize_url(s))))
            .collect();
        if upstreams.is_empty() {
            return Err(ConfigError::NoUpstreams);
        }

        for (i, u) in upstreams.iter().enumerate() {
            tracing::info!(index = i + 1, url = %u.url, "upstream registered");
        }

        Ok(Self {
            upstreams,
            current: AtomicUsize::new(0),
        })
    }

    pub fn get_upstream(&self) -> Option<Arc<Upstream>> {
        let len = self.upstreams.len();
        let start = self.current.fetch_add(1, Ordering::Relaxed) % len;
        self.upstreams
            .iter()
            .cycle()
            .skip(start)
            .take(len)
            .find(|u| u.is_healthy())
            .cloned()
    }

    pub fn all_upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    pub fn healthy_count(&self) -> usize {
        self.upstreams.iter().filter(|u| u.is_healthy()).count()
    }
}

/// An upstream is alive when `GET <url><path>` answers below 500 in time.
pub async fn check_health(client: &reqwest::Client, upstream: &Upstream, path: &str) -> bool {
    let url = format!("{}{}", upstream.url, path);
    match client.get(&url).timeout(CHECK_TIMEOUT).send().await {
        Ok(res) => !res.status().is_server_error(),
        Err(err) => {
            tracing::debug!(%url, error = %err, "health check failed");
            false
        }
    }
}

/// Re-checks every upstream each `period`, all at once.
pub async fn health_checker(
    load_balancer: Arc<LoadBalancer>,
    client: reqwest::Client,
    path: String,
    period: Duration,
) {
    let mut interval = interval(period);
    tracing::info!(?period, %path, "health checker started");

    loop {
        interval.tick().await;

        let checks = load_balancer
            .all_upstreams()
            .iter()
            .map(|u| check_health(&client, u, &path));
        let results = join_all(checks).await;

        for (upstream, healthy) in load_balancer.all_upstreams().iter().zip(results) {
            let was_healthy = upstream.set_healthy(healthy);
            match (was_healthy, healthy) {
                (false, true) => tracing::info!(upstream = %upstream.url, "upstream is healthy again"),
                (true, false) => tracing::warn!(upstream = %upstream.url, "upstream is unhealthy"),
                _ => {}
            }
        }
    }
}
