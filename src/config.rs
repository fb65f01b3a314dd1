use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::deflect::DeflectOptions;
use crate::error::ConfigError;
use crate::log::{DEFAULT_LOG_DATE_FORMAT, DEFAULT_LOG_FORMAT, LogSink, TracingSink, WriterSink};

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "deflect-gateway")]
#[command(about = "Reverse proxy that throttles abusive clients")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // Upstream servers (comma-separated)
    // Example: "localhost:3000,localhost:3001"
    #[arg(short, long, default_value = "localhost:3000")]
    pub upstreams: String,

    // Requests allowed per client within one interval
    #[arg(long, default_value_t = 100)]
    pub request_threshold: u64,

    // Counting window in seconds
    #[arg(long, default_value_t = 5)]
    pub interval: u64,

    // Block duration in seconds
    #[arg(long, default_value_t = 900)]
    pub block_duration: u64,

    // Addresses or masks that are never throttled (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub whitelist: Vec<String>,

    // Addresses or masks that are always refused (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub blacklist: Vec<String>,

    // Block/release log: off, stdout, stderr, tracing or a file path
    #[arg(long, default_value = "off")]
    pub log: String,

    #[arg(long, default_value = DEFAULT_LOG_FORMAT)]
    pub log_format: String,

    #[arg(long, default_value = DEFAULT_LOG_DATE_FORMAT)]
    pub log_date_format: String,

    // Stale client sweep in seconds, 0 (the default) disables it.
    // A swept client's next window starts one request early.
    #[arg(long, default_value_t = 0)]
    pub sweep_interval: u64,

    // Upstream health check interval in seconds
    #[arg(long, default_value_t = 30)]
    pub health_interval: u64,

    // Path requested on each upstream by the health check
    #[arg(long, default_value = "/")]
    pub health_path: String,

    // Largest request body forwarded upstream, in bytes
    #[arg(long, default_value_t = 2 * 1024 * 1024)]
    pub body_limit: usize,
}

impl Args {
    pub fn log_sink(&self) -> Result<Option<Arc<dyn LogSink>>, ConfigError> {
        let sink: Arc<dyn LogSink> = match self.log.as_str() {
            "" | "off" | "false" => return Ok(None),
            "stdout" | "-" => Arc::new(WriterSink::new(std::io::stdout())),
            "stderr" => Arc::new(WriterSink::new(std::io::stderr())),
            "tracing" => Arc::new(TracingSink),
            path => Arc::new(WriterSink::append(path)?),
        };
        Ok(Some(sink))
    }

    pub fn deflect_options(&self) -> Result<DeflectOptions, ConfigError> {
        let mut options = DeflectOptions::default()
            .request_threshold(self.request_threshold)
            .interval(Duration::from_secs(self.interval))
            .block_duration(Duration::from_secs(self.block_duration))
            .whitelist(self.whitelist.iter().map(|s| s.trim()).filter(|s| !s.is_empty()))
            .blacklist(self.blacklist.iter().map(|s| s.trim()).filter(|s| !s.is_empty()))
            .log_format(self.log_format.clone())
            .log_date_format(self.log_date_format.clone());
        if self.sweep_interval > 0 {
            options = options.sweep_interval(Duration::from_secs(self.sweep_interval));
        }
        options.log = self.log_sink()?;
        Ok(options)
    }
}
