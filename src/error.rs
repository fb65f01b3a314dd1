use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors detected while building a [`Deflect`](crate::Deflect) from its options.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("{name} of {secs}s is out of range")]
    DurationOutOfRange { name: &'static str, secs: u64 },

    #[error("invalid address mask {mask:?}: {source}")]
    InvalidMask {
        mask: String,
        #[source]
        source: ipnet::AddrParseError,
    },

    #[error("invalid log date format {0:?}")]
    InvalidDateFormat(String),

    #[error("log format {0:?} has no {{message}} placeholder")]
    MissingMessagePlaceholder(String),

    #[error("cannot open log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("at least one upstream is required")]
    NoUpstreams,
}

// Failures while forwarding an allowed request upstream
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no healthy upstreams available")]
    NoHealthyUpstream,

    #[error("request body rejected: {0}")]
    Body(String),

    #[error("upstream {url} failed: {source}")]
    Upstream {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match self {
            ProxyError::NoHealthyUpstream => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Body(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}
