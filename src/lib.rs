//! Denial-of-service throttle for axum/tower services.
//!
//! [`Deflect`] counts requests per client inside a fixed window and blocks
//! clients that go over the threshold for a while. Whitelisted clients are
//! never counted, blacklisted ones are always refused. [`DeflectLayer`]
//! wraps any service and answers deflected requests with an empty 403.
//!
//! ```no_run
//! use std::time::Duration;
//! use axum::{Router, routing::get};
//! use deflect::{Deflect, DeflectLayer, DeflectOptions, WriterSink};
//!
//! # fn main() -> Result<(), deflect::ConfigError> {
//! let deflect = Deflect::new(
//!     DeflectOptions::default()
//!         .request_threshold(20)
//!         .interval(Duration::from_secs(2))
//!         .block_duration(Duration::from_secs(60))
//!         .log(WriterSink::new(std::io::stdout())),
//! )?;
//! let app: Router = Router::new()
//!     .route("/", get(|| async { "hello" }))
//!     .layer(DeflectLayer::new(deflect));
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod clock;
pub mod config;
pub mod deflect;
pub mod error;
pub mod layer;
pub mod log;
pub mod metrics;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use deflect::{Decision, Deflect, DeflectOptions, sweeper};
pub use error::ConfigError;
pub use layer::{ClientId, DeflectLayer, DeflectService, client_id, deflected};
pub use log::{LogFormat, LogSink, MemorySink, TracingSink, WriterSink};
pub use store::{ClientRecord, CounterStore};
