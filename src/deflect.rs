//! Per-client request throttle.
//!
//! Every non-whitelisted, non-blacklisted client gets a counting window of
//! `interval`. A client that makes more than `request_threshold` requests in
//! one window is blocked for `block_duration`. Once the block runs out the
//! client starts over as if it had never been seen.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use crate::access::AddrList;
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::log::{DEFAULT_LOG_DATE_FORMAT, DEFAULT_LOG_FORMAT, LogFormat, LogSink};
use crate::metrics::{BLOCKS_TOTAL, REJECTED_TOTAL, RELEASES_TOTAL, REQUESTS_TOTAL, TRACKED_CLIENTS};
use crate::store::{Change, ClientRecord, CounterStore, Disposition};

// Durations past this are refused so that `now + duration` cannot overflow.
const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Outcome of checking one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block,
}

impl Decision {
    pub fn is_blocked(self) -> bool {
        self == Decision::Block
    }
}

// A client moving into or out of the blocked state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Blocked,
    Released,
}

/// Options recognised by [`Deflect`]. `Default` gives the stock settings.
#[derive(Clone)]
pub struct DeflectOptions {
    /// Requests allowed within one `interval`.
    pub request_threshold: u64,
    /// Length of a counting window.
    pub interval: Duration,
    /// How long a client stays blocked.
    pub block_duration: Duration,
    /// Identifiers or masks that bypass the throttle.
    pub whitelist: Vec<String>,
    /// Identifiers or masks that are always rejected.
    pub blacklist: Vec<String>,
    pub log: Option<Arc<dyn LogSink>>,
    pub log_format: String,
    pub log_date_format: String,
    /// Period of the stale-record sweeper, if one should run. See
    /// [`Deflect::sweep`] for how sweeping shifts the next window.
    pub sweep_interval: Option<Duration>,
}

impl Default for DeflectOptions {
    fn default() -> Self {
        Self {
            request_threshold: 100,
            interval: Duration::from_secs(5),
            block_duration: Duration::from_secs(900),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            log: None,
            log_format: DEFAULT_LOG_FORMAT.to_string(),
            log_date_format: DEFAULT_LOG_DATE_FORMAT.to_string(),
            sweep_interval: None,
        }
    }
}

impl DeflectOptions {
    pub fn request_threshold(mut self, threshold: u64) -> Self {
        self.request_threshold = threshold;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn block_duration(mut self, block_duration: Duration) -> Self {
        self.block_duration = block_duration;
        self
    }

    pub fn whitelist<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn blacklist<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn log(mut self, sink: impl LogSink + 'static) -> Self {
        self.log = Some(Arc::new(sink));
        self
    }

    pub fn log_format(mut self, format: impl Into<String>) -> Self {
        self.log_format = format.into();
        self
    }

    pub fn log_date_format(mut self, format: impl Into<String>) -> Self {
        self.log_date_format = format.into();
        self
    }

    pub fn sweep_interval(mut self, every: Duration) -> Self {
        self.sweep_interval = Some(every);
        self
    }
}

impl fmt::Debug for DeflectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeflectOptions")
            .field("request_threshold", &self.request_threshold)
            .field("interval", &self.interval)
            .field("block_duration", &self.block_duration)
            .field("whitelist", &self.whitelist)
            .field("blacklist", &self.blacklist)
            .field("log", &self.log.is_some())
            .field("log_format", &self.log_format)
            .field("log_date_format", &self.log_date_format)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

fn time_delta(name: &'static str, duration: Duration) -> Result<TimeDelta, ConfigError> {
    if duration.is_zero() {
        return Err(ConfigError::ZeroDuration { name });
    }
    if duration.as_secs() > MAX_DURATION_SECS {
        return Err(ConfigError::DurationOutOfRange {
            name,
            secs: duration.as_secs(),
        });
    }
    TimeDelta::from_std(duration).map_err(|_| ConfigError::DurationOutOfRange {
        name,
        secs: duration.as_secs(),
    })
}

/// Applies one request to a client's record.
///
/// The count is bumped before the window is looked at, so the request that
/// discovers an expired window is charged to the old window, and the next
/// request opens a fresh one.
fn step(
    record: &mut ClientRecord,
    now: DateTime<Utc>,
    threshold: u64,
    block: TimeDelta,
) -> (Disposition, Decision, Option<Transition>) {
    record.request_count = record.request_count.saturating_add(1);

    if record.window_expired(now) && !record.is_blocked() {
        return (Disposition::Remove, Decision::Allow, None);
    }

    if record.block_expired(now) {
        return (Disposition::Remove, Decision::Allow, Some(Transition::Released));
    }

    let mut transition = None;
    if !record.is_blocked() && record.request_count > threshold {
        record.block_expires_at = Some(now + block);
        transition = Some(Transition::Blocked);
    }

    let decision = if record.is_blocked() {
        Decision::Block
    } else {
        Decision::Allow
    };
    (Disposition::Keep, decision, transition)
}

struct Inner {
    threshold: u64,
    window: TimeDelta,
    block: TimeDelta,
    whitelist: AddrList,
    blacklist: AddrList,
    log: Option<Arc<dyn LogSink>>,
    log_format: LogFormat,
    sweep_interval: Option<Duration>,
    store: CounterStore,
    clock: Arc<dyn Clock>,
    // set once the empty identifier has been tracked
    warned_anonymous: AtomicBool,
}

/// The throttle. Cheap to clone; clones share one counter store.
#[derive(Clone)]
pub struct Deflect {
    inner: Arc<Inner>,
}

impl Deflect {
    pub fn new(options: DeflectOptions) -> Result<Self, ConfigError> {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    /// Like [`Deflect::new`] but reading time from `clock`.
    pub fn with_clock(options: DeflectOptions, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let window = time_delta("interval", options.interval)?;
        let block = time_delta("block_duration", options.block_duration)?;
        if let Some(every) = options.sweep_interval {
            if every.is_zero() {
                return Err(ConfigError::ZeroDuration { name: "sweep_interval" });
            }
        }

        let inner = Inner {
            threshold: options.request_threshold,
            window,
            block,
            whitelist: AddrList::parse(options.whitelist.as_slice())?,
            blacklist: AddrList::parse(options.blacklist.as_slice())?,
            log: options.log,
            log_format: LogFormat::new(options.log_format, options.log_date_format)?,
            sweep_interval: options.sweep_interval,
            store: CounterStore::new(),
            clock,
            warned_anonymous: AtomicBool::new(false),
        };

        tracing::info!(
            request_threshold = inner.threshold,
            interval_secs = options.interval.as_secs_f64(),
            block_secs = options.block_duration.as_secs_f64(),
            whitelisted = options.whitelist.len(),
            blacklisted = options.blacklist.len(),
            "deflect initialized"
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Decides whether a request from `client_id` may proceed.
    pub fn check(&self, client_id: &str) -> Decision {
        REQUESTS_TOTAL.inc();
        let decision = self.decide(client_id);
        if decision.is_blocked() {
            REJECTED_TOTAL.inc();
            tracing::debug!(client = client_id, "request deflected");
        }
        decision
    }

    fn decide(&self, client_id: &str) -> Decision {
        let inner = &*self.inner;
        if inner.whitelist.matches(client_id) {
            return Decision::Allow;
        }
        if inner.blacklist.matches(client_id) {
            return Decision::Block;
        }

        let now = inner.clock.now();
        let ((decision, transition), change) = inner.store.transact(client_id, now, inner.window, |record| {
            let (disposition, decision, transition) = step(record, now, inner.threshold, inner.block);
            (disposition, (decision, transition))
        });

        match change {
            Change::Inserted => {
                TRACKED_CLIENTS.inc();
                if client_id.is_empty() && !inner.warned_anonymous.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        "tracking requests without a client identifier; they all share one bucket"
                    );
                }
            }
            Change::Removed => TRACKED_CLIENTS.dec(),
            Change::Unchanged => {}
        }

        match transition {
            Some(Transition::Blocked) => {
                BLOCKS_TOTAL.inc();
                tracing::warn!(client = client_id, "client blocked");
                self.log(now, &format!("blocked {client_id}"));
            }
            Some(Transition::Released) => self.released(now, client_id),
            None => {}
        }
        decision
    }

    fn released(&self, now: DateTime<Utc>, client_id: &str) {
        RELEASES_TOTAL.inc();
        tracing::info!(client = client_id, "client released");
        self.log(now, &format!("released {client_id}"));
    }

    fn log(&self, now: DateTime<Utc>, message: &str) {
        let Some(sink) = &self.inner.log else {
            return;
        };
        let line = self.inner.log_format.render(now, message);
        if let Err(e) = sink.write_line(&line) {
            tracing::warn!(error = %e, "deflect log write failed");
        }
    }

    pub fn is_whitelisted(&self, client_id: &str) -> bool {
        self.inner.whitelist.matches(client_id)
    }

    pub fn is_blacklisted(&self, client_id: &str) -> bool {
        self.inner.blacklist.matches(client_id)
    }

    /// Snapshot of the record held for `client_id`.
    pub fn record(&self, client_id: &str) -> Option<ClientRecord> {
        self.inner.store.get(client_id)
    }

    pub fn tracked_clients(&self) -> usize {
        self.inner.store.len()
    }

    pub fn blocked_clients(&self) -> usize {
        self.inner.store.blocked_count()
    }

    /// Drops records whose window or block has run out and returns how many
    /// blocks were released.
    ///
    /// A swept client's next request opens a fresh window and is counted in
    /// it. Left alone, that request would have been charged to the expired
    /// record and only the one after it would open the window, so sweeping
    /// costs the client one request of its next window.
    pub fn sweep(&self) -> usize {
        let now = self.inner.clock.now();
        let purged = self.inner.store.purge(now);
        TRACKED_CLIENTS.sub(purged.removed as f64);

        for client_id in &purged.released {
            self.released(now, client_id);
        }
        tracing::debug!(
            removed = purged.removed,
            released = purged.released.len(),
            "swept stale clients"
        );
        purged.released.len()
    }

    /// Starts [`sweeper`] on the current runtime when a sweep interval is configured.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let every = self.inner.sweep_interval?;
        Some(tokio::spawn(sweeper(self.clone(), every)))
    }
}

impl fmt::Debug for Deflect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deflect")
            .field("request_threshold", &self.inner.threshold)
            .field("tracked_clients", &self.inner.store.len())
            .finish_non_exhaustive()
    }
}

/// Periodically sweeps `deflect` until the task is dropped.
pub async fn sweeper(deflect: Deflect, every: Duration) {
    let mut interval = interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(interval = ?every, "deflect sweeper started");

    loop {
        interval.tick().await;
        deflect.sweep();
    }
}
