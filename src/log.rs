//! Line-oriented block/release log.
//!
//! This is the operator-facing log of clients entering and leaving the
//! blocked state. It is separate from the `tracing` diagnostics the crate
//! always emits and is disabled unless a sink is configured.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};

use crate::error::ConfigError;

pub const DEFAULT_LOG_FORMAT: &str = "deflect({date}): {message}";
pub const DEFAULT_LOG_DATE_FORMAT: &str = "%m/%d/%Y";

/// Anything that accepts whole lines of text.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str) -> io::Result<()>;
}

/// Wraps any writer; one line per call, flushed immediately.
pub struct WriterSink<W> {
    inner: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WriterSink<std::fs::File> {
    pub fn append(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(Self::new)
            .map_err(|source| ConfigError::LogFile {
                path: path.display().to_string(),
                source,
            })
    }
}

impl<W: Write + Send> LogSink for WriterSink<W> {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut out = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}")?;
        out.flush()
    }
}

impl<W> fmt::Debug for WriterSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterSink").finish_non_exhaustive()
    }
}

/// In-memory sink, handy for inspecting what was logged.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
        Ok(())
    }
}

/// Forwards lines to `tracing` at info level under the `deflect::log` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        tracing::info!(target: "deflect::log", "{line}");
        Ok(())
    }
}

/// `{date}` / `{message}` template plus the strftime format used for `{date}`.
#[derive(Debug, Clone)]
pub struct LogFormat {
    template: String,
    date_format: String,
}

impl LogFormat {
    pub fn new(template: impl Into<String>, date_format: impl Into<String>) -> Result<Self, ConfigError> {
        let template = template.into();
        let date_format = date_format.into();

        if !template.contains("{message}") {
            return Err(ConfigError::MissingMessagePlaceholder(template));
        }
        if StrftimeItems::new(&date_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::InvalidDateFormat(date_format));
        }

        Ok(Self { template, date_format })
    }

    pub fn render(&self, at: DateTime<Utc>, message: &str) -> String {
        let date = at.format(&self.date_format).to_string();
        self.template.replace("{date}", &date).replace("{message}", message)
    }
}

impl Default for LogFormat {
    fn default() -> Self {
        Self {
            template: DEFAULT_LOG_FORMAT.to_string(),
            date_format: DEFAULT_LOG_DATE_FORMAT.to_string(),
        }
    }
}
