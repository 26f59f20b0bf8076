//! Subscriber setup for the events `rsflight-core` emits.
//!
//! | Level | Event |
//! |---|---|
//! | `DEBUG` | a call started, joined, forgot or completed; a session created or disposed |
//! | `WARN` | work or a session `create` outlasted the group's slow-call threshold |
//! | `ERROR` | work, `create` or `dispose` panicked |
//!
//! Every event carries a `group` field with the configured group name.
//! Session events also sit inside a `use_resource` span. In JSON output a
//! slow call reads:
//!
//! ```json
//! {"timestamp":"2024-01-15T10:30:00.000Z","level":"WARN","fields":{"message":"slow call","group":"avatars","call_id":7,"elapsed_ms":812},"target":"rsflight_core::group"}
//! ```
//!
//! ```ignore
//! use rsflight_core::CoalesceConfig;
//! use rsflight_observability::{init_logging, LoggingConfig};
//!
//! let config = CoalesceConfig::load("rsflight.yaml")?;
//! init_logging(LoggingConfig::from_settings(&config.logging));
//! ```

use rsflight_core::LoggingSettings;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    prelude::*,
    EnvFilter,
};

/// How the global subscriber renders coalescing events.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// One JSON object per line instead of multi-line text.
    pub json: bool,
    /// Applies when `RUST_LOG` is unset. `DEBUG` shows every join and forget.
    pub level: Level,
    /// Also log entering and leaving spans such as `use_resource`.
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: Level::INFO,
            span_events: false,
        }
    }
}

impl LoggingConfig {
    pub fn json() -> Self {
        Self {
            json: true,
            ..Self::default()
        }
    }

    /// Reads the `logging` section of a
    /// [`CoalesceConfig`](rsflight_core::CoalesceConfig). An unrecognized
    /// level falls back to `INFO`.
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        Self {
            json: settings.json,
            level: settings.level.parse().unwrap_or(Level::INFO),
            span_events: false,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_span_events(mut self) -> Self {
        self.span_events = true;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))
    }

    fn fmt_span(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::ENTER | FmtSpan::EXIT
        } else {
            FmtSpan::NONE
        }
    }
}

/// Installs the process-wide subscriber.
///
/// Only the first subscriber installed in a process takes effect, so calling
/// this after a host application set up its own logging changes nothing.
///
/// ```ignore
/// use rsflight_observability::{init_logging, LoggingConfig};
///
/// // Follow every coalesced call while debugging.
/// init_logging(LoggingConfig::default().with_level(tracing::Level::DEBUG));
/// ```
pub fn init_logging(config: LoggingConfig) {
    let json = config.json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(config.fmt_span())
    });
    let text = (!config.json).then(|| fmt::layer().pretty().with_span_events(config.fmt_span()));

    let subscriber = tracing_subscriber::registry()
        .with(config.filter())
        .with(json)
        .with(text);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A subscriber writing every event at every level to `writer` as JSON.
///
/// Lets tests assert on what a group logged without touching the global
/// subscriber.
pub fn json_subscriber<W>(writer: W) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(EnvFilter::new("trace"))
        .with(fmt::layer().json().with_current_span(true).with_writer(writer))
}
