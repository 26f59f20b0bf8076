//! rsflight-observability: Logging setup for applications using rsflight
//!
//! `rsflight-core` only emits `tracing` events and spans. This crate installs
//! a subscriber for them:
//! - JSON output for production
//! - Pretty text output for development
//! - Level taken from `RUST_LOG` or from [`LoggingSettings`](rsflight_core::LoggingSettings)

mod logging;

pub use logging::{init_logging, json_subscriber, LoggingConfig};
