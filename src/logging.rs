//! Logging and tracing initialization for bkmgr.
//!
//! Console output is compact and human readable; `json_logs` switches to
//! one JSON object per line, including the enclosing `sync_run` span so each
//! line carries its job id.

use anyhow::{Result, anyhow};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    /// Default level DEBUG instead of INFO
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    /// Filter used when `RUST_LOG` is not set.
    fn default_directive(&self) -> String {
        let level = if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };
        format!("bkmgr={}", level.as_str().to_lowercase())
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Fails if a subscriber is already installed.
pub fn init(config: LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    let result = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_thread_ids(false),
            )
            .try_init()
    };

    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

/// Lets through at most one message per interval.
///
/// Progress events arrive once per copied file; the throttle keeps the log
/// readable on large trees.
pub struct LogThrottle {
    interval_ms: u64,
    /// u64::MAX until the first message
    last_log_ms: AtomicU64,
    start: Instant,
}

const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            start: Instant::now(),
        }
    }

    /// True if the caller should log now. Safe to share between threads.
    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        let due = last == NEVER_LOGGED || now_ms.saturating_sub(last) >= self.interval_ms;
        if !due {
            return false;
        }

        // Losing the race means another thread just logged
        self.last_log_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}
