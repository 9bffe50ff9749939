//! Log setup for the provisioning binaries.
//!
//! Both binaries log to stderr. The agent's stdout carries the result blob,
//! and its timestamps continue from the host's elapsed time so host and agent
//! lines read as one timeline.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

/// Timer printing seconds since the start of the run.
#[derive(Debug, Clone)]
pub struct ElapsedTimer {
    base: Duration,
    start: Instant,
}

impl ElapsedTimer {
    /// Start counting from `base`, the time already elapsed elsewhere.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.base + self.start.elapsed()
    }
}

impl FormatTime for ElapsedTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "[{:>8.3}s]", self.elapsed().as_secs_f64())
    }
}

/// Filter from `RUST_LOG`, else `level`, else "info".
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber with a timer starting at `base`.
pub fn init(level: &str, base: Duration) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_timer(ElapsedTimer::new(base))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialise logging: {}", e))
}
