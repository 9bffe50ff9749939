//! Transfer progress tracking.
//!
//! Each flash task owns one `ProgressSink` and is its only writer. The
//! orchestrator holds clones of every sink in a `ProgressReporter` and reads
//! them on a timer to log the aggregate.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Number of samples used to estimate transfer rate.
const RATE_ESTIMATION_WINDOW: usize = 5;

/// Format `n` with a K/M/G/T suffix and three significant digits.
pub fn format_unit(n: f64) -> String {
    let mut n = n;
    let mut unit = "";
    for u in ["", "K", "M", "G", "T"] {
        unit = u;
        if n < 1000.0 {
            break;
        }
        if u != "T" {
            n /= 1000.0;
        }
    }
    let digits = if n >= 100.0 {
        0
    } else if n >= 10.0 {
        1
    } else {
        2
    };
    let s = format!("{:.*}", digits, n);
    let s = if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    };
    format!("{}{}", s, unit)
}

/// Format `n` out of `total` bytes, or just `n` once complete.
pub fn format_size(n: u64, total: u64) -> String {
    if n == total {
        return format!("{}B", format_unit(n as f64));
    }
    format!("{}B/{}B", format_unit(n as f64), format_unit(total as f64))
}

#[derive(Debug, Default)]
struct SinkState {
    written: AtomicU64,
    total: AtomicU64,
}

/// Named byte counter for one transfer.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    name: Arc<str>,
    state: Arc<SinkState>,
}

impl ProgressSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            state: Arc::new(SinkState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the number of bytes expected. Called before the transfer starts.
    pub fn set_total(&self, total: u64) {
        self.state.total.store(total, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.state.written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn written(&self) -> u64 {
        self.state.written.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.state.total.load(Ordering::Relaxed)
    }

    /// `[name n/total]`
    pub fn stats(&self) -> String {
        format!("[{} {}]", self.name, format_size(self.written(), self.total()))
    }
}

/// Reader adapter that counts every byte read into a sink.
pub struct ProgressReader<R> {
    inner: R,
    sink: ProgressSink,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(inner: R, sink: ProgressSink) -> Self {
        Self { inner, sink }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.sink.add(n as u64);
        Ok(n)
    }
}

/// Sliding-window rate estimate over cumulative samples.
#[derive(Debug)]
pub struct RateEstimator {
    samples: VecDeque<(Instant, f64)>,
    window: usize,
}

impl RateEstimator {
    pub fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window + 1),
            window: window.max(2),
        }
    }

    /// Record the cumulative `value` now and return the rate per second.
    pub fn add_record(&mut self, value: f64) -> f64 {
        self.add_record_at(Instant::now(), value)
    }

    pub fn add_record_at(&mut self, at: Instant, value: f64) -> f64 {
        self.samples.push_back((at, value));
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let secs = last.0.duration_since(first.0).as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (last.1 - first.1) / secs
    }
}

/// Aggregates the progress of a group of sinks.
#[derive(Debug)]
pub struct ProgressReporter {
    sinks: Vec<ProgressSink>,
    rate: RateEstimator,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            rate: RateEstimator::new(RATE_ESTIMATION_WINDOW),
        }
    }

    /// Create a sink that reports into this reporter.
    pub fn sink(&mut self, name: &str) -> ProgressSink {
        let sink = ProgressSink::new(name);
        self.sinks.push(sink.clone());
        sink
    }

    pub fn written(&self) -> u64 {
        self.sinks.iter().map(|s| s.written()).sum()
    }

    pub fn total(&self) -> u64 {
        self.sinks.iter().map(|s| s.total()).sum()
    }

    /// One-line summary: overall percent, bit rate, then each sink.
    pub fn report(&mut self) -> String {
        let written = self.written();
        let total = self.total().max(1);
        let per_sink: Vec<String> = self.sinks.iter().map(|s| s.stats()).collect();
        let bps = self.rate.add_record((written * 8) as f64);
        format!(
            "{:5.1}% {}bps {}",
            written as f64 / total as f64 * 100.0,
            format_unit(bps),
            per_sink.join(" ")
        )
    }
}
