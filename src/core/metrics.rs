use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;

use super::circular_buffer::CircularBuffer;

const MAX_RECENT_ERRORS: usize = 100;
const MAX_RECENT_SAMPLES: usize = 64;
const MAX_ERROR_TEXT_BYTES: usize = 1024;
const MAX_TRACKED_MICROS: u64 = 600_000_000;

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_ERROR_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_ERROR_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn micros(latency: Duration) -> u64 {
    latency.as_micros().min(u64::MAX as u128) as u64
}

/// One entry in the recent-error ring.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub at: Instant,
    pub context: String,
    pub message: String,
}

/// Percentiles over all samples plus a short window of the most recent ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub last_us: Option<u64>,
    pub recent_mean_us: Option<u64>,
}

#[derive(Debug)]
struct LatencyWindow {
    histogram: Option<Histogram<u64>>,
    recent: CircularBuffer<u64>,
}

impl LatencyWindow {
    fn new() -> Self {
        Self {
            histogram: Histogram::new_with_bounds(1, MAX_TRACKED_MICROS, 3).ok(),
            recent: CircularBuffer::new(MAX_RECENT_SAMPLES),
        }
    }

    fn record(&mut self, latency: Duration) {
        let us = micros(latency).max(1);
        if let Some(histogram) = self.histogram.as_mut() {
            histogram.saturating_record(us);
        }
        self.recent.push(us);
    }

    fn summary(&self) -> LatencySummary {
        let (samples, p50_us, p99_us) = match self.histogram.as_ref() {
            Some(h) if h.len() > 0 => (
                h.len(),
                h.value_at_percentile(50.0),
                h.value_at_percentile(99.0),
            ),
            _ => (0, 0, 0),
        };
        let recent_mean_us = if self.recent.is_empty() {
            None
        } else {
            Some(self.recent.iter().sum::<u64>() / self.recent.len() as u64)
        };
        LatencySummary {
            samples,
            p50_us,
            p99_us,
            last_us: self.recent.back().copied(),
            recent_mean_us,
        }
    }
}

/// Counters and latency windows shared by every feed component.
///
/// Counters are plain atomics; the latency windows and the error ring sit behind short
/// non-async critical sections.
#[derive(Debug)]
pub struct FeedMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    reconnects: AtomicU64,
    connection_failures: AtomicU64,
    requests_issued: AtomicU64,
    requests_retried: AtomicU64,
    requests_deduplicated: AtomicU64,
    requests_failed: AtomicU64,
    requests_timed_out: AtomicU64,
    requests_cancelled: AtomicU64,
    handler_errors: AtomicU64,
    protocol_errors: AtomicU64,
    unknown_messages: AtomicU64,
    poll_cycles: AtomicU64,
    poll_updates_dropped: AtomicU64,
    rtt: Mutex<LatencyWindow>,
    call_latency: Mutex<LatencyWindow>,
    errors: Mutex<CircularBuffer<ErrorRecord>>,
}

/// Read-only copy of [`FeedMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnects: u64,
    pub connection_failures: u64,
    pub requests_issued: u64,
    pub requests_retried: u64,
    pub requests_deduplicated: u64,
    pub requests_failed: u64,
    pub requests_timed_out: u64,
    pub requests_cancelled: u64,
    pub handler_errors: u64,
    pub protocol_errors: u64,
    pub unknown_messages: u64,
    pub poll_cycles: u64,
    pub poll_updates_dropped: u64,
    pub rtt: LatencySummary,
    pub call_latency: LatencySummary,
    pub recent_errors: usize,
}

macro_rules! counter {
    ($($record:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $record(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl Default for FeedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            requests_issued: AtomicU64::new(0),
            requests_retried: AtomicU64::new(0),
            requests_deduplicated: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            requests_cancelled: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            unknown_messages: AtomicU64::new(0),
            poll_cycles: AtomicU64::new(0),
            poll_updates_dropped: AtomicU64::new(0),
            rtt: Mutex::new(LatencyWindow::new()),
            call_latency: Mutex::new(LatencyWindow::new()),
            errors: Mutex::new(CircularBuffer::new(MAX_RECENT_ERRORS)),
        }
    }

    counter! {
        record_sent => messages_sent,
        record_received => messages_received,
        record_reconnect => reconnects,
        record_connection_failure => connection_failures,
        record_request => requests_issued,
        record_retry => requests_retried,
        record_dedup => requests_deduplicated,
        record_request_failed => requests_failed,
        record_request_timeout => requests_timed_out,
        record_request_cancelled => requests_cancelled,
        record_handler_error => handler_errors,
        record_protocol_error => protocol_errors,
        record_unknown_message => unknown_messages,
        record_poll_cycle => poll_cycles,
        record_poll_update_dropped => poll_updates_dropped,
    }

    pub fn record_rtt(&self, latency: Duration) {
        self.rtt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(latency);
    }

    pub fn record_call_latency(&self, latency: Duration) {
        self.call_latency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(latency);
    }

    pub fn record_error(&self, context: &str, message: &str) {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ErrorRecord {
                at: Instant::now(),
                context: truncate_string(context),
                message: truncate_string(message),
            });
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_sent: load(&self.messages_sent),
            messages_received: load(&self.messages_received),
            reconnects: load(&self.reconnects),
            connection_failures: load(&self.connection_failures),
            requests_issued: load(&self.requests_issued),
            requests_retried: load(&self.requests_retried),
            requests_deduplicated: load(&self.requests_deduplicated),
            requests_failed: load(&self.requests_failed),
            requests_timed_out: load(&self.requests_timed_out),
            requests_cancelled: load(&self.requests_cancelled),
            handler_errors: load(&self.handler_errors),
            protocol_errors: load(&self.protocol_errors),
            unknown_messages: load(&self.unknown_messages),
            poll_cycles: load(&self.poll_cycles),
            poll_updates_dropped: load(&self.poll_updates_dropped),
            rtt: self.rtt.lock().unwrap_or_else(|e| e.into_inner()).summary(),
            call_latency: self
                .call_latency
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .summary(),
            recent_errors: self.errors.lock().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }
}
