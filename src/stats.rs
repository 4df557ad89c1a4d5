//! # Transport Statistics Module
//!
//! This module provides the statistics surface every transport exposes
//! through [`Transport::stats`](crate::transport::Transport::stats). A
//! [`StatsRecorder`] lives inside a transport implementation and is updated
//! on every send, receive, error, and lifecycle transition; a
//! [`TransportStats`] snapshot is what callers observe.
//!
//! ## Latency Tracking
//!
//! Per-event latency is recorded into an HDR (High Dynamic Range)
//! histogram, which provides constant-time recording and accurate
//! percentile-free mean calculation across wide value ranges. The snapshot
//! exposes the mean as `average_latency`; implementations that need full
//! percentile analysis can layer their own collection on top.
//!
//! ## Thread Safety
//!
//! Counters are relaxed atomics; only latency recording takes a lock (the
//! histogram is not lock-free). Snapshot reads are cheap and never block
//! senders for long.

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Point-in-time statistics snapshot for a transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportStats {
    /// When the current connection was established
    pub connected_at: Option<DateTime<Utc>>,

    /// Number of successful reconnects over the transport's lifetime
    pub reconnect_count: u64,

    /// Rendered form of the most recent error
    pub last_error: Option<String>,

    /// Time since the current connection was established
    pub uptime: Duration,

    /// Events successfully sent
    pub events_sent: u64,

    /// Events received
    pub events_received: u64,

    /// Payload bytes sent
    pub bytes_sent: u64,

    /// Payload bytes received
    pub bytes_received: u64,

    /// Mean per-event latency across recorded samples
    pub average_latency: Duration,

    /// Errors observed
    pub error_count: u64,

    /// When the most recent event was sent
    pub last_event_sent_at: Option<DateTime<Utc>>,

    /// When the most recent event was received
    pub last_event_received_at: Option<DateTime<Utc>>,
}

impl Default for TransportStats {
    fn default() -> Self {
        Self {
            connected_at: None,
            reconnect_count: 0,
            last_error: None,
            uptime: Duration::ZERO,
            events_sent: 0,
            events_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            average_latency: Duration::ZERO,
            error_count: 0,
            last_event_sent_at: None,
            last_event_received_at: None,
        }
    }
}

/// State the recorder keeps under its lock
struct RecorderInner {
    // 3 significant figures keeps precision within 0.1% while bounding
    // memory for latencies from nanoseconds up to the histogram max.
    latency: Histogram<u64>,
    connected_since: Option<Instant>,
    connected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_event_sent_at: Option<DateTime<Utc>>,
    last_event_received_at: Option<DateTime<Utc>>,
}

/// Mutable statistics accumulator for a transport implementation
///
/// Transports call the `record_*` methods at the corresponding points in
/// their send/receive/lifecycle paths and hand out snapshots from
/// `stats()`.
pub struct StatsRecorder {
    events_sent: AtomicU64,
    events_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    error_count: AtomicU64,
    reconnect_count: AtomicU64,
    inner: Mutex<RecorderInner>,
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRecorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self {
            events_sent: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            reconnect_count: AtomicU64::new(0),
            inner: Mutex::new(RecorderInner {
                latency: Histogram::<u64>::new(3).expect("histogram sigfig in range"),
                connected_since: None,
                connected_at: None,
                last_error: None,
                last_event_sent_at: None,
                last_event_received_at: None,
            }),
        }
    }

    /// Record a successful connect
    pub fn record_connect(&self) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.connected_since = Some(Instant::now());
        inner.connected_at = Some(Utc::now());
    }

    /// Record a disconnect; uptime stops accumulating
    pub fn record_disconnect(&self) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.connected_since = None;
        inner.connected_at = None;
    }

    /// Record a successful reconnect
    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
        self.record_connect();
    }

    /// Record a sent event of the given payload size
    pub fn record_send(&self, bytes: usize) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.last_event_sent_at = Some(Utc::now());
    }

    /// Record a received event of the given payload size
    pub fn record_receive(&self, bytes: usize) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.last_event_received_at = Some(Utc::now());
    }

    /// Record a per-event latency sample
    pub fn record_latency(&self, latency: Duration) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        // Saturate rather than fail: a sample beyond the histogram's range
        // still counts at the maximum trackable value.
        let nanos = latency.as_nanos().min(u128::from(u64::MAX)) as u64;
        let _ = inner.latency.record(nanos.max(1));
    }

    /// Record an error occurrence
    pub fn record_error(&self, error: &dyn std::fmt::Display) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.last_error = Some(error.to_string());
    }

    /// Produce a point-in-time snapshot
    pub fn snapshot(&self) -> TransportStats {
        let inner = self.inner.lock().expect("stats lock poisoned");
        let uptime = inner
            .connected_since
            .map(|since| since.elapsed())
            .unwrap_or(Duration::ZERO);
        let average_latency = if inner.latency.is_empty() {
            Duration::ZERO
        } else {
            Duration::from_nanos(inner.latency.mean() as u64)
        };

        TransportStats {
            connected_at: inner.connected_at,
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            last_error: inner.last_error.clone(),
            uptime,
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            average_latency,
            error_count: self.error_count.load(Ordering::Relaxed),
            last_event_sent_at: inner.last_event_sent_at,
            last_event_received_at: inner.last_event_received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test counters accumulate across sends and receives
    #[test]
    fn test_send_receive_counters() {
        let recorder = StatsRecorder::new();
        recorder.record_send(100);
        recorder.record_send(50);
        recorder.record_receive(75);

        let stats = recorder.snapshot();
        assert_eq!(stats.events_sent, 2);
        assert_eq!(stats.bytes_sent, 150);
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.bytes_received, 75);
        assert!(stats.last_event_sent_at.is_some());
        assert!(stats.last_event_received_at.is_some());
    }

    /// Test uptime tracks the connect state
    #[test]
    fn test_uptime() {
        let recorder = StatsRecorder::new();
        assert_eq!(recorder.snapshot().uptime, Duration::ZERO);

        recorder.record_connect();
        std::thread::sleep(Duration::from_millis(5));
        assert!(recorder.snapshot().uptime >= Duration::from_millis(5));
        assert!(recorder.snapshot().connected_at.is_some());

        recorder.record_disconnect();
        assert_eq!(recorder.snapshot().uptime, Duration::ZERO);
    }

    /// Test average latency reflects recorded samples
    #[test]
    fn test_average_latency() {
        let recorder = StatsRecorder::new();
        recorder.record_latency(Duration::from_micros(100));
        recorder.record_latency(Duration::from_micros(300));

        let average = recorder.snapshot().average_latency;
        assert!(average >= Duration::from_micros(150));
        assert!(average <= Duration::from_micros(250));
    }

    /// Test errors update the count and last-error text
    #[test]
    fn test_error_recording() {
        let recorder = StatsRecorder::new();
        recorder.record_error(&"connection reset");
        recorder.record_error(&"broken pipe");

        let stats = recorder.snapshot();
        assert_eq!(stats.error_count, 2);
        assert_eq!(stats.last_error.as_deref(), Some("broken pipe"));
    }

    /// Test reconnects bump the counter and restart uptime
    #[test]
    fn test_reconnect() {
        let recorder = StatsRecorder::new();
        recorder.record_connect();
        recorder.record_reconnect();
        let stats = recorder.snapshot();
        assert_eq!(stats.reconnect_count, 1);
        assert!(stats.connected_at.is_some());
    }
}
