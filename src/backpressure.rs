//! # Backpressure Handler Module
//!
//! This module implements the bounded event queue that decouples transport
//! delivery rate from consumer consumption rate. A producer submits
//! envelopes against a configured overflow strategy; consumers take them in
//! FIFO order. Occupancy watermarks produce advisory signals without ever
//! changing the configured strategy.
//!
//! ## Overflow Strategies
//!
//! | Strategy | Full-buffer behavior |
//! |---|---|
//! | `None` | Submission fails immediately with `backpressure-active` |
//! | `DropOldest` | Head (oldest) element evicted, submission succeeds |
//! | `DropNewest` | Submitted element discarded, submission succeeds |
//! | `Block` | Submission waits until space is available |
//! | `BlockWithTimeout` | As `Block`, failing with `backpressure-timeout` |
//!
//! ## Ordering
//!
//! The buffer is FIFO under every strategy. `DropOldest` preserves the
//! relative order of surviving elements; only the prefix is lost.
//!
//! ## Concurrency
//!
//! Safe for many concurrent producers and one-or-more consumers. Producers
//! are serialized by the entry lock; blocked producers and waiting
//! consumers suspend on separate `Notify` handles. Metrics are plain
//! atomics so reading a snapshot never contends with the queue lock.

use crate::error::{ConfigurationError, ConfigValue, TransportError};
use crate::event::EnvelopedEvent;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Overflow policy applied when a submission finds the buffer full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowStrategy {
    /// Fail the submission immediately
    None,
    /// Evict the oldest buffered element and accept the new one
    DropOldest,
    /// Discard the submitted element
    DropNewest,
    /// Wait indefinitely for space
    Block,
    /// Wait up to `block_timeout` for space
    BlockWithTimeout,
}

/// Configuration for the backpressure handler
///
/// `high_watermark` and `low_watermark` are fractions of `buffer_size` in
/// [0, 1] with `low < high`. Crossing the high mark upward records a hit
/// and emits a warning; falling back through the low mark records
/// recovery. Marks are advisory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Overflow policy for full-buffer submissions
    pub strategy: OverflowStrategy,

    /// Bound of the internal queue; must be positive
    pub buffer_size: usize,

    /// Fraction of occupancy that counts as high pressure
    pub high_watermark: f64,

    /// Fraction of occupancy that counts as recovered
    pub low_watermark: f64,

    /// Wait bound for `BlockWithTimeout`; ignored by other strategies
    pub block_timeout: Duration,

    /// Whether to update the metrics counters
    pub enable_metrics: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            strategy: OverflowStrategy::Block,
            buffer_size: 1024,
            high_watermark: 0.8,
            low_watermark: 0.2,
            block_timeout: Duration::from_secs(5),
            enable_metrics: true,
        }
    }
}

impl BackpressureConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.buffer_size == 0 {
            return Err(ConfigurationError::new(
                "buffer_size",
                ConfigValue::Int(0),
                "must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.high_watermark) {
            return Err(ConfigurationError::new(
                "high_watermark",
                ConfigValue::Float(self.high_watermark),
                "must be a fraction in [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.low_watermark) {
            return Err(ConfigurationError::new(
                "low_watermark",
                ConfigValue::Float(self.low_watermark),
                "must be a fraction in [0, 1]",
            ));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(ConfigurationError::new(
                "low_watermark",
                ConfigValue::Float(self.low_watermark),
                "must be below high_watermark",
            ));
        }
        if self.strategy == OverflowStrategy::BlockWithTimeout && self.block_timeout.is_zero() {
            return Err(ConfigurationError::new(
                "block_timeout",
                ConfigValue::Int(0),
                "must be non-zero for block-with-timeout",
            ));
        }
        Ok(())
    }
}

/// Snapshot of backpressure counters and gauges
///
/// All counters are monotonic over the lifetime of a handler. The snapshot
/// is assembled from atomics; it never takes the queue lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureMetrics {
    /// Events evicted or discarded by a drop strategy
    pub events_dropped: u64,

    /// Submissions that had to wait for space
    pub events_blocked: u64,

    /// Upward crossings of the high watermark
    pub high_watermark_hits: u64,

    /// Current queue occupancy
    pub current_buffer_size: usize,

    /// Peak queue occupancy observed
    pub max_buffer_size: usize,

    /// When the most recent drop happened
    pub last_drop_time: Option<DateTime<Utc>>,
}

/// Atomic metric storage shared between producers and consumers
#[derive(Default)]
struct MetricsInner {
    events_dropped: AtomicU64,
    events_blocked: AtomicU64,
    high_watermark_hits: AtomicU64,
    current_buffer_size: AtomicU64,
    max_buffer_size: AtomicU64,
    // Unix nanos of the last drop; 0 means "never".
    last_drop_ns: AtomicU64,
}

impl MetricsInner {
    fn record_drop(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
        self.last_drop_ns.store(now, Ordering::Relaxed);
    }

    fn record_occupancy(&self, occupancy: usize) {
        self.current_buffer_size
            .store(occupancy as u64, Ordering::Relaxed);
        self.max_buffer_size
            .fetch_max(occupancy as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BackpressureMetrics {
        let last_drop_ns = self.last_drop_ns.load(Ordering::Relaxed);
        BackpressureMetrics {
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_blocked: self.events_blocked.load(Ordering::Relaxed),
            high_watermark_hits: self.high_watermark_hits.load(Ordering::Relaxed),
            current_buffer_size: self.current_buffer_size.load(Ordering::Relaxed) as usize,
            max_buffer_size: self.max_buffer_size.load(Ordering::Relaxed) as usize,
            last_drop_time: if last_drop_ns == 0 {
                None
            } else {
                Some(Utc.timestamp_nanos(last_drop_ns as i64))
            },
        }
    }
}

/// Queue state guarded by the entry lock
struct QueueState {
    items: VecDeque<EnvelopedEvent>,
    closed: bool,
    // Set while occupancy sits above the high watermark; cleared when it
    // falls back through the low watermark.
    above_high: bool,
}

struct Shared {
    config: BackpressureConfig,
    queue: Mutex<QueueState>,
    // Woken when space frees up (blocked producers).
    space: Notify,
    // Woken when an item arrives (waiting consumers).
    items: Notify,
    metrics: MetricsInner,
}

/// Bounded event queue with a pluggable overflow policy
///
/// Cheap to clone; all clones share the same buffer, metrics, and close
/// state. The manager submits received envelopes on one side and pumps
/// them to the public channel from the other; tests drive both sides
/// directly.
#[derive(Clone)]
pub struct BackpressureHandler {
    shared: Arc<Shared>,
}

impl BackpressureHandler {
    /// Create a handler for the given configuration
    ///
    /// Fails with an `invalid-configuration` error when the configuration
    /// does not validate.
    pub fn new(config: BackpressureConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                queue: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    closed: false,
                    above_high: false,
                }),
                space: Notify::new(),
                items: Notify::new(),
                metrics: MetricsInner::default(),
            }),
        })
    }

    /// Create a handler with the default configuration
    pub fn with_defaults() -> Self {
        Self::new(BackpressureConfig::default()).expect("default config is valid")
    }

    /// Submit an envelope under the configured overflow policy
    ///
    /// Returns immediately for every strategy except `Block` and
    /// `BlockWithTimeout`, which suspend until space is available. An
    /// envelope accepted into the buffer is not retractable: cancelling a
    /// blocked submission never removes previously accepted elements.
    ///
    /// After [`close`](Self::close), submissions fail with
    /// `backpressure-active`.
    pub async fn submit(&self, envelope: EnvelopedEvent) -> Result<(), TransportError> {
        let shared = &self.shared;
        let strategy = shared.config.strategy;
        let capacity = shared.config.buffer_size;

        // Fast path: try to enqueue under the entry lock.
        let envelope = {
            let mut queue = shared.queue.lock().expect("backpressure lock poisoned");
            if queue.closed {
                return Err(TransportError::backpressure_active("submit")
                    .with_message("handler is closed"));
            }
            if queue.items.len() < capacity {
                self.push_locked(&mut queue, envelope);
                shared.items.notify_one();
                return Ok(());
            }

            match strategy {
                OverflowStrategy::None => {
                    return Err(TransportError::backpressure_active("submit"));
                }
                OverflowStrategy::DropOldest => {
                    let evicted = queue.items.pop_front();
                    if shared.config.enable_metrics {
                        shared.metrics.record_drop();
                    }
                    if let Some(evicted) = evicted {
                        debug!(event_id = %evicted.event.id, "evicted oldest event under drop-oldest");
                    }
                    self.push_locked(&mut queue, envelope);
                    shared.items.notify_one();
                    return Ok(());
                }
                OverflowStrategy::DropNewest => {
                    if shared.config.enable_metrics {
                        shared.metrics.record_drop();
                    }
                    debug!(event_id = %envelope.event.id, "discarded newest event under drop-newest");
                    return Ok(());
                }
                OverflowStrategy::Block | OverflowStrategy::BlockWithTimeout => {
                    // Fall through to the blocking path below, keeping the
                    // envelope. The blocked counter counts submissions, not
                    // wait iterations.
                    if shared.config.enable_metrics {
                        shared.metrics.events_blocked.fetch_add(1, Ordering::Relaxed);
                    }
                    envelope
                }
            }
        };

        match strategy {
            OverflowStrategy::Block => self.submit_blocking(envelope).await,
            OverflowStrategy::BlockWithTimeout => {
                let block_timeout = shared.config.block_timeout;
                match timeout(block_timeout, self.submit_blocking(envelope)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::backpressure_timeout("submit", block_timeout)),
                }
            }
            _ => unreachable!("only blocking strategies reach the wait path"),
        }
    }

    /// Wait for space and enqueue
    async fn submit_blocking(&self, envelope: EnvelopedEvent) -> Result<(), TransportError> {
        let shared = &self.shared;
        let capacity = shared.config.buffer_size;
        loop {
            // Register interest before re-checking so a permit stored by a
            // concurrent dequeue is not lost between the check and the await.
            let notified = shared.space.notified();
            {
                let mut queue = shared.queue.lock().expect("backpressure lock poisoned");
                if queue.closed {
                    return Err(TransportError::backpressure_active("submit")
                        .with_message("handler is closed"));
                }
                if queue.items.len() < capacity {
                    self.push_locked(&mut queue, envelope);
                    shared.items.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Enqueue under the lock and maintain occupancy metrics and watermarks
    fn push_locked(&self, queue: &mut QueueState, envelope: EnvelopedEvent) {
        let shared = &self.shared;
        queue.items.push_back(envelope);
        let occupancy = queue.items.len();
        if shared.config.enable_metrics {
            shared.metrics.record_occupancy(occupancy);
        }

        let high = (shared.config.high_watermark * shared.config.buffer_size as f64).ceil() as usize;
        if !queue.above_high && high > 0 && occupancy >= high {
            queue.above_high = true;
            if shared.config.enable_metrics {
                shared
                    .metrics
                    .high_watermark_hits
                    .fetch_add(1, Ordering::Relaxed);
            }
            warn!(
                occupancy,
                capacity = shared.config.buffer_size,
                "event buffer crossed high watermark"
            );
        }
    }

    /// Take the next envelope in FIFO order
    ///
    /// Suspends until an envelope is available. Returns `None` once the
    /// handler is closed and drained. Safe to call from multiple consumer
    /// tasks; each envelope is delivered to exactly one of them.
    pub async fn recv(&self) -> Option<EnvelopedEvent> {
        let shared = &self.shared;
        loop {
            let notified = shared.items.notified();
            {
                let mut queue = shared.queue.lock().expect("backpressure lock poisoned");
                if let Some(envelope) = self.pop_locked(&mut queue) {
                    return Some(envelope);
                }
                if queue.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take the next envelope without waiting
    pub fn try_recv(&self) -> Option<EnvelopedEvent> {
        let mut queue = self.shared.queue.lock().expect("backpressure lock poisoned");
        self.pop_locked(&mut queue)
    }

    /// Dequeue under the lock, maintaining occupancy metrics and watermarks
    fn pop_locked(&self, queue: &mut QueueState) -> Option<EnvelopedEvent> {
        let shared = &self.shared;
        let envelope = queue.items.pop_front()?;
        let occupancy = queue.items.len();
        if shared.config.enable_metrics {
            shared.metrics.record_occupancy(occupancy);
        }

        let low = (shared.config.low_watermark * shared.config.buffer_size as f64) as usize;
        if queue.above_high && occupancy <= low {
            queue.above_high = false;
            debug!(occupancy, "event buffer recovered below low watermark");
        }

        shared.space.notify_one();
        Some(envelope)
    }

    /// Current queue occupancy
    pub fn len(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("backpressure lock poisoned")
            .items
            .len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the handler has been closed
    pub fn is_closed(&self) -> bool {
        self.shared
            .queue
            .lock()
            .expect("backpressure lock poisoned")
            .closed
    }

    /// Snapshot the metrics counters
    pub fn metrics(&self) -> BackpressureMetrics {
        self.shared.metrics.snapshot()
    }

    /// The configuration this handler was built with
    pub fn config(&self) -> &BackpressureConfig {
        &self.shared.config
    }

    /// Close the handler
    ///
    /// Idempotent. Blocked producers fail with `backpressure-active`;
    /// consumers drain the remaining elements and then observe end of
    /// stream.
    pub fn close(&self) {
        let mut queue = self.shared.queue.lock().expect("backpressure lock poisoned");
        if queue.closed {
            return;
        }
        queue.closed = true;
        drop(queue);
        self.shared.space.notify_waiters();
        self.shared.items.notify_waiters();
        debug!("backpressure handler closed");
    }
}
