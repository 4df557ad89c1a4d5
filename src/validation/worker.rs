//! # Asynchronous Validation Module
//!
//! Moves validation off the caller's task onto a small worker pool.
//! Submission enqueues an (id, event) record onto a bounded queue; each of
//! the N workers pulls records, runs the wrapped validator, and publishes
//! the result under the event id. Callers fetch results by id, either
//! immediately or by waiting.
//!
//! ## Saturation
//!
//! `try_submit` never blocks: when the bounded queue is full it fails with
//! a `backpressure-active` error tagged with the `validate-submit`
//! operation, which is this pipeline's queue-full signal.
//!
//! ## Shutdown
//!
//! `shutdown` closes the submit queue, lets the workers drain what was
//! already accepted, and joins them with a bounded deadline.

use crate::error::TransportError;
use crate::event::Event;
use crate::validation::{ValidationResult, Validator};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Validator running on a pool of worker tasks
pub struct AsyncValidator {
    submit_tx: Option<mpsc::Sender<(String, Event)>>,
    results: Arc<Mutex<HashMap<String, ValidationResult>>>,
    ready: Arc<Notify>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncValidator {
    /// Spawn `worker_count` workers over a queue of `queue_capacity`
    pub fn new(inner: Arc<dyn Validator>, worker_count: usize, queue_capacity: usize) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel::<(String, Event)>(queue_capacity.max(1));
        let submit_rx = Arc::new(tokio::sync::Mutex::new(submit_rx));
        let results: Arc<Mutex<HashMap<String, ValidationResult>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let ready = Arc::new(Notify::new());

        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                let inner = inner.clone();
                let submit_rx = submit_rx.clone();
                let results = results.clone();
                let ready = ready.clone();
                tokio::spawn(async move {
                    loop {
                        let record = {
                            let mut rx = submit_rx.lock().await;
                            rx.recv().await
                        };
                        let (id, event) = match record {
                            Some(record) => record,
                            None => break,
                        };
                        let result = inner.validate(&event);
                        results
                            .lock()
                            .expect("async validator results lock poisoned")
                            .insert(id, result);
                        ready.notify_waiters();
                    }
                    debug!(worker_id, "async validation worker exited");
                })
            })
            .collect();

        Self {
            submit_tx: Some(submit_tx),
            results,
            ready,
            workers,
        }
    }

    /// Enqueue an event for validation under its own id
    ///
    /// Fails with `backpressure-active` (operation `validate-submit`) when
    /// the bounded queue is saturated, and after shutdown.
    pub fn try_submit(&self, event: Event) -> Result<(), TransportError> {
        let submit_tx = self.submit_tx.as_ref().ok_or_else(|| {
            TransportError::backpressure_active("validate-submit")
                .with_message("async validator is shut down")
        })?;
        submit_tx
            .try_send((event.id.clone(), event))
            .map_err(|_| {
                TransportError::backpressure_active("validate-submit")
                    .with_message("validation queue is full")
            })
    }

    /// Take the result for an id if it is already available
    pub fn take_result(&self, id: &str) -> Option<ValidationResult> {
        self.results
            .lock()
            .expect("async validator results lock poisoned")
            .remove(id)
    }

    /// Wait up to `wait` for the result for an id
    pub async fn wait_result(&self, id: &str, wait: Duration) -> Option<ValidationResult> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register before checking so a publish between the check and
            // the await still wakes us.
            let notified = self.ready.notified();
            if let Some(result) = self.take_result(id) {
                return Some(result);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if timeout(remaining, notified).await.is_err() {
                return self.take_result(id);
            }
        }
    }

    /// Number of results waiting to be fetched
    pub fn pending_results(&self) -> usize {
        self.results
            .lock()
            .expect("async validator results lock poisoned")
            .len()
    }

    /// Close the queue, drain accepted work, and join the workers
    ///
    /// Accepted submissions are still validated; their results remain
    /// fetchable after shutdown. Workers that fail to exit within the
    /// deadline are abandoned with a warning.
    pub async fn shutdown(&mut self, deadline: Duration) {
        self.submit_tx = None;
        for worker in self.workers.drain(..) {
            match timeout(deadline, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => warn!(error = %join_err, "async validation worker panicked"),
                Err(_) => warn!("async validation worker did not exit within deadline"),
            }
        }
    }
}

impl Drop for AsyncValidator {
    fn drop(&mut self) {
        // Closing the queue is enough: workers exit once it drains.
        self.submit_tx = None;
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EVENT_TYPE_DATA;
    use crate::validation::{FastValidator, ValidationConfig};

    fn validator(workers: usize, queue: usize) -> AsyncValidator {
        AsyncValidator::new(
            Arc::new(FastValidator::new(ValidationConfig::default())),
            workers,
            queue,
        )
    }

    /// Test submit and fetch by id
    #[tokio::test]
    async fn test_submit_and_fetch() {
        let validator = validator(2, 16);

        let good = Event::with_id("good", EVENT_TYPE_DATA, Vec::new());
        let bad = Event::with_id("", EVENT_TYPE_DATA, Vec::new());
        let bad_id = bad.id.clone();

        validator.try_submit(good).unwrap();
        validator.try_submit(bad).unwrap();

        let result = validator
            .wait_result("good", Duration::from_secs(1))
            .await
            .expect("result should arrive");
        assert!(result.valid);

        let result = validator
            .wait_result(&bad_id, Duration::from_secs(1))
            .await
            .expect("result should arrive");
        assert!(!result.valid);
    }

    /// Test queue saturation fails the submit
    #[tokio::test]
    async fn test_queue_full() {
        // One worker, capacity 1: fill the queue faster than it drains.
        let validator = validator(1, 1);

        let mut saturated = false;
        for i in 0..64 {
            let event = Event::with_id(format!("e{}", i), EVENT_TYPE_DATA, vec![0; 1024]);
            if validator.try_submit(event).is_err() {
                saturated = true;
                break;
            }
        }
        assert!(saturated, "bounded queue should saturate under burst load");
    }

    /// Test shutdown drains accepted work
    #[tokio::test]
    async fn test_shutdown_drains() {
        let mut validator = validator(2, 16);
        for i in 0..8 {
            validator
                .try_submit(Event::with_id(format!("e{}", i), EVENT_TYPE_DATA, Vec::new()))
                .unwrap();
        }

        validator.shutdown(Duration::from_secs(1)).await;
        assert_eq!(validator.pending_results(), 8);

        // Further submissions are rejected.
        let err = validator
            .try_submit(Event::new(EVENT_TYPE_DATA, Vec::new()))
            .unwrap_err();
        assert_eq!(
            err.kind(),
            crate::error::TransportErrorKind::BackpressureActive
        );
    }
}
