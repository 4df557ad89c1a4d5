//! # Cleanup Validation Module
//!
//! The shutdown-correctness subsystem. A [`CleanupTracker`] accompanies
//! every manager lifecycle and records the resources that must be released
//! on stop: spawned tasks, open connections, timers, and subscriptions. At
//! stop, a [`CleanupValidator`] drains the tracker and evaluates a fixed
//! rule set over what remained.
//!
//! ## Rules
//!
//! 1. every tracked task finished within the drain deadline (up to a
//!    configured tolerance)
//! 2. no tracked resource remains uncleaned
//! 3. the drain completed within `validation_timeout`
//! 4. the stop reported `success`
//! 5. memory growth stayed under the configured threshold — evaluated only
//!    when a memory probe is installed, since the standard library exposes
//!    no allocator counters
//!
//! Each rule produces a structured [`CleanupRuleResult`] with a severity.
//! Cleanup validation is observability-only: failures are surfaced as
//! warnings and errors but never roll back the stop.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Kind of resource registered with the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    /// A spawned task
    Task,
    /// An open connection
    Connection,
    /// A running timer
    Timer,
    /// A subscription to a stream or channel
    Subscription,
}

/// Severity attached to a cleanup rule outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

struct TrackedResource {
    name: String,
    kind: ResourceKind,
    cleaned: bool,
}

/// Per-lifecycle registry of resources whose release is checked at stop
///
/// Cheap to clone; clones share the same registry. Components register
/// what they open and mark it cleaned when they release it; the validator
/// reads what is left.
#[derive(Clone, Default)]
pub struct CleanupTracker {
    resources: Arc<Mutex<HashMap<u64, TrackedResource>>>,
    tasks: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
    next_id: Arc<AtomicU64>,
}

impl CleanupTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource; returns the id used to mark it cleaned
    pub fn track(&self, name: impl Into<String>, kind: ResourceKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.resources
            .lock()
            .expect("cleanup tracker lock poisoned")
            .insert(
                id,
                TrackedResource {
                    name: name.into(),
                    kind,
                    cleaned: false,
                },
            );
        id
    }

    /// Mark a tracked resource as cleaned
    pub fn mark_cleaned(&self, id: u64) {
        if let Some(resource) = self
            .resources
            .lock()
            .expect("cleanup tracker lock poisoned")
            .get_mut(&id)
        {
            resource.cleaned = true;
        }
    }

    /// Register a spawned task to be joined during drain
    pub fn track_task(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .expect("cleanup tracker lock poisoned")
            .push((name.into(), handle));
    }

    /// Names of resources not yet marked cleaned
    pub fn uncleaned(&self) -> Vec<String> {
        self.resources
            .lock()
            .expect("cleanup tracker lock poisoned")
            .values()
            .filter(|resource| !resource.cleaned)
            .map(|resource| format!("{:?}:{}", resource.kind, resource.name))
            .collect()
    }

    /// Number of registered tasks not yet drained
    pub fn pending_tasks(&self) -> usize {
        self.tasks
            .lock()
            .expect("cleanup tracker lock poisoned")
            .len()
    }

    /// Join every registered task within an overall deadline
    ///
    /// Returns the names of tasks that did not finish in time; those are
    /// left running (aborting them is the caller's policy decision).
    pub async fn drain_tasks(&self, deadline: Duration) -> Vec<String> {
        let tasks: Vec<(String, JoinHandle<()>)> = self
            .tasks
            .lock()
            .expect("cleanup tracker lock poisoned")
            .drain(..)
            .collect();

        let started = Instant::now();
        let mut unfinished = Vec::new();
        for (name, handle) in tasks {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                if handle.is_finished() {
                    continue;
                }
                unfinished.push(name);
                continue;
            }
            match timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) if join_err.is_cancelled() => {}
                Ok(Err(join_err)) => {
                    warn!(task = %name, error = %join_err, "tracked task panicked");
                }
                Err(_) => unfinished.push(name),
            }
        }
        unfinished
    }
}

/// Outcome of one cleanup rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupRuleResult {
    /// Rule identifier
    pub rule: String,
    /// Whether the rule passed
    pub passed: bool,
    /// Human-readable detail
    pub message: String,
    /// How bad a failure of this rule is
    pub severity: Severity,
}

/// Aggregate cleanup validation report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Whether every rule passed
    pub success: bool,
    /// Per-rule outcomes
    pub results: Vec<CleanupRuleResult>,
    /// How long the drain-and-validate pass took
    pub duration: Duration,
}

impl CleanupReport {
    /// Rules that failed, most severe first
    pub fn failures(&self) -> Vec<&CleanupRuleResult> {
        let mut failures: Vec<&CleanupRuleResult> =
            self.results.iter().filter(|r| !r.passed).collect();
        failures.sort_by(|a, b| b.severity.cmp(&a.severity));
        failures
    }
}

/// Configuration for the cleanup validator
#[derive(Clone)]
pub struct CleanupValidatorConfig {
    /// Overall deadline for draining tracked tasks
    pub validation_timeout: Duration,

    /// Tracked tasks allowed to outlive the drain
    pub max_unfinished_tasks: usize,

    /// Memory growth tolerated across the stop, in bytes
    pub max_memory_delta_bytes: u64,

    /// Allocator probe returning currently allocated bytes
    ///
    /// When absent the memory rule reports an informational skip.
    pub memory_probe: Option<Arc<dyn Fn() -> u64 + Send + Sync>>,
}

impl Default for CleanupValidatorConfig {
    fn default() -> Self {
        Self {
            validation_timeout: Duration::from_secs(5),
            max_unfinished_tasks: 0,
            max_memory_delta_bytes: 8 * 1024 * 1024,
            memory_probe: None,
        }
    }
}

impl fmt::Debug for CleanupValidatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupValidatorConfig")
            .field("validation_timeout", &self.validation_timeout)
            .field("max_unfinished_tasks", &self.max_unfinished_tasks)
            .field("max_memory_delta_bytes", &self.max_memory_delta_bytes)
            .field("memory_probe", &self.memory_probe.is_some())
            .finish()
    }
}

/// Evaluates the cleanup rules against a drained tracker
#[derive(Debug, Clone, Default)]
pub struct CleanupValidator {
    config: CleanupValidatorConfig,
}

impl CleanupValidator {
    /// Create a validator with the given configuration
    pub fn new(config: CleanupValidatorConfig) -> Self {
        Self { config }
    }

    /// Drain the tracker and evaluate every rule
    ///
    /// `reported_success` is the stop path's own verdict (true when the
    /// transport closed cleanly and the loops exited). The report is
    /// logged at severities matching the failed rules.
    pub async fn validate(&self, tracker: &CleanupTracker, reported_success: bool) -> CleanupReport {
        let config = &self.config;
        let started = Instant::now();
        let memory_before = config.memory_probe.as_ref().map(|probe| probe());

        let unfinished = tracker.drain_tasks(config.validation_timeout).await;
        let drain_duration = started.elapsed();
        let memory_after = config.memory_probe.as_ref().map(|probe| probe());

        let mut results = Vec::new();

        results.push(CleanupRuleResult {
            rule: "tasks-joined".to_string(),
            passed: unfinished.len() <= config.max_unfinished_tasks,
            message: if unfinished.is_empty() {
                "all tracked tasks finished".to_string()
            } else {
                format!("unfinished tasks: {}", unfinished.join(", "))
            },
            severity: Severity::Error,
        });

        let uncleaned = tracker.uncleaned();
        results.push(CleanupRuleResult {
            rule: "resources-released".to_string(),
            passed: uncleaned.is_empty(),
            message: if uncleaned.is_empty() {
                "all tracked resources released".to_string()
            } else {
                format!("uncleaned resources: {}", uncleaned.join(", "))
            },
            severity: Severity::Critical,
        });

        results.push(CleanupRuleResult {
            rule: "drain-deadline".to_string(),
            passed: drain_duration <= config.validation_timeout,
            message: format!(
                "drain took {:?} (deadline {:?})",
                drain_duration, config.validation_timeout
            ),
            severity: Severity::Warning,
        });

        results.push(CleanupRuleResult {
            rule: "stop-succeeded".to_string(),
            passed: reported_success,
            message: if reported_success {
                "stop reported success".to_string()
            } else {
                "stop reported errors".to_string()
            },
            severity: Severity::Error,
        });

        match (memory_before, memory_after) {
            (Some(before), Some(after)) => {
                let delta = after.saturating_sub(before);
                results.push(CleanupRuleResult {
                    rule: "memory-delta".to_string(),
                    passed: delta <= config.max_memory_delta_bytes,
                    message: format!(
                        "memory grew by {} bytes (threshold {})",
                        delta, config.max_memory_delta_bytes
                    ),
                    severity: Severity::Warning,
                });
            }
            _ => {
                results.push(CleanupRuleResult {
                    rule: "memory-delta".to_string(),
                    passed: true,
                    message: "skipped: no memory probe configured".to_string(),
                    severity: Severity::Info,
                });
            }
        }

        let report = CleanupReport {
            success: results.iter().all(|r| r.passed),
            results,
            duration: started.elapsed(),
        };

        for failure in report.failures() {
            match failure.severity {
                Severity::Critical | Severity::Error => {
                    error!(rule = %failure.rule, "cleanup validation failed: {}", failure.message);
                }
                Severity::Warning => {
                    warn!(rule = %failure.rule, "cleanup validation warning: {}", failure.message);
                }
                Severity::Info => {
                    debug!(rule = %failure.rule, "{}", failure.message);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test a clean stop passes every rule
    #[tokio::test]
    async fn test_clean_stop_passes() {
        let tracker = CleanupTracker::new();
        let id = tracker.track("event-channel", ResourceKind::Subscription);
        tracker.track_task(
            "receive-loop",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }),
        );
        tracker.mark_cleaned(id);

        let validator = CleanupValidator::default();
        let report = validator.validate(&tracker, true).await;
        assert!(report.success, "failures: {:?}", report.failures());
    }

    /// Test uncleaned resources fail the critical rule
    #[tokio::test]
    async fn test_uncleaned_resource_fails() {
        let tracker = CleanupTracker::new();
        tracker.track("pool-connection", ResourceKind::Connection);

        let validator = CleanupValidator::default();
        let report = validator.validate(&tracker, true).await;
        assert!(!report.success);

        let failures = report.failures();
        assert_eq!(failures[0].rule, "resources-released");
        assert_eq!(failures[0].severity, Severity::Critical);
        assert!(failures[0].message.contains("pool-connection"));
    }

    /// Test a stuck task fails the drain within its deadline
    #[tokio::test]
    async fn test_stuck_task_fails() {
        let tracker = CleanupTracker::new();
        tracker.track_task(
            "stuck-worker",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }),
        );

        let validator = CleanupValidator::new(CleanupValidatorConfig {
            validation_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let report = validator.validate(&tracker, true).await;
        assert!(!report.success);
        assert!(report
            .results
            .iter()
            .any(|r| r.rule == "tasks-joined" && !r.passed));
    }

    /// Test the reported-success rule
    #[tokio::test]
    async fn test_reported_failure_rule() {
        let tracker = CleanupTracker::new();
        let validator = CleanupValidator::default();
        let report = validator.validate(&tracker, false).await;
        assert!(!report.success);
        assert!(report
            .results
            .iter()
            .any(|r| r.rule == "stop-succeeded" && !r.passed));
    }

    /// Test the memory rule runs only with a probe installed
    #[tokio::test]
    async fn test_memory_probe() {
        let tracker = CleanupTracker::new();

        // Without a probe: informational skip, still passing.
        let validator = CleanupValidator::default();
        let report = validator.validate(&tracker, true).await;
        let memory_rule = report
            .results
            .iter()
            .find(|r| r.rule == "memory-delta")
            .unwrap();
        assert!(memory_rule.passed);
        assert!(memory_rule.message.contains("skipped"));

        // With a probe reporting growth beyond the threshold: failure.
        let calls = Arc::new(AtomicU64::new(0));
        let probe_calls = calls.clone();
        let validator = CleanupValidator::new(CleanupValidatorConfig {
            max_memory_delta_bytes: 100,
            memory_probe: Some(Arc::new(move || {
                // First call (before): 0 bytes; second (after): 1MB.
                probe_calls.fetch_add(1, Ordering::SeqCst) * 1024 * 1024
            })),
            ..Default::default()
        });
        let report = validator.validate(&tracker, true).await;
        assert!(!report.success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Test task tolerance threshold
    #[tokio::test]
    async fn test_unfinished_task_tolerance() {
        let tracker = CleanupTracker::new();
        tracker.track_task(
            "slow-worker",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }),
        );

        let validator = CleanupValidator::new(CleanupValidatorConfig {
            validation_timeout: Duration::from_millis(50),
            max_unfinished_tasks: 1,
            ..Default::default()
        });
        let report = validator.validate(&tracker, true).await;
        let task_rule = report
            .results
            .iter()
            .find(|r| r.rule == "tasks-joined")
            .unwrap();
        assert!(task_rule.passed);
    }
}
