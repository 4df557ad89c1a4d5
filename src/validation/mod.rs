//! # Validation Pipeline Module
//!
//! This module implements the pluggable event validator interposed on the
//! manager's send and receive paths. Validation is layered: a cheap
//! config-driven validator covers the enumerated properties, wrappers add
//! memoization and batching, an async variant moves work onto a small
//! worker pool, and structural rules compose over JSON payloads.
//!
//! ## Layers
//!
//! - [`FastValidator`]: the enumerated cheap checks (allowed type, required
//!   fields, size bound, timestamps) without payload serialization
//! - [`CachedValidator`](cache::CachedValidator): memoizes results by
//!   event fingerprint with bounded LRU eviction
//! - [`BatchValidator`]: validates sequences in bounded batches, yielding
//!   between batches so callers can cancel
//! - [`AsyncValidator`](worker::AsyncValidator): N worker tasks over a
//!   bounded submit queue, results fetched by event id
//! - [rule composition](rules): `AllOf` / `AnyOf` / `Union` plus
//!   struct/slice/map/recursive rules over payload JSON
//!
//! ## Error Semantics
//!
//! Every rule failure yields a [`ValidationError`] naming the rule. With
//! `fail_fast` the first failure ends validation; with
//! `collect_all_errors` every failure is gathered (fail-fast wins when
//! both are set). `strict_mode` elevates recoverable warnings to
//! failures. The per-direction bypass flags short-circuit before any work
//! happens.

use crate::error::{ConfigurationError, ConfigValue, ValidationError, ValidationErrorKind};
use crate::event::Event;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub mod cache;
pub mod rules;
pub mod worker;

pub use cache::{CacheStats, CachedValidator};
pub use rules::{
    AllOf, AnyOf, MapRule, PayloadRuleValidator, RecursiveRule, SliceRule, StructRule, TypeRule,
    Union, ValidationRule, DEFAULT_MAX_DEPTH,
};
pub use worker::AsyncValidator;

/// Direction of travel for an event under validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Events arriving from the transport
    Incoming,
    /// Events submitted by the application
    Outgoing,
}

/// Configuration for the validation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Master switch; when false every event passes untouched
    pub enabled: bool,

    /// Upper bound on the estimated serialized event size, in bytes
    pub max_event_size: usize,

    /// Header fields that must be present and non-empty
    ///
    /// Recognized names: "id", "type", "timestamp".
    pub required_fields: Vec<String>,

    /// Event types accepted; empty means accept all
    pub allowed_event_types: Vec<String>,

    /// Whether to check timestamps for plausibility
    pub validate_timestamps: bool,

    /// Stop at the first failure
    pub fail_fast: bool,

    /// Gather every failure; ignored when `fail_fast` is set
    pub collect_all_errors: bool,

    /// Bypass validation on the incoming path
    pub skip_on_incoming: bool,

    /// Bypass validation on the outgoing path
    pub skip_on_outgoing: bool,

    /// Elevate recoverable warnings to failures and suppress delivery of
    /// failing incoming events
    pub strict_mode: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_event_size: 1024 * 1024, // 1MB
            required_fields: vec!["id".to_string(), "type".to_string()],
            allowed_event_types: Vec::new(),
            validate_timestamps: true,
            fail_fast: false,
            collect_all_errors: true,
            skip_on_incoming: false,
            skip_on_outgoing: false,
            strict_mode: false,
        }
    }
}

impl ValidationConfig {
    /// Validate the configuration itself
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.enabled && self.max_event_size == 0 {
            return Err(ConfigurationError::new(
                "max_event_size",
                ConfigValue::Int(0),
                "must be positive when validation is enabled",
            ));
        }
        for field in &self.required_fields {
            if !matches!(field.as_str(), "id" | "type" | "timestamp") {
                return Err(ConfigurationError::new(
                    "required_fields",
                    ConfigValue::Str(field.clone()),
                    "unknown header field (expected id, type, or timestamp)",
                ));
            }
        }
        Ok(())
    }

    /// Whether validation applies to the given direction
    pub fn applies_to(&self, direction: Direction) -> bool {
        if !self.enabled {
            return false;
        }
        match direction {
            Direction::Incoming => !self.skip_on_incoming,
            Direction::Outgoing => !self.skip_on_outgoing,
        }
    }
}

/// Outcome of validating one event
///
/// `field_errors` groups failures by the field they apply to;
/// field-agnostic failures land in `errors`. An event is valid iff both
/// collections are empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the event passed
    pub valid: bool,

    /// Failures grouped by field name
    pub field_errors: HashMap<String, Vec<ValidationError>>,

    /// Field-agnostic failures
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// A passing result
    pub fn ok() -> Self {
        Self {
            valid: true,
            field_errors: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// A failing result seeded with one error
    pub fn fail(error: ValidationError) -> Self {
        let mut result = Self::ok();
        result.push(error);
        result
    }

    /// Record a failure, routing field-scoped errors into `field_errors`
    pub fn push(&mut self, error: ValidationError) {
        self.valid = false;
        match &error.field {
            Some(field) => self
                .field_errors
                .entry(field.clone())
                .or_default()
                .push(error),
            None => self.errors.push(error),
        }
    }

    /// Fold another result into this one
    pub fn merge(&mut self, other: ValidationResult) {
        self.valid = self.valid && other.valid;
        self.errors.extend(other.errors);
        for (field, errors) in other.field_errors {
            self.field_errors.entry(field).or_default().extend(errors);
        }
    }

    /// The first recorded failure, if any
    pub fn first_error(&self) -> Option<&ValidationError> {
        self.errors
            .first()
            .or_else(|| self.field_errors.values().flat_map(|v| v.iter()).next())
    }

    /// Total number of recorded failures
    pub fn error_count(&self) -> usize {
        self.errors.len() + self.field_errors.values().map(Vec::len).sum::<usize>()
    }
}

/// The validator contract
///
/// Implementations are small composable values; the manager holds one as a
/// trait object and calls the direction-specific entry points, which
/// default to the shared `validate`.
pub trait Validator: Send + Sync {
    /// Validate an event
    fn validate(&self, event: &Event) -> ValidationResult;

    /// Validate an event arriving from the transport
    fn validate_incoming(&self, event: &Event) -> ValidationResult {
        self.validate(event)
    }

    /// Validate an event submitted by the application
    fn validate_outgoing(&self, event: &Event) -> ValidationResult {
        self.validate(event)
    }

    /// Name used in logs and cache diagnostics
    fn name(&self) -> &str {
        "validator"
    }
}

/// Config-driven validator for the enumerated cheap properties
///
/// Checks event type membership, required header fields, the estimated
/// size bound, and timestamp plausibility. Never serializes the payload;
/// the size check uses [`Event::estimated_size`].
pub struct FastValidator {
    config: ValidationConfig,
}

impl FastValidator {
    /// Create a validator for the given configuration
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// The configuration driving this validator
    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Run the enumerated checks, honoring fail-fast
    fn run_checks(&self, event: &Event) -> ValidationResult {
        let config = &self.config;
        let mut result = ValidationResult::ok();

        macro_rules! record {
            ($err:expr) => {
                result.push($err);
                if config.fail_fast {
                    return result;
                }
            };
        }

        // Required header fields.
        for field in &config.required_fields {
            match field.as_str() {
                "id" if event.id.is_empty() => {
                    record!(ValidationError::new(
                        "required-fields",
                        ValidationErrorKind::MissingRequiredField,
                        "event id is empty",
                    )
                    .with_field("id"));
                }
                "type" if event.event_type.is_empty() => {
                    record!(ValidationError::new(
                        "required-fields",
                        ValidationErrorKind::MissingRequiredField,
                        "event type is empty",
                    )
                    .with_field("type"));
                }
                "timestamp" if event.timestamp.timestamp_nanos_opt().unwrap_or(0) == 0 => {
                    record!(ValidationError::new(
                        "required-fields",
                        ValidationErrorKind::MissingRequiredField,
                        "event timestamp is zero",
                    )
                    .with_field("timestamp"));
                }
                _ => {}
            }
        }

        // Allowed event types; an empty set accepts everything.
        if !config.allowed_event_types.is_empty()
            && !config.allowed_event_types.contains(&event.event_type)
        {
            record!(ValidationError::new(
                "allowed-event-types",
                ValidationErrorKind::InvalidEventType,
                format!("event type {:?} is not allowed", event.event_type),
            )
            .with_field("type"));
        }

        // Size bound on the estimated serialized form.
        let size = event.estimated_size();
        if size > config.max_event_size {
            record!(ValidationError::new(
                "max-event-size",
                ValidationErrorKind::InvalidSize,
                format!("event size {} exceeds limit {}", size, config.max_event_size),
            ));
        }

        // Timestamp plausibility.
        if config.validate_timestamps {
            let nanos = event.timestamp.timestamp_nanos_opt().unwrap_or(0);
            if nanos == 0 {
                record!(ValidationError::new(
                    "validate-timestamps",
                    ValidationErrorKind::FieldValidationFailed,
                    "event timestamp is zero",
                )
                .with_field("timestamp"));
            } else if config.strict_mode {
                // In strict mode a timestamp more than five minutes ahead of
                // the local clock is a failure rather than a warning.
                let skew = event.timestamp.signed_duration_since(Utc::now());
                if skew > chrono::Duration::minutes(5) {
                    record!(ValidationError::new(
                        "validate-timestamps",
                        ValidationErrorKind::FieldValidationFailed,
                        format!("event timestamp is {}s in the future", skew.num_seconds()),
                    )
                    .with_field("timestamp"));
                }
            }
        }

        result
    }
}

impl Validator for FastValidator {
    fn validate(&self, event: &Event) -> ValidationResult {
        if !self.config.enabled {
            return ValidationResult::ok();
        }
        self.run_checks(event)
    }

    fn validate_incoming(&self, event: &Event) -> ValidationResult {
        if !self.config.applies_to(Direction::Incoming) {
            return ValidationResult::ok();
        }
        self.run_checks(event)
    }

    fn validate_outgoing(&self, event: &Event) -> ValidationResult {
        if !self.config.applies_to(Direction::Outgoing) {
            return ValidationResult::ok();
        }
        self.run_checks(event)
    }

    fn name(&self) -> &str {
        "fast"
    }
}

/// Batched validation over a sequence of events
///
/// Processes events in batches of `batch_size` to bound scheduler hold
/// time, yielding to the runtime between batches. The yield is also the
/// cancellation point: dropping the returned future between batches
/// abandons the remaining work.
pub struct BatchValidator {
    inner: Arc<dyn Validator>,
    batch_size: usize,
}

impl BatchValidator {
    /// Wrap a validator with the given batch size (minimum 1)
    pub fn new(inner: Arc<dyn Validator>, batch_size: usize) -> Self {
        Self {
            inner,
            batch_size: batch_size.max(1),
        }
    }

    /// Validate a slice of events, one result per event in order
    pub async fn validate_batch(&self, events: &[Event]) -> Vec<ValidationResult> {
        let mut results = Vec::with_capacity(events.len());
        for batch in events.chunks(self.batch_size) {
            for event in batch {
                results.push(self.inner.validate(event));
            }
            tokio::task::yield_now().await;
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EVENT_TYPE_DATA;

    fn config() -> ValidationConfig {
        ValidationConfig::default()
    }

    /// Test the disabled master switch passes everything
    #[test]
    fn test_disabled_passes_all() {
        let validator = FastValidator::new(ValidationConfig {
            enabled: false,
            ..config()
        });
        let bad = Event::with_id("", "", Vec::new());
        assert!(validator.validate(&bad).valid);
    }

    /// Test required field enforcement
    #[test]
    fn test_required_fields() {
        let validator = FastValidator::new(config());

        let missing_id = Event::with_id("", EVENT_TYPE_DATA, Vec::new());
        let result = validator.validate(&missing_id);
        assert!(!result.valid);
        assert!(result.field_errors.contains_key("id"));

        let missing_type = Event::with_id("evt", "", Vec::new());
        let result = validator.validate(&missing_type);
        assert!(!result.valid);
        assert_eq!(
            result.first_error().unwrap().kind,
            ValidationErrorKind::MissingRequiredField
        );
    }

    /// Test allowed event type enforcement
    #[test]
    fn test_allowed_event_types() {
        let validator = FastValidator::new(ValidationConfig {
            allowed_event_types: vec!["allowed".to_string()],
            ..config()
        });

        assert!(validator
            .validate(&Event::new("allowed", Vec::new()))
            .valid);

        let result = validator.validate(&Event::new("forbidden", Vec::new()));
        assert!(!result.valid);
        assert_eq!(
            result.first_error().unwrap().kind,
            ValidationErrorKind::InvalidEventType
        );
    }

    /// Test the size bound
    #[test]
    fn test_size_bound() {
        let validator = FastValidator::new(ValidationConfig {
            max_event_size: 64,
            ..config()
        });

        assert!(validator
            .validate(&Event::with_id("e", EVENT_TYPE_DATA, vec![0; 8]))
            .valid);

        let result = validator.validate(&Event::with_id("e", EVENT_TYPE_DATA, vec![0; 256]));
        assert!(!result.valid);
        assert_eq!(
            result.first_error().unwrap().kind,
            ValidationErrorKind::InvalidSize
        );
    }

    /// Test fail-fast stops at the first failure
    #[test]
    fn test_fail_fast() {
        let validator = FastValidator::new(ValidationConfig {
            fail_fast: true,
            allowed_event_types: vec!["allowed".to_string()],
            max_event_size: 8,
            ..config()
        });

        // Empty id, disallowed type, oversized: fail-fast reports only one.
        let event = Event::with_id("", "forbidden", vec![0; 64]);
        let result = validator.validate(&event);
        assert!(!result.valid);
        assert_eq!(result.error_count(), 1);

        // Collect-all gathers all three.
        let collecting = FastValidator::new(ValidationConfig {
            fail_fast: false,
            collect_all_errors: true,
            allowed_event_types: vec!["allowed".to_string()],
            max_event_size: 8,
            ..config()
        });
        let result = collecting.validate(&event);
        assert_eq!(result.error_count(), 3);
    }

    /// Test per-direction bypasses
    #[test]
    fn test_direction_bypass() {
        let validator = FastValidator::new(ValidationConfig {
            skip_on_incoming: true,
            ..config()
        });
        let bad = Event::with_id("", EVENT_TYPE_DATA, Vec::new());

        assert!(validator.validate_incoming(&bad).valid);
        assert!(!validator.validate_outgoing(&bad).valid);
    }

    /// Test strict mode rejects far-future timestamps
    #[test]
    fn test_strict_future_timestamp() {
        let strict = FastValidator::new(ValidationConfig {
            strict_mode: true,
            ..config()
        });
        let lenient = FastValidator::new(config());

        let mut event = Event::new(EVENT_TYPE_DATA, Vec::new());
        event.timestamp = Utc::now() + chrono::Duration::hours(2);

        assert!(lenient.validate(&event).valid);
        assert!(!strict.validate(&event).valid);
    }

    /// Test config self-validation
    #[test]
    fn test_config_validation() {
        let mut bad = config();
        bad.max_event_size = 0;
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.required_fields = vec!["nonsense".to_string()];
        assert!(bad.validate().is_err());

        assert!(config().validate().is_ok());
    }

    /// Test batch validation yields results in order
    #[tokio::test]
    async fn test_batch_validation() {
        let validator = BatchValidator::new(Arc::new(FastValidator::new(config())), 2);
        let events = vec![
            Event::with_id("a", EVENT_TYPE_DATA, Vec::new()),
            Event::with_id("", EVENT_TYPE_DATA, Vec::new()),
            Event::with_id("c", EVENT_TYPE_DATA, Vec::new()),
        ];

        let results = validator.validate_batch(&events).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].valid);
        assert!(!results[1].valid);
        assert!(results[2].valid);
    }
}
