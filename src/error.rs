//! # Error Taxonomy Module
//!
//! This module defines the stable error surface shared by every component of
//! the event-transport core. All failures are expressed as a structured
//! [`TransportError`] carrying a sentinel [`TransportErrorKind`], the name of
//! the transport involved (where applicable), the operation that failed, an
//! optional underlying cause, and two classification flags.
//!
//! ## Classification Flags
//!
//! - **temporary**: the same operation may succeed if retried soon (e.g. a
//!   full buffer that is being drained)
//! - **retryable**: the caller may safely retry the operation, possibly after
//!   corrective action (e.g. binding a new transport after `NotConnected`)
//!
//! Every `temporary` error is also `retryable`; the converse does not hold.
//!
//! ## Cause Chains
//!
//! A transport error wraps its underlying cause such that the cause can be
//! recovered through `std::error::Error::source`. Errors produced by
//! third-party code are carried as boxed error objects.
//!
//! ## Companion Error Types
//!
//! - [`ConfigurationError`]: typed per-field configuration failure with the
//!   offending value preserved as a [`ConfigValue`]
//! - [`ValidationError`]: a single validation rule failure with a sub-kind

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable sentinel set of error kinds
///
/// Each variant identifies one failure class recognized across the core.
/// The set is closed: components match on it to drive retry and
/// classification decisions, so new kinds are additive and existing kinds
/// never change meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportErrorKind {
    /// Operation requires an active connection
    NotConnected,

    /// `connect` called while already connected
    AlreadyConnected,

    /// `start` called on a manager that is already started
    AlreadyStarted,

    /// Establishing the connection failed
    ConnectionFailed,

    /// The connection vanished mid-operation
    ConnectionClosed,

    /// A deadline elapsed before the operation completed
    Timeout,

    /// Payload exceeds the configured size bound
    MessageTooLarge,

    /// An optional capability was probed and found absent
    UnsupportedCapability,

    /// The requested transport name is not registered
    TransportNotFound,

    /// A configuration field failed validation
    InvalidConfiguration,

    /// Stream-level failure: the stream id is unknown
    StreamNotFound,

    /// Stream-level failure: the stream was closed
    StreamClosed,

    /// The reconnect strategy was exhausted without success
    ReconnectFailed,

    /// A health probe rejected the connection
    HealthCheckFailed,

    /// Submission rejected under the `None` overflow strategy
    BackpressureActive,

    /// Submission wait exceeded the configured block timeout
    BackpressureTimeout,

    /// Event validation rejected the event
    ValidationFailed,

    /// Connection pool acquire deadline fired
    AcquireTimeout,
}

impl TransportErrorKind {
    /// Stable machine-readable tag for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotConnected => "not-connected",
            Self::AlreadyConnected => "already-connected",
            Self::AlreadyStarted => "already-started",
            Self::ConnectionFailed => "connection-failed",
            Self::ConnectionClosed => "connection-closed",
            Self::Timeout => "timeout",
            Self::MessageTooLarge => "message-too-large",
            Self::UnsupportedCapability => "unsupported-capability",
            Self::TransportNotFound => "transport-not-found",
            Self::InvalidConfiguration => "invalid-configuration",
            Self::StreamNotFound => "stream-not-found",
            Self::StreamClosed => "stream-closed",
            Self::ReconnectFailed => "reconnect-failed",
            Self::HealthCheckFailed => "health-check-failed",
            Self::BackpressureActive => "backpressure-active",
            Self::BackpressureTimeout => "backpressure-timeout",
            Self::ValidationFailed => "validation-failed",
            Self::AcquireTimeout => "acquire-timeout",
        }
    }

    /// Default `temporary` flag for errors of this kind
    ///
    /// Temporary means the same operation may succeed soon without any
    /// corrective action by the caller.
    fn default_temporary(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::BackpressureActive
                | Self::BackpressureTimeout
                | Self::AcquireTimeout
        )
    }

    /// Default `retryable` flag for errors of this kind
    ///
    /// `NotConnected` is retryable after re-binding a transport. Lifecycle
    /// idempotence violations, configuration errors, and oversized payloads
    /// are never retryable: retrying the identical call cannot succeed.
    fn default_retryable(&self) -> bool {
        !matches!(
            self,
            Self::AlreadyConnected
                | Self::AlreadyStarted
                | Self::InvalidConfiguration
                | Self::MessageTooLarge
                | Self::UnsupportedCapability
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured transport error
///
/// The single error type surfaced by the core's public operations. Carries
/// the failure kind, the transport name where one is involved, a short
/// operation tag (e.g. `"send"`, `"connect"`, `"acquire"`), a human-readable
/// message, an optional underlying cause, and the temporary/retryable
/// classification flags.
///
/// ## Construction
///
/// Use the kind-specific constructors (`TransportError::not_connected`,
/// `TransportError::timeout`, …) which fix the default classification flags,
/// then refine with the builder methods:
///
/// ```rust
/// use event_transport::error::TransportError;
///
/// let err = TransportError::connection_failed("websocket", "connect")
///     .with_message("dial tcp 10.0.0.1:443 refused")
///     .with_temporary(true);
/// assert!(err.retryable());
/// ```
#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    transport: Option<String>,
    op: String,
    message: String,
    cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    temporary: bool,
    retryable: bool,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.transport {
            Some(name) => write!(f, "{} [{}/{}]: {}", self.kind, name, self.op, self.message),
            None => write!(f, "{} [{}]: {}", self.kind, self.op, self.message),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl TransportError {
    /// Create an error of the given kind with default classification flags
    pub fn new(kind: TransportErrorKind, op: impl Into<String>) -> Self {
        let op = op.into();
        Self {
            kind,
            transport: None,
            message: format!("{} failed: {}", op, kind),
            op,
            cause: None,
            temporary: kind.default_temporary(),
            retryable: kind.default_retryable(),
        }
    }

    /// Operation requires an active connection
    pub fn not_connected(transport: impl Into<String>, op: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotConnected, op).with_transport(transport)
    }

    /// `connect` called on an already-connected transport
    pub fn already_connected(transport: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::AlreadyConnected, "connect").with_transport(transport)
    }

    /// `start` called on an already-started manager
    pub fn already_started() -> Self {
        Self::new(TransportErrorKind::AlreadyStarted, "start")
    }

    /// Connection establishment failed
    pub fn connection_failed(transport: impl Into<String>, op: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionFailed, op).with_transport(transport)
    }

    /// The connection vanished mid-operation
    pub fn connection_closed(transport: impl Into<String>, op: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionClosed, op).with_transport(transport)
    }

    /// A deadline elapsed before the operation completed
    pub fn timeout(op: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, op)
    }

    /// Payload exceeds the configured size bound
    pub fn message_too_large(op: impl Into<String>, size: usize, limit: usize) -> Self {
        Self::new(TransportErrorKind::MessageTooLarge, op)
            .with_message(format!("event size {} exceeds limit {}", size, limit))
    }

    /// An optional capability was probed and found absent
    pub fn unsupported_capability(
        transport: impl Into<String>,
        capability: impl Into<String>,
    ) -> Self {
        let capability = capability.into();
        Self::new(TransportErrorKind::UnsupportedCapability, capability.clone())
            .with_transport(transport)
            .with_message(format!("capability {} not supported", capability))
    }

    /// The requested transport name is not registered
    pub fn transport_not_found(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(TransportErrorKind::TransportNotFound, "create")
            .with_message(format!("transport {:?} is not registered", name))
            .with_transport(name)
    }

    /// Stream-level failure: unknown stream id
    pub fn stream_not_found(transport: impl Into<String>, stream_id: u64) -> Self {
        Self::new(TransportErrorKind::StreamNotFound, "stream")
            .with_transport(transport)
            .with_message(format!("stream {} not found", stream_id))
    }

    /// Stream-level failure: the stream was closed
    pub fn stream_closed(transport: impl Into<String>, op: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::StreamClosed, op).with_transport(transport)
    }

    /// The reconnect strategy was exhausted without success
    pub fn reconnect_failed(transport: impl Into<String>, attempts: u32) -> Self {
        Self::new(TransportErrorKind::ReconnectFailed, "reconnect")
            .with_transport(transport)
            .with_message(format!("reconnect failed after {} attempts", attempts))
    }

    /// A health probe rejected the connection
    pub fn health_check_failed(op: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::HealthCheckFailed, op)
    }

    /// Submission rejected under the `None` overflow strategy
    pub fn backpressure_active(op: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::BackpressureActive, op)
            .with_message("event buffer is full".to_string())
    }

    /// Submission wait exceeded the configured block timeout
    pub fn backpressure_timeout(op: impl Into<String>, waited: std::time::Duration) -> Self {
        Self::new(TransportErrorKind::BackpressureTimeout, op)
            .with_message(format!("gave up waiting for buffer space after {:?}", waited))
    }

    /// Connection pool acquire deadline fired
    pub fn acquire_timeout(waited: std::time::Duration) -> Self {
        Self::new(TransportErrorKind::AcquireTimeout, "acquire")
            .with_message(format!("no connection became available within {:?}", waited))
    }

    /// Attach the transport name
    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }

    /// Replace the human-readable message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach an underlying cause, recoverable via `Error::source`
    pub fn with_cause(
        mut self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Attach an `anyhow::Error` cause
    ///
    /// Convenience for call sites that accumulate context with `anyhow`
    /// before crossing the library boundary.
    pub fn with_anyhow(self, cause: anyhow::Error) -> Self {
        self.with_cause(Box::<dyn std::error::Error + Send + Sync + 'static>::from(cause))
    }

    /// Override the `temporary` flag; a temporary error is always retryable
    pub fn with_temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        if temporary {
            self.retryable = true;
        }
        self
    }

    /// Override the `retryable` flag
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// The sentinel kind of this error
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Transport name, if one is involved
    pub fn transport(&self) -> Option<&str> {
        self.transport.as_deref()
    }

    /// Operation tag (e.g. `"send"`, `"connect"`, `"acquire"`)
    pub fn op(&self) -> &str {
        &self.op
    }

    /// Human-readable failure message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the same operation may succeed soon without intervention
    pub fn temporary(&self) -> bool {
        self.temporary
    }

    /// Whether the caller may safely retry
    pub fn retryable(&self) -> bool {
        self.retryable
    }
}

impl From<ConfigurationError> for TransportError {
    fn from(err: ConfigurationError) -> Self {
        TransportError::new(TransportErrorKind::InvalidConfiguration, "configure")
            .with_message(err.to_string())
            .with_cause(err)
    }
}

impl From<ValidationError> for TransportError {
    fn from(err: ValidationError) -> Self {
        TransportError::new(TransportErrorKind::ValidationFailed, "validate")
            .with_message(err.to_string())
            .with_cause(err)
    }
}

/// Typed configuration field value
///
/// Preserves the offending value of a rejected configuration field without
/// forcing it through a string. The `Other` variant is the legacy escape
/// hatch for values that predate the typed representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigValue {
    /// String-valued field
    Str(String),
    /// Integer-valued field
    Int(i64),
    /// Boolean-valued field
    Bool(bool),
    /// Floating-point field
    Float(f64),
    /// Absent / null value
    Nil,
    /// Untyped legacy value rendered to a string at capture time
    Other(String),
}

impl ConfigValue {
    /// Render the value for display regardless of variant
    pub fn as_display_string(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Nil => "nil".to_string(),
            Self::Other(s) => s.clone(),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_display_string())
    }
}

/// Typed per-field configuration error
///
/// Produced by the `validate()` methods on the configuration structs.
/// Identifies the field, carries the offending value, and explains the
/// constraint that was violated.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("invalid configuration field {field:?} = {value}: {message}")]
pub struct ConfigurationError {
    /// Name of the rejected field
    pub field: String,
    /// The offending value
    pub value: ConfigValue,
    /// The constraint that was violated
    pub message: String,
}

impl ConfigurationError {
    /// Create a configuration error for the given field
    pub fn new(field: impl Into<String>, value: ConfigValue, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value,
            message: message.into(),
        }
    }
}

/// Sub-kind classifying a validation rule failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationErrorKind {
    /// Event exceeds the configured size bound
    InvalidSize,
    /// A required field is missing or empty
    MissingRequiredField,
    /// Event type is not in the allowed set
    InvalidEventType,
    /// Payload could not be interpreted in the expected format
    InvalidDataFormat,
    /// A field-level rule rejected a field value
    FieldValidationFailed,
    /// A pattern rule rejected a value
    PatternValidationFailed,
}

impl ValidationErrorKind {
    /// Stable machine-readable tag for this sub-kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSize => "invalid-size",
            Self::MissingRequiredField => "missing-required-field",
            Self::InvalidEventType => "invalid-event-type",
            Self::InvalidDataFormat => "invalid-data-format",
            Self::FieldValidationFailed => "field-validation-failed",
            Self::PatternValidationFailed => "pattern-validation-failed",
        }
    }
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single validation rule failure
///
/// Every rule failure names the rule that produced it so composed rules
/// remain diagnosable, the field it applies to where one exists, and the
/// sub-kind used by callers that branch on failure class.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("rule {rule:?} failed ({kind}): {message}")]
pub struct ValidationError {
    /// Name of the rule that failed
    pub rule: String,
    /// Field the failure applies to, when field-scoped
    pub field: Option<String>,
    /// Failure classification
    pub kind: ValidationErrorKind,
    /// Human-readable description
    pub message: String,
}

impl ValidationError {
    /// Create a validation error for the named rule
    pub fn new(
        rule: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule: rule.into(),
            field: None,
            kind,
            message: message.into(),
        }
    }

    /// Scope the error to a specific field
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test default classification flags per kind
    #[test]
    fn test_default_flags() {
        let err = TransportError::not_connected("ws", "send");
        assert_eq!(err.kind(), TransportErrorKind::NotConnected);
        assert!(err.retryable());
        assert!(!err.temporary());

        let err = TransportError::already_started();
        assert!(!err.retryable());
        assert!(!err.temporary());

        let err = TransportError::backpressure_active("submit");
        assert!(err.temporary());
        assert!(err.retryable());

        let err = TransportError::acquire_timeout(std::time::Duration::from_millis(50));
        assert!(err.temporary());
        assert!(err.retryable());
    }

    /// Test that temporary implies retryable after builder overrides
    #[test]
    fn test_temporary_implies_retryable() {
        let err = TransportError::already_connected("ws").with_temporary(true);
        assert!(err.temporary());
        assert!(err.retryable());
    }

    /// Test that the cause is recoverable through Error::source
    #[test]
    fn test_cause_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TransportError::connection_failed("tcp", "connect").with_cause(io);

        let source = std::error::Error::source(&err).expect("cause should be preserved");
        assert!(source.to_string().contains("refused"));
    }

    /// Test display format carries kind, transport, and op
    #[test]
    fn test_display_format() {
        let err = TransportError::not_connected("websocket", "send");
        let rendered = err.to_string();
        assert!(rendered.contains("not-connected"));
        assert!(rendered.contains("websocket"));
        assert!(rendered.contains("send"));
    }

    /// Test config value display strings
    #[test]
    fn test_config_value_display() {
        assert_eq!(ConfigValue::Str("x".into()).as_display_string(), "x");
        assert_eq!(ConfigValue::Int(-3).as_display_string(), "-3");
        assert_eq!(ConfigValue::Bool(true).as_display_string(), "true");
        assert_eq!(ConfigValue::Nil.as_display_string(), "nil");
        assert_eq!(ConfigValue::Other("{a:1}".into()).as_display_string(), "{a:1}");
    }

    /// Test conversion from configuration errors
    #[test]
    fn test_from_configuration_error() {
        let cfg = ConfigurationError::new("buffer_size", ConfigValue::Int(0), "must be positive");
        let err: TransportError = cfg.into();
        assert_eq!(err.kind(), TransportErrorKind::InvalidConfiguration);
        assert!(!err.retryable());
        assert!(err.message().contains("buffer_size"));
    }

    /// Test conversion from validation errors
    #[test]
    fn test_from_validation_error() {
        let v = ValidationError::new(
            "allowed-event-types",
            ValidationErrorKind::InvalidEventType,
            "type \"forbidden\" is not allowed",
        );
        let err: TransportError = v.into();
        assert_eq!(err.kind(), TransportErrorKind::ValidationFailed);
    }
}
