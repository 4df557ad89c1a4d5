//! # Event Model Module
//!
//! This module defines the event record the core carries between an
//! application and its transports, plus the envelope wrapper delivered on
//! the public receive channel. The core treats events as opaque: a small
//! header (id, type, timestamp) plus arbitrary byte-oriented payload with
//! optional typed accessors.
//!
//! ## Event Lifecycle
//!
//! 1. **Creation**: application constructs an event with a payload and type
//! 2. **Outgoing validation**: optional, configured on the manager
//! 3. **Transmission**: the bound transport serializes and delivers it
//! 4. **Ingress**: received events are wrapped in an [`EnvelopedEvent`]
//!    carrying transport-side metadata and an ingress timestamp
//! 5. **Delivery**: envelopes flow through the backpressure handler onto
//!    the public event channel
//!
//! ## Invariants
//!
//! Whenever validation is enabled, `id` and `event_type` are non-empty and
//! `timestamp` is non-zero. The constructors uphold these by default; only
//! hand-rolled events can violate them, which is exactly what the
//! validation pipeline exists to catch.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Well-known event type classifier for application data events
pub const EVENT_TYPE_DATA: &str = "data";

/// Well-known event type classifier for control-plane events
pub const EVENT_TYPE_CONTROL: &str = "control";

/// Opaque event record
///
/// The unit of transmission across every transport. The core never
/// interprets the payload; transports may re-encode it but must deliver it
/// intact and un-interleaved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stable unique identifier
    ///
    /// Used for correlation, async validation result lookup, and ordering
    /// assertions in tests. Generated as a UUID v4 by the constructors.
    pub id: String,

    /// Short classifier (e.g. "data", "control")
    pub event_type: String,

    /// Creation time
    ///
    /// Wall-clock creation timestamp. Latency measurements use monotonic
    /// clocks separately; this field exists for correlation and validation.
    pub timestamp: DateTime<Utc>,

    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

impl Event {
    /// Create an event with a generated id and the current timestamp
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Create an event with an explicit id
    ///
    /// Used by tests that assert ordering and by applications that carry
    /// their own correlation ids.
    pub fn with_id(id: impl Into<String>, event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Create a data event from a JSON value
    pub fn from_json(event_type: impl Into<String>, value: &serde_json::Value) -> Result<Self> {
        Ok(Self::new(event_type, serde_json::to_vec(value)?))
    }

    /// Interpret the payload as JSON
    pub fn payload_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Interpret the payload as UTF-8 text
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Estimated serialized size in bytes
    ///
    /// Uses the bincode serialized size where available and falls back to a
    /// field-sum approximation. The estimate backs the validation size
    /// bound; actual wire size may vary slightly by transport encoding.
    pub fn estimated_size(&self) -> usize {
        match bincode::serialized_size(self) {
            Ok(size) => size as usize,
            Err(_) => {
                self.id.len() + self.event_type.len() + self.payload.len() + 12 // timestamp
            }
        }
    }

    /// Serialize the event to bytes
    ///
    /// Compact binary encoding used by in-process transports and size
    /// accounting. Wire transports are free to choose their own framing.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize an event from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Transport-side metadata attached to a received event
///
/// Captured by the manager's receive loop at ingress. The transport name is
/// the identity of the transport that delivered the event; after a swap,
/// envelopes still buffered keep the previous transport's name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Name of the transport that delivered the event
    pub transport: String,

    /// Transport-level headers, if the wire protocol carries any
    pub headers: HashMap<String, String>,

    /// Serialized size of the event in bytes
    pub size: usize,

    /// Transport-measured delivery latency, when known
    pub latency: Option<Duration>,

    /// Whether the payload arrived compressed
    pub compressed: bool,

    /// Validation annotation set on the incoming path
    ///
    /// In non-strict mode a failing event is still forwarded; the failed
    /// rule name is recorded here so consumers can distinguish annotated
    /// events from clean ones.
    pub validation: Option<String>,
}

/// The value delivered on the public receive channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopedEvent {
    /// The received event
    pub event: Event,

    /// Transport-side metadata captured at ingress
    pub metadata: EventMetadata,

    /// When the manager's receive loop picked the event up
    pub received_at: DateTime<Utc>,
}

impl EnvelopedEvent {
    /// Wrap an event with metadata, stamping the ingress time
    pub fn new(event: Event, metadata: EventMetadata) -> Self {
        Self {
            event,
            metadata,
            received_at: Utc::now(),
        }
    }

    /// Wrap an event with only a transport name and computed size
    pub fn from_transport(event: Event, transport: impl Into<String>) -> Self {
        let size = event.estimated_size();
        Self::new(
            event,
            EventMetadata {
                transport: transport.into(),
                size,
                ..Default::default()
            },
        )
    }
}
