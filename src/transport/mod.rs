//! # Transport Abstraction Module
//!
//! This module defines the pluggable boundary between the event-transport
//! core and concrete wire implementations (WebSocket, HTTP streaming,
//! server-sent events, in-process channels, …). The core multiplexes one
//! application-level API onto whichever implementation is currently bound.
//!
//! ## Transport Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │   Application   │───▶│    Transport     │───▶│    Specific     │
//! │    (Manager)    │    │      Trait       │    │ Implementation  │
//! │                 │    │  (abstraction)   │    │ (WS/SSE/channel)│
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! ## Capability Model
//!
//! The base [`Transport`] trait covers the mandatory capability set:
//! connect, close, send, receive stream, error stream, state, config, and
//! stats. Optional capabilities are separate sidecar traits reached through
//! feature probes on the base trait (`as_batch`, `as_streaming`,
//! `as_reliable`, `as_reconnect`), each defaulting to `None`:
//!
//! - [`BatchTransport`]: one call submits an ordered sequence of events
//! - [`StreamingTransport`]: bidirectional channel pairs plus error stream
//! - [`ReliableTransport`]: send that blocks for acknowledgment
//! - [`ReconnectTransport`]: explicit reconnect with a strategy knob
//!
//! ## Implementer Contracts
//!
//! - `connect` is idempotent-with-error: connecting twice fails with
//!   `already-connected`
//! - `send` fails with `not-connected` before `connect` or after `close`
//! - the receive stream terminates when the transport closes; the error
//!   stream terminates with it
//! - `close` is idempotent and releases all resources
//! - concurrent sends appear on the wire in some consistent total order;
//!   no event is ever partially interleaved with another

use crate::error::TransportError;
use crate::event::Event;
use crate::stats::TransportStats;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod channel;

pub use channel::ChannelTransport;

/// Identifier for a logical stream opened by a streaming transport
pub type StreamId = u64;

/// Endpoint configuration a transport reports through [`Transport::config`]
///
/// The core does not interpret these fields; they exist so applications and
/// diagnostics can identify what a bound transport points at without
/// knowing its concrete type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Type tag of the implementation (e.g. "websocket", "sse", "channel")
    pub transport_type: String,

    /// Endpoint the transport connects to, in implementation syntax
    pub endpoint: String,

    /// Per-operation timeout the implementation applies
    pub timeout: Duration,

    /// Protocol headers presented on connect, if any
    pub headers: HashMap<String, String>,

    /// Whether the underlying channel is transport-layer secured
    pub secure: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            transport_type: "unknown".to_string(),
            endpoint: String::new(),
            timeout: Duration::from_secs(30),
            headers: HashMap::new(),
            secure: false,
        }
    }
}

impl EndpointConfig {
    /// Create a config with the given type tag and endpoint
    pub fn new(transport_type: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            transport_type: transport_type.into(),
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }
}

/// Connection state a transport implementation moves through
///
/// ```text
/// Uninitialized → Connecting → Connected
///       │             │            │
///       └──────────▶ Failed ◀──────┴──▶ Disconnected
/// ```
///
/// The state machine is owned by the implementation; the core only reads
/// it through [`Transport::is_connected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// Created but not yet connected
    Uninitialized,

    /// Connection establishment in progress
    Connecting,

    /// Ready for sends and producing the receive stream
    Connected,

    /// Cleanly closed
    Disconnected,

    /// Failed; requires a fresh instance
    Failed,
}

/// The pluggable wire-level contract
///
/// Implementations are driven by the manager through an exclusive
/// reference, so they need interior mutability only for state shared with
/// their own background tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection
    ///
    /// Idempotent-with-error: fails with `already-connected` when called on
    /// a connected transport. May suspend; dropping the future cancels the
    /// attempt.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the transport and release all resources
    ///
    /// Idempotent: a second close is a no-op. The receive and error
    /// streams terminate.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Send one event
    ///
    /// Fails with `not-connected` before `connect` succeeds or after
    /// `close`. The event appears on the wire whole; concurrent sends are
    /// ordered by the implementation.
    async fn send(&mut self, event: Event) -> Result<(), TransportError>;

    /// Take the receive stream
    ///
    /// Returns the channel of incoming events. The stream is handed out
    /// once; a second call fails with `not-connected` semantics of the
    /// implementation. It ends when the transport closes.
    fn subscribe(&mut self) -> Result<mpsc::Receiver<Event>, TransportError>;

    /// Take the out-of-band error stream
    ///
    /// Asynchronous errors (receive-side failures, connection loss) are
    /// reported here. Terminates together with the receive stream.
    fn error_stream(&mut self) -> Result<mpsc::Receiver<TransportError>, TransportError>;

    /// Whether the transport is currently connected
    fn is_connected(&self) -> bool;

    /// Endpoint configuration of this transport
    fn config(&self) -> &EndpointConfig;

    /// Point-in-time statistics snapshot
    fn stats(&self) -> TransportStats;

    /// Short implementation name used in envelopes, errors, and logs
    fn name(&self) -> &'static str;

    /// Probe for the batch-send capability
    fn as_batch(&mut self) -> Option<&mut dyn BatchTransport> {
        None
    }

    /// Probe for the bidirectional streaming capability
    fn as_streaming(&mut self) -> Option<&mut dyn StreamingTransport> {
        None
    }

    /// Probe for the acknowledged-send capability
    fn as_reliable(&mut self) -> Option<&mut dyn ReliableTransport> {
        None
    }

    /// Probe for the explicit-reconnect capability
    fn as_reconnect(&mut self) -> Option<&mut dyn ReconnectTransport> {
        None
    }
}

/// Optional capability: submit an ordered sequence in one call
#[async_trait]
pub trait BatchTransport: Send {
    /// Send a batch; events appear on the wire in slice order
    ///
    /// The batch is not transactional: a failure may leave a prefix
    /// delivered. Implementations report how many events were accepted
    /// through their stats.
    async fn send_batch(&mut self, events: Vec<Event>) -> Result<(), TransportError>;
}

/// Channel bundle returned when opening a bidirectional stream
#[derive(Debug)]
pub struct EventStream {
    /// Identifier for closing the stream later
    pub stream_id: StreamId,

    /// Application → transport direction
    pub outgoing: mpsc::Sender<Event>,

    /// Transport → application direction
    pub incoming: mpsc::Receiver<Event>,

    /// Stream-scoped asynchronous errors
    pub errors: mpsc::Receiver<TransportError>,
}

/// Optional capability: long-lived bidirectional streams
#[async_trait]
pub trait StreamingTransport: Send {
    /// Open a bidirectional stream
    async fn open_stream(&mut self) -> Result<EventStream, TransportError>;

    /// Close a previously opened stream
    ///
    /// Fails with `stream-not-found` for unknown ids.
    async fn close_stream(&mut self, stream_id: StreamId) -> Result<(), TransportError>;
}

/// Optional capability: send that blocks for an acknowledgment
#[async_trait]
pub trait ReliableTransport: Send {
    /// Send and wait for the peer's acknowledgment
    ///
    /// Fails with `timeout` when the acknowledgment does not arrive within
    /// `ack_timeout`.
    async fn send_with_ack(
        &mut self,
        event: Event,
        ack_timeout: Duration,
    ) -> Result<(), TransportError>;
}

/// Reconnect pacing for transports that support explicit reconnection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ReconnectStrategy {
    /// Never reconnect automatically
    Never,

    /// Retry immediately, up to the given number of attempts
    Immediate { max_attempts: u32 },

    /// Fixed delay between attempts
    FixedDelay { delay: Duration, max_attempts: u32 },

    /// Exponential backoff between attempts
    ExponentialBackoff {
        initial: Duration,
        max: Duration,
        max_attempts: u32,
    },
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self::Never
    }
}

/// Optional capability: explicit reconnect with a strategy knob
#[async_trait]
pub trait ReconnectTransport: Send {
    /// Re-establish the connection according to the configured strategy
    ///
    /// Fails with `reconnect-failed` once the strategy is exhausted.
    async fn reconnect(&mut self) -> Result<(), TransportError>;

    /// Replace the reconnect strategy
    fn set_reconnect_strategy(&mut self, strategy: ReconnectStrategy);
}

/// Constructor stored in the registry
pub type TransportConstructor = Box<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

/// Named registry of transport constructors
///
/// Backs the manager's primary/fallback selection: applications register
/// constructors under short names and the manager instantiates by name.
/// Unknown names fail with `transport-not-found`.
#[derive(Default)]
pub struct TransportRegistry {
    constructors: HashMap<String, TransportConstructor>,
}

impl TransportRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under a name, replacing any previous entry
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn Transport> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
    }

    /// Whether a name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names, unordered
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Instantiate the named transport
    pub fn create(&self, name: &str) -> Result<Box<dyn Transport>, TransportError> {
        match self.constructors.get(name) {
            Some(constructor) => Ok(constructor()),
            None => Err(TransportError::transport_not_found(name)),
        }
    }

    /// Instantiate the primary transport, falling back down the list
    ///
    /// Tries `primary` first, then each name in `fallback` in order.
    /// Returns the instantiated transport together with the name that
    /// produced it. Fails with `transport-not-found` naming the primary
    /// when nothing on the list is registered.
    pub fn create_with_fallback(
        &self,
        primary: &str,
        fallback: &[String],
    ) -> Result<(String, Box<dyn Transport>), TransportError> {
        if let Ok(transport) = self.create(primary) {
            return Ok((primary.to_string(), transport));
        }
        for name in fallback {
            if let Ok(transport) = self.create(name) {
                tracing::warn!(
                    primary,
                    fallback = %name,
                    "primary transport not registered, using fallback"
                );
                return Ok((name.clone(), transport));
            }
        }
        Err(TransportError::transport_not_found(primary))
    }
}
