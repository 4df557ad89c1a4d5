//! # Event Transport Core
//!
//! The core runtime of a pluggable event-transport layer. Applications
//! talk to a [`Manager`] — send an event, read the event channel, read the
//! error channel — while the wire-level work is delegated to a swappable
//! [`Transport`] implementation. The core enforces ordering, backpressure,
//! validation, lifecycle, and failure-isolation guarantees regardless of
//! which transport is bound.

pub mod backpressure;
pub mod cleanup;
pub mod error;
pub mod event;
pub mod logging;
pub mod manager;
pub mod pool;
pub mod stats;
pub mod transport;
pub mod validation;

pub use backpressure::{
    BackpressureConfig, BackpressureHandler, BackpressureMetrics, OverflowStrategy,
};
pub use cleanup::{CleanupReport, CleanupTracker, CleanupValidator, Severity};
pub use error::{ConfigValue, ConfigurationError, TransportError, TransportErrorKind};
pub use event::{EnvelopedEvent, Event, EventMetadata};
pub use manager::{Manager, ManagerConfig, ManagerMetrics};
pub use pool::{ConnectionFactory, ConnectionPool, ConnectionPoolConfig, PoolStats};
pub use stats::{StatsRecorder, TransportStats};
pub use transport::{
    ChannelTransport, EndpointConfig, Transport, TransportRegistry, TransportState,
};
pub use validation::{FastValidator, ValidationConfig, ValidationResult, Validator};

/// The current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default capacity of the public event channel
    pub const BUFFER_SIZE: usize = 256;

    /// Default bound of the backpressure queue
    pub const BACKPRESSURE_BUFFER_SIZE: usize = 1024;

    /// Default block timeout under the block-with-timeout strategy
    pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default upper bound on event size accepted by validation
    pub const MAX_EVENT_SIZE: usize = 1024 * 1024;

    /// Default deadline handed to `Manager::stop`
    pub const STOP_DEADLINE: Duration = Duration::from_secs(5);

    /// Default connection pool acquire deadline
    pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
}
