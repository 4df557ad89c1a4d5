//! # Transport Manager Module
//!
//! The lifecycle coordinator at the center of the crate. A [`Manager`]
//! bridges the application-facing API (send, receive channel, error
//! channel) onto whichever [`Transport`] is currently bound, shielding the
//! application from transport churn: transports can be swapped while
//! running, and a transport crash surfaces as an error without stopping
//! the manager.
//!
//! ## Data Flow
//!
//! ```text
//! application ── send ─▶ Manager ─▶ [validate-out] ─▶ Transport ─▶ wire
//!                           ▲                            │
//!                  public   │     [validate-in]          │
//!                  event/err│◀── BackpressureHandler ◀── receive loop
//!                  channels
//! ```
//!
//! ## Lifecycle
//!
//! `new → started → stopped`, one-shot. `start` fails with
//! `already-started` on a second call; `stop` is idempotent and always
//! completes the transition even when the transport close fails (the
//! error is returned, but the manager is stopped). Restarting means
//! creating a new manager.
//!
//! ## Receive Loop
//!
//! One long-lived task reads the bound transport's event and error
//! streams. Incoming events are validated (strict mode suppresses
//! failures; otherwise they are annotated and forwarded), pushed through
//! the backpressure handler, and pumped onto the public event channel.
//! Transport errors fan into the public error channel. When the transport
//! streams close unexpectedly, the loop reports `connection-closed` and
//! waits for a replacement transport instead of exiting.

use crate::backpressure::{BackpressureConfig, BackpressureHandler, BackpressureMetrics};
use crate::cleanup::{CleanupTracker, CleanupValidator, CleanupValidatorConfig, ResourceKind};
use crate::error::{TransportError, TransportErrorKind};
use crate::event::{EnvelopedEvent, Event, EventMetadata};
use crate::stats::TransportStats;
use crate::transport::Transport;
use crate::validation::{Direction, FastValidator, ValidationConfig, Validator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Configuration for a [`Manager`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Registry name of the preferred transport
    pub primary: String,

    /// Registry names tried in order when the primary is unavailable
    pub fallback: Vec<String>,

    /// Capacity of the public event channel
    pub buffer_size: usize,

    /// Whether the manager updates its metrics counters
    pub enable_metrics: bool,

    /// Backpressure configuration for the receive path
    pub backpressure: BackpressureConfig,

    /// Validation configuration for both paths
    pub validation: ValidationConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            primary: "channel".to_string(),
            fallback: Vec::new(),
            buffer_size: 256,
            enable_metrics: true,
            backpressure: BackpressureConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Validate the configuration and its embedded sections
    pub fn validate(&self) -> Result<(), crate::error::ConfigurationError> {
        if self.buffer_size == 0 {
            return Err(crate::error::ConfigurationError::new(
                "buffer_size",
                crate::error::ConfigValue::Int(0),
                "must be positive",
            ));
        }
        self.backpressure.validate()?;
        self.validation.validate()?;
        Ok(())
    }
}

/// Manager metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerMetrics {
    /// Events accepted by `send`
    pub events_sent: u64,
    /// Events picked up from the transport's receive stream
    pub events_received: u64,
    /// `send` calls that failed
    pub send_errors: u64,
    /// Incoming events that failed validation
    pub validation_failures: u64,
    /// Transport swaps performed
    pub transport_swaps: u64,
    /// When the manager started
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MetricsInner {
    events_sent: AtomicU64,
    events_received: AtomicU64,
    send_errors: AtomicU64,
    validation_failures: AtomicU64,
    transport_swaps: AtomicU64,
}

/// Manager lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Started,
    Stopped,
}

/// Stream bundle the receive loop reads from the currently bound transport
struct TransportStreams {
    transport_name: String,
    events: mpsc::Receiver<Event>,
    errors: mpsc::Receiver<TransportError>,
    errors_open: bool,
}

/// What the receive loop decided to do after one wakeup
enum LoopAction {
    Stop,
    Rebind(Option<TransportStreams>),
    Event(Option<Event>),
    TransportError(Option<TransportError>),
}

/// The lifecycle coordinator over a swappable transport
pub struct Manager {
    config: ManagerConfig,
    lifecycle: Mutex<Lifecycle>,
    transport: Arc<tokio::sync::Mutex<Option<Box<dyn Transport>>>>,
    validator: Option<Arc<dyn Validator>>,
    backpressure: BackpressureHandler,
    event_tx: Mutex<Option<mpsc::Sender<EnvelopedEvent>>>,
    event_rx: Mutex<Option<mpsc::Receiver<EnvelopedEvent>>>,
    error_tx: mpsc::Sender<TransportError>,
    error_rx: Mutex<Option<mpsc::Receiver<TransportError>>>,
    // Hands fresh stream bundles to the receive loop across swaps.
    streams_tx: mpsc::Sender<TransportStreams>,
    streams_rx: Mutex<Option<mpsc::Receiver<TransportStreams>>>,
    stop_tx: watch::Sender<bool>,
    tracker: CleanupTracker,
    cleanup_config: CleanupValidatorConfig,
    // Tracker ids of the public channels, marked cleaned during stop.
    tracked_channels: Mutex<Vec<u64>>,
    metrics: Arc<MetricsInner>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl Manager {
    /// Create a manager with the validator derived from the configuration
    pub fn new(config: ManagerConfig) -> Result<Self, TransportError> {
        let validator: Option<Arc<dyn Validator>> = if config.validation.enabled {
            Some(Arc::new(FastValidator::new(config.validation.clone())))
        } else {
            None
        };
        Self::with_validator_impl(config, validator)
    }

    /// Create a manager with a custom validator
    ///
    /// The validator replaces the config-derived one; the configuration's
    /// direction bypass flags still apply before it is consulted.
    pub fn with_validator(
        config: ManagerConfig,
        validator: Arc<dyn Validator>,
    ) -> Result<Self, TransportError> {
        Self::with_validator_impl(config, Some(validator))
    }

    fn with_validator_impl(
        config: ManagerConfig,
        validator: Option<Arc<dyn Validator>>,
    ) -> Result<Self, TransportError> {
        config.validate()?;

        let backpressure = BackpressureHandler::new(config.backpressure.clone())?;
        let (event_tx, event_rx) = mpsc::channel(config.buffer_size);
        let (error_tx, error_rx) = mpsc::channel(256);
        let (streams_tx, streams_rx) = mpsc::channel(4);
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            lifecycle: Mutex::new(Lifecycle::New),
            transport: Arc::new(tokio::sync::Mutex::new(None)),
            validator,
            backpressure,
            event_tx: Mutex::new(Some(event_tx)),
            event_rx: Mutex::new(Some(event_rx)),
            error_tx,
            error_rx: Mutex::new(Some(error_rx)),
            streams_tx,
            streams_rx: Mutex::new(Some(streams_rx)),
            stop_tx,
            tracker: CleanupTracker::new(),
            cleanup_config: CleanupValidatorConfig::default(),
            tracked_channels: Mutex::new(Vec::new()),
            metrics: Arc::new(MetricsInner::default()),
            started_at: Mutex::new(None),
        })
    }

    /// Whether the manager has started and not yet stopped
    pub fn is_started(&self) -> bool {
        *self.lifecycle.lock().expect("manager lock poisoned") == Lifecycle::Started
    }

    /// Name of the currently bound transport, if any
    pub async fn transport_name(&self) -> Option<String> {
        self.transport
            .lock()
            .await
            .as_ref()
            .map(|t| t.name().to_string())
    }

    /// Bind or swap the transport
    ///
    /// Atomic with respect to `send`: the swap holds the same lock, so no
    /// in-flight send on the previous transport can be routed to the new
    /// one, and every send after this returns goes to the new transport.
    /// A previously bound transport is closed best-effort with the error
    /// logged. Safe to call before or after start; after start the new
    /// transport is connected and its streams take over the receive loop.
    /// Envelopes already buffered keep the previous transport's name.
    pub async fn set_transport(
        &self,
        mut transport: Box<dyn Transport>,
    ) -> Result<(), TransportError> {
        let started = self.is_started();

        let mut bound = self.transport.lock().await;
        if let Some(mut previous) = bound.take() {
            if let Err(err) = previous.close().await {
                warn!(
                    transport = previous.name(),
                    error = %err,
                    "failed to close previous transport during swap"
                );
            }
        }

        if self.config.enable_metrics {
            self.metrics.transport_swaps.fetch_add(1, Ordering::Relaxed);
        }

        if started {
            transport.connect().await?;
            let streams = Self::take_streams(transport.as_mut())?;
            *bound = Some(transport);
            drop(bound);
            // The receive loop picks the bundle up on its next wakeup.
            let _ = self.streams_tx.send(streams).await;
        } else {
            *bound = Some(transport);
        }

        debug!("transport bound");
        Ok(())
    }

    fn take_streams(transport: &mut dyn Transport) -> Result<TransportStreams, TransportError> {
        let events = transport.subscribe()?;
        let errors = transport.error_stream()?;
        Ok(TransportStreams {
            transport_name: transport.name().to_string(),
            events,
            errors,
            errors_open: true,
        })
    }

    /// Start the manager
    ///
    /// Fails with `already-started` when called twice (including after
    /// stop: the lifecycle is one-shot). Connects the bound transport when
    /// one is present — a connect failure fails the start and leaves the
    /// manager startable again — and spawns the receive loop and the
    /// channel pump.
    pub async fn start(&self) -> Result<(), TransportError> {
        {
            let lifecycle = self.lifecycle.lock().expect("manager lock poisoned");
            if *lifecycle != Lifecycle::New {
                return Err(TransportError::already_started());
            }
        }

        // Connect outside the lifecycle lock; the transport mutex guards
        // the binding.
        let initial_streams = {
            let mut bound = self.transport.lock().await;
            match bound.as_mut() {
                Some(transport) => {
                    transport.connect().await?;
                    Some(Self::take_streams(transport.as_mut())?)
                }
                None => None,
            }
        };

        {
            let mut lifecycle = self.lifecycle.lock().expect("manager lock poisoned");
            if *lifecycle != Lifecycle::New {
                return Err(TransportError::already_started());
            }
            *lifecycle = Lifecycle::Started;
        }
        *self.started_at.lock().expect("manager lock poisoned") = Some(Utc::now());

        if let Some(streams) = initial_streams {
            let _ = self.streams_tx.send(streams).await;
        }

        {
            let mut tracked = self.tracked_channels.lock().expect("manager lock poisoned");
            tracked.push(
                self.tracker
                    .track("public-event-channel", ResourceKind::Subscription),
            );
            tracked.push(
                self.tracker
                    .track("public-error-channel", ResourceKind::Subscription),
            );
        }

        self.spawn_receive_loop();
        self.spawn_channel_pump();

        info!("manager started");
        Ok(())
    }

    fn spawn_receive_loop(&self) {
        let streams_rx = self
            .streams_rx
            .lock()
            .expect("manager lock poisoned")
            .take()
            .expect("receive loop spawned once");
        let mut stop_rx = self.stop_tx.subscribe();
        let validator = self.validator.clone();
        let validation = self.config.validation.clone();
        let backpressure = self.backpressure.clone();
        let error_tx = self.error_tx.clone();
        let enable_metrics = self.config.enable_metrics;
        let metrics = self.metrics.clone();

        let handle = tokio::spawn(async move {
            Self::receive_loop(
                streams_rx,
                &mut stop_rx,
                validator,
                validation,
                backpressure,
                error_tx,
                enable_metrics,
                metrics,
            )
            .await;
        });
        self.tracker.track_task("receive-loop", handle);
    }

    fn spawn_channel_pump(&self) {
        let event_tx = self
            .event_tx
            .lock()
            .expect("manager lock poisoned")
            .clone()
            .expect("channel pump spawned before stop");
        let backpressure = self.backpressure.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        // Best-effort drain of what is already buffered.
                        while let Some(envelope) = backpressure.try_recv() {
                            if event_tx.try_send(envelope).is_err() {
                                break;
                            }
                        }
                        break;
                    }
                    maybe = backpressure.recv() => match maybe {
                        Some(envelope) => {
                            tokio::select! {
                                _ = stop_rx.changed() => {
                                    let _ = event_tx.try_send(envelope);
                                    break;
                                }
                                permit = event_tx.reserve() => match permit {
                                    Ok(permit) => permit.send(envelope),
                                    Err(_) => break, // receiver dropped
                                }
                            }
                        }
                        None => break, // handler closed and drained
                    }
                }
            }
            debug!("channel pump exited");
        });
        self.tracker.track_task("channel-pump", handle);
    }

    /// The long-lived receive loop
    #[allow(clippy::too_many_arguments)]
    async fn receive_loop(
        mut streams_rx: mpsc::Receiver<TransportStreams>,
        stop_rx: &mut watch::Receiver<bool>,
        validator: Option<Arc<dyn Validator>>,
        validation: ValidationConfig,
        backpressure: BackpressureHandler,
        error_tx: mpsc::Sender<TransportError>,
        enable_metrics: bool,
        metrics: Arc<MetricsInner>,
    ) {
        let mut active: Option<TransportStreams> = None;

        loop {
            let action = match active.as_mut() {
                Some(streams) => {
                    tokio::select! {
                        _ = stop_rx.changed() => LoopAction::Stop,
                        bundle = streams_rx.recv() => LoopAction::Rebind(bundle),
                        maybe = streams.events.recv() => LoopAction::Event(maybe),
                        maybe = streams.errors.recv(), if streams.errors_open => {
                            LoopAction::TransportError(maybe)
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = stop_rx.changed() => LoopAction::Stop,
                        bundle = streams_rx.recv() => LoopAction::Rebind(bundle),
                    }
                }
            };

            match action {
                LoopAction::Stop => break,
                LoopAction::Rebind(None) => break, // manager dropped mid-run
                LoopAction::Rebind(Some(streams)) => {
                    debug!(transport = %streams.transport_name, "receive loop rebound");
                    active = Some(streams);
                }
                LoopAction::Event(Some(event)) => {
                    let streams = active.as_ref().expect("event arm requires active streams");
                    if enable_metrics {
                        metrics.events_received.fetch_add(1, Ordering::Relaxed);
                    }
                    Self::handle_incoming(
                        event,
                        &streams.transport_name,
                        validator.as_deref(),
                        &validation,
                        &backpressure,
                        &error_tx,
                        enable_metrics,
                        &metrics.validation_failures,
                    )
                    .await;
                }
                LoopAction::Event(None) => {
                    // The transport's receive stream closed underneath us:
                    // the connection is gone. Surface it and wait for a
                    // replacement transport; the manager keeps running.
                    let name = active
                        .take()
                        .map(|s| s.transport_name)
                        .unwrap_or_default();
                    warn!(transport = %name, "transport receive stream closed");
                    Self::forward_error(
                        &error_tx,
                        TransportError::connection_closed(name, "receive")
                            .with_message("transport receive stream closed"),
                    );
                }
                LoopAction::TransportError(Some(err)) => {
                    Self::forward_error(&error_tx, err);
                }
                LoopAction::TransportError(None) => {
                    if let Some(streams) = active.as_mut() {
                        streams.errors_open = false;
                    }
                }
            }
        }
        debug!("receive loop exited");
    }

    /// Forward an error to the public channel without ever blocking
    ///
    /// The receive loop must not stall behind a consumer that ignores the
    /// error channel, so a full channel drops the error with a warning.
    fn forward_error(error_tx: &mpsc::Sender<TransportError>, err: TransportError) {
        if let Err(rejected) = error_tx.try_send(err) {
            warn!(
                error = %rejected.into_inner(),
                "public error channel full, dropping error"
            );
        }
    }

    /// Validate, annotate, and enqueue one incoming event
    #[allow(clippy::too_many_arguments)]
    async fn handle_incoming(
        event: Event,
        transport_name: &str,
        validator: Option<&dyn Validator>,
        validation: &ValidationConfig,
        backpressure: &BackpressureHandler,
        error_tx: &mpsc::Sender<TransportError>,
        enable_metrics: bool,
        validation_failures: &AtomicU64,
    ) {
        let mut metadata = EventMetadata {
            transport: transport_name.to_string(),
            size: event.estimated_size(),
            ..Default::default()
        };

        if validation.applies_to(Direction::Incoming) {
            if let Some(validator) = validator {
                let result = validator.validate_incoming(&event);
                if !result.valid {
                    if enable_metrics {
                        validation_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    let rule = result
                        .first_error()
                        .map(|e| e.rule.clone())
                        .unwrap_or_else(|| "unknown".to_string());
                    let error = match result.first_error() {
                        Some(first) => TransportError::from(first.clone())
                            .with_transport(transport_name.to_string()),
                        None => TransportError::new(
                            TransportErrorKind::ValidationFailed,
                            "validate",
                        )
                        .with_transport(transport_name.to_string()),
                    };
                    Self::forward_error(error_tx, error);

                    if validation.strict_mode {
                        // Strict mode suppresses delivery entirely.
                        debug!(event_id = %event.id, "suppressed invalid incoming event");
                        return;
                    }
                    // Non-strict: annotate and forward.
                    metadata.validation = Some(rule);
                }
            }
        }

        let envelope = EnvelopedEvent::new(event, metadata);
        if let Err(err) = backpressure.submit(envelope).await {
            Self::forward_error(error_tx, err);
        }
    }

    /// Send an event through the bound transport
    ///
    /// Fails with `not-connected` when no transport is bound, when the
    /// manager has not started, or after stop. Outgoing validation (when
    /// enabled) runs first and aborts the send on failure.
    pub async fn send(&self, event: Event) -> Result<(), TransportError> {
        if !self.is_started() {
            return Err(TransportError::not_connected("manager", "send")
                .with_message("manager is not started"));
        }

        if self.config.validation.applies_to(Direction::Outgoing) {
            if let Some(validator) = &self.validator {
                let result = validator.validate_outgoing(&event);
                if !result.valid {
                    if self.config.enable_metrics {
                        self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    let error = match result.first_error() {
                        Some(first) => TransportError::from(first.clone()),
                        None => {
                            TransportError::new(TransportErrorKind::ValidationFailed, "send")
                        }
                    };
                    return Err(error);
                }
            }
        }

        let mut bound = self.transport.lock().await;
        let transport = bound.as_mut().ok_or_else(|| {
            TransportError::not_connected("manager", "send").with_message("no transport bound")
        })?;

        match transport.send(event).await {
            Ok(()) => {
                if self.config.enable_metrics {
                    self.metrics.events_sent.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(err) => {
                if self.config.enable_metrics {
                    self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                }
                Err(err)
            }
        }
    }

    /// Send an ordered batch of events
    ///
    /// Uses the transport's batch capability when it has one and falls
    /// back to sequential sends otherwise; either way the events reach
    /// the wire in slice order. Outgoing validation applies to every
    /// event before anything is sent.
    pub async fn send_batch(&self, events: Vec<Event>) -> Result<(), TransportError> {
        if !self.is_started() {
            return Err(TransportError::not_connected("manager", "send-batch")
                .with_message("manager is not started"));
        }

        if self.config.validation.applies_to(Direction::Outgoing) {
            if let Some(validator) = &self.validator {
                for event in &events {
                    let result = validator.validate_outgoing(event);
                    if !result.valid {
                        let error = match result.first_error() {
                            Some(first) => TransportError::from(first.clone()),
                            None => TransportError::new(
                                TransportErrorKind::ValidationFailed,
                                "send-batch",
                            ),
                        };
                        return Err(error);
                    }
                }
            }
        }

        let batch_len = events.len() as u64;
        let mut bound = self.transport.lock().await;
        let transport = bound.as_mut().ok_or_else(|| {
            TransportError::not_connected("manager", "send-batch")
                .with_message("no transport bound")
        })?;

        // Probe first so the capability borrow does not overlap the
        // sequential fallback path.
        let has_batch = transport.as_batch().is_some();
        let outcome = if has_batch {
            let batch = transport.as_batch().expect("probed above");
            batch.send_batch(events).await
        } else {
            // No batch capability: sequential sends under the same lock
            // still yield a contiguous, ordered sequence.
            let mut outcome = Ok(());
            for event in events {
                if let Err(err) = transport.send(event).await {
                    outcome = Err(err);
                    break;
                }
            }
            outcome
        };

        if self.config.enable_metrics {
            match &outcome {
                Ok(()) => {
                    self.metrics
                        .events_sent
                        .fetch_add(batch_len, Ordering::Relaxed);
                }
                Err(_) => {
                    self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        outcome
    }

    /// Send one event and wait for the transport's acknowledgment
    ///
    /// Requires the reliable capability; fails with
    /// `unsupported-capability` when the bound transport lacks it.
    pub async fn send_with_ack(
        &self,
        event: Event,
        ack_timeout: Duration,
    ) -> Result<(), TransportError> {
        if !self.is_started() {
            return Err(TransportError::not_connected("manager", "send-with-ack")
                .with_message("manager is not started"));
        }

        let mut bound = self.transport.lock().await;
        let transport = bound.as_mut().ok_or_else(|| {
            TransportError::not_connected("manager", "send-with-ack")
                .with_message("no transport bound")
        })?;
        let name = transport.name();

        match transport.as_reliable() {
            Some(reliable) => reliable.send_with_ack(event, ack_timeout).await,
            None => Err(TransportError::unsupported_capability(name, "reliable-send")),
        }
    }

    /// Open a bidirectional stream on the bound transport
    ///
    /// Requires the streaming capability; fails with
    /// `unsupported-capability` when absent.
    pub async fn open_stream(&self) -> Result<crate::transport::EventStream, TransportError> {
        if !self.is_started() {
            return Err(TransportError::not_connected("manager", "open-stream")
                .with_message("manager is not started"));
        }

        let mut bound = self.transport.lock().await;
        let transport = bound.as_mut().ok_or_else(|| {
            TransportError::not_connected("manager", "open-stream")
                .with_message("no transport bound")
        })?;
        let name = transport.name();

        match transport.as_streaming() {
            Some(streaming) => streaming.open_stream().await,
            None => Err(TransportError::unsupported_capability(name, "streaming")),
        }
    }

    /// Ask the bound transport to reconnect
    ///
    /// The core never reconnects on its own; this forwards an explicit
    /// application request to transports with the reconnect capability.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let mut bound = self.transport.lock().await;
        let transport = bound.as_mut().ok_or_else(|| {
            TransportError::not_connected("manager", "reconnect")
                .with_message("no transport bound")
        })?;
        let name = transport.name();

        match transport.as_reconnect() {
            Some(reconnect) => reconnect.reconnect().await,
            None => Err(TransportError::unsupported_capability(name, "reconnect")),
        }
    }

    /// Take the public event channel
    ///
    /// The receiver is handed out once; subsequent calls return `None`.
    /// The channel closes when the manager stops.
    pub fn events(&self) -> Option<mpsc::Receiver<EnvelopedEvent>> {
        self.event_rx.lock().expect("manager lock poisoned").take()
    }

    /// Take the public error channel
    ///
    /// Asynchronous transport errors and incoming-validation failures
    /// arrive here. Handed out once, closed by stop.
    pub fn errors(&self) -> Option<mpsc::Receiver<TransportError>> {
        self.error_rx.lock().expect("manager lock poisoned").take()
    }

    /// Stop the manager
    ///
    /// Idempotent. Cancels the receive loop and pump, closes the bound
    /// transport best-effort, drains and closes the public channels, joins
    /// the loops within `deadline`, and runs cleanup validation. The state
    /// transition always completes; the first error encountered is
    /// returned after the manager is stopped.
    pub async fn stop(&self, deadline: Duration) -> Result<(), TransportError> {
        {
            let mut lifecycle = self.lifecycle.lock().expect("manager lock poisoned");
            match *lifecycle {
                Lifecycle::Stopped => return Ok(()),
                _ => *lifecycle = Lifecycle::Stopped,
            }
        }

        let mut first_error: Option<TransportError> = None;

        // Close the transport before cancelling the loop so the receive
        // stream ends rather than being abandoned mid-read.
        {
            let mut bound = self.transport.lock().await;
            if let Some(mut transport) = bound.take() {
                if let Err(err) = transport.close().await {
                    warn!(error = %err, "transport close failed during stop");
                    first_error.get_or_insert(err);
                }
            }
        }

        // Cancel the loops and stop accepting new envelopes.
        let _ = self.stop_tx.send(true);
        self.backpressure.close();

        // Drop the manager's public senders: the channels close once the
        // pump's clone is gone too.
        self.event_tx.lock().expect("manager lock poisoned").take();
        for id in self
            .tracked_channels
            .lock()
            .expect("manager lock poisoned")
            .drain(..)
        {
            self.tracker.mark_cleaned(id);
        }

        // Join the loops and check what was left behind, bounded by the
        // caller's deadline.
        let success = first_error.is_none();
        let cleanup = CleanupValidator::new(CleanupValidatorConfig {
            validation_timeout: deadline,
            ..self.cleanup_config.clone()
        });
        let report = cleanup.validate(&self.tracker, success).await;
        if !report.success {
            debug!(
                failures = report.failures().len(),
                "cleanup validation reported failures"
            );
        }

        info!("manager stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Manager metrics snapshot
    pub fn metrics(&self) -> ManagerMetrics {
        ManagerMetrics {
            events_sent: self.metrics.events_sent.load(Ordering::Relaxed),
            events_received: self.metrics.events_received.load(Ordering::Relaxed),
            send_errors: self.metrics.send_errors.load(Ordering::Relaxed),
            validation_failures: self.metrics.validation_failures.load(Ordering::Relaxed),
            transport_swaps: self.metrics.transport_swaps.load(Ordering::Relaxed),
            started_at: *self.started_at.lock().expect("manager lock poisoned"),
        }
    }

    /// Backpressure metrics snapshot
    pub fn backpressure_metrics(&self) -> BackpressureMetrics {
        self.backpressure.metrics()
    }

    /// Stats snapshot of the bound transport, if any
    pub async fn transport_stats(&self) -> Option<TransportStats> {
        self.transport.lock().await.as_ref().map(|t| t.stats())
    }

    /// The configuration this manager was built with
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EVENT_TYPE_DATA;
    use crate::transport::ChannelTransport;

    fn manager() -> Manager {
        Manager::new(ManagerConfig::default()).unwrap()
    }

    /// Test send before start fails with not-connected
    #[tokio::test]
    async fn test_send_requires_start() {
        let manager = manager();
        let err = manager
            .send(Event::new(EVENT_TYPE_DATA, Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::NotConnected);
    }

    /// Test start is one-shot
    #[tokio::test]
    async fn test_start_one_shot() {
        let manager = manager();
        manager.start().await.unwrap();

        let err = manager.start().await.unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::AlreadyStarted);

        manager.stop(Duration::from_secs(1)).await.unwrap();

        // Restart after stop is also rejected; the lifecycle is one-shot.
        let err = manager.start().await.unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::AlreadyStarted);
    }

    /// Test stop is idempotent
    #[tokio::test]
    async fn test_stop_idempotent() {
        let manager = manager();
        manager.start().await.unwrap();

        manager.stop(Duration::from_secs(1)).await.unwrap();
        manager.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!manager.is_started());
    }

    /// Test send with no transport bound fails with not-connected
    #[tokio::test]
    async fn test_send_without_transport() {
        let manager = manager();
        manager.start().await.unwrap();

        let err = manager
            .send(Event::new(EVENT_TYPE_DATA, Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::NotConnected);

        manager.stop(Duration::from_secs(1)).await.unwrap();
    }

    /// Test the public channels are handed out exactly once
    #[tokio::test]
    async fn test_channels_taken_once() {
        let manager = manager();
        assert!(manager.events().is_some());
        assert!(manager.events().is_none());
        assert!(manager.errors().is_some());
        assert!(manager.errors().is_none());
    }

    /// Test a config that fails validation is rejected
    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ManagerConfig::default();
        config.buffer_size = 0;
        let err = Manager::new(config).unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::InvalidConfiguration);
    }

    /// Test a bound transport is connected by start and closed by stop
    #[tokio::test]
    async fn test_transport_lifecycle() {
        let manager = manager();
        let (local, mut peer) = ChannelTransport::pair("channel", 16);
        peer.connect().await.unwrap();
        let mut peer_events = peer.subscribe().unwrap();

        manager.set_transport(Box::new(local)).await.unwrap();
        manager.start().await.unwrap();
        assert_eq!(manager.transport_name().await.as_deref(), Some("channel"));

        manager
            .send(Event::with_id("m1", EVENT_TYPE_DATA, vec![1]))
            .await
            .unwrap();
        assert_eq!(peer_events.recv().await.unwrap().id, "m1");
        assert_eq!(manager.metrics().events_sent, 1);

        manager.stop(Duration::from_secs(1)).await.unwrap();
        // Manager closed its endpoint; the peer's stream ends.
        assert!(peer_events.recv().await.is_none());
    }

    /// Test capability probing through the manager
    #[tokio::test]
    async fn test_capability_probes() {
        let manager = manager();
        let (local, mut peer) = ChannelTransport::pair("channel", 16);
        peer.connect().await.unwrap();
        let mut peer_events = peer.subscribe().unwrap();

        manager.set_transport(Box::new(local)).await.unwrap();
        manager.start().await.unwrap();

        // The channel transport has batch and reliable capabilities.
        manager
            .send_batch(vec![
                Event::with_id("b1", EVENT_TYPE_DATA, Vec::new()),
                Event::with_id("b2", EVENT_TYPE_DATA, Vec::new()),
            ])
            .await
            .unwrap();
        assert_eq!(peer_events.recv().await.unwrap().id, "b1");
        assert_eq!(peer_events.recv().await.unwrap().id, "b2");
        assert_eq!(manager.metrics().events_sent, 2);

        manager
            .send_with_ack(
                Event::with_id("r1", EVENT_TYPE_DATA, Vec::new()),
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        assert_eq!(peer_events.recv().await.unwrap().id, "r1");

        // Streaming and reconnect are absent: probes report it.
        let err = manager.open_stream().await.unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::UnsupportedCapability);
        let err = manager.reconnect().await.unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::UnsupportedCapability);

        manager.stop(Duration::from_secs(1)).await.unwrap();
    }
}
