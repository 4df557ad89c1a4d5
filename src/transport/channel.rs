//! # In-Process Channel Transport
//!
//! A loopback [`Transport`] implementation connecting two endpoints over
//! bounded in-process channels. It is the reference implementation of the
//! transport contract: integration tests drive a manager bound to one
//! endpoint while asserting on the other, and new wire transports can use
//! it as the behavioral model for state transitions and stream semantics.
//!
//! ## Topology
//!
//! [`ChannelTransport::pair`] creates two connected endpoints. Events sent
//! on one appear on the other's receive stream. Closing an endpoint drops
//! its sender, which terminates the peer's receive stream — the same thing
//! a closed socket does to the remote reader.
//!
//! ## Capabilities
//!
//! Implements the batch capability (sequential, order-preserving) and the
//! reliable capability, where an acknowledgment means the event was
//! accepted into the peer's receive queue.

use crate::error::TransportError;
use crate::event::Event;
use crate::stats::{StatsRecorder, TransportStats};
use crate::transport::{
    BatchTransport, EndpointConfig, ReliableTransport, Transport, TransportState,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

// Generous wire cap; events are meant to be small records, not blobs.
const MAX_EVENT_BYTES: usize = 16 * 1024 * 1024;

/// One endpoint of an in-process transport pair
pub struct ChannelTransport {
    name: &'static str,
    state: TransportState,
    config: EndpointConfig,
    // Sender feeding the peer's receive stream. Dropped on close.
    peer_tx: Option<mpsc::Sender<Event>>,
    // Our receive stream, taken once by subscribe().
    incoming_rx: Option<mpsc::Receiver<Event>>,
    // Out-of-band error stream for this endpoint.
    error_tx: mpsc::Sender<TransportError>,
    error_rx: Option<mpsc::Receiver<TransportError>>,
    stats: Arc<StatsRecorder>,
}

impl ChannelTransport {
    /// Create a connected pair of endpoints with the given buffer capacity
    ///
    /// Both endpoints start `Uninitialized`; each side must still call
    /// `connect` before sending, exactly as with a wire transport.
    pub fn pair(name: &'static str, capacity: usize) -> (Self, Self) {
        let (a_to_b, b_from_a) = mpsc::channel(capacity.max(1));
        let (b_to_a, a_from_b) = mpsc::channel(capacity.max(1));
        (
            Self::endpoint(name, a_to_b, a_from_b),
            Self::endpoint(name, b_to_a, b_from_a),
        )
    }

    fn endpoint(
        name: &'static str,
        peer_tx: mpsc::Sender<Event>,
        incoming_rx: mpsc::Receiver<Event>,
    ) -> Self {
        let (error_tx, error_rx) = mpsc::channel(64);
        Self {
            name,
            state: TransportState::Uninitialized,
            config: EndpointConfig::new(name, "memory://local"),
            peer_tx: Some(peer_tx),
            incoming_rx: Some(incoming_rx),
            error_tx,
            error_rx: Some(error_rx),
            stats: Arc::new(StatsRecorder::new()),
        }
    }

    /// Replace the endpoint configuration reported by `config()`
    pub fn with_config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Deliver one event to the peer, mapping channel failures
    async fn deliver(&self, event: Event) -> Result<(), TransportError> {
        let peer_tx = self.peer_tx.as_ref().ok_or_else(|| {
            TransportError::not_connected(self.name, "send")
        })?;

        let size = event.estimated_size();
        if size > MAX_EVENT_BYTES {
            return Err(
                TransportError::message_too_large("send", size, MAX_EVENT_BYTES)
                    .with_transport(self.name),
            );
        }
        let started = Instant::now();

        let send = peer_tx.send(event);
        match timeout(self.config.timeout, send).await {
            Ok(Ok(())) => {
                self.stats.record_send(size);
                self.stats.record_latency(started.elapsed());
                Ok(())
            }
            Ok(Err(_)) => {
                // Peer endpoint dropped its receiver: the connection is gone.
                let err = TransportError::connection_closed(self.name, "send")
                    .with_message("peer endpoint closed");
                self.stats.record_error(&err);
                let _ = self
                    .error_tx
                    .try_send(TransportError::connection_closed(self.name, "send")
                        .with_message("peer endpoint closed"));
                Err(err)
            }
            Err(_) => {
                let err = TransportError::timeout("send").with_transport(self.name);
                self.stats.record_error(&err);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.state == TransportState::Connected {
            return Err(TransportError::already_connected(self.name));
        }
        if self.peer_tx.is_none() {
            return Err(TransportError::connection_failed(self.name, "connect")
                .with_message("endpoint was closed"));
        }
        self.state = TransportState::Connecting;
        self.stats.record_connect();
        self.state = TransportState::Connected;
        debug!(transport = self.name, "channel transport connected");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.state == TransportState::Disconnected {
            return Ok(());
        }
        // Dropping the sender terminates the peer's receive stream.
        self.peer_tx = None;
        self.state = TransportState::Disconnected;
        self.stats.record_disconnect();
        debug!(transport = self.name, "channel transport closed");
        Ok(())
    }

    async fn send(&mut self, event: Event) -> Result<(), TransportError> {
        if self.state != TransportState::Connected {
            return Err(TransportError::not_connected(self.name, "send"));
        }
        self.deliver(event).await
    }

    fn subscribe(&mut self) -> Result<mpsc::Receiver<Event>, TransportError> {
        self.incoming_rx.take().ok_or_else(|| {
            TransportError::stream_closed(self.name, "subscribe")
                .with_message("receive stream already taken")
        })
    }

    fn error_stream(&mut self) -> Result<mpsc::Receiver<TransportError>, TransportError> {
        self.error_rx.take().ok_or_else(|| {
            TransportError::stream_closed(self.name, "error-stream")
                .with_message("error stream already taken")
        })
    }

    fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
    }

    fn config(&self) -> &EndpointConfig {
        &self.config
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn as_batch(&mut self) -> Option<&mut dyn BatchTransport> {
        Some(self)
    }

    fn as_reliable(&mut self) -> Option<&mut dyn ReliableTransport> {
        Some(self)
    }
}

#[async_trait]
impl BatchTransport for ChannelTransport {
    async fn send_batch(&mut self, events: Vec<Event>) -> Result<(), TransportError> {
        if self.state != TransportState::Connected {
            return Err(TransportError::not_connected(self.name, "send-batch"));
        }
        for event in events {
            self.deliver(event).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReliableTransport for ChannelTransport {
    async fn send_with_ack(
        &mut self,
        event: Event,
        ack_timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.state != TransportState::Connected {
            return Err(TransportError::not_connected(self.name, "send-with-ack"));
        }
        let peer_tx = self.peer_tx.as_ref().ok_or_else(|| {
            TransportError::not_connected(self.name, "send-with-ack")
        })?;

        let size = event.estimated_size();
        // Acceptance into the peer's receive queue is the acknowledgment.
        match timeout(ack_timeout, peer_tx.send(event)).await {
            Ok(Ok(())) => {
                self.stats.record_send(size);
                Ok(())
            }
            Ok(Err(_)) => {
                let err = TransportError::connection_closed(self.name, "send-with-ack");
                self.stats.record_error(&err);
                Err(err)
            }
            Err(_) => {
                let err = TransportError::timeout("send-with-ack").with_transport(self.name);
                self.stats.record_error(&err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use crate::event::EVENT_TYPE_DATA;

    /// Test a round trip across a connected pair
    #[tokio::test]
    async fn test_pair_round_trip() {
        let (mut a, mut b) = ChannelTransport::pair("channel", 16);
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let mut b_events = b.subscribe().unwrap();

        a.send(Event::with_id("1", EVENT_TYPE_DATA, vec![1, 2, 3]))
            .await
            .unwrap();
        let received = b_events.recv().await.unwrap();
        assert_eq!(received.id, "1");
        assert_eq!(received.payload, vec![1, 2, 3]);

        // And the reverse direction.
        let mut a_events = a.subscribe().unwrap();
        b.send(Event::with_id("2", EVENT_TYPE_DATA, Vec::new()))
            .await
            .unwrap();
        assert_eq!(a_events.recv().await.unwrap().id, "2");
    }

    /// Test lifecycle contract: connect idempotence and send gating
    #[tokio::test]
    async fn test_lifecycle_contract() {
        let (mut a, _b) = ChannelTransport::pair("channel", 4);

        let err = a
            .send(Event::new(EVENT_TYPE_DATA, Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::NotConnected);

        a.connect().await.unwrap();
        let err = a.connect().await.unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::AlreadyConnected);

        a.close().await.unwrap();
        a.close().await.unwrap(); // idempotent

        let err = a
            .send(Event::new(EVENT_TYPE_DATA, Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::NotConnected);
    }

    /// Test that closing one endpoint terminates the peer's stream
    #[tokio::test]
    async fn test_close_terminates_peer_stream() {
        let (mut a, mut b) = ChannelTransport::pair("channel", 4);
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let mut b_events = b.subscribe().unwrap();

        a.close().await.unwrap();
        assert!(b_events.recv().await.is_none());

        // Sends into the closed pair surface connection-closed.
        let err = b
            .send(Event::new(EVENT_TYPE_DATA, Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::ConnectionClosed);
    }

    /// Test the batch capability preserves order
    #[tokio::test]
    async fn test_batch_order() {
        let (mut a, mut b) = ChannelTransport::pair("channel", 16);
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let mut b_events = b.subscribe().unwrap();

        let batch = (0..5)
            .map(|i| Event::with_id(i.to_string(), EVENT_TYPE_DATA, Vec::new()))
            .collect();
        a.as_batch().unwrap().send_batch(batch).await.unwrap();

        for i in 0..5 {
            assert_eq!(b_events.recv().await.unwrap().id, i.to_string());
        }
    }

    /// Test acknowledged send times out when the peer queue is full
    #[tokio::test]
    async fn test_send_with_ack_timeout() {
        let (mut a, mut b) = ChannelTransport::pair("channel", 1);
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let _b_events = b.subscribe().unwrap();

        let reliable = a.as_reliable().unwrap();
        reliable
            .send_with_ack(Event::new(EVENT_TYPE_DATA, Vec::new()), Duration::from_millis(50))
            .await
            .unwrap();

        // Queue full and nobody draining: the ack deadline fires.
        let err = reliable
            .send_with_ack(Event::new(EVENT_TYPE_DATA, Vec::new()), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::Timeout);
    }

    /// Test stats accumulate across operations
    #[tokio::test]
    async fn test_stats() {
        let (mut a, mut b) = ChannelTransport::pair("channel", 8);
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let _b_events = b.subscribe().unwrap();

        a.send(Event::new(EVENT_TYPE_DATA, vec![0; 32]))
            .await
            .unwrap();
        a.send(Event::new(EVENT_TYPE_DATA, vec![0; 32]))
            .await
            .unwrap();

        let stats = a.stats();
        assert_eq!(stats.events_sent, 2);
        assert!(stats.bytes_sent > 0);
        assert!(stats.connected_at.is_some());
    }
}
