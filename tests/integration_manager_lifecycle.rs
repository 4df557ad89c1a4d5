//! End-to-end manager scenarios over the in-process channel transport:
//! receive flow, outgoing validation, transport swap, crash isolation,
//! and stop semantics.

use event_transport::error::TransportErrorKind;
use event_transport::event::{Event, EVENT_TYPE_DATA};
use event_transport::manager::{Manager, ManagerConfig};
use event_transport::transport::{ChannelTransport, Transport};
use event_transport::validation::ValidationConfig;
use std::time::Duration;
use tokio::time::timeout;

const STOP_DEADLINE: Duration = Duration::from_secs(2);
const RECV_DEADLINE: Duration = Duration::from_secs(2);

/// Build a manager bound to one end of a channel pair; returns the peer.
async fn bound_manager(config: ManagerConfig) -> (Manager, ChannelTransport) {
    let manager = Manager::new(config).unwrap();
    let (local, mut peer) = ChannelTransport::pair("channel", 64);
    peer.connect().await.unwrap();
    manager.set_transport(Box::new(local)).await.unwrap();
    (manager, peer)
}

#[tokio::test]
async fn receive_flow_envelopes_events() {
    let (manager, mut peer) = bound_manager(ManagerConfig::default()).await;
    let mut events = manager.events().unwrap();
    manager.start().await.unwrap();

    peer.send(Event::with_id("in-1", EVENT_TYPE_DATA, vec![42]))
        .await
        .unwrap();

    let envelope = timeout(RECV_DEADLINE, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.event.id, "in-1");
    assert_eq!(envelope.metadata.transport, "channel");
    assert!(envelope.metadata.size > 0);
    assert!(envelope.metadata.validation.is_none());
    assert_eq!(manager.metrics().events_received, 1);

    manager.stop(STOP_DEADLINE).await.unwrap();
}

/// Scenario E: outgoing validation rejects a disallowed type and the
/// transport receives nothing.
#[tokio::test]
async fn outgoing_validation_aborts_send() {
    let config = ManagerConfig {
        validation: ValidationConfig {
            allowed_event_types: vec!["allowed".to_string()],
            ..Default::default()
        },
        ..Default::default()
    };
    let (manager, mut peer) = bound_manager(config).await;
    let mut peer_events = peer.subscribe().unwrap();
    manager.start().await.unwrap();

    let err = manager
        .send(Event::new("forbidden", Vec::new()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::ValidationFailed);
    assert!(err.to_string().contains("invalid-event-type"));

    // The allowed type goes through; the forbidden one never did.
    manager
        .send(Event::with_id("ok", "allowed", Vec::new()))
        .await
        .unwrap();
    let received = timeout(RECV_DEADLINE, peer_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.id, "ok");

    manager.stop(STOP_DEADLINE).await.unwrap();
}

/// Non-strict incoming validation annotates and forwards; the error
/// channel carries the validation failure.
#[tokio::test]
async fn incoming_validation_annotates_in_lenient_mode() {
    let (manager, mut peer) = bound_manager(ManagerConfig::default()).await;
    let mut events = manager.events().unwrap();
    let mut errors = manager.errors().unwrap();
    manager.start().await.unwrap();

    // Empty id fails the required-fields rule.
    peer.send(Event::with_id("", EVENT_TYPE_DATA, Vec::new()))
        .await
        .unwrap();

    let envelope = timeout(RECV_DEADLINE, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.metadata.validation.as_deref(), Some("required-fields"));

    let err = timeout(RECV_DEADLINE, errors.recv()).await.unwrap().unwrap();
    assert_eq!(err.kind(), TransportErrorKind::ValidationFailed);
    assert_eq!(manager.metrics().validation_failures, 1);

    manager.stop(STOP_DEADLINE).await.unwrap();
}

/// Strict mode suppresses delivery and only the error channel sees it.
#[tokio::test]
async fn incoming_validation_suppresses_in_strict_mode() {
    let config = ManagerConfig {
        validation: ValidationConfig {
            strict_mode: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let (manager, mut peer) = bound_manager(config).await;
    let mut events = manager.events().unwrap();
    let mut errors = manager.errors().unwrap();
    manager.start().await.unwrap();

    peer.send(Event::with_id("", EVENT_TYPE_DATA, Vec::new()))
        .await
        .unwrap();
    peer.send(Event::with_id("good", EVENT_TYPE_DATA, Vec::new()))
        .await
        .unwrap();

    // Only the valid event is delivered; the invalid one was suppressed.
    let envelope = timeout(RECV_DEADLINE, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.event.id, "good");

    let err = timeout(RECV_DEADLINE, errors.recv()).await.unwrap().unwrap();
    assert_eq!(err.kind(), TransportErrorKind::ValidationFailed);

    manager.stop(STOP_DEADLINE).await.unwrap();
}

/// Invariant 7: after a swap returns, sends route to the new transport
/// and the old transport was closed.
#[tokio::test]
async fn swap_routes_sends_to_new_transport() {
    let (manager, mut old_peer) = bound_manager(ManagerConfig::default()).await;
    let mut old_peer_events = old_peer.subscribe().unwrap();
    manager.start().await.unwrap();

    manager
        .send(Event::with_id("before", EVENT_TYPE_DATA, Vec::new()))
        .await
        .unwrap();
    assert_eq!(
        timeout(RECV_DEADLINE, old_peer_events.recv())
            .await
            .unwrap()
            .unwrap()
            .id,
        "before"
    );

    // Swap in a fresh pair.
    let (new_local, mut new_peer) = ChannelTransport::pair("channel", 64);
    new_peer.connect().await.unwrap();
    let mut new_peer_events = new_peer.subscribe().unwrap();
    manager.set_transport(Box::new(new_local)).await.unwrap();

    // The old endpoint was closed: its peer's stream terminated.
    assert!(timeout(RECV_DEADLINE, old_peer_events.recv())
        .await
        .unwrap()
        .is_none());

    manager
        .send(Event::with_id("after", EVENT_TYPE_DATA, Vec::new()))
        .await
        .unwrap();
    assert_eq!(
        timeout(RECV_DEADLINE, new_peer_events.recv())
            .await
            .unwrap()
            .unwrap()
            .id,
        "after"
    );
    assert_eq!(manager.metrics().transport_swaps, 2);

    manager.stop(STOP_DEADLINE).await.unwrap();
}

/// Receive flow keeps working across a swap performed while running.
#[tokio::test]
async fn swap_rebinds_receive_loop() {
    let (manager, _old_peer) = bound_manager(ManagerConfig::default()).await;
    let mut events = manager.events().unwrap();
    manager.start().await.unwrap();

    let (new_local, mut new_peer) = ChannelTransport::pair("channel", 64);
    new_peer.connect().await.unwrap();
    manager.set_transport(Box::new(new_local)).await.unwrap();

    new_peer
        .send(Event::with_id("via-new", EVENT_TYPE_DATA, Vec::new()))
        .await
        .unwrap();
    let envelope = timeout(RECV_DEADLINE, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.event.id, "via-new");

    manager.stop(STOP_DEADLINE).await.unwrap();
}

/// A transport crash surfaces on the error channel and the manager keeps
/// running; binding a replacement restores service.
#[tokio::test]
async fn transport_crash_is_isolated() {
    let (manager, mut peer) = bound_manager(ManagerConfig::default()).await;
    let mut events = manager.events().unwrap();
    let mut errors = manager.errors().unwrap();
    manager.start().await.unwrap();

    // Simulate the crash: the peer endpoint vanishes.
    peer.close().await.unwrap();

    let err = timeout(RECV_DEADLINE, errors.recv()).await.unwrap().unwrap();
    assert_eq!(err.kind(), TransportErrorKind::ConnectionClosed);
    assert!(manager.is_started());

    // The application swaps in a replacement; events flow again.
    let (new_local, mut new_peer) = ChannelTransport::pair("channel", 64);
    new_peer.connect().await.unwrap();
    manager.set_transport(Box::new(new_local)).await.unwrap();

    new_peer
        .send(Event::with_id("recovered", EVENT_TYPE_DATA, Vec::new()))
        .await
        .unwrap();
    let envelope = timeout(RECV_DEADLINE, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.event.id, "recovered");

    manager.stop(STOP_DEADLINE).await.unwrap();
}

/// Invariant 6: stop is idempotent and closes the public channels.
#[tokio::test]
async fn stop_closes_public_channels() {
    let (manager, _peer) = bound_manager(ManagerConfig::default()).await;
    let mut events = manager.events().unwrap();
    manager.start().await.unwrap();

    manager.stop(STOP_DEADLINE).await.unwrap();
    manager.stop(STOP_DEADLINE).await.unwrap();

    // Channel is closed after stop.
    assert!(timeout(RECV_DEADLINE, events.recv())
        .await
        .unwrap()
        .is_none());

    // Data-plane operations now fail.
    let err = manager
        .send(Event::new(EVENT_TYPE_DATA, Vec::new()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::NotConnected);
}

/// Events buffered before stop are still delivered to a live consumer.
#[tokio::test]
async fn stop_drains_buffered_events() {
    let (manager, mut peer) = bound_manager(ManagerConfig::default()).await;
    let mut events = manager.events().unwrap();
    manager.start().await.unwrap();

    for i in 0..5 {
        peer.send(Event::with_id(format!("d{}", i), EVENT_TYPE_DATA, Vec::new()))
            .await
            .unwrap();
    }
    // Let the receive loop pick everything up before stopping.
    let first = timeout(RECV_DEADLINE, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.event.id, "d0");
    for _ in 0..200 {
        if manager.metrics().events_received == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(manager.metrics().events_received, 5);
    // The counter ticks at pickup; give the last submit a beat to land.
    tokio::time::sleep(Duration::from_millis(20)).await;

    manager.stop(STOP_DEADLINE).await.unwrap();

    let mut seen = 1;
    while let Some(envelope) = events.recv().await {
        assert_eq!(envelope.event.id, format!("d{}", seen));
        seen += 1;
    }
    assert_eq!(seen, 5, "buffered events should drain through stop");
}
