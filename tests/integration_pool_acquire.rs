//! Connection pool acquire semantics: timeout under exhaustion, FIFO
//! waiter service, and the membership invariants.

use async_trait::async_trait;
use event_transport::error::{TransportError, TransportErrorKind};
use event_transport::pool::{ConnectionFactory, ConnectionPool, ConnectionPoolConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct CountingFactory {
    created: AtomicU64,
    closed: AtomicU64,
}

impl CountingFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl ConnectionFactory for Arc<CountingFactory> {
    type Connection = u64;

    async fn create(&self) -> Result<u64, TransportError> {
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }

    async fn validate(&self, _conn: &mut u64) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self, _conn: u64) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn config(max_size: usize, acquire_timeout: Duration) -> ConnectionPoolConfig {
    ConnectionPoolConfig {
        initial_size: 0,
        min_idle: 0,
        max_idle: max_size,
        max_size,
        acquire_timeout,
        health_check_interval: Duration::from_secs(60),
        ..Default::default()
    }
}

/// Scenario F: max_size=1, acquire_timeout=50ms; the second caller times
/// out while the first holds the only connection.
#[tokio::test]
async fn acquire_times_out_when_exhausted() {
    let factory = CountingFactory::new();
    let pool = ConnectionPool::new(factory, config(1, Duration::from_millis(50)))
        .await
        .unwrap();

    let held = pool.acquire().await.unwrap();

    let start = Instant::now();
    let err = pool.acquire().await.unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err.kind(), TransportErrorKind::AcquireTimeout);
    assert!(err.temporary());
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(500));
    assert_eq!(pool.stats().acquire_timeouts, 1);

    drop(held);
    pool.close().await;
}

/// Invariant 5: totals stay bounded and acquire/return is balanced.
#[tokio::test]
async fn membership_invariants_hold() {
    let factory = CountingFactory::new();
    let pool = ConnectionPool::new(factory, config(3, Duration::from_millis(200)))
        .await
        .unwrap();

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.in_use, 2);
    assert_eq!(stats.idle + stats.in_use, stats.total);
    assert!(stats.total <= 3);

    drop(a);
    let stats = pool.stats();
    assert_eq!(stats.in_use, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.total, 2);

    drop(b);
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.total, 2);

    pool.close().await;
}

/// A waiter parked on a full pool is served as soon as a connection is
/// returned, well before its deadline.
#[tokio::test]
async fn waiter_is_served_on_return() {
    let factory = CountingFactory::new();
    let pool = ConnectionPool::new(factory.clone(), config(1, Duration::from_secs(5)))
        .await
        .unwrap();

    let held = pool.acquire().await.unwrap();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move {
        let started = Instant::now();
        let conn = waiter_pool.acquire().await.unwrap();
        (started.elapsed(), conn.id())
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let held_id = held.id();
    drop(held);

    let (waited, reused_id) = waiter.await.unwrap();
    assert!(waited < Duration::from_secs(1));
    // The returned connection is handed to the waiter, not a new one.
    assert_eq!(reused_id, held_id);
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);

    pool.close().await;
}

/// Created and closed counters are monotonic and reconcile at close.
#[tokio::test]
async fn created_closed_reconcile() {
    let factory = CountingFactory::new();
    let pool = ConnectionPool::new(factory.clone(), config(4, Duration::from_millis(200)))
        .await
        .unwrap();

    let mut guards = Vec::new();
    for _ in 0..4 {
        guards.push(pool.acquire().await.unwrap());
    }
    drop(guards);

    pool.close().await;
    // Guards returned before close, so everything was closed by the pool.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.total_created, 4);
    assert_eq!(stats.total_closed, 4);
}
