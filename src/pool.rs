//! # Connection Pool Module
//!
//! A generic pool of physical connections for transports that multiplex
//! application traffic over more than one underlying link. The pool owns
//! the complete connection lifecycle; callers only acquire and return.
//!
//! ## Lifecycle
//!
//! ```text
//! created → idle → in-use → idle → … → expired → closed
//! ```
//!
//! State transitions are mediated exclusively by the pool. Returning is
//! dropping the [`PooledConnection`] guard; closing a connection directly
//! is not possible because the guard never gives ownership away.
//!
//! ## Invariants
//!
//! - `idle + in_use == total` and `total <= max_size`, enforced under the
//!   membership lock for every creation
//! - `idle <= max_idle`, enforced on return and by the maintenance worker
//! - a background task tops idle connections up to `min_idle`
//! - waiters for a full pool are served in FIFO order (the semaphore's
//!   fairness), failing with `acquire-timeout` on deadline
//!
//! ## Workers
//!
//! Three background tasks run until close: a closer that disposes of
//! connections without blocking callers, a health checker that probes idle
//! connections on a fixed interval, and a maintenance worker that evicts
//! expired connections, trims excess idle, and tops up to `min_idle`. All
//! three stop through a watch channel and are joined by `close` with a
//! bounded deadline.

use crate::error::{ConfigurationError, ConfigValue, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, warn};

/// Configuration for a [`ConnectionPool`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    /// Connections created eagerly when the pool starts
    pub initial_size: usize,

    /// Hard bound on total connections
    pub max_size: usize,

    /// Idle floor the maintenance worker tops up to
    pub min_idle: usize,

    /// Idle ceiling; returns beyond it close the connection
    pub max_idle: usize,

    /// Idle age past which a connection is expired
    pub max_idle_time: Duration,

    /// Total age past which a connection is expired
    pub max_lifetime: Duration,

    /// How long an acquire waits for a free connection
    pub acquire_timeout: Duration,

    /// Interval between health probe sweeps over the idle set
    pub health_check_interval: Duration,

    /// Deadline for a single health probe
    pub health_check_timeout: Duration,

    /// Run the factory's validate before handing a connection out
    pub validate_on_acquire: bool,

    /// Run the factory's broken-check when a connection is returned
    pub validate_on_return: bool,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 2,
            max_size: 8,
            min_idle: 1,
            max_idle: 4,
            max_idle_time: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
            acquire_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            validate_on_acquire: true,
            validate_on_return: false,
        }
    }
}

impl ConnectionPoolConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_size == 0 {
            return Err(ConfigurationError::new(
                "max_size",
                ConfigValue::Int(0),
                "must be positive",
            ));
        }
        if self.initial_size > self.max_size {
            return Err(ConfigurationError::new(
                "initial_size",
                ConfigValue::Int(self.initial_size as i64),
                "must not exceed max_size",
            ));
        }
        if self.min_idle > self.max_size {
            return Err(ConfigurationError::new(
                "min_idle",
                ConfigValue::Int(self.min_idle as i64),
                "must not exceed max_size",
            ));
        }
        if self.max_idle > self.max_size {
            return Err(ConfigurationError::new(
                "max_idle",
                ConfigValue::Int(self.max_idle as i64),
                "must not exceed max_size",
            ));
        }
        if self.min_idle > self.max_idle {
            return Err(ConfigurationError::new(
                "min_idle",
                ConfigValue::Int(self.min_idle as i64),
                "must not exceed max_idle",
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(ConfigurationError::new(
                "acquire_timeout",
                ConfigValue::Int(0),
                "must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Factory the pool delegates connection management to
///
/// The pool does not know how to create connections; an implementation of
/// this trait supplies creation, health probing, and disposal. `create` is
/// called under the pool's own lifetime and stops being called after
/// close.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The physical connection type
    type Connection: Send + 'static;

    /// Open a new connection
    async fn create(&self) -> Result<Self::Connection, TransportError>;

    /// Probe a connection's health
    ///
    /// Used on acquire (when `validate_on_acquire`) and by the health
    /// check worker. A failure closes the connection.
    async fn validate(&self, conn: &mut Self::Connection) -> Result<(), TransportError>;

    /// Cheap synchronous check used on the return path
    ///
    /// Runs when `validate_on_return` is set; a broken connection is
    /// closed instead of going back to the idle set.
    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }

    /// Dispose of a connection
    async fn close(&self, conn: Self::Connection);
}

/// Pool statistics snapshot
///
/// The counters are monotonic for the lifetime of the pool; the gauges
/// reflect the membership at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    /// Connections ever created
    pub total_created: u64,
    /// Connections ever closed
    pub total_closed: u64,
    /// Acquires that failed on deadline
    pub acquire_timeouts: u64,
    /// Health probes that rejected a connection
    pub health_check_failures: u64,
    /// Idle connections right now
    pub idle: usize,
    /// Connections currently handed out
    pub in_use: usize,
    /// Total live connections
    pub total: usize,
}

#[derive(Default)]
struct PoolCounters {
    total_created: AtomicU64,
    total_closed: AtomicU64,
    acquire_timeouts: AtomicU64,
    health_check_failures: AtomicU64,
}

struct IdleConn<C> {
    conn: C,
    id: u64,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConn<C>>,
    total: usize,
    in_use: usize,
    closed: bool,
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    config: ConnectionPoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    // FIFO gate on concurrently held connections; one permit per guard.
    semaphore: Arc<Semaphore>,
    counters: PoolCounters,
    next_conn_id: AtomicU64,
    // Connections are disposed off the caller's path through this channel.
    close_tx: mpsc::UnboundedSender<F::Connection>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> PoolInner<F> {
    /// Remove a connection from the accounting and queue it for disposal
    ///
    /// Callers must have already taken the connection out of `idle` or
    /// `in_use`; this only adjusts `total` and hands the connection to the
    /// closer worker.
    fn dispose(&self, conn: F::Connection) {
        self.counters.total_closed.fetch_add(1, Ordering::Relaxed);
        if self.close_tx.send(conn).is_err() {
            // Closer already gone (pool shutting down): the connection is
            // dropped here instead.
            debug!("closer worker gone, dropping connection");
        }
    }

    fn expired(&self, created_at: Instant, idle_since: Option<Instant>) -> bool {
        if created_at.elapsed() >= self.config.max_lifetime {
            return true;
        }
        if let Some(idle_since) = idle_since {
            if idle_since.elapsed() >= self.config.max_idle_time {
                return true;
            }
        }
        false
    }

    /// Create one connection with the membership slot already reserved
    async fn create_reserved(&self) -> Result<(F::Connection, u64, Instant), TransportError> {
        match self.factory.create().await {
            Ok(conn) => {
                self.counters.total_created.fetch_add(1, Ordering::Relaxed);
                let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                debug!(conn_id = id, "pool connection created");
                Ok((conn, id, Instant::now()))
            }
            Err(err) => {
                let mut state = self.state.lock().expect("pool lock poisoned");
                state.total -= 1;
                Err(err)
            }
        }
    }
}

/// Generic connection pool with health checking and lifetime bounds
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool, eagerly opening `initial_size` connections
    ///
    /// Spawns the closer, health check, and maintenance workers. Fails
    /// with `invalid-configuration` when the configuration does not
    /// validate; initial connection failures are logged and left to the
    /// maintenance worker to retry.
    pub async fn new(factory: F, config: ConnectionPoolConfig) -> Result<Self, TransportError> {
        config.validate()?;

        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            factory,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                in_use: 0,
                closed: false,
            }),
            config,
            counters: PoolCounters::default(),
            next_conn_id: AtomicU64::new(1),
            close_tx,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        });

        let pool = Self { inner };
        pool.fill_to(pool.inner.config.initial_size).await;

        let mut workers = Vec::new();
        workers.push(tokio::spawn(Self::closer_worker(
            pool.inner.clone(),
            close_rx,
            shutdown_rx.clone(),
        )));
        workers.push(tokio::spawn(Self::health_check_worker(
            pool.inner.clone(),
            shutdown_rx.clone(),
        )));
        workers.push(tokio::spawn(Self::maintenance_worker(
            pool.inner.clone(),
            shutdown_rx,
        )));
        *pool.inner.workers.lock().expect("pool lock poisoned") = workers;

        Ok(pool)
    }

    /// Acquire a connection
    ///
    /// Takes an idle connection when one is available (optionally
    /// validated; failures close it and retry), creates one while `total <
    /// max_size`, and otherwise waits FIFO behind earlier acquirers,
    /// failing with `acquire-timeout` on deadline.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, TransportError> {
        let inner = &self.inner;
        if inner.state.lock().expect("pool lock poisoned").closed {
            return Err(TransportError::connection_closed("pool", "acquire")
                .with_message("pool is closed"));
        }

        let permit = match timeout(
            inner.config.acquire_timeout,
            inner.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(TransportError::connection_closed("pool", "acquire")
                    .with_message("pool is closed"));
            }
            Err(_) => {
                inner
                    .counters
                    .acquire_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::acquire_timeout(inner.config.acquire_timeout));
            }
        };

        loop {
            // Take an idle connection or reserve a creation slot.
            let action = {
                let mut state = inner.state.lock().expect("pool lock poisoned");
                if state.closed {
                    return Err(TransportError::connection_closed("pool", "acquire")
                        .with_message("pool is closed"));
                }
                if let Some(idle) = state.idle.pop_front() {
                    state.in_use += 1;
                    Some(idle)
                } else if state.total < inner.config.max_size {
                    state.total += 1;
                    state.in_use += 1;
                    None
                } else {
                    // Capacity freed by our permit holder is transiently
                    // out of the idle set (e.g. mid-health-probe). Back
                    // off briefly and re-check.
                    drop(state);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    continue;
                }
            };

            match action {
                Some(mut idle) => {
                    // Expiry and optional validation happen outside the lock.
                    if inner.expired(idle.created_at, Some(idle.idle_since)) {
                        self.discard_in_use(idle.conn);
                        continue;
                    }
                    if inner.config.validate_on_acquire {
                        let probe = timeout(
                            inner.config.health_check_timeout,
                            inner.factory.validate(&mut idle.conn),
                        )
                        .await;
                        if !matches!(probe, Ok(Ok(()))) {
                            debug!(conn_id = idle.id, "connection failed acquire validation");
                            inner
                                .counters
                                .health_check_failures
                                .fetch_add(1, Ordering::Relaxed);
                            self.discard_in_use(idle.conn);
                            continue;
                        }
                    }
                    return Ok(PooledConnection {
                        conn: Some(idle.conn),
                        id: idle.id,
                        created_at: idle.created_at,
                        pool: Arc::downgrade(inner),
                        permit: Some(permit),
                    });
                }
                None => {
                    let (conn, id, created_at) = match inner.create_reserved().await {
                        Ok(created) => created,
                        Err(err) => {
                            let mut state = inner.state.lock().expect("pool lock poisoned");
                            state.in_use -= 1;
                            return Err(err);
                        }
                    };
                    return Ok(PooledConnection {
                        conn: Some(conn),
                        id,
                        created_at,
                        pool: Arc::downgrade(inner),
                        permit: Some(permit),
                    });
                }
            }
        }
    }

    /// Drop an in-use connection out of the accounting and dispose of it
    fn discard_in_use(&self, conn: F::Connection) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().expect("pool lock poisoned");
            state.in_use -= 1;
            state.total -= 1;
        }
        inner.dispose(conn);
    }

    /// Create idle connections until `total` reaches `target`
    async fn fill_to(&self, target: usize) {
        let inner = &self.inner;
        loop {
            {
                let mut state = inner.state.lock().expect("pool lock poisoned");
                if state.closed
                    || state.total >= target
                    || state.total >= inner.config.max_size
                    || state.idle.len() >= inner.config.max_idle
                {
                    return;
                }
                state.total += 1;
            }
            match inner.create_reserved().await {
                Ok((conn, id, created_at)) => {
                    let mut state = inner.state.lock().expect("pool lock poisoned");
                    state.idle.push_back(IdleConn {
                        conn,
                        id,
                        created_at,
                        idle_since: Instant::now(),
                    });
                }
                Err(err) => {
                    warn!(error = %err, "pool top-up connection failed");
                    return;
                }
            }
        }
    }

    /// Dispose of connections the guards sent back for closing
    async fn closer_worker(
        inner: Arc<PoolInner<F>>,
        mut close_rx: mpsc::UnboundedReceiver<F::Connection>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                conn = close_rx.recv() => match conn {
                    Some(conn) => inner.factory.close(conn).await,
                    None => break,
                },
                _ = shutdown_rx.changed() => {
                    // Drain whatever is already queued, then exit.
                    while let Ok(conn) = close_rx.try_recv() {
                        inner.factory.close(conn).await;
                    }
                    break;
                }
            }
        }
        debug!("pool closer worker exited");
    }

    /// Probe idle connections on a fixed interval
    async fn health_check_worker(inner: Arc<PoolInner<F>>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(inner.config.health_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => break,
            }

            // Snapshot the idle set; in-use connections are exclusively
            // borrowed by their guards and are probed on return instead.
            let snapshot: Vec<IdleConn<F::Connection>> = {
                let mut state = inner.state.lock().expect("pool lock poisoned");
                state.idle.drain(..).collect()
            };

            for mut idle in snapshot {
                let probe = timeout(
                    inner.config.health_check_timeout,
                    inner.factory.validate(&mut idle.conn),
                )
                .await;
                match probe {
                    Ok(Ok(())) => {
                        let mut state = inner.state.lock().expect("pool lock poisoned");
                        state.idle.push_back(idle);
                    }
                    _ => {
                        warn!(conn_id = idle.id, "idle connection failed health check");
                        inner
                            .counters
                            .health_check_failures
                            .fetch_add(1, Ordering::Relaxed);
                        let mut state = inner.state.lock().expect("pool lock poisoned");
                        state.total -= 1;
                        drop(state);
                        inner.dispose(idle.conn);
                    }
                }
            }
        }
        debug!("pool health check worker exited");
    }

    /// Evict expired connections, trim excess idle, and top up `min_idle`
    async fn maintenance_worker(inner: Arc<PoolInner<F>>, mut shutdown_rx: watch::Receiver<bool>) {
        // Run often enough to notice idle expiry without busy-looping.
        let period = (inner.config.max_idle_time / 4)
            .max(Duration::from_millis(100))
            .min(inner.config.health_check_interval);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let pool = ConnectionPool {
            inner: inner.clone(),
        };
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => break,
            }

            // Evict expired and trim down to max_idle.
            let mut evicted = Vec::new();
            {
                let mut state = inner.state.lock().expect("pool lock poisoned");
                let max_idle = inner.config.max_idle;
                let mut keep = VecDeque::with_capacity(state.idle.len());
                while let Some(idle) = state.idle.pop_front() {
                    if inner.expired(idle.created_at, Some(idle.idle_since)) || keep.len() >= max_idle
                    {
                        state.total -= 1;
                        evicted.push(idle);
                    } else {
                        keep.push_back(idle);
                    }
                }
                state.idle = keep;
            }
            for idle in evicted {
                debug!(conn_id = idle.id, "evicting pool connection");
                inner.dispose(idle.conn);
            }

            // Top up the idle floor.
            let deficit_target = {
                let state = inner.state.lock().expect("pool lock poisoned");
                if state.idle.len() < inner.config.min_idle {
                    state.total + (inner.config.min_idle - state.idle.len())
                } else {
                    0
                }
            };
            if deficit_target > 0 {
                pool.fill_to(deficit_target).await;
            }
        }
        debug!("pool maintenance worker exited");
    }

    /// Current statistics snapshot
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let (idle, in_use, total) = {
            let state = inner.state.lock().expect("pool lock poisoned");
            (state.idle.len(), state.in_use, state.total)
        };
        PoolStats {
            total_created: inner.counters.total_created.load(Ordering::Relaxed),
            total_closed: inner.counters.total_closed.load(Ordering::Relaxed),
            acquire_timeouts: inner.counters.acquire_timeouts.load(Ordering::Relaxed),
            health_check_failures: inner
                .counters
                .health_check_failures
                .load(Ordering::Relaxed),
            idle,
            in_use,
            total,
        }
    }

    /// Close the pool
    ///
    /// Idempotent. Stops the workers, disposes of every idle connection,
    /// and fails subsequent acquires. Guards still out close their
    /// connections on drop.
    pub async fn close(&self) {
        let inner = &self.inner;
        let idle: Vec<IdleConn<F::Connection>> = {
            let mut state = inner.state.lock().expect("pool lock poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total -= drained.len();
            drained
        };

        let _ = inner.shutdown_tx.send(true);
        // Wake any acquirers parked on the semaphore.
        inner.semaphore.close();
        let workers: Vec<JoinHandle<()>> =
            inner.workers.lock().expect("pool lock poisoned").drain(..).collect();
        for worker in workers {
            if timeout(Duration::from_secs(5), worker).await.is_err() {
                warn!("pool worker did not exit within deadline");
            }
        }

        for idle in idle {
            inner.factory.close(idle.conn).await;
            inner.counters.total_closed.fetch_add(1, Ordering::Relaxed);
        }
        debug!("connection pool closed");
    }
}

/// RAII guard for an acquired connection
///
/// Dereferences to the underlying connection. Dropping the guard returns
/// the connection to the pool: expired or broken connections are closed,
/// a full idle set closes the connection, and otherwise it goes back to
/// the idle queue. The guard holds the semaphore permit, so the return
/// completes before the next waiter proceeds.
#[derive(Debug)]
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<F::Connection>,
    id: u64,
    created_at: Instant,
    pool: Weak<PoolInner<F>>,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Pool-assigned identifier, stable for the connection's lifetime
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the underlying connection was created
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection taken")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection taken")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };
        let inner = match self.pool.upgrade() {
            Some(inner) => inner,
            None => return, // pool gone; the connection drops with us
        };

        let broken = inner.config.validate_on_return && inner.factory.has_broken(&mut conn);
        let expired = inner.expired(self.created_at, None);

        {
            let mut state = inner.state.lock().expect("pool lock poisoned");
            state.in_use -= 1;
            if state.closed || broken || expired || state.idle.len() >= inner.config.max_idle {
                state.total -= 1;
                drop(state);
                inner.dispose(conn);
            } else {
                state.idle.push_back(IdleConn {
                    conn,
                    id: self.id,
                    created_at: self.created_at,
                    idle_since: Instant::now(),
                });
            }
        }

        // The return is visible before the permit wakes the next waiter.
        self.permit.take();
    }
}
