//! Connection pool implementation.
//!
//! All mutable pool state (the available set, the busy count and the wait
//! queue) sits behind one mutex. The lock is never held across an `.await`:
//! opening and pinging connections happen outside it, against slots that
//! were reserved while it was held.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sqltx_types::{
    Connection, DbError, DynConnectionFactory, IsolationLevel, QueryResult, SqlValue,
};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::lifecycle::{ConnectionMetadata, ConnectionState, HealthCheckResult};

/// A bounded, health-checked pool of database connections.
///
/// The pool is a cheap handle; clones share the same connections.
///
/// # Fairness
///
/// Callers that find the pool saturated wait in a strict FIFO queue. A
/// returned connection goes to the longest waiter, never to a newer caller.
///
/// # Example
///
/// ```rust,ignore
/// use sqltx_pool::{Pool, PoolConfig};
///
/// let pool = Pool::builder()
///     .min_connections(2)
///     .max_connections(20)
///     .build(factory)
///     .await?;
///
/// let mut conn = pool.get().await?;
/// conn.query("SELECT 1", &[]).await?;
/// pool.release(conn);
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// Pool configuration.
    config: PoolConfig,

    /// Opens new connections.
    factory: DynConnectionFactory,

    /// Whether the pool is closed.
    closed: AtomicBool,

    /// Counter for generating connection IDs.
    next_connection_id: AtomicU64,

    /// Counter for generating waiter IDs.
    next_waiter_id: AtomicU64,

    /// When the pool was created.
    created_at: Instant,

    /// Available set, busy count and wait queue.
    state: Mutex<PoolState>,

    /// Pool metrics.
    metrics: Mutex<PoolMetricsInner>,
}

#[derive(Default)]
struct PoolState {
    /// Idle connections, most recently returned first.
    idle: VecDeque<IdleConnection>,
    /// Connections lent out, plus slots reserved for connections being opened
    /// on behalf of a caller.
    in_use: u32,
    /// Connections taken out by the health sweep, plus slots reserved for
    /// top-up connections.
    maintenance: u32,
    /// Callers blocked in `get()`, oldest first.
    waiters: VecDeque<Waiter>,
}

impl PoolState {
    fn total(&self) -> u32 {
        self.idle.len() as u32 + self.in_use + self.maintenance
    }
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    metadata: ConnectionMetadata,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

/// What a waiter is handed when it reaches the head of the queue.
enum Grant {
    /// A ready connection.
    Connection(IdleConnection),
    /// Capacity freed up; the waiter opens its own connection.
    Slot,
}

enum Checkout {
    Ready(IdleConnection),
    Open,
    Wait(u64, oneshot::Receiver<Grant>),
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    /// Total connections created.
    connections_created: u64,
    /// Total connections closed.
    connections_closed: u64,
    /// Total successful checkouts.
    checkouts_successful: u64,
    /// Total failed checkouts (timeouts, errors).
    checkouts_failed: u64,
    /// Total health checks performed.
    health_checks_performed: u64,
    /// Total health check failures.
    health_checks_failed: u64,
    /// Connections closed for sitting idle too long.
    idle_evictions: u64,
}

impl Pool {
    /// Create a new pool builder.
    ///
    /// Use the builder to configure the pool before creating it.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Create a new pool with the given configuration.
    ///
    /// Opens `min_connections` connections up front and starts the background
    /// health sweep. Failures to open the initial connections are logged and
    /// left for the sweep to retry.
    pub async fn new(config: PoolConfig, factory: DynConnectionFactory) -> Result<Self, PoolError> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            config: config.clone(),
            factory,
            closed: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
            next_waiter_id: AtomicU64::new(1),
            created_at: Instant::now(),
            state: Mutex::new(PoolState::default()),
            metrics: Mutex::new(PoolMetricsInner::default()),
        });

        let pool = Self { inner };
        pool.top_up().await;
        pool.spawn_health_check();

        tracing::info!(
            min = config.min_connections,
            max = config.max_connections,
            "connection pool created"
        );

        Ok(pool)
    }

    /// Get a connection from the pool.
    ///
    /// This will either return an existing idle connection or create a new one
    /// if the pool is not at capacity. If all connections are in use and the
    /// pool is at capacity, this will wait in FIFO order until a connection
    /// becomes available or the acquire timeout is reached.
    pub async fn get(&self) -> Result<PooledConnection, PoolError> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        tracing::trace!("acquiring connection from pool");
        let started = Instant::now();

        let checkout = {
            let mut state = self.inner.state.lock();
            if let Some(idle) = state.idle.pop_front() {
                state.in_use += 1;
                Checkout::Ready(idle)
            } else if state.waiters.is_empty() && state.total() < self.inner.config.max_connections
            {
                state.in_use += 1;
                Checkout::Open
            } else {
                let id = self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter { id, tx });
                tracing::debug!(waiter = id, waiting = state.waiters.len(), "pool saturated, queueing");
                Checkout::Wait(id, rx)
            }
        };

        let result = match checkout {
            Checkout::Ready(idle) => self.hand_out(idle).await,
            Checkout::Open => self.open_for_checkout().await,
            Checkout::Wait(id, rx) => match self.wait_for_grant(id, rx, started).await {
                Ok(Grant::Connection(idle)) => self.hand_out(idle).await,
                Ok(Grant::Slot) => self.open_for_checkout().await,
                Err(e) => Err(e),
            },
        };

        let mut metrics = self.inner.metrics.lock();
        match &result {
            Ok(conn) => {
                metrics.checkouts_successful += 1;
                tracing::trace!(
                    connection_id = conn.metadata.id,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "connection checked out"
                );
            }
            Err(e) => {
                metrics.checkouts_failed += 1;
                tracing::debug!(error = %e, "connection checkout failed");
            }
        }

        result
    }

    /// Try to get an idle connection without waiting or opening a new one.
    ///
    /// Returns `None` if no connections are immediately available.
    pub fn try_get(&self) -> Result<Option<PooledConnection>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let mut state = self.inner.state.lock();
        let Some(idle) = state.idle.pop_front() else {
            return Ok(None);
        };
        state.in_use += 1;
        drop(state);

        self.inner.metrics.lock().checkouts_successful += 1;
        Ok(Some(PooledConnection::new(idle, Arc::clone(&self.inner))))
    }

    /// Return a connection to the pool.
    ///
    /// Equivalent to dropping the guard; the connection goes to the oldest
    /// waiter if there is one, otherwise back to the available set.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Get a point-in-time snapshot of the pool.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            available: state.idle.len() as u32,
            in_use: state.in_use,
            waiting: state.waiters.len() as u32,
            total: state.total(),
            max: self.inner.config.max_connections,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            health_checks_performed: inner.health_checks_performed,
            health_checks_failed: inner.health_checks_failed,
            idle_evictions: inner.idle_evictions,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Run one health sweep.
    ///
    /// Closes idle connections past the idle timeout, pings the remaining
    /// idle connections and closes the ones that fail, then opens connections
    /// until the pool is back at `min_connections`. Busy connections are never
    /// touched. The background task calls this every `health_check_interval`.
    pub async fn run_health_check(&self) -> Vec<HealthCheckResult> {
        if self.is_closed() {
            return Vec::new();
        }

        let idle_timeout = self.inner.config.idle_timeout;
        let ping_timeout = self.inner.config.ping_timeout;
        let (expired, to_check, mut slots) = {
            let mut state = self.inner.state.lock();
            let (expired, keep): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|c| c.metadata.is_idle_expired(idle_timeout));
            let slots = MaintenanceSlots::take(&self.inner, &mut state, keep.len() as u32);
            (expired, keep, slots)
        };

        if !expired.is_empty() {
            {
                let mut metrics = self.inner.metrics.lock();
                metrics.idle_evictions += expired.len() as u64;
                metrics.connections_closed += expired.len() as u64;
            }
            for conn in &expired {
                tracing::debug!(
                    connection_id = conn.metadata.id,
                    idle_ms = conn.metadata.idle_time().as_millis() as u64,
                    "closing idle connection"
                );
            }
            // Capacity freed by eviction may unblock waiters.
            let mut state = self.inner.state.lock();
            for _ in 0..expired.len() {
                self.inner.grant_slot(&mut state);
            }
        }
        drop(expired);

        let mut results = Vec::with_capacity(to_check.len());
        for mut idle in to_check {
            idle.metadata.state = ConnectionState::Checking;
            let started = Instant::now();
            let outcome = ping_within(&mut *idle.conn, ping_timeout).await;
            let now = Instant::now();
            idle.metadata.last_checked_at = Some(now);
            idle.metadata.healthy = outcome.is_ok();

            {
                let mut metrics = self.inner.metrics.lock();
                metrics.health_checks_performed += 1;
                if outcome.is_err() {
                    metrics.health_checks_failed += 1;
                    metrics.connections_closed += 1;
                }
            }

            results.push(HealthCheckResult {
                connection_id: idle.metadata.id,
                healthy: outcome.is_ok(),
                latency: now.duration_since(started),
                error: outcome.as_ref().err().map(ToString::to_string),
            });

            let mut state = self.inner.state.lock();
            slots.settle(&mut state);
            match outcome {
                Ok(()) => self.inner.put_back(&mut state, idle),
                Err(e) => {
                    tracing::warn!(
                        connection_id = idle.metadata.id,
                        error = %e,
                        "health check failed, closing connection"
                    );
                    self.inner.grant_slot(&mut state);
                }
            }
        }
        drop(slots);

        self.top_up().await;
        results
    }

    /// Close the pool, dropping all idle connections and failing all waiters.
    ///
    /// Connections currently lent out are closed when they are returned.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            let idle: Vec<_> = state.idle.drain(..).collect();
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            (idle, waiters)
        };
        self.inner.metrics.lock().connections_closed += idle.len() as u64;
        drop(waiters);
        drop(idle);
        tracing::info!("connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    async fn wait_for_grant(
        &self,
        id: u64,
        rx: oneshot::Receiver<Grant>,
        started: Instant,
    ) -> Result<Grant, PoolError> {
        let mut ticket = WaitTicket {
            inner: &self.inner,
            id,
            rx,
            settled: false,
        };
        match tokio::time::timeout(self.inner.config.acquire_timeout, &mut ticket.rx).await {
            Ok(Ok(grant)) => {
                ticket.settled = true;
                Ok(grant)
            }
            Ok(Err(_)) => {
                ticket.settled = true;
                Err(PoolError::PoolClosed)
            }
            Err(_) => {
                // Granted while the timer fired: take it rather than waste it.
                if let Some(grant) = ticket.withdraw() {
                    return Ok(grant);
                }
                tracing::debug!(waiter = id, "gave up waiting for a connection");
                Err(PoolError::Timeout {
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Finish a checkout of an existing connection, pinging it if configured.
    async fn hand_out(&self, idle: IdleConnection) -> Result<PooledConnection, PoolError> {
        // From here on the guard owns the slot, so a cancelled caller still
        // returns it.
        let mut conn = PooledConnection::new(idle, Arc::clone(&self.inner));
        if !self.inner.config.test_on_checkout {
            return Ok(conn);
        }

        if let Err(e) = ping_within(&mut *conn, self.inner.config.ping_timeout).await {
            tracing::debug!(
                connection_id = conn.id(),
                error = %e,
                "connection failed checkout ping, replacing"
            );
            match self.open().await {
                Ok(fresh) => {
                    self.inner.metrics.lock().connections_closed += 1;
                    conn.replace(fresh);
                }
                Err(e) => {
                    conn.mark_unhealthy();
                    return Err(PoolError::Connect(e));
                }
            }
        }
        Ok(conn)
    }

    /// Open a connection into a slot already counted in `in_use`.
    async fn open_for_checkout(&self) -> Result<PooledConnection, PoolError> {
        let reservation = Reservation {
            inner: &self.inner,
            armed: true,
        };
        let opened = self.open().await;
        reservation.finish(opened.is_ok());
        opened
            .map(|idle| PooledConnection::new(idle, Arc::clone(&self.inner)))
            .map_err(PoolError::Connect)
    }

    async fn open(&self) -> Result<IdleConnection, DbError> {
        let conn = self.inner.factory.connect().await?;
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.lock().connections_created += 1;
        tracing::debug!(connection_id = id, "opened new connection");
        Ok(IdleConnection {
            conn,
            metadata: ConnectionMetadata::new(id),
        })
    }

    /// Open connections until the pool holds `min_connections`.
    async fn top_up(&self) {
        loop {
            let mut slot = {
                let mut state = self.inner.state.lock();
                if self.is_closed() || state.total() >= self.inner.config.min_connections {
                    return;
                }
                MaintenanceSlots::take(&self.inner, &mut state, 1)
            };

            let opened = self.open().await;
            let mut state = self.inner.state.lock();
            slot.settle(&mut state);
            match opened {
                Ok(idle) => self.inner.put_back(&mut state, idle),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open connection while topping up pool");
                    self.inner.grant_slot(&mut state);
                    return;
                }
            }
        }
    }

    fn spawn_health_check(&self) {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                let pool = Pool { inner };
                let results = pool.run_health_check().await;
                let status = pool.status();
                tracing::trace!(
                    checked = results.len(),
                    available = status.available,
                    in_use = status.in_use,
                    "health sweep finished"
                );
            }

            tracing::debug!("health check task stopped");
        });
    }
}

impl PoolInner {
    /// Place a healthy, unowned connection: oldest waiter first, else the
    /// available set. Caller holds the state lock.
    fn put_back(&self, state: &mut PoolState, idle: IdleConnection) {
        if self.closed.load(Ordering::Acquire) {
            self.metrics.lock().connections_closed += 1;
            return;
        }

        let mut pending = Some(idle);
        while let Some(mut conn) = pending.take() {
            let Some(waiter) = state.waiters.pop_front() else {
                conn.metadata.state = ConnectionState::Idle;
                state.idle.push_front(conn);
                break;
            };
            state.in_use += 1;
            if let Err(Grant::Connection(back)) = waiter.tx.send(Grant::Connection(conn)) {
                // Waiter gave up between timing out and dequeuing itself.
                state.in_use -= 1;
                pending = Some(back);
            }
        }
    }

    /// Hand freed capacity to the oldest waiter, if any. Caller holds the
    /// state lock and has already released the capacity.
    fn grant_slot(&self, state: &mut PoolState) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            state.in_use += 1;
            if waiter.tx.send(Grant::Slot).is_ok() {
                return;
            }
            state.in_use -= 1;
        }
    }

    /// Take back a lent-out connection.
    fn check_in(&self, conn: Box<dyn Connection>, mut metadata: ConnectionMetadata) {
        metadata.last_used_at = Instant::now();

        let mut state = self.state.lock();
        state.in_use -= 1;

        if !metadata.healthy {
            tracing::debug!(connection_id = metadata.id, "discarding unhealthy connection");
            self.metrics.lock().connections_closed += 1;
            self.grant_slot(&mut state);
            drop(state);
            drop(conn);
            return;
        }

        tracing::trace!(connection_id = metadata.id, "returning connection to pool");
        self.put_back(&mut state, IdleConnection { conn, metadata });
    }
}

/// A slot counted in `in_use` while its connection is being opened.
///
/// Dropping it armed (the open failed, or the caller was cancelled) gives
/// the slot back.
struct Reservation<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl Reservation<'_> {
    fn finish(mut self, opened: bool) {
        self.armed = !opened;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state.lock();
            state.in_use -= 1;
            self.inner.grant_slot(&mut state);
        }
    }
}

/// Ping with an upper bound; a ping that does not answer in time counts as
/// failed.
async fn ping_within(conn: &mut dyn Connection, limit: Duration) -> Result<(), DbError> {
    match tokio::time::timeout(limit, conn.ping()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(DbError::new(format!(
            "ping timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// A queued `get()`.
///
/// Grants are sent under the state lock, so once the waiter is no longer in
/// the queue its grant (if any) is already in the channel. Dropping an
/// unsettled ticket returns that grant to the pool.
struct WaitTicket<'a> {
    inner: &'a PoolInner,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    settled: bool,
}

impl WaitTicket<'_> {
    /// Leave the queue, returning whatever was granted before we left.
    fn withdraw(&mut self) -> Option<Grant> {
        self.settled = true;
        {
            let mut state = self.inner.state.lock();
            let before = state.waiters.len();
            state.waiters.retain(|w| w.id != self.id);
            if state.waiters.len() != before {
                return None;
            }
        }
        self.rx.close();
        self.rx.try_recv().ok()
    }
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Some(grant) = self.withdraw() else {
            return;
        };

        tracing::debug!(waiter = self.id, "waiter cancelled after grant, returning it");
        let mut state = self.inner.state.lock();
        state.in_use -= 1;
        match grant {
            Grant::Connection(idle) => self.inner.put_back(&mut state, idle),
            Grant::Slot => self.inner.grant_slot(&mut state),
        }
    }
}

/// Slots counted in `maintenance` while the pool works on them outside the
/// lock. Dropping the guard releases every slot not yet settled.
struct MaintenanceSlots<'a> {
    inner: &'a PoolInner,
    unsettled: u32,
}

impl<'a> MaintenanceSlots<'a> {
    /// Count `count` slots as under maintenance. Caller holds the state lock.
    fn take(inner: &'a PoolInner, state: &mut PoolState, count: u32) -> Self {
        state.maintenance += count;
        Self {
            inner,
            unsettled: count,
        }
    }

    /// Stop counting one slot. Caller holds the state lock and decides where
    /// the slot goes next.
    fn settle(&mut self, state: &mut PoolState) {
        self.unsettled -= 1;
        state.maintenance -= 1;
    }
}

impl Drop for MaintenanceSlots<'_> {
    fn drop(&mut self) {
        if self.unsettled == 0 {
            return;
        }
        tracing::debug!(slots = self.unsettled, "maintenance abandoned, releasing slots");
        let mut state = self.inner.state.lock();
        state.maintenance -= self.unsettled;
        for _ in 0..self.unsettled {
            self.inner.grant_slot(&mut state);
        }
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .pool_config(pool_config)
///     .build(factory)
///     .await?;
/// ```
pub struct PoolBuilder {
    pool_config: PoolConfig,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new() -> Self {
        Self {
            pool_config: PoolConfig::default(),
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.pool_config.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.pool_config.max_connections = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.acquire_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.idle_timeout = timeout;
        self
    }

    /// Set the background health check interval.
    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.pool_config.health_check_interval = interval;
        self
    }

    /// Enable or disable pinging connections on checkout.
    #[must_use]
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.pool_config.test_on_checkout = enabled;
        self
    }

    /// Set the ping timeout for health and checkout pings.
    #[must_use]
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.ping_timeout = timeout;
        self
    }

    /// Build the pool.
    pub async fn build(self, factory: DynConnectionFactory) -> Result<Pool, PoolError> {
        Pool::new(self.pool_config, factory).await
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of the pool, taken without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Idle connections ready to hand out.
    pub available: u32,
    /// Connections lent to callers (busy).
    pub in_use: u32,
    /// Callers queued in `get()`.
    pub waiting: u32,
    /// Every connection the pool accounts for, including ones being opened
    /// or checked by the sweep.
    pub total: u32,
    /// Configured `max_connections`.
    pub max: u32,
}

impl PoolStatus {
    /// Busy connections as a percentage of `max`.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        ratio(u64::from(self.in_use), u64::from(self.max), 0.0) * 100.0
    }

    /// Whether a new caller would have to wait for a release.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.available == 0 && self.total >= self.max
    }
}

/// Counters accumulated since the pool was created.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Connections opened.
    pub connections_created: u64,
    /// Connections closed, for any reason.
    pub connections_closed: u64,
    /// `get()` calls that returned a connection.
    pub checkouts_successful: u64,
    /// `get()` calls that failed (timeout, closed pool, connect error).
    pub checkouts_failed: u64,
    /// Pings issued by the sweep.
    pub health_checks_performed: u64,
    /// Sweep pings that failed.
    pub health_checks_failed: u64,
    /// Connections closed for exceeding the idle timeout.
    pub idle_evictions: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Fraction of checkouts that succeeded; 1.0 before the first one.
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        ratio(
            self.checkouts_successful,
            self.checkouts_successful + self.checkouts_failed,
            1.0,
        )
    }

    /// Fraction of sweep pings that succeeded; 1.0 before the first sweep.
    #[must_use]
    pub fn health_check_success_rate(&self) -> f64 {
        ratio(
            self.health_checks_performed
                .saturating_sub(self.health_checks_failed),
            self.health_checks_performed,
            1.0,
        )
    }
}

fn ratio(part: u64, whole: u64, empty: f64) -> f64 {
    if whole == 0 {
        empty
    } else {
        part as f64 / whole as f64
    }
}

/// A connection borrowed from the pool.
///
/// Dereferences to the underlying [`Connection`]. Dropping the guard (or
/// passing it to [`Pool::release`]) returns the connection exactly once.
pub struct PooledConnection {
    conn: Box<dyn Connection>,
    metadata: ConnectionMetadata,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(idle: IdleConnection, pool: Arc<PoolInner>) -> Self {
        let IdleConnection { conn, mut metadata } = idle;
        metadata.state = ConnectionState::InUse;
        metadata.last_used_at = Instant::now();
        metadata.use_count += 1;
        Self {
            conn,
            metadata,
            pool,
        }
    }

    /// Get the connection metadata.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    /// Get the connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.metadata.id
    }

    /// Flag the connection as broken; it is closed instead of reused on return.
    pub fn mark_unhealthy(&mut self) {
        self.metadata.healthy = false;
    }

    /// Swap in a freshly opened connection, keeping the checkout.
    fn replace(&mut self, fresh: IdleConnection) {
        let IdleConnection { conn, mut metadata } = fresh;
        metadata.state = ConnectionState::InUse;
        metadata.use_count = 1;
        self.conn = conn;
        self.metadata = metadata;
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &*self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = std::mem::replace(&mut self.conn, Box::new(Returned));
        self.pool.check_in(conn, self.metadata.clone());
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Stand-in left behind in a guard whose connection went back to the pool.
struct Returned;

#[async_trait]
impl Connection for Returned {
    async fn query(&mut self, _sql: &str, _params: &[SqlValue]) -> Result<QueryResult, DbError> {
        Err(returned())
    }

    async fn begin(&mut self, _isolation: IsolationLevel) -> Result<(), DbError> {
        Err(returned())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        Err(returned())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        Err(returned())
    }

    async fn try_advisory_lock(&mut self, _key: &str, _timeout: Duration) -> Result<bool, DbError> {
        Err(returned())
    }

    async fn advisory_unlock(&mut self, _key: &str) -> Result<(), DbError> {
        Err(returned())
    }

    async fn ping(&mut self) -> Result<(), DbError> {
        Err(returned())
    }
}

fn returned() -> DbError {
    DbError::new("connection already returned to pool")
}
