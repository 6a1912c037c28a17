//! Connection pool
//!
//! Keeps an idle queue of established connections and a count of every connection it
//! owns (idle plus checked out). Provisioning runs on the tokio runtime: one attempt at a
//! time, never past `max`, and a failed attempt reschedules itself after `backoff`
//! instead of surfacing the error.
//!
//! Acquisition comes in three flavours:
//! * [`ConnectionPool::fast`]: never blocks; kicks off provisioning on a miss
//! * [`ConnectionPool::guaranteed`]: blocks the calling thread until a connection is idle.
//!   Call it from a dedicated thread (or `spawn_blocking`), never from a runtime worker.
//! * [`Pool::acquire`]: the async equivalent of `guaranteed`
//!
//! Connections handed out by the pool return themselves through
//! [`Connection::execute`]: healthy ones go back on the idle queue, unhealthy ones are
//! dropped and, when the pool falls below `min`, replaced after the backoff. A pooled
//! connection that is dropped or closed any other way gives its slot back the same way.

use crate::connection::config::millis;
use crate::connection::{Connection, Outcome, SessionConfig};
use crate::metrics::{counters, gauges};
use crate::operation::{Operation, QueryResult, SimpleQuery};
use crate::{Error, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::Notify;

/// Where a connection goes when an operation is done with it
pub trait ConnectionPool: Send + Sync {
    /// Idle connection if one is immediately available
    fn fast(&self) -> Option<Connection>;

    /// Block until a connection is idle
    fn guaranteed(&self) -> Result<Connection>;

    /// Take back a healthy connection
    fn good(&self, conn: Connection);

    /// Retire an unhealthy connection
    fn bad(&self, conn: Connection);
}

/// No pool: connections handed back are simply dropped
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

impl ConnectionPool for Detached {
    fn fast(&self) -> Option<Connection> {
        None
    }

    fn guaranteed(&self) -> Result<Connection> {
        Err(Error::PoolClosed)
    }

    fn good(&self, conn: Connection) {
        drop(conn);
    }

    fn bad(&self, conn: Connection) {
        drop(conn);
    }
}

/// Pool bounds and provisioning backoff
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Connections kept open even when idle
    pub min: usize,
    /// Upper bound on connections owned by the pool
    pub max: usize,
    /// Delay before retrying a failed provisioning attempt
    #[serde(rename = "backoff_ms", deserialize_with = "millis::required")]
    pub backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 10,
            backoff: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// Config with `max` connections and no minimum
    pub fn with_max(max: usize) -> Self {
        Self {
            min: 0,
            max,
            ..Self::default()
        }
    }

    /// Set the minimum
    pub fn min(mut self, min: usize) -> Self {
        self.min = min;
        self
    }

    /// Set the provisioning backoff
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Reject bounds no pool can satisfy
    pub fn validate(&self) -> Result<()> {
        if self.max == 0 {
            return Err(Error::Config("pool max must be at least 1".into()));
        }
        if self.min > self.max {
            return Err(Error::Config(format!(
                "pool min {} exceeds max {}",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Pool usage snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections on the idle queue
    pub idle: usize,
    /// Connections owned by the pool (idle + checked out)
    pub total: usize,
    /// Configured minimum
    pub min: usize,
    /// Configured maximum
    pub max: usize,
    /// Whether [`Pool::close`] was called
    pub closed: bool,
}

/// Opens connections for the pool
pub trait Connector: Send + Sync + 'static {
    /// Open and establish one connection
    fn connect(&self) -> BoxFuture<'static, Result<Connection>>;
}

impl<F, Fut> Connector for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Connection>> + Send + 'static,
{
    fn connect(&self) -> BoxFuture<'static, Result<Connection>> {
        Box::pin(self())
    }
}

/// Connector for a [`SessionConfig`] (TCP or Unix socket)
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: Arc<SessionConfig>,
}

impl PgConnector {
    /// Connector opening sessions described by `config`
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Connector for PgConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Connection>> {
        let config = Arc::clone(&self.config);
        Box::pin(async move { Connection::connect(&config).await })
    }
}

struct Inner {
    config: PoolConfig,
    connector: Box<dyn Connector>,
    idle: Mutex<VecDeque<Connection>>,
    /// Wakes threads blocked in `guaranteed`
    available: Condvar,
    /// Wakes tasks waiting in `acquire`
    returned: Notify,
    total: AtomicUsize,
    provisioning: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    runtime: Handle,
    this: Weak<Inner>,
}

impl Inner {
    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn below_max(&self) -> bool {
        self.total.load(Ordering::Acquire) < self.config.max
    }

    fn pop(&self) -> Option<Connection> {
        let mut idle = self.lock_idle();
        let conn = idle.pop_front();
        gauges::pool_idle(idle.len());
        conn
    }

    fn push(&self, conn: Connection) {
        {
            let mut idle = self.lock_idle();
            idle.push_back(conn);
            gauges::pool_idle(idle.len());
        }
        self.available.notify_one();
        self.returned.notify_waiters();
    }

    /// Provision one connection after `delay`. The task only keeps the pool alive while
    /// an attempt is running.
    fn schedule(&self, delay: Duration) {
        let this = self.this.clone();
        self.runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(inner) = this.upgrade() {
                add(inner).await;
            }
        });
    }

    fn fast(&self) -> Option<Connection> {
        let conn = self.pop();
        if conn.is_none() && !self.is_closed() && self.below_max() {
            self.schedule(Duration::ZERO);
        }
        conn
    }

    fn wait(&self, deadline: Option<Instant>) -> Result<Connection> {
        let mut idle = self.lock_idle();
        loop {
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }
            if let Some(conn) = idle.pop_front() {
                gauges::pool_idle(idle.len());
                return Ok(conn);
            }
            if self.below_max() {
                self.schedule(Duration::ZERO);
            }
            idle = match deadline {
                None => self
                    .available
                    .wait(idle)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    match self.available.wait_timeout(idle, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
    }

    fn good(&self, mut conn: Connection) {
        if conn.is_closed() {
            return self.bad(conn);
        }
        if self.is_closed() {
            conn.detach();
            self.runtime.spawn(async move {
                let _ = conn.close().await;
            });
            return;
        }
        self.push(conn);
    }

    fn bad(&self, conn: Connection) {
        tracing::debug!(conn = conn.id(), "retiring connection");
        // the lease gives the slot back
        drop(conn);
    }

    /// A connection left the pool for good
    fn forfeit(&self) {
        counters::pool_retired();
        let total = self.release();
        if total < self.config.min && !self.is_closed() {
            tracing::debug!(total, min = self.config.min, backoff = ?self.config.backoff, "below minimum, reprovisioning");
            self.schedule(self.config.backoff);
        }
    }

    /// Forget one owned connection, returning the new total
    fn release(&self) -> usize {
        let total = self.total.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        gauges::pool_total(total);
        total
    }
}

fn add(inner: Arc<Inner>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let _provisioning = inner.provisioning.lock().await;
        if inner.is_closed() || !inner.below_max() {
            return;
        }
        match inner.connector.connect().await {
            Ok(mut conn) => {
                let total = inner.total.fetch_add(1, Ordering::AcqRel) + 1;
                conn.attach(Arc::new(PoolRef(inner.this.clone())));
                conn.set_lease(Lease(inner.this.clone()));
                counters::pool_provisioned();
                gauges::pool_total(total);
                tracing::debug!(conn = conn.id(), total, "connection provisioned");
                // closed while connecting: `good` retires it
                inner.good(conn);
            }
            Err(err) => {
                counters::pool_provision_failed();
                tracing::warn!(
                    error = %err,
                    backoff = ?inner.config.backoff,
                    "provisioning failed, retrying after backoff"
                );
                inner.schedule(inner.config.backoff);
            }
        }
    })
}

/// Slot in the pool's total held by every connection the pool owns, idle or checked
/// out. Dropping it (with the connection, or on [`Connection::detach`]) gives the slot
/// back exactly once.
pub(crate) struct Lease(Weak<Inner>);

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(inner) = self.0.upgrade() {
            inner.forfeit();
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Lease")
    }
}

/// Handle connections keep to their pool; does not keep the pool alive
struct PoolRef(Weak<Inner>);

impl ConnectionPool for PoolRef {
    fn fast(&self) -> Option<Connection> {
        self.0.upgrade()?.fast()
    }

    fn guaranteed(&self) -> Result<Connection> {
        self.0.upgrade().ok_or(Error::PoolClosed)?.wait(None)
    }

    fn good(&self, conn: Connection) {
        if let Some(inner) = self.0.upgrade() {
            inner.good(conn);
        }
    }

    fn bad(&self, conn: Connection) {
        if let Some(inner) = self.0.upgrade() {
            inner.bad(conn);
        }
    }
}

/// Bounded connection pool
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Pool {
    /// Pool over `connector`. Must be called inside a tokio runtime; provisioning of the
    /// first `min` connections starts immediately.
    pub fn new(config: PoolConfig, connector: impl Connector) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| Error::Config("pool must be created inside a tokio runtime".into()))?;
        let inner = Arc::new_cyclic(|this| Inner {
            config,
            connector: Box::new(connector),
            idle: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            returned: Notify::new(),
            total: AtomicUsize::new(0),
            provisioning: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            runtime,
            this: this.clone(),
        });
        for _ in 0..inner.config.min {
            inner.schedule(Duration::ZERO);
        }
        tracing::info!(min = inner.config.min, max = inner.config.max, "pool started");
        Ok(Self { inner })
    }

    /// Pool of sessions described by `config`, bounded by `config.pool`
    pub fn connect(config: SessionConfig) -> Result<Self> {
        let bounds = config.pool.clone();
        Self::new(bounds, PgConnector::new(config))
    }

    /// Wait (asynchronously) for an idle connection
    pub async fn acquire(&self) -> Result<Connection> {
        loop {
            let returned = self.inner.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();

            if self.inner.is_closed() {
                return Err(Error::PoolClosed);
            }
            if let Some(conn) = self.inner.pop() {
                return Ok(conn);
            }
            if self.inner.below_max() {
                self.inner.schedule(Duration::ZERO);
            }
            returned.await;
        }
    }

    /// [`guaranteed`](ConnectionPool::guaranteed) with an upper bound on the wait
    pub fn guaranteed_timeout(&self, limit: Duration) -> Result<Connection> {
        self.inner.wait(Some(Instant::now() + limit))
    }

    /// Acquire a connection and run `op` on it; the connection returns itself afterwards
    pub async fn run<O: Operation>(&self, op: O) -> Result<Outcome> {
        let conn = self.acquire().await?;
        Ok(conn.execute(op).await)
    }

    /// Run a simple query on any idle connection
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        let (op, rx) = SimpleQuery::new(sql);
        self.run(op).await?;
        rx.await.map_err(|_| Error::InvalidState {
            expected: "query result".into(),
            actual: "result channel closed".into(),
        })?
    }

    /// Stop provisioning, fail waiters and close idle connections. Connections checked
    /// out at the time are closed when they come back.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Connection> = self.inner.lock_idle().drain(..).collect();
        gauges::pool_idle(0);
        for mut conn in drained {
            conn.detach();
            self.inner.runtime.spawn(async move {
                let _ = conn.close().await;
            });
        }
        self.inner.available.notify_all();
        self.inner.returned.notify_waiters();
        tracing::info!("pool closed");
    }

    /// Current usage
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.inner.lock_idle().len(),
            total: self.inner.total.load(Ordering::Acquire),
            min: self.inner.config.min,
            max: self.inner.config.max,
            closed: self.inner.is_closed(),
        }
    }
}

impl ConnectionPool for Pool {
    fn fast(&self) -> Option<Connection> {
        self.inner.fast()
    }

    fn guaranteed(&self) -> Result<Connection> {
        self.inner.wait(None)
    }

    fn good(&self, conn: Connection) {
        self.inner.good(conn);
    }

    fn bad(&self, conn: Connection) {
        self.inner.bad(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Transport;
    use crate::operation::{Exchange, Next};
    use tokio::io::DuplexStream;

    /// Connector over in-memory streams; fails the first `failures` attempts
    #[derive(Clone, Default)]
    struct Fake {
        attempts: Arc<AtomicUsize>,
        failures: usize,
        peers: Arc<Mutex<Vec<DuplexStream>>>,
    }

    impl Fake {
        fn failing(failures: usize) -> Self {
            Self {
                failures,
                ..Self::default()
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Connector for Fake {
        fn connect(&self) -> BoxFuture<'static, Result<Connection>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let failures = self.failures;
            let peers = Arc::clone(&self.peers);
            Box::pin(async move {
                if attempt < failures {
                    return Err(Error::ConnectionClosed);
                }
                let (client, server) = tokio::io::duplex(64);
                peers.lock().unwrap().push(server);
                Connection::new(Transport::from_stream(client), 0)
            })
        }
    }

    struct Noop;

    impl Operation for Noop {
        fn on_start(&mut self, _cx: &mut Exchange<'_>) -> Result<Next> {
            Ok(Next::Finished)
        }
        fn on_read(&mut self, _cx: &mut Exchange<'_>) -> Result<Next> {
            Ok(Next::Finished)
        }
        fn on_fail(&mut self, _err: Error) {}
    }

    struct Fail;

    impl Operation for Fail {
        fn on_start(&mut self, _cx: &mut Exchange<'_>) -> Result<Next> {
            Err(Error::Protocol("boom".into()))
        }
        fn on_read(&mut self, _cx: &mut Exchange<'_>) -> Result<Next> {
            Ok(Next::Finished)
        }
        fn on_fail(&mut self, _err: Error) {}
    }

    async fn eventually(pool: &Pool, check: impl Fn(PoolStats) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check(pool.stats()) {
            assert!(Instant::now() < deadline, "condition not reached: {:?}", pool.stats());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(PoolConfig::with_max(0).validate().is_err());
        assert!(PoolConfig::with_max(2).min(3).validate().is_err());
    }

    #[test]
    fn test_new_requires_runtime() {
        assert!(matches!(
            Pool::new(PoolConfig::with_max(1), Fake::default()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_min_connections_provisioned_on_start() {
        let pool = Pool::new(PoolConfig::with_max(4).min(2), Fake::default()).unwrap();
        eventually(&pool, |s| s.idle == 2 && s.total == 2).await;
    }

    #[tokio::test]
    async fn test_fast_miss_schedules_provisioning() {
        let pool = Pool::new(PoolConfig::with_max(2), Fake::default()).unwrap();
        assert!(pool.fast().is_none());
        eventually(&pool, |s| s.idle >= 1).await;
        assert!(pool.fast().is_some());
    }

    #[tokio::test]
    async fn test_total_never_exceeds_max() {
        let connector = Fake::default();
        let pool = Pool::new(PoolConfig::with_max(2), connector.clone()).unwrap();
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        for _ in 0..10 {
            assert!(pool.fast().is_none());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().total, 2);
        assert_eq!(connector.attempts(), 2);
        drop((a, b));
    }

    #[tokio::test]
    async fn test_failed_provisioning_retries_after_backoff() {
        let connector = Fake::failing(2);
        let config = PoolConfig::with_max(1).backoff(Duration::from_millis(10));
        let pool = Pool::new(config, connector.clone()).unwrap();

        let conn = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connector.attempts(), 3);
        pool.good(conn);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_execute_returns_connection() {
        let pool = Pool::new(PoolConfig::with_max(1).min(1), Fake::default()).unwrap();
        assert_eq!(pool.run(Noop).await.unwrap(), Outcome::Finished);
        assert_eq!(pool.stats(), PoolStats { idle: 1, total: 1, min: 1, max: 1, closed: false });
    }

    #[tokio::test]
    async fn test_bad_connection_replaced_after_backoff() {
        let connector = Fake::default();
        let config = PoolConfig::with_max(1)
            .min(1)
            .backoff(Duration::from_millis(20));
        let pool = Pool::new(config, connector.clone()).unwrap();
        eventually(&pool, |s| s.idle == 1).await;

        assert_eq!(pool.run(Fail).await.unwrap(), Outcome::Failed);
        assert_eq!(pool.stats().total, 0);
        eventually(&pool, |s| s.idle == 1 && s.total == 1).await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_dropped_connection_frees_its_slot() {
        let connector = Fake::default();
        let pool = Pool::new(PoolConfig::with_max(1), connector.clone()).unwrap();
        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_pooled());
        drop(conn);
        assert_eq!(pool.stats().total, 0);

        let again = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
            .await
            .expect("slot was not given back")
            .unwrap();
        assert_eq!(connector.attempts(), 2);
        assert_eq!(pool.stats().total, 1);
        drop(again);
    }

    #[tokio::test]
    async fn test_closed_connection_is_retired_and_replaced() {
        let config = PoolConfig::with_max(1)
            .min(1)
            .backoff(Duration::from_millis(10));
        let pool = Pool::new(config, Fake::default()).unwrap();
        let conn = pool.acquire().await.unwrap();

        // the fake peer never answers, but Terminate needs no reply
        conn.close().await.unwrap();
        assert_eq!(pool.stats().total, 0);
        eventually(&pool, |s| s.idle == 1 && s.total == 1).await;
    }

    #[tokio::test]
    async fn test_guaranteed_blocks_until_returned() {
        let pool = Pool::new(PoolConfig::with_max(1), Fake::default()).unwrap();
        let conn = pool.acquire().await.unwrap();

        let waiter = pool.clone();
        let blocked = tokio::task::spawn_blocking(move || waiter.guaranteed());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());

        pool.good(conn);
        let again = blocked.await.unwrap().unwrap();
        assert!(!again.is_closed());
    }

    #[tokio::test]
    async fn test_guaranteed_timeout() {
        let pool = Pool::new(PoolConfig::with_max(1), Fake::default()).unwrap();
        let _held = pool.acquire().await.unwrap();
        let waiter = pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            waiter.guaranteed_timeout(Duration::from_millis(30))
        })
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_later_acquires() {
        let pool = Pool::new(PoolConfig::with_max(1), Fake::default()).unwrap();
        let held = pool.acquire().await.unwrap();

        let waiter = pool.clone();
        let pending = tokio::spawn(async move { waiter.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close();

        assert!(matches!(pending.await.unwrap(), Err(Error::PoolClosed)));
        assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));

        // a connection coming back after close is retired, not queued
        pool.good(held);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().total, 0);
    }
}
