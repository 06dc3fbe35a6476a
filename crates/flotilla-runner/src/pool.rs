//! Keyed, bounded connection pool.
//!
//! A connection is owned by exactly one of: the idle list of its key, or a
//! [`PooledConnection`] guard. Idle lists are only touched under the pool
//! mutex, and the mutex is never held across an `.await`, so a connection
//! can never be both handed out and closed.
//!
//! Returning a connection requires an explicit [`PooledConnection::release`].
//! A guard dropped any other way (error, timeout, cancellation) discards its
//! connection.

use crate::connection::{Connection, Connector, PoolKey, TransportFailure};
use flotilla_core::events::{
    ConnectionEvictedPayload, Event, EventEmitter, EvictionReason, PoolExhaustedPayload,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// What to do when every pooled slot for a key is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Wait up to the acquire timeout, then fail.
    Block,
    /// Wait up to the acquire timeout, then open an unpooled connection.
    #[default]
    OpenTransient,
}

/// Pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum pooled connections per key.
    #[serde(default = "default_max_per_key")]
    pub max_per_key: usize,
    /// Maximum age of a reusable connection.
    #[serde(default = "default_persist_timeout_ms")]
    pub persist_timeout_ms: u64,
    /// How long to wait for a free slot.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default)]
    pub exhaustion_policy: ExhaustionPolicy,
}

fn default_max_per_key() -> usize {
    4
}

fn default_persist_timeout_ms() -> u64 {
    60_000
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_key: default_max_per_key(),
            persist_timeout_ms: default_persist_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            exhaustion_policy: ExhaustionPolicy::default(),
        }
    }
}

impl PoolConfig {
    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn with_max_per_key(mut self, max: usize) -> Self {
        self.max_per_key = max;
        self
    }

    pub fn with_persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.exhaustion_policy = policy;
        self
    }
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub opened: u64,
    pub reused: u64,
    pub evicted: u64,
    pub transient: u64,
    pub exhausted: u64,
}

#[derive(Debug, Default)]
struct PoolMetrics {
    opened: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    transient: AtomicU64,
    exhausted: AtomicU64,
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    created_at: Instant,
}

struct KeySlot {
    idle: Vec<IdleConnection>,
    permits: Arc<Semaphore>,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    slots: Mutex<HashMap<PoolKey, KeySlot>>,
    closed: AtomicBool,
    metrics: PoolMetrics,
    events: EventEmitter,
}

/// Connection pool shared by every dispatch over one transport.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig, events: EventEmitter) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                slots: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                metrics: PoolMetrics::default(),
                events,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a connection for `key`, reusing an idle one when possible.
    pub async fn acquire(&self, key: &PoolKey) -> Result<PooledConnection, TransportFailure> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportFailure::new("connection pool is closed"));
        }

        let permits = self.inner.permits_for(key);
        let permit = match permits.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                debug!(key = %key, "Pool slots busy, waiting");
                match tokio::time::timeout(
                    self.inner.config.acquire_timeout(),
                    permits.clone().acquire_owned(),
                )
                .await
                {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) => return Err(TransportFailure::new("connection pool is closed")),
                    Err(_) => None,
                }
            }
        };

        let Some(permit) = permit else {
            return self.on_exhausted(key).await;
        };

        let slot = Some(Slot { permits, _permit: permit });
        if let Some((conn, created_at)) = self.inner.take_idle(key) {
            self.inner.metrics.reused.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Reusing pooled connection");
            return Ok(PooledConnection::new(
                conn,
                created_at,
                key.clone(),
                slot,
                Arc::clone(&self.inner),
            ));
        }

        let conn = self.inner.connector.connect(key).await?;
        self.inner.metrics.opened.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Opened pooled connection");
        Ok(PooledConnection::new(
            conn,
            Instant::now(),
            key.clone(),
            slot,
            Arc::clone(&self.inner),
        ))
    }

    /// Check the endpoint behind `key` on a dedicated connection.
    ///
    /// The check never takes a pooled slot, so a key whose slots are all busy
    /// with tasks still answers. A failed check closes the key's idle
    /// connections.
    pub async fn probe(&self, key: &PoolKey) -> Result<(), TransportFailure> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportFailure::new("connection pool is closed"));
        }

        let result = match self.inner.connector.connect(key).await {
            Ok(mut conn) => {
                let result = conn.probe().await;
                conn.close().await;
                result
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            debug!(key = %key, error = %e.message, "Endpoint check failed");
            self.evict_idle(key, EvictionReason::Errored).await;
        }
        result
    }

    async fn on_exhausted(&self, key: &PoolKey) -> Result<PooledConnection, TransportFailure> {
        let config = &self.inner.config;
        let opened_transient = config.exhaustion_policy == ExhaustionPolicy::OpenTransient;
        self.inner.metrics.exhausted.fetch_add(1, Ordering::Relaxed);
        self.inner.events.emit(Event::PoolExhausted(PoolExhaustedPayload {
            transport: key.transport,
            endpoint: key.endpoint.to_string(),
            max_per_key: config.max_per_key,
            opened_transient,
            timestamp: chrono::Utc::now(),
        }));

        if !opened_transient {
            warn!(key = %key, max_per_key = config.max_per_key, "Connection pool exhausted");
            return Err(TransportFailure::new(format!(
                "connection pool for {} exhausted after {}ms",
                key, config.acquire_timeout_ms
            )));
        }

        info!(key = %key, "Connection pool exhausted, opening transient connection");
        let conn = self.inner.connector.connect(key).await?;
        self.inner.metrics.transient.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection::new(
            conn,
            Instant::now(),
            key.clone(),
            None,
            Arc::clone(&self.inner),
        ))
    }

    /// Number of idle connections currently pooled for `key`.
    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.inner
            .lock_slots()
            .get(key)
            .map(|slot| slot.idle.len())
            .unwrap_or(0)
    }

    /// Number of connections for `key` currently checked out from pooled slots.
    pub fn in_use(&self, key: &PoolKey) -> usize {
        self.inner
            .lock_slots()
            .get(key)
            .map(|slot| {
                self.inner
                    .config
                    .max_per_key
                    .max(1)
                    .saturating_sub(slot.permits.available_permits())
            })
            .unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        let m = &self.inner.metrics;
        PoolStats {
            opened: m.opened.load(Ordering::Relaxed),
            reused: m.reused.load(Ordering::Relaxed),
            evicted: m.evicted.load(Ordering::Relaxed),
            transient: m.transient.load(Ordering::Relaxed),
            exhausted: m.exhausted.load(Ordering::Relaxed),
        }
    }

    /// Forget `key` entirely.
    ///
    /// Idle connections are closed now. Connections still checked out are
    /// closed when they come back instead of being pooled.
    pub async fn evict_key(&self, key: &PoolKey) {
        let removed = self.inner.lock_slots().remove(key);
        if let Some(slot) = removed {
            slot.permits.close();
            debug!(key = %key, idle = slot.idle.len(), "Evicting pool key");
            for idle in slot.idle {
                self.inner.evicted(key, EvictionReason::Closed);
                idle.conn.close().await;
            }
        }
    }

    async fn evict_idle(&self, key: &PoolKey, reason: EvictionReason) {
        let drained: Vec<_> = {
            let mut slots = self.inner.lock_slots();
            slots
                .get_mut(key)
                .map(|slot| slot.idle.drain(..).collect())
                .unwrap_or_default()
        };
        for idle in drained {
            self.inner.evicted(key, reason);
            idle.conn.close().await;
        }
    }

    /// Close the pool. Idle connections are closed now, in-use ones on release.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(PoolKey, Vec<IdleConnection>)> = {
            let mut slots = self.inner.lock_slots();
            slots
                .iter_mut()
                .map(|(key, slot)| {
                    slot.permits.close();
                    (key.clone(), slot.idle.drain(..).collect())
                })
                .collect()
        };
        for (key, idle) in drained {
            for entry in idle {
                self.inner.evicted(&key, EvictionReason::Closed);
                entry.conn.close().await;
            }
        }
        info!("Connection pool closed");
    }
}

impl PoolInner {
    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<PoolKey, KeySlot>> {
        // A panic while holding the lock cannot leave a slot half-updated.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn permits_for(&self, key: &PoolKey) -> Arc<Semaphore> {
        let mut slots = self.lock_slots();
        let slot = slots.entry(key.clone()).or_insert_with(|| KeySlot {
            idle: Vec::new(),
            permits: Arc::new(Semaphore::new(self.config.max_per_key.max(1))),
        });
        Arc::clone(&slot.permits)
    }

    /// Pop the freshest reusable connection, evicting stale or broken ones.
    fn take_idle(&self, key: &PoolKey) -> Option<(Box<dyn Connection>, Instant)> {
        let max_age = self.config.persist_timeout();
        let mut rejected = Vec::new();
        let found = {
            let mut slots = self.lock_slots();
            let slot = slots.get_mut(key)?;
            let mut found = None;
            while let Some(mut idle) = slot.idle.pop() {
                if idle.created_at.elapsed() >= max_age {
                    rejected.push((idle.conn, EvictionReason::Expired));
                } else if idle.conn.is_broken() {
                    rejected.push((idle.conn, EvictionReason::Broken));
                } else {
                    found = Some((idle.conn, idle.created_at));
                    break;
                }
            }
            found
        };
        for (conn, reason) in rejected {
            self.evicted(key, reason);
            spawn_close(conn);
        }
        found
    }

    /// Put a connection back on the idle list of the slot it was taken from.
    ///
    /// The closed flag and the slot are checked under the slots lock, the same
    /// lock `close` and `evict_key` drain under, so a connection either lands
    /// before the drain or is closed here.
    fn give_back(
        &self,
        key: &PoolKey,
        mut conn: Box<dyn Connection>,
        created_at: Instant,
        permits: &Arc<Semaphore>,
    ) {
        let stale = if created_at.elapsed() >= self.config.persist_timeout() {
            Some(EvictionReason::Expired)
        } else if conn.is_broken() {
            Some(EvictionReason::Broken)
        } else {
            None
        };
        if let Some(reason) = stale {
            self.evicted(key, reason);
            spawn_close(conn);
            return;
        }

        {
            let mut slots = self.lock_slots();
            if !self.closed.load(Ordering::SeqCst)
                && let Some(slot) = slots.get_mut(key)
                && Arc::ptr_eq(&slot.permits, permits)
            {
                slot.idle.push(IdleConnection { conn, created_at });
                return;
            }
        }
        self.evicted(key, EvictionReason::Closed);
        spawn_close(conn);
    }

    fn evicted(&self, key: &PoolKey, reason: EvictionReason) {
        self.metrics.evicted.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, reason = ?reason, "Evicting connection");
        self.events.emit(Event::ConnectionEvicted(ConnectionEvictedPayload {
            transport: key.transport,
            endpoint: key.endpoint.to_string(),
            reason,
            timestamp: chrono::Utc::now(),
        }));
    }
}

fn spawn_close(conn: Box<dyn Connection>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { conn.close().await });
    }
}

/// A pooled slot held by a checked-out connection.
struct Slot {
    permits: Arc<Semaphore>,
    _permit: OwnedSemaphorePermit,
}

/// A checked-out connection.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    key: PoolKey,
    slot: Option<Slot>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(
        conn: Box<dyn Connection>,
        created_at: Instant,
        key: PoolKey,
        slot: Option<Slot>,
        pool: Arc<PoolInner>,
    ) -> Self {
        Self {
            conn: Some(conn),
            created_at,
            key,
            slot,
            pool,
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Whether this connection bypasses the pool because it was exhausted.
    pub fn is_transient(&self) -> bool {
        self.slot.is_none()
    }

    pub fn connection(&mut self) -> Result<&mut (dyn Connection + 'static), TransportFailure> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| TransportFailure::new("connection already returned to the pool"))
    }

    /// Return a healthy connection to the pool.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            match &self.slot {
                Some(slot) => self.pool.give_back(&self.key, conn, self.created_at, &slot.permits),
                None => spawn_close(conn),
            }
        }
        // The permit is dropped after the connection is back on the idle list.
        self.slot.take();
    }

    /// Close the connection without returning it.
    pub fn discard(mut self, reason: EvictionReason) {
        self.discard_inner(reason);
    }

    fn discard_inner(&mut self, reason: EvictionReason) {
        if let Some(conn) = self.conn.take() {
            if self.slot.is_some() {
                self.pool.evicted(&self.key, reason);
            }
            spawn_close(conn);
        }
        self.slot.take();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.discard_inner(EvictionReason::Errored);
    }
}
