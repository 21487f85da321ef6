//! Per-host upstream connection pool with caps and a priority waiter queue.
//!
//! The pool is the admission layer for upstream calls: a provider client
//! borrows a connection slot before dispatching and returns it when the
//! call (or stream) completes. All mutation happens under one mutex with no
//! awaits inside the critical section; the only code that runs outside it
//! is completing a waiter's oneshot channel.

mod connection;

pub use connection::{AcquirePriority, Connection, ConnectionState, HostKey};

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

use config::PoolConfig;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became available within `connectionTimeout`.
    #[error("timed out acquiring a connection to {key}")]
    AcquireTimeout { key: HostKey },

    /// The pool was dropped while a waiter was queued.
    #[error("connection pool shut down")]
    Closed,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    waiter_seq: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    connections: Vec<Connection>,
    /// Kept sorted by (priority, seq): highest priority first, FIFO within.
    waiters: Vec<Waiter>,
}

struct Waiter {
    seq: u64,
    key: HostKey,
    priority: AcquirePriority,
    queued_at: Instant,
    tx: oneshot::Sender<Uuid>,
}

/// A borrowed connection. Returned to the pool on drop; poisoned leases are
/// destroyed instead of going back to idle.
pub struct ConnectionLease {
    pool: ConnectionPool,
    id: Uuid,
    key: HostKey,
    poisoned: bool,
}

impl ConnectionLease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Mark the connection as unusable after a transport error; it will be
    /// destroyed on release rather than reused.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.pool.release(self.id, self.poisoned);
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

/// Point-in-time pool counters for `/status` and tests.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolSnapshot {
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
    pub waiting: usize,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState::default()),
                waiter_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Borrow a connection to `key`, waiting up to `connectionTimeout` when
    /// the pool is saturated. Waiters are served highest priority first,
    /// FIFO within the same priority.
    pub async fn acquire(&self, key: HostKey, priority: AcquirePriority) -> Result<ConnectionLease, PoolError> {
        let (seq, rx) = {
            let mut state = self.lock_state();

            if let Some(id) = Self::checkout_idle(&mut state, &key) {
                return Ok(self.lease(id, key));
            }

            if self.can_create(&state, &key) {
                let id = Self::create_connection(&mut state, key.clone());
                return Ok(self.lease(id, key));
            }

            let seq = self.inner.waiter_seq.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            let waiter = Waiter {
                seq,
                key: key.clone(),
                priority,
                queued_at: Instant::now(),
                tx,
            };

            let position = state
                .waiters
                .partition_point(|queued| (queued.priority, queued.seq) <= (priority, seq));
            state.waiters.insert(position, waiter);

            (seq, rx)
        };

        let timeout = Duration::from_millis(self.inner.config.connection_timeout);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(id)) => Ok(self.lease(id, key)),
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                let mut state = self.lock_state();
                state.waiters.retain(|waiter| waiter.seq != seq);
                Err(PoolError::AcquireTimeout { key })
            }
        }
    }

    /// Return a connection. Poisoned connections are destroyed; otherwise
    /// the connection goes idle and the waiter queue is processed.
    fn release(&self, id: Uuid, poisoned: bool) {
        let grants = {
            let mut state = self.lock_state();

            if let Some(connection) = state.connections.iter_mut().find(|c| c.id == id) {
                if poisoned {
                    connection.state = ConnectionState::Error;
                } else {
                    connection.state = ConnectionState::Idle;
                    connection.last_used_at = Instant::now();
                }
            }

            state
                .connections
                .retain(|c| !matches!(c.state, ConnectionState::Error | ConnectionState::Closed));

            self.process_waiters(&mut state)
        };

        self.complete_grants(grants);
    }

    /// Evict idle connections past `idleTimeout` and enforce `maxIdle`.
    /// Runs from a periodic background task.
    pub fn sweep(&self) {
        let grants = {
            let mut state = self.lock_state();
            let idle_timeout = Duration::from_millis(self.inner.config.idle_timeout);
            let now = Instant::now();

            state.connections.retain(|connection| {
                let expired = connection.state == ConnectionState::Idle
                    && now.duration_since(connection.last_used_at) > idle_timeout;

                if expired {
                    log::debug!("evicting idle connection {} to {}", connection.id, connection.key);
                }

                !expired && connection.state != ConnectionState::Error
            });

            let mut idle: Vec<(Instant, Uuid)> = state
                .connections
                .iter()
                .filter(|c| c.state == ConnectionState::Idle)
                .map(|c| (c.last_used_at, c.id))
                .collect();

            if idle.len() > self.inner.config.max_idle {
                idle.sort_by_key(|(last_used, _)| *last_used);
                let excess: Vec<Uuid> = idle
                    .iter()
                    .take(idle.len() - self.inner.config.max_idle)
                    .map(|(_, id)| *id)
                    .collect();
                state.connections.retain(|c| !excess.contains(&c.id));
            }

            self.process_waiters(&mut state)
        };

        self.complete_grants(grants);
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.lock_state();

        PoolSnapshot {
            total: state.connections.len(),
            busy: state
                .connections
                .iter()
                .filter(|c| c.state == ConnectionState::Busy)
                .count(),
            idle: state
                .connections
                .iter()
                .filter(|c| c.state == ConnectionState::Idle)
                .count(),
            waiting: state.waiters.len(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lease(&self, id: Uuid, key: HostKey) -> ConnectionLease {
        ConnectionLease {
            pool: self.clone(),
            id,
            key,
            poisoned: false,
        }
    }

    /// Least-used idle connection for the key, if any, marked busy.
    fn checkout_idle(state: &mut PoolState, key: &HostKey) -> Option<Uuid> {
        let candidate = state
            .connections
            .iter_mut()
            .filter(|c| c.reusable() && &c.key == key)
            .min_by_key(|c| c.usage_count)?;

        candidate.state = ConnectionState::Busy;
        candidate.usage_count += 1;
        Some(candidate.id)
    }

    fn can_create(&self, state: &PoolState, key: &HostKey) -> bool {
        let live = state
            .connections
            .iter()
            .filter(|c| !matches!(c.state, ConnectionState::Closed | ConnectionState::Closing))
            .count();
        let per_host = state.connections.iter().filter(|c| &c.key == key).count();

        live < self.inner.config.max_connections && per_host < self.inner.config.max_connections_per_host
    }

    fn create_connection(state: &mut PoolState, key: HostKey) -> Uuid {
        let mut connection = Connection::new(key);
        connection.state = ConnectionState::Connected;
        connection.state = ConnectionState::Busy;
        connection.usage_count = 1;

        let id = connection.id;
        state.connections.push(connection);
        id
    }

    /// Serve queued waiters in priority-then-FIFO order. Returns the grants
    /// to complete outside the lock.
    fn process_waiters(&self, state: &mut PoolState) -> Vec<(oneshot::Sender<Uuid>, Uuid)> {
        let mut grants = Vec::new();
        let mut index = 0;

        while index < state.waiters.len() {
            if state.waiters[index].tx.is_closed() {
                // The acquire timed out or was dropped; discard the waiter.
                state.waiters.remove(index);
                continue;
            }

            let key = state.waiters[index].key.clone();

            let granted = Self::checkout_idle(state, &key).or_else(|| {
                self.can_create(state, &key)
                    .then(|| Self::create_connection(state, key.clone()))
            });

            match granted {
                Some(id) => {
                    let waiter = state.waiters.remove(index);
                    log::debug!(
                        "granting connection {id} to waiter queued for {}ms",
                        waiter.queued_at.elapsed().as_millis()
                    );
                    grants.push((waiter.tx, id));
                }
                None => index += 1,
            }
        }

        grants
    }

    fn complete_grants(&self, grants: Vec<(oneshot::Sender<Uuid>, Uuid)>) {
        for (tx, id) in grants {
            if tx.send(id).is_err() {
                // Receiver gave up between queue processing and delivery;
                // the connection goes back to the pool.
                self.release(id, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max_connections: usize, per_host: usize, timeout_ms: u64) -> ConnectionPool {
        ConnectionPool::new(PoolConfig {
            max_connections,
            max_connections_per_host: per_host,
            max_idle: 4,
            connection_timeout: timeout_ms,
            idle_timeout: 50,
            ..PoolConfig::default()
        })
    }

    fn key(host: &str) -> HostKey {
        HostKey {
            scheme: "https".to_string(),
            host: host.to_string(),
            port: 443,
        }
    }

    #[tokio::test]
    async fn reuses_idle_connection_for_same_host() {
        let pool = small_pool(4, 4, 100);

        let lease = pool.acquire(key("a"), AcquirePriority::Normal).await.unwrap();
        let first_id = lease.id();
        drop(lease);

        let lease = pool.acquire(key("a"), AcquirePriority::Normal).await.unwrap();
        assert_eq!(lease.id(), first_id);
        assert_eq!(pool.snapshot().total, 1);
    }

    #[tokio::test]
    async fn respects_per_host_and_global_caps() {
        let pool = small_pool(2, 1, 20);

        let _a = pool.acquire(key("a"), AcquirePriority::Normal).await.unwrap();

        // Per-host cap of one: a second acquire for the same host times out.
        let error = pool.acquire(key("a"), AcquirePriority::Normal).await.unwrap_err();
        assert!(matches!(error, PoolError::AcquireTimeout { .. }));

        // A different host still fits under the global cap.
        let _b = pool.acquire(key("b"), AcquirePriority::Normal).await.unwrap();

        // Global cap of two: a third host has no room.
        let error = pool.acquire(key("c"), AcquirePriority::Normal).await.unwrap_err();
        assert!(matches!(error, PoolError::AcquireTimeout { .. }));

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.busy, 2);
        assert!(snapshot.busy <= 2);
    }

    #[tokio::test]
    async fn no_connection_is_handed_to_two_callers() {
        let pool = small_pool(1, 1, 50);

        let lease = pool.acquire(key("a"), AcquirePriority::Normal).await.unwrap();
        let held_id = lease.id();

        let contender = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(key("a"), AcquirePriority::Normal).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.snapshot().waiting, 1);

        drop(lease);

        let second = contender.await.unwrap().unwrap();
        assert_eq!(second.id(), held_id);
        assert_eq!(pool.snapshot().busy, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_release_in_priority_then_fifo_order() {
        let pool = small_pool(1, 1, 5_000);
        let lease = pool.acquire(key("a"), AcquirePriority::Normal).await.unwrap();

        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

        // Enqueue in the order: low, normal-1, high, normal-2. Expected
        // service order: high, normal-1, normal-2, low.
        for (label, priority) in [
            ("low", AcquirePriority::Low),
            ("normal-1", AcquirePriority::Normal),
            ("high", AcquirePriority::High),
            ("normal-2", AcquirePriority::Normal),
        ] {
            let pool = pool.clone();
            let done = done_tx.clone();

            tokio::spawn(async move {
                let lease = pool.acquire(key("a"), priority).await.unwrap();
                done.send(label).unwrap();
                drop(lease);
            });

            // Let each waiter enqueue before the next.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(pool.snapshot().waiting, 4);
        drop(lease);

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(done_rx.recv().await.unwrap());
        }

        assert_eq!(order, vec!["high", "normal-1", "normal-2", "low"]);
    }

    #[tokio::test]
    async fn poisoned_lease_destroys_the_connection() {
        let pool = small_pool(2, 2, 100);

        let mut lease = pool.acquire(key("a"), AcquirePriority::Normal).await.unwrap();
        let poisoned_id = lease.id();
        lease.poison();
        drop(lease);

        assert_eq!(pool.snapshot().total, 0);

        let lease = pool.acquire(key("a"), AcquirePriority::Normal).await.unwrap();
        assert_ne!(lease.id(), poisoned_id);
    }

    #[tokio::test]
    async fn sweep_evicts_connections_past_idle_timeout() {
        let pool = small_pool(4, 4, 100);

        let lease = pool.acquire(key("a"), AcquirePriority::Normal).await.unwrap();
        drop(lease);
        assert_eq!(pool.snapshot().idle, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        pool.sweep();

        assert_eq!(pool.snapshot().total, 0);
    }

    #[tokio::test]
    async fn least_used_idle_connection_is_preferred() {
        let pool = small_pool(4, 4, 100);

        // Create two connections by holding both, then releasing.
        let first = pool.acquire(key("a"), AcquirePriority::Normal).await.unwrap();
        let second = pool.acquire(key("a"), AcquirePriority::Normal).await.unwrap();
        drop(first);
        drop(second);

        // Bump the first connection's usage count.
        let reused = pool.acquire(key("a"), AcquirePriority::Normal).await.unwrap();
        let heavily_used = reused.id();
        drop(reused);

        // Both idle now; the less-used one must be preferred.
        let lease = pool.acquire(key("a"), AcquirePriority::Normal).await.unwrap();
        assert_ne!(lease.id(), heavily_used);
    }
}
