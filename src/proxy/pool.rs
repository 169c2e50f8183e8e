//! Per-destination connection pool.
//!
//! Each destination has a bucket with a counting semaphore sized to the
//! destination's connection budget and a stack of idle connections. A
//! borrower holds a permit for as long as it holds the connection, so the
//! number of connections in use never exceeds the budget and a connection
//! is only ever in one borrower's hands: it is moved out of the idle stack
//! on acquire and moved back on release.
//!
//! Idle connections hold no permit. New connections are only opened when
//! the idle stack is empty, so in-use plus idle stays within the budget.
//!
//! The pool does not open connections itself. [`ConnectionPool::acquire`]
//! returns either a reused connection or a [`VacantSlot`] that the caller
//! fills after running a handshake.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// A pooled transport.
pub trait PoolTransport: Send + 'static {
    /// Whether the transport can still carry a request.
    fn is_open(&self) -> bool;

    /// Whether the credentials the transport was built with have been
    /// replaced. Such a transport is never handed out again.
    fn is_superseded(&self) -> bool {
        false
    }
}

/// Pool limits.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Connections per destination, borrowed plus idle.
    pub max_per_destination: usize,
    /// Longest wait for a connection slot.
    pub acquire_timeout: Duration,
    /// Idle time after which a connection is evicted.
    pub idle_ttl: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_per_destination: 8,
            acquire_timeout: Duration::from_secs(1),
            idle_ttl: Duration::from_secs(90),
        }
    }
}

/// Pool failures.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every connection slot stayed busy for the whole wait.
    #[error("Connection pool for '{destination}' exhausted after {waited:?}")]
    Exhausted {
        /// Destination name.
        destination: String,
        /// How long the caller waited.
        waited: Duration,
    },
}

/// How a borrowed connection came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The exchange completed cleanly; the connection may be reused.
    Reusable,
    /// The connection is in an unknown state and must be discarded.
    Broken,
}

struct IdleEntry<T> {
    conn: T,
    version: u64,
    idle_since: Instant,
}

struct Bucket<T> {
    permits: Arc<Semaphore>,
    capacity: usize,
    idle: Mutex<VecDeque<IdleEntry<T>>>,
    /// Newest identity version seen for this destination.
    newest_version: AtomicU64,
}

impl<T: PoolTransport> Bucket<T> {
    fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            idle: Mutex::new(VecDeque::new()),
            newest_version: AtomicU64::new(0),
        }
    }

    fn is_usable(&self, entry: &IdleEntry<T>, ttl: Duration, now: Instant) -> bool {
        entry.version >= self.newest_version.load(Ordering::SeqCst)
            && now.duration_since(entry.idle_since) < ttl
            && entry.conn.is_open()
            && !entry.conn.is_superseded()
    }

    /// Pop the most recently idled usable connection, discarding unusable
    /// ones on the way.
    fn take_idle(&self, destination: &str, ttl: Duration) -> Option<IdleEntry<T>> {
        let now = Instant::now();
        let mut idle = self.idle.lock().unwrap();
        while let Some(entry) = idle.pop_back() {
            if self.is_usable(&entry, ttl, now) {
                return Some(entry);
            }
            debug!(
                destination,
                version = entry.version,
                "Discarding idle connection"
            );
        }
        None
    }

    /// Drop unusable idle entries. Returns how many were dropped.
    fn purge(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut idle = self.idle.lock().unwrap();
        let before = idle.len();
        idle.retain(|entry| self.is_usable(entry, ttl, now));
        before - idle.len()
    }
}

/// Result of [`ConnectionPool::acquire`].
pub enum Checkout<T> {
    /// An idle connection built with the current identity.
    Reused(PooledConnection<T>),
    /// A slot with no connection; open one and [`VacantSlot::fill`] it.
    Vacant(VacantSlot<T>),
}

/// A reserved slot awaiting a new connection.
///
/// Dropping it gives the slot back.
pub struct VacantSlot<T> {
    destination: String,
    bucket: Arc<Bucket<T>>,
    permit: OwnedSemaphorePermit,
}

impl<T: PoolTransport> VacantSlot<T> {
    /// Destination this slot belongs to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Place a freshly opened connection, built with identity `version`,
    /// in this slot.
    pub fn fill(self, conn: T, version: u64) -> PooledConnection<T> {
        self.bucket
            .newest_version
            .fetch_max(version, Ordering::SeqCst);
        PooledConnection {
            conn,
            version,
            destination: self.destination,
            bucket: self.bucket,
            permit: self.permit,
        }
    }
}

/// A connection on loan to one borrower.
///
/// Dropping it without [`ConnectionPool::release`] discards the connection,
/// which is what cancellation needs.
pub struct PooledConnection<T> {
    conn: T,
    version: u64,
    destination: String,
    bucket: Arc<Bucket<T>>,
    permit: OwnedSemaphorePermit,
}

impl<T: PoolTransport> PooledConnection<T> {
    /// Identity version the connection was built with.
    pub fn identity_version(&self) -> u64 {
        self.version
    }

    /// Destination name.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The underlying transport.
    pub fn get(&self) -> &T {
        &self.conn
    }

    /// The underlying transport, mutably.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.conn
    }
}

/// Idle and in-use counts for one destination.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DestinationStats {
    /// Destination name.
    pub destination: String,
    /// Connections on loan.
    pub in_use: usize,
    /// Idle connections.
    pub idle: usize,
    /// Connection budget.
    pub capacity: usize,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, Serialize, Default)]
pub struct PoolStats {
    /// Per-destination counts, sorted by name.
    pub destinations: Vec<DestinationStats>,
}

/// Bounded per-destination connection pool.
pub struct ConnectionPool<T> {
    settings: PoolSettings,
    buckets: Mutex<HashMap<String, Arc<Bucket<T>>>>,
}

impl<T: PoolTransport> ConnectionPool<T> {
    /// Empty pool with the given limits.
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings: PoolSettings {
                max_per_destination: settings.max_per_destination.max(1),
                ..settings
            },
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Pool limits.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Borrow a connection to `destination`.
    ///
    /// Waits up to the acquire timeout for a slot. Idle connections built
    /// with an identity older than `active_version`, idle past the TTL or
    /// closed by the peer are discarded instead of reused.
    pub async fn acquire(
        &self,
        destination: &str,
        active_version: u64,
    ) -> Result<Checkout<T>, PoolError> {
        let bucket = self.bucket(destination);
        bucket
            .newest_version
            .fetch_max(active_version, Ordering::SeqCst);

        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.settings.acquire_timeout,
            bucket.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // The semaphore is never closed; treat it like a timeout.
            Ok(Err(_)) | Err(_) => {
                return Err(PoolError::Exhausted {
                    destination: destination.to_string(),
                    waited: started.elapsed(),
                });
            }
        };

        Ok(match bucket.take_idle(destination, self.settings.idle_ttl) {
            Some(entry) => Checkout::Reused(PooledConnection {
                conn: entry.conn,
                version: entry.version,
                destination: destination.to_string(),
                bucket,
                permit,
            }),
            None => Checkout::Vacant(VacantSlot {
                destination: destination.to_string(),
                bucket,
                permit,
            }),
        })
    }

    /// Borrow an idle connection to `destination` without waiting.
    ///
    /// Returns `None` when every slot is on loan or no usable idle
    /// connection exists. Never reserves a slot for a new connection.
    pub fn try_reuse(&self, destination: &str, active_version: u64) -> Option<PooledConnection<T>> {
        let bucket = self.bucket(destination);
        bucket
            .newest_version
            .fetch_max(active_version, Ordering::SeqCst);

        let permit = bucket.permits.clone().try_acquire_owned().ok()?;
        let entry = bucket.take_idle(destination, self.settings.idle_ttl)?;
        Some(PooledConnection {
            conn: entry.conn,
            version: entry.version,
            destination: destination.to_string(),
            bucket,
            permit,
        })
    }

    /// Return a borrowed connection.
    ///
    /// `Reusable` connections built with the newest identity go back on the
    /// idle stack. Anything else is dropped.
    pub fn release(&self, conn: PooledConnection<T>, outcome: ReleaseOutcome) {
        let PooledConnection {
            conn,
            version,
            destination,
            bucket,
            permit,
        } = conn;

        let current =
            version >= bucket.newest_version.load(Ordering::SeqCst) && !conn.is_superseded();
        if outcome == ReleaseOutcome::Reusable && current && conn.is_open() {
            let mut idle = bucket.idle.lock().unwrap();
            idle.push_back(IdleEntry {
                conn,
                version,
                idle_since: Instant::now(),
            });
            while idle.len() > bucket.capacity {
                idle.pop_front();
            }
        } else {
            debug!(
                destination = %destination,
                version,
                ?outcome,
                current,
                "Dropping released connection"
            );
            drop(conn);
        }
        // The permit goes back only after the connection is idle, so a
        // waiter woken by it finds the connection.
        drop(permit);
    }

    /// Evict idle connections that are stale, superseded, expired or closed.
    ///
    /// Returns the number evicted.
    pub fn evict_idle(&self) -> usize {
        let buckets: Vec<Arc<Bucket<T>>> =
            self.buckets.lock().unwrap().values().cloned().collect();
        buckets
            .iter()
            .map(|bucket| bucket.purge(self.settings.idle_ttl))
            .sum()
    }

    /// Forget `destination`, dropping its idle connections.
    ///
    /// Connections on loan finish normally and are dropped on release.
    pub fn remove_destination(&self, destination: &str) {
        if let Some(bucket) = self.buckets.lock().unwrap().remove(destination) {
            bucket.newest_version.store(u64::MAX, Ordering::SeqCst);
            bucket.idle.lock().unwrap().clear();
        }
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        let buckets = self.buckets.lock().unwrap();
        let mut destinations: Vec<DestinationStats> = buckets
            .iter()
            .map(|(name, bucket)| DestinationStats {
                destination: name.clone(),
                in_use: bucket.capacity - bucket.permits.available_permits(),
                idle: bucket.idle.lock().unwrap().len(),
                capacity: bucket.capacity,
            })
            .collect();
        destinations.sort_by(|a, b| a.destination.cmp(&b.destination));
        PoolStats { destinations }
    }

    fn bucket(&self, destination: &str) -> Arc<Bucket<T>> {
        self.buckets
            .lock()
            .unwrap()
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(Bucket::new(self.settings.max_per_destination)))
            .clone()
    }
}

impl<T: PoolTransport + Sync> ConnectionPool<T> {
    /// Spawn the idle reaper.
    ///
    /// The task stops when `shutdown_rx` turns `true`.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = pool.evict_idle();
                        if evicted > 0 {
                            debug!("Evicted {} idle connections", evicted);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Pool reaper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Transport that detects concurrent borrowers.
    struct FakeConn {
        id: usize,
        borrowed: Arc<AtomicBool>,
        open: Arc<AtomicBool>,
        superseded: Arc<AtomicBool>,
    }

    impl FakeConn {
        fn new(id: usize) -> Self {
            Self {
                id,
                borrowed: Arc::new(AtomicBool::new(false)),
                open: Arc::new(AtomicBool::new(true)),
                superseded: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl PoolTransport for FakeConn {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn is_superseded(&self) -> bool {
            self.superseded.load(Ordering::SeqCst)
        }
    }

    fn pool(max: usize) -> ConnectionPool<FakeConn> {
        ConnectionPool::new(PoolSettings {
            max_per_destination: max,
            acquire_timeout: Duration::from_millis(200),
            idle_ttl: Duration::from_secs(60),
        })
    }

    async fn open(
        pool: &ConnectionPool<FakeConn>,
        id: usize,
        version: u64,
    ) -> PooledConnection<FakeConn> {
        match pool.acquire("billing", version).await.unwrap() {
            Checkout::Vacant(slot) => slot.fill(FakeConn::new(id), version),
            Checkout::Reused(_) => panic!("expected a vacant slot"),
        }
    }

    #[tokio::test]
    async fn test_third_acquire_waits_for_release() {
        let pool = Arc::new(ConnectionPool::new(PoolSettings {
            max_per_destination: 2,
            acquire_timeout: Duration::from_secs(2),
            idle_ttl: Duration::from_secs(60),
        }));
        let first = open(&pool, 1, 1).await;
        let _second = open(&pool, 2, 1).await;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("billing", 1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.release(first, ReleaseOutcome::Reusable);
        match waiter.await.unwrap().unwrap() {
            Checkout::Reused(conn) => {
                assert_eq!(conn.get().id, 1);
                assert_eq!(conn.identity_version(), 1);
            }
            Checkout::Vacant(_) => panic!("expected the released connection"),
        }
    }

    #[tokio::test]
    async fn test_released_stale_connection_not_handed_to_waiter() {
        let pool = Arc::new(ConnectionPool::new(PoolSettings {
            max_per_destination: 2,
            acquire_timeout: Duration::from_secs(2),
            idle_ttl: Duration::from_secs(60),
        }));
        let first = open(&pool, 1, 1).await;
        let _second = open(&pool, 2, 1).await;

        // Rotation to v2 happens while both are on loan.
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("billing", 2).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.release(first, ReleaseOutcome::Reusable);
        assert!(matches!(
            waiter.await.unwrap().unwrap(),
            Checkout::Vacant(_)
        ));
    }

    #[tokio::test]
    async fn test_exhausted_after_bounded_wait() {
        let pool = pool(1);
        let _held = open(&pool, 1, 1).await;

        let started = Instant::now();
        let result = pool.acquire("billing", 1).await;
        assert!(matches!(result, Err(PoolError::Exhausted { .. })));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_try_reuse_never_waits_or_reserves() {
        let pool = pool(2);
        assert!(pool.try_reuse("billing", 1).is_none());
        assert_eq!(pool.stats().destinations[0].in_use, 0);

        let conn = open(&pool, 1, 1).await;
        pool.release(conn, ReleaseOutcome::Reusable);
        let reused = pool.try_reuse("billing", 1).expect("idle connection");
        assert_eq!(reused.get().id, 1);

        // Budget fully on loan: no wait, no slot.
        let _other = open(&pool, 2, 1).await;
        let started = Instant::now();
        assert!(pool.try_reuse("billing", 1).is_none());
        assert!(started.elapsed() < Duration::from_millis(50));

        // A stale idle connection is not handed out.
        pool.release(reused, ReleaseOutcome::Reusable);
        assert!(pool.try_reuse("billing", 2).is_none());
        assert_eq!(pool.stats().destinations[0].idle, 0);
    }

    #[tokio::test]
    async fn test_destinations_have_separate_budgets() {
        let pool = pool(1);
        let _billing = open(&pool, 1, 1).await;
        assert!(matches!(
            pool.acquire("ledger", 1).await,
            Ok(Checkout::Vacant(_))
        ));
    }

    #[tokio::test]
    async fn test_broken_and_dropped_connections_discarded() {
        let pool = pool(2);
        let conn = open(&pool, 1, 1).await;
        pool.release(conn, ReleaseOutcome::Broken);

        let conn = open(&pool, 2, 1).await;
        drop(conn);

        assert!(matches!(
            pool.acquire("billing", 1).await.unwrap(),
            Checkout::Vacant(_)
        ));
        let stats = pool.stats();
        assert_eq!(stats.destinations[0].idle, 0);
    }

    #[tokio::test]
    async fn test_reuse_is_most_recent_first() {
        let pool = pool(2);
        let a = open(&pool, 1, 1).await;
        let b = open(&pool, 2, 1).await;
        pool.release(a, ReleaseOutcome::Reusable);
        pool.release(b, ReleaseOutcome::Reusable);

        match pool.acquire("billing", 1).await.unwrap() {
            Checkout::Reused(conn) => assert_eq!(conn.get().id, 2),
            Checkout::Vacant(_) => panic!("expected reuse"),
        }
    }

    #[tokio::test]
    async fn test_idle_stale_closed_and_expired_evicted() {
        let pool = ConnectionPool::new(PoolSettings {
            max_per_destination: 4,
            acquire_timeout: Duration::from_millis(100),
            idle_ttl: Duration::from_millis(50),
        });
        let conn = open(&pool, 1, 1).await;
        pool.release(conn, ReleaseOutcome::Reusable);
        assert_eq!(pool.evict_idle(), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(pool.evict_idle(), 1);

        let conn = open(&pool, 2, 1).await;
        let open_flag = conn.get().open.clone();
        pool.release(conn, ReleaseOutcome::Reusable);
        open_flag.store(false, Ordering::SeqCst);
        assert_eq!(pool.evict_idle(), 1);

        let conn = open(&pool, 3, 1).await;
        pool.release(conn, ReleaseOutcome::Reusable);
        // A newer identity makes the idle v1 connection stale.
        let slot = pool.acquire("billing", 2).await.unwrap();
        assert!(matches!(slot, Checkout::Vacant(_)));
    }

    #[tokio::test]
    async fn test_superseded_connections_evicted_and_not_pooled() {
        let pool = pool(4);
        let idle = open(&pool, 1, 1).await;
        let idle_superseded = idle.get().superseded.clone();
        pool.release(idle, ReleaseOutcome::Reusable);

        // Rotation flags the idle connection before any acquire under v2.
        idle_superseded.store(true, Ordering::SeqCst);
        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(pool.stats().destinations[0].idle, 0);

        let on_loan = open(&pool, 2, 1).await;
        on_loan.get().superseded.store(true, Ordering::SeqCst);
        pool.release(on_loan, ReleaseOutcome::Reusable);
        assert_eq!(pool.stats().destinations[0].idle, 0);
        assert!(pool.try_reuse("billing", 1).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_borrower_under_contention() {
        let pool = Arc::new(ConnectionPool::new(PoolSettings {
            max_per_destination: 3,
            acquire_timeout: Duration::from_secs(5),
            idle_ttl: Duration::from_secs(60),
        }));
        let next_id = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            let next_id = next_id.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let conn = match pool.acquire("billing", 1).await.unwrap() {
                        Checkout::Reused(conn) => conn,
                        Checkout::Vacant(slot) => {
                            let id = next_id.fetch_add(1, Ordering::SeqCst);
                            slot.fill(FakeConn::new(id), 1)
                        }
                    };
                    assert!(!conn.get().borrowed.swap(true, Ordering::SeqCst));
                    let in_use = pool.stats().destinations[0].in_use;
                    max_seen.fetch_max(in_use, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    conn.get().borrowed.store(false, Ordering::SeqCst);
                    pool.release(conn, ReleaseOutcome::Reusable);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert!(next_id.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_remove_destination_drops_idle() {
        let pool = pool(2);
        let conn = open(&pool, 1, 1).await;
        let on_loan = open(&pool, 2, 1).await;
        pool.release(conn, ReleaseOutcome::Reusable);

        pool.remove_destination("billing");
        assert!(pool.stats().destinations.is_empty());

        // The loaned connection belongs to the forgotten bucket and is dropped.
        pool.release(on_loan, ReleaseOutcome::Reusable);
        assert!(matches!(
            pool.acquire("billing", 1).await.unwrap(),
            Checkout::Vacant(_)
        ));
    }

    #[tokio::test]
    async fn test_reaper_stops_on_shutdown() {
        let pool = Arc::new(pool(1));
        let (tx, rx) = watch::channel(false);
        let handle = pool.spawn_reaper(Duration::from_millis(10), rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
