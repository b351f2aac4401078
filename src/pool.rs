//! Connection pool and pooled connection handles

use crate::cache::{CacheEntry, ConnectionCache};
use crate::config::PoolOptions;
use crate::connection::{CacheKey, Connection, Dialer};
use crate::errors::PoolResult;
use crate::metrics::{MetricsExporter, MetricsTracker, PoolMetrics};

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::{debug, warn};

/// Release state of a [`PooledConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Checked out, not yet released
    Active,

    /// Released healthy and handed back to the cache
    ReturnedToCache,

    /// Released broken (or unpooled) and closed
    Discarded,
}

const ACTIVE: u8 = 0;
const RETURNED: u8 = 1;
const DISCARDED: u8 = 2;

impl HandleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            ACTIVE => HandleState::Active,
            RETURNED => HandleState::ReturnedToCache,
            _ => HandleState::Discarded,
        }
    }
}

type CacheOf<K, D> = ConnectionCache<K, <D as Dialer>::Connection, <D as Dialer>::State>;

async fn dial<K, D>(dialer: &D, key: &K, metrics: Option<&MetricsTracker>) -> Result<CacheEntry<D::Connection, D::State>, D::Error>
where
    K: CacheKey,
    D: Dialer,
{
    match dialer.dial().await {
        Ok((conn, state)) => {
            if let Some(metrics) = metrics {
                MetricsTracker::increment(&metrics.connections_dialed);
            }
            debug!(?key, "connection_dialed");
            Ok(CacheEntry::new(Arc::new(conn), state))
        }
        Err(err) => {
            if let Some(metrics) = metrics {
                MetricsTracker::increment(&metrics.dial_failures);
            }
            Err(err)
        }
    }
}

/// Takes a usable connection for `key` from the cache or dials a new one,
/// then immediately republishes it so concurrent callers can share it.
///
/// Also returns whether the cache accepted the connection. A cache closed
/// while the dial was in flight refuses it and the connection comes back
/// open, owned by the caller alone.
async fn checkout<K, D>(
    cache: &CacheOf<K, D>,
    key: &K,
    dialer: &D,
) -> Result<(CacheEntry<D::Connection, D::State>, bool), D::Error>
where
    K: CacheKey,
    D: Dialer,
{
    let entry = match cache.take(key) {
        Some(entry) => {
            MetricsTracker::increment(&cache.tracker().connections_from_cache);
            debug!(?key, "connection_from_cache");
            entry
        }
        None => dial(dialer, key, Some(cache.tracker())).await?,
    };

    let (conn, state) = entry.into_parts();
    let pooled = cache
        .try_put(key.clone(), CacheEntry::new(Arc::clone(&conn), state.clone()))
        .is_ok();
    if !pooled {
        debug!(?key, "pool closed during checkout, connection not cached");
    }
    Ok((CacheEntry::new(conn, state), pooled))
}

/// A connection checked out of a [`Pool`].
///
/// Dereferences to the underlying connection. Releasing the handle, either
/// through [`close`](Self::close) or by dropping it, hands a healthy
/// connection back to the pool and closes a broken one. Only the first
/// release has any effect.
///
/// A handle obtained without a pool owns its connection outright: releasing
/// it closes the connection.
pub struct PooledConnection<K: CacheKey, D: Dialer> {
    conn: Arc<D::Connection>,
    aux: D::State,
    key: K,
    cache: Option<Arc<CacheOf<K, D>>>,
    dialer: Arc<D>,
    state: AtomicU8,
}

impl<K: CacheKey, D: Dialer> PooledConnection<K, D> {
    fn new(entry: CacheEntry<D::Connection, D::State>, key: K, cache: Option<Arc<CacheOf<K, D>>>, dialer: Arc<D>) -> Self {
        let (conn, aux) = entry.into_parts();
        Self {
            conn,
            aux,
            key,
            cache,
            dialer,
            state: AtomicU8::new(ACTIVE),
        }
    }

    async fn unpooled(key: K, dialer: D, metrics: Option<&MetricsTracker>) -> Result<(Self, D::State), D::Error> {
        let entry = dial(&dialer, &key, metrics).await?;
        let aux = entry.state().clone();
        Ok((Self::new(entry, key, None, Arc::new(dialer)), aux))
    }

    /// The shared connection this handle forwards to
    pub fn connection(&self) -> &Arc<D::Connection> {
        &self.conn
    }

    /// State captured when the connection was dialed
    pub fn aux_state(&self) -> &D::State {
        &self.aux
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn is_pooled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Releases the connection.
    ///
    /// The first call either returns a healthy connection to the pool under
    /// the original key or closes a broken one. Later calls do nothing.
    pub fn close(&self) {
        let broken = self.conn.is_closed();
        let target = if broken || self.cache.is_none() { DISCARDED } else { RETURNED };
        if self
            .state
            .compare_exchange(ACTIVE, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        match &self.cache {
            Some(cache) if !broken => {
                MetricsTracker::increment(&cache.tracker().connections_returned);
                cache.put(self.key.clone(), CacheEntry::new(Arc::clone(&self.conn), self.aux.clone()));
            }
            cache => {
                if let Some(cache) = cache {
                    MetricsTracker::increment(&cache.tracker().connections_discarded);
                    debug!(key = ?self.key, "discarding broken connection");
                }
                if let Err(err) = self.conn.close() {
                    warn!(key = ?self.key, error = %err, "failed to close discarded connection");
                }
            }
        }
    }

    /// Replaces a broken connection using the dialer this handle was created
    /// with.
    ///
    /// Goes through the same take-or-dial path as [`Pool::get`], so a healthy
    /// cached connection is preferred over a new dial. Does nothing when the
    /// connection is still healthy or the handle has been released. On error
    /// the handle keeps its broken connection.
    pub async fn redial(&mut self) -> Result<(), D::Error> {
        if self.state() != HandleState::Active || !self.conn.is_closed() {
            return Ok(());
        }

        if self.cache.as_ref().is_some_and(|cache| cache.is_closed()) {
            self.cache = None;
        }

        let (entry, pooled) = match &self.cache {
            Some(cache) => checkout(&**cache, &self.key, &*self.dialer).await?,
            None => (dial(&*self.dialer, &self.key, None).await?, false),
        };
        if !pooled {
            self.cache = None;
        }
        debug!(key = ?self.key, "redialed broken connection");

        if let Err(err) = self.conn.close() {
            warn!(key = ?self.key, error = %err, "failed to close replaced connection");
        }
        let (conn, aux) = entry.into_parts();
        self.conn = conn;
        self.aux = aux;
        Ok(())
    }
}

impl<K: CacheKey, D: Dialer> Deref for PooledConnection<K, D> {
    type Target = D::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<K: CacheKey, D: Dialer> Drop for PooledConnection<K, D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<K: CacheKey, D: Dialer> fmt::Debug for PooledConnection<K, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

/// Keyed connection pool.
///
/// [`get`](Self::get) looks up a cached connection for a key and dials a new
/// one on a miss. Either way the connection is put straight back into the
/// cache before the handle is returned, so concurrent callers for the same
/// key share it. This is only sound for transports that multiplex concurrent
/// calls over one connection.
///
/// Dropping a pool without calling [`close`](Self::close) is reported as a
/// leak and closes the cached connections.
///
/// # Examples
///
/// ```
/// use rpcpool::{Connection, Pool, PoolKey, PoolOptions};
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// #[derive(Default)]
/// struct Conn(AtomicBool);
///
/// impl Connection for Conn {
///     type Error = std::io::Error;
///     fn close(&self) -> std::io::Result<()> {
///         self.0.store(true, Ordering::SeqCst);
///         Ok(())
///     }
///     fn is_closed(&self) -> bool {
///         self.0.load(Ordering::SeqCst)
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool: Pool<PoolKey, Conn> = Pool::new(PoolOptions::default());
/// let key = PoolKey::new("node-1:7777");
///
/// let (first, _) = pool
///     .get(key.clone(), || async { Ok::<_, std::io::Error>((Conn::default(), ())) })
///     .await
///     .unwrap();
/// first.close();
///
/// let (second, _) = pool
///     .get(key, || async { Ok::<_, std::io::Error>((Conn::default(), ())) })
///     .await
///     .unwrap();
/// assert!(std::sync::Arc::ptr_eq(first.connection(), second.connection()));
///
/// drop(second);
/// pool.close().unwrap();
/// # }
/// ```
pub struct Pool<K: CacheKey, C: Connection, S: Clone + Send + Sync + 'static = ()> {
    cache: Arc<ConnectionCache<K, C, S>>,
    armed: AtomicBool,
}

impl<K, C, S> Pool<K, C, S>
where
    K: CacheKey,
    C: Connection,
    S: Clone + Send + Sync + 'static,
{
    /// Create a new pool
    pub fn new(options: PoolOptions) -> Self {
        debug!(
            capacity = options.capacity,
            key_capacity = options.key_capacity,
            idle_expiration = ?options.idle_expiration,
            "connection pool created"
        );

        Self {
            cache: Arc::new(ConnectionCache::new(&options)),
            armed: AtomicBool::new(true),
        }
    }

    /// Get a connection for `key`, dialing with `dialer` on a cache miss.
    ///
    /// Dial errors are returned unchanged and leave the cache untouched.
    /// After the pool is closed every call dials a fresh connection that is
    /// not pooled.
    pub async fn get<D>(&self, key: K, dialer: D) -> Result<(PooledConnection<K, D>, S), D::Error>
    where
        D: Dialer<Connection = C, State = S>,
    {
        if self.cache.is_closed() {
            return PooledConnection::unpooled(key, dialer, Some(self.cache.tracker())).await;
        }

        let (entry, pooled) = checkout(&*self.cache, &key, &dialer).await?;
        let aux = entry.state().clone();
        let cache = pooled.then(|| Arc::clone(&self.cache));
        let handle = PooledConnection::new(entry, key, cache, Arc::new(dialer));
        Ok((handle, aux))
    }

    /// [`get`](Self::get) on an optional pool. Without a pool the dialer is
    /// always called and the connection is never cached.
    pub async fn get_or_dial<D>(pool: Option<&Self>, key: K, dialer: D) -> Result<(PooledConnection<K, D>, S), D::Error>
    where
        D: Dialer<Connection = C, State = S>,
    {
        match pool {
            Some(pool) => pool.get(key, dialer).await,
            None => PooledConnection::unpooled(key, dialer, None).await,
        }
    }

    /// Close every cached connection. Calling it again is a no-op.
    pub fn close(&self) -> PoolResult<()> {
        self.armed.store(false, Ordering::Release);
        self.cache.close()?;
        debug!("connection pool closed");
        Ok(())
    }

    /// [`close`](Self::close) on an optional pool
    pub fn close_optional(pool: Option<&Self>) -> PoolResult<()> {
        match pool {
            Some(pool) => pool.close(),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cache.is_closed()
    }

    /// Number of cached connections
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Number of cached connections for `key`
    pub fn key_len(&self, key: &K) -> usize {
        self.cache.key_len(key)
    }

    /// Get pool metrics
    pub fn metrics(&self) -> PoolMetrics {
        self.cache.metrics()
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.metrics().export()
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics_prometheus(&self, pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        MetricsExporter::export_prometheus(&self.metrics(), pool_name, tags)
    }
}

impl<K, C, S> Drop for Pool<K, C, S>
where
    K: CacheKey,
    C: Connection,
    S: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !*self.armed.get_mut() || self.cache.is_closed() {
            return;
        }

        MetricsTracker::increment(&self.cache.tracker().pools_leaked);
        warn!(resident = self.cache.len(), "pool_leaked: dropped without close, closing cached connections");
        if let Err(err) = self.cache.close() {
            warn!(error = %err, "failed to close connections of leaked pool");
        }
    }
}
