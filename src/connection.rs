//! Contracts the pool expects from connections and dialers

use async_trait::async_trait;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;

/// A live transport connection that can be shared through the pool.
///
/// Connections are held behind an `Arc` and may be referenced by several
/// handles at once, so both methods take `&self`. `close` may be called more
/// than once on the same connection (for example by an evicting cache and a
/// handle discarding it) and must tolerate that.
pub trait Connection: Send + Sync + 'static {
    type Error: Display + Send + 'static;

    /// Tear down the connection.
    fn close(&self) -> Result<(), Self::Error>;

    /// Whether the connection has already been closed or broken.
    fn is_closed(&self) -> bool;
}

/// Establishes new connections on demand.
///
/// Implementations must be safe to call concurrently and must not cache
/// connections themselves. Any `Fn() -> impl Future` closure returning
/// `Result<(connection, state), error>` is a dialer.
///
/// # Examples
///
/// ```
/// use rpcpool::{Connection, Dialer};
/// use std::sync::atomic::{AtomicBool, Ordering};
///
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
/// let dialer = || async { Ok::<_, std::io::Error>((Conn(AtomicBool::new(false)), "session")) };
/// let (conn, state) = dialer.dial().await.unwrap();
/// assert!(!conn.is_closed());
/// assert_eq!(state, "session");
/// # }
/// ```
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: Connection;

    /// Metadata captured at dial time, e.g. the negotiated session.
    type State: Clone + Send + Sync + 'static;

    /// Returned to the pool's caller unchanged.
    type Error: Send + 'static;

    async fn dial(&self) -> Result<(Self::Connection, Self::State), Self::Error>;
}

#[async_trait]
impl<F, Fut, C, S, E> Dialer for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(C, S), E>> + Send + 'static,
    C: Connection,
    S: Clone + Send + Sync + 'static,
    E: Send + 'static,
{
    type Connection = C;
    type State = S;
    type Error = E;

    async fn dial(&self) -> Result<(C, S), E> {
        (self)().await
    }
}

/// Bounds required of a cache key.
pub trait CacheKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Hash + Eq + Clone + Debug + Send + Sync + 'static {}
