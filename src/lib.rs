//! # rpcpool
//!
//! Keyed, thread-safe connection pool sitting between an RPC client and the
//! dialer that establishes its transport connections.
//!
//! ## Features
//!
//! - Connections shared per [`PoolKey`] (endpoint plus configuration fingerprint)
//! - Global and per-key capacity limits with oldest-first eviction
//! - Lazy staleness checks: broken and idle-expired connections are never reused
//! - Exactly-once release of [`PooledConnection`] handles, automatic on drop
//! - Leak reporting for pools dropped without [`Pool::close`]
//! - Metrics snapshots and Prometheus text export
//!
//! ## Quick Start
//!
//! ```rust
//! use rpcpool::{Connection, Pool, PoolKey, PoolOptions};
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::time::Duration;
//!
//! #[derive(Default)]
//! struct Conn(AtomicBool);
//!
//! impl Connection for Conn {
//!     type Error = std::io::Error;
//!     fn close(&self) -> std::io::Result<()> {
//!         self.0.store(true, Ordering::SeqCst);
//!         Ok(())
//!     }
//!     fn is_closed(&self) -> bool {
//!         self.0.load(Ordering::SeqCst)
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool: Pool<PoolKey, Conn> = Pool::new(
//!     PoolOptions::new()
//!         .with_capacity(10)
//!         .with_key_capacity(2)
//!         .with_idle_expiration(Duration::from_secs(60)),
//! );
//!
//! {
//!     let (conn, _state) = pool
//!         .get(PoolKey::new("node-1:7777"), || async {
//!             Ok::<_, std::io::Error>((Conn::default(), ()))
//!         })
//!         .await
//!         .unwrap();
//!     assert!(!conn.is_closed());
//!     // Connection automatically returned when `conn` goes out of scope
//! }
//!
//! assert_eq!(pool.len(), 1);
//! pool.close().unwrap();
//! # }
//! ```

mod cache;
mod config;
mod connection;
mod errors;
mod eviction;
mod key;
mod metrics;
mod pool;

pub use cache::{CacheEntry, ConnectionCache};
pub use config::PoolOptions;
pub use connection::{CacheKey, Connection, Dialer};
pub use errors::{PoolError, PoolResult, TeardownError};
pub use eviction::EvictionReason;
pub use key::PoolKey;
pub use metrics::{MetricsExporter, PoolMetrics};
pub use pool::{HandleState, Pool, PooledConnection};
