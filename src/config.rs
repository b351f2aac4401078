//! Pool configuration options

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration for connection pool behavior
///
/// A limit of `0` means the corresponding bound is not enforced.
///
/// # Examples
///
/// ```
/// use rpcpool::PoolOptions;
/// use std::time::Duration;
///
/// let options = PoolOptions::new()
///     .with_capacity(20)
///     .with_key_capacity(2)
///     .with_idle_expiration(Duration::from_secs(30));
///
/// assert_eq!(options.capacity, 20);
/// assert_eq!(options.key_capacity, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolOptions {
    /// Maximum number of connections kept open across all keys
    pub capacity: usize,

    /// Maximum number of connections kept open for a single key
    pub key_capacity: usize,

    /// How long a connection may sit idle in the pool before it is considered
    /// stale. Zero disables age-based expiration.
    pub idle_expiration: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            capacity: 100,
            key_capacity: 5,
            idle_expiration: Duration::from_secs(120),
        }
    }
}

impl PoolOptions {
    /// Create new options with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global connection capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the per-key connection capacity
    pub fn with_key_capacity(mut self, key_capacity: usize) -> Self {
        self.key_capacity = key_capacity;
        self
    }

    /// Set the idle expiration
    ///
    /// # Examples
    ///
    /// ```
    /// use rpcpool::PoolOptions;
    /// use std::time::Duration;
    ///
    /// let options = PoolOptions::new().with_idle_expiration(Duration::ZERO);
    /// assert!(options.idle_expiration.is_zero());
    /// ```
    pub fn with_idle_expiration(mut self, idle_expiration: Duration) -> Self {
        self.idle_expiration = idle_expiration;
        self
    }
}
