//! Staleness and eviction bookkeeping for cached connections

use crate::connection::Connection;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Why a cached connection was removed and closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// The pool held more connections than its global capacity
    Capacity,

    /// The key held more connections than its per-key capacity
    KeyCapacity,

    /// The connection reported itself closed or broken
    Broken,

    /// The connection sat idle longer than the idle expiration
    Expired,

    /// The cache was closed
    Shutdown,
}

impl EvictionReason {
    pub fn is_stale(self) -> bool {
        matches!(self, EvictionReason::Broken | EvictionReason::Expired)
    }
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            EvictionReason::Capacity => "capacity",
            EvictionReason::KeyCapacity => "key_capacity",
            EvictionReason::Broken => "broken",
            EvictionReason::Expired => "expired",
            EvictionReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Idle expiration policy. A zero duration never expires.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IdleExpiration(Duration);

impl IdleExpiration {
    pub fn new(idle: Duration) -> Self {
        Self(idle)
    }

    pub fn expires(&self, inserted_at: Instant) -> bool {
        if self.0.is_zero() {
            return false;
        }
        Instant::now().saturating_duration_since(inserted_at) > self.0
    }

    /// Returns the reason a resident connection may no longer be handed out.
    pub fn staleness<C: Connection>(&self, conn: &C, inserted_at: Instant) -> Option<EvictionReason> {
        if conn.is_closed() {
            Some(EvictionReason::Broken)
        } else if self.expires(inserted_at) {
            Some(EvictionReason::Expired)
        } else {
            None
        }
    }
}
