//! Cache keys identifying interchangeable connections

use std::fmt;
use std::sync::Arc;

/// Identity under which pooled connections are considered interchangeable.
///
/// A key combines the logical endpoint a connection was dialed to with a
/// fingerprint of the configuration it was dialed with (for example the TLS
/// options in use). Two connections may only be shared when both parts are
/// equal.
///
/// # Examples
///
/// ```
/// use rpcpool::PoolKey;
///
/// let a = PoolKey::with_fingerprint("node-1:7777", "tls-v1");
/// let b = PoolKey::with_fingerprint("node-1:7777", "tls-v1");
/// let c = PoolKey::with_fingerprint("node-1:7777", "insecure");
///
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PoolKey<F = ()> {
    endpoint: Arc<str>,
    fingerprint: F,
}

impl PoolKey<()> {
    /// Key for an endpoint dialed without any distinguishing configuration
    pub fn new(endpoint: impl Into<Arc<str>>) -> Self {
        Self::with_fingerprint(endpoint, ())
    }
}

impl<F> PoolKey<F> {
    pub fn with_fingerprint(endpoint: impl Into<Arc<str>>, fingerprint: F) -> Self {
        Self {
            endpoint: endpoint.into(),
            fingerprint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn fingerprint(&self) -> &F {
        &self.fingerprint
    }
}

impl<F: fmt::Debug> fmt::Debug for PoolKey<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolKey")
            .field(&&*self.endpoint)
            .field(&self.fingerprint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keys_hash_by_both_parts() {
        let mut keys = HashSet::new();
        keys.insert(PoolKey::with_fingerprint("a:1", 1u64));
        keys.insert(PoolKey::with_fingerprint("a:1", 1u64));
        keys.insert(PoolKey::with_fingerprint("a:1", 2u64));
        keys.insert(PoolKey::with_fingerprint("b:1", 1u64));

        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn test_debug_output() {
        let key = PoolKey::new("node:7777");
        assert_eq!(key.endpoint(), "node:7777");
        assert_eq!(format!("{key:?}"), r#"PoolKey("node:7777", ())"#);
    }
}
