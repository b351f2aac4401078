//! Metrics collection and export for connection pools

use crate::eviction::EvictionReason;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "serde")]
use serde::Serialize;

/// Metrics snapshot for a pool
///
/// # Examples
///
/// ```
/// use rpcpool::{PoolKey, PoolOptions};
/// # use rpcpool::Connection;
/// # struct Conn;
/// # impl Connection for Conn {
/// #     type Error = std::io::Error;
/// #     fn close(&self) -> std::io::Result<()> { Ok(()) }
/// #     fn is_closed(&self) -> bool { false }
/// # }
/// type Pool = rpcpool::Pool<PoolKey, Conn>;
///
/// let pool = Pool::new(PoolOptions::default());
/// let metrics = pool.metrics();
/// assert_eq!(metrics.connections_dialed, 0);
/// assert_eq!(metrics.resident_connections, 0);
/// pool.close().unwrap();
/// ```
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PoolMetrics {
    /// Connections established by a dialer
    pub connections_dialed: usize,

    /// Dial attempts that returned an error
    pub dial_failures: usize,

    /// Gets satisfied from the cache
    pub connections_from_cache: usize,

    /// Handles that returned their connection to the cache
    pub connections_returned: usize,

    /// Handles that discarded a broken connection
    pub connections_discarded: usize,

    /// Connections evicted by the global or per-key capacity
    pub capacity_evictions: usize,

    /// Connections evicted as broken or idle-expired
    pub stale_evictions: usize,

    /// Connections closed by cache shutdown
    pub shutdown_closes: usize,

    /// Connection closes that returned an error
    pub teardown_failures: usize,

    /// Pools dropped without an explicit close
    pub pools_leaked: usize,

    /// Connections currently resident in the cache
    pub resident_connections: usize,

    /// Keys with at least one resident connection
    pub resident_keys: usize,

    /// Resident connections relative to capacity (0.0 to 1.0)
    pub utilization: f64,

    /// Configured global capacity, 0 if unbounded
    pub capacity: usize,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("connections_dialed".to_string(), self.connections_dialed.to_string());
        metrics.insert("dial_failures".to_string(), self.dial_failures.to_string());
        metrics.insert("connections_from_cache".to_string(), self.connections_from_cache.to_string());
        metrics.insert("connections_returned".to_string(), self.connections_returned.to_string());
        metrics.insert("connections_discarded".to_string(), self.connections_discarded.to_string());
        metrics.insert("capacity_evictions".to_string(), self.capacity_evictions.to_string());
        metrics.insert("stale_evictions".to_string(), self.stale_evictions.to_string());
        metrics.insert("shutdown_closes".to_string(), self.shutdown_closes.to_string());
        metrics.insert("teardown_failures".to_string(), self.teardown_failures.to_string());
        metrics.insert("pools_leaked".to_string(), self.pools_leaked.to_string());
        metrics.insert("resident_connections".to_string(), self.resident_connections.to_string());
        metrics.insert("resident_keys".to_string(), self.resident_keys.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics.insert("capacity".to_string(), self.capacity.to_string());
        metrics
    }
}

/// Metrics exporter for Prometheus format
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        let gauges = [
            ("rpcpool_connections_resident", "Connections resident in the cache", metrics.resident_connections as f64),
            ("rpcpool_keys_resident", "Keys with resident connections", metrics.resident_keys as f64),
            ("rpcpool_utilization", "Resident connections relative to capacity", metrics.utilization),
            ("rpcpool_capacity", "Configured global capacity, 0 if unbounded", metrics.capacity as f64),
        ];
        for (name, help, value) in gauges {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} gauge\n"));
            output.push_str(&format!("{name}{{{labels}}} {value:.2}\n"));
        }

        let counters = [
            ("rpcpool_connections_dialed_total", "Connections established by the dialer", metrics.connections_dialed),
            ("rpcpool_dial_failures_total", "Failed dial attempts", metrics.dial_failures),
            ("rpcpool_connections_from_cache_total", "Gets satisfied from the cache", metrics.connections_from_cache),
            ("rpcpool_connections_returned_total", "Connections returned by handles", metrics.connections_returned),
            ("rpcpool_connections_discarded_total", "Broken connections discarded by handles", metrics.connections_discarded),
            ("rpcpool_capacity_evictions_total", "Connections evicted by capacity limits", metrics.capacity_evictions),
            ("rpcpool_stale_evictions_total", "Broken or expired connections evicted", metrics.stale_evictions),
            ("rpcpool_shutdown_closes_total", "Connections closed by pool shutdown", metrics.shutdown_closes),
            ("rpcpool_teardown_failures_total", "Connection closes that failed", metrics.teardown_failures),
            ("rpcpool_pools_leaked_total", "Pools dropped without close", metrics.pools_leaked),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} counter\n"));
            output.push_str(&format!("{name}{{{labels}}} {value}\n"));
        }

        output
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut tags: Vec<_> = tags.iter().collect();
            tags.sort();
            for (key, value) in tags {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Internal metrics tracker
#[derive(Default)]
pub(crate) struct MetricsTracker {
    pub connections_dialed: AtomicUsize,
    pub dial_failures: AtomicUsize,
    pub connections_from_cache: AtomicUsize,
    pub connections_returned: AtomicUsize,
    pub connections_discarded: AtomicUsize,
    pub capacity_evictions: AtomicUsize,
    pub stale_evictions: AtomicUsize,
    pub shutdown_closes: AtomicUsize,
    pub teardown_failures: AtomicUsize,
    pub pools_leaked: AtomicUsize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, reason: EvictionReason) {
        let counter = match reason {
            reason if reason.is_stale() => &self.stale_evictions,
            EvictionReason::Shutdown => &self.shutdown_closes,
            _ => &self.capacity_evictions,
        };
        Self::increment(counter);
    }

    pub fn get_metrics(&self, resident: usize, keys: usize, capacity: usize) -> PoolMetrics {
        let utilization = if capacity > 0 {
            resident as f64 / capacity as f64
        } else {
            0.0
        };

        PoolMetrics {
            connections_dialed: self.connections_dialed.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            connections_from_cache: self.connections_from_cache.load(Ordering::Relaxed),
            connections_returned: self.connections_returned.load(Ordering::Relaxed),
            connections_discarded: self.connections_discarded.load(Ordering::Relaxed),
            capacity_evictions: self.capacity_evictions.load(Ordering::Relaxed),
            stale_evictions: self.stale_evictions.load(Ordering::Relaxed),
            shutdown_closes: self.shutdown_closes.load(Ordering::Relaxed),
            teardown_failures: self.teardown_failures.load(Ordering::Relaxed),
            pools_leaked: self.pools_leaked.load(Ordering::Relaxed),
            resident_connections: resident,
            resident_keys: keys,
            utilization,
            capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_reasons_map_to_counters() {
        let tracker = MetricsTracker::new();
        tracker.record_eviction(EvictionReason::Capacity);
        tracker.record_eviction(EvictionReason::KeyCapacity);
        tracker.record_eviction(EvictionReason::Expired);
        tracker.record_eviction(EvictionReason::Shutdown);

        let metrics = tracker.get_metrics(1, 1, 4);
        assert_eq!(metrics.capacity_evictions, 2);
        assert_eq!(metrics.stale_evictions, 1);
        assert_eq!(metrics.shutdown_closes, 1);
        assert_eq!(metrics.utilization, 0.25);
    }

    #[test]
    fn test_prometheus_labels_are_sorted() {
        let metrics = MetricsTracker::new().get_metrics(0, 0, 0);
        let mut tags = HashMap::new();
        tags.insert("zone".to_string(), "eu".to_string());
        tags.insert("service".to_string(), "uplink".to_string());

        let output = MetricsExporter::export_prometheus(&metrics, "main", Some(&tags));
        assert!(output.contains(r#"rpcpool_connections_resident{pool="main",service="uplink",zone="eu"} 0.00"#));
        assert!(output.contains("# TYPE rpcpool_connections_dialed_total counter"));
    }

    #[test]
    fn test_prometheus_includes_capacity_and_shutdown_closes() {
        let tracker = MetricsTracker::new();
        tracker.record_eviction(EvictionReason::Shutdown);
        tracker.record_eviction(EvictionReason::Shutdown);
        let metrics = tracker.get_metrics(0, 0, 8);

        let output = MetricsExporter::export_prometheus(&metrics, "main", None);
        assert!(output.contains("# TYPE rpcpool_capacity gauge"));
        assert!(output.contains(r#"rpcpool_capacity{pool="main"} 8.00"#));
        assert!(output.contains("# TYPE rpcpool_shutdown_closes_total counter"));
        assert!(output.contains(r#"rpcpool_shutdown_closes_total{pool="main"} 2"#));
    }

    #[test]
    fn test_export_map() {
        let metrics = MetricsTracker::new().get_metrics(3, 2, 10);
        let exported = metrics.export();
        assert_eq!(exported["resident_connections"], "3");
        assert_eq!(exported["utilization"], "0.30");
    }
}
