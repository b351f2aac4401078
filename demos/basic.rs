//! Basic usage examples for Pool

use rpcpool::{Connection, Pool, PoolKey, PoolOptions};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Stand-in for a negotiated RPC transport.
struct DemoConn {
    id: usize,
    closed: AtomicBool,
}

impl Connection for DemoConn {
    type Error = std::io::Error;

    fn close(&self) -> std::io::Result<()> {
        println!("   closing connection #{}", self.id);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn dial() -> std::io::Result<(DemoConn, &'static str)> {
    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
    println!("   dialing connection #{id}");
    Ok((
        DemoConn {
            id,
            closed: AtomicBool::new(false),
        },
        "TLS1.3",
    ))
}

type DemoPool = Pool<PoolKey<&'static str>, DemoConn, &'static str>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== rpcpool - Basic Examples ===\n");

    // Example 1: Reuse
    reuse().await;

    // Example 2: Capacity eviction
    eviction().await;

    // Example 3: Pooling disabled
    unpooled().await;
}

async fn reuse() {
    println!("1. Reuse:");
    let pool = DemoPool::new(PoolOptions::default());
    let key = PoolKey::with_fingerprint("node-1:7777", "tls");

    for _ in 0..3 {
        let (conn, state) = pool.get(key.clone(), dial).await.unwrap();
        println!("   using connection #{} ({state})", conn.id);
        // Connection automatically returned when `conn` goes out of scope
    }

    let metrics = pool.metrics();
    println!(
        "   dialed: {}, from cache: {}\n",
        metrics.connections_dialed, metrics.connections_from_cache
    );
    pool.close().unwrap();
}

async fn eviction() {
    println!("2. Capacity Eviction:");
    let options = PoolOptions::new()
        .with_capacity(2)
        .with_key_capacity(1)
        .with_idle_expiration(Duration::from_secs(30));
    let pool = DemoPool::new(options);

    for endpoint in ["node-1:7777", "node-2:7777", "node-3:7777"] {
        let (conn, _) = pool.get(PoolKey::with_fingerprint(endpoint, "tls"), dial).await.unwrap();
        conn.close();
    }

    println!("   resident after three endpoints: {}", pool.len());
    println!("   closing pool:");
    pool.close().unwrap();
    println!();
}

async fn unpooled() {
    println!("3. Pooling Disabled:");
    let key = PoolKey::with_fingerprint("node-1:7777", "tls");
    let (conn, _) = DemoPool::get_or_dial(None, key, dial).await.unwrap();
    println!("   pooled: {}", conn.is_pooled());
    conn.close();
    println!();
}
