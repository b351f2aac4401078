//! Concurrent usage example: many tasks sharing multiplexed connections

use rpcpool::{Connection, Pool, PoolKey, PoolOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;

static DIALS: AtomicUsize = AtomicUsize::new(0);

struct MuxConn {
    closed: AtomicBool,
}

impl Connection for MuxConn {
    type Error = std::io::Error;

    fn close(&self) -> std::io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn dial() -> std::io::Result<(MuxConn, ())> {
    // Simulated handshake
    sleep(Duration::from_millis(20)).await;
    DIALS.fetch_add(1, Ordering::SeqCst);
    Ok((
        MuxConn {
            closed: AtomicBool::new(false),
        },
        (),
    ))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== rpcpool - Async Examples ===\n");

    let pool: Arc<Pool<PoolKey, MuxConn>> = Arc::new(Pool::new(
        PoolOptions::new().with_capacity(8).with_key_capacity(2),
    ));

    let mut tasks = Vec::new();
    for i in 0..16 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            let key = PoolKey::new(format!("node-{}:7777", i % 4));
            for _ in 0..10 {
                let (conn, _) = pool.get(key.clone(), dial).await.unwrap();
                // Simulated RPC over the shared connection
                sleep(Duration::from_millis(1)).await;
                conn.close();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    println!("   160 calls over {} dialed connections", DIALS.load(Ordering::SeqCst));

    let mut tags = HashMap::new();
    tags.insert("service".to_string(), "demo".to_string());
    println!("{}", pool.export_metrics_prometheus("demo", Some(&tags)));

    pool.close().unwrap();
}
