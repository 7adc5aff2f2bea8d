//! Aggregate counters and the dump-on-connect stats endpoint.
//!
//! Counters are plain relaxed atomics, incremented from the serving tasks
//! and snapshotted whole when a stats client connects. The endpoint speaks
//! no protocol: any connect receives one JSON object and the socket closes.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub server_connections: Counter,
    pub server_eof: Counter,
    pub server_err: Counter,
    pub server_timedout: Counter,
    pub requests: Counter,
    pub request_bytes: Counter,
    pub responses: Counter,
    pub response_bytes: Counter,
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub client_connections: Counter,
    pub client_eof: Counter,
    pub client_err: Counter,
    pub forward_error: Counter,
    pub fragments: Counter,
    pub requests: Counter,
    pub request_bytes: Counter,
    pub responses: Counter,
    pub response_bytes: Counter,
    pub server_ejects: Counter,
}

/// Process-wide stats registry. Pools and servers register at startup; the
/// maps are immutable afterwards, only the counters move.
#[derive(Debug)]
pub struct Stats {
    service: &'static str,
    source: String,
    version: &'static str,
    started: Instant,
    pub curr_connections: Counter,
    pub total_connections: Counter,
    pools: BTreeMap<String, (Arc<PoolStats>, BTreeMap<String, Arc<ServerStats>>)>,
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            service: "shardmux",
            source: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            version: env!("CARGO_PKG_VERSION"),
            started: Instant::now(),
            curr_connections: Counter::default(),
            total_connections: Counter::default(),
            pools: BTreeMap::new(),
        }
    }

    pub fn register_pool(
        &mut self,
        pool: &str,
        servers: impl IntoIterator<Item = String>,
    ) -> (Arc<PoolStats>, Vec<Arc<ServerStats>>) {
        let pool_stats = Arc::new(PoolStats::default());
        let mut by_name = BTreeMap::new();
        let mut ordered = Vec::new();
        for server in servers {
            let s = Arc::new(ServerStats::default());
            by_name.insert(server, s.clone());
            ordered.push(s);
        }
        self.pools
            .insert(pool.to_string(), (pool_stats.clone(), by_name));
        (pool_stats, ordered)
    }

    /// One coherent-enough snapshot of every counter.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut root = serde_json::Map::new();
        root.insert("service".into(), json!(self.service));
        root.insert("source".into(), json!(self.source));
        root.insert("version".into(), json!(self.version));
        root.insert("uptime".into(), json!(self.started.elapsed().as_secs()));
        root.insert(
            "timestamp".into(),
            json!(SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)),
        );
        root.insert(
            "curr_connections".into(),
            json!(self.curr_connections.get()),
        );
        root.insert(
            "total_connections".into(),
            json!(self.total_connections.get()),
        );

        for (name, (pool, servers)) in &self.pools {
            let mut p = serde_json::Map::new();
            p.insert("client_connections".into(), json!(pool.client_connections.get()));
            p.insert("client_eof".into(), json!(pool.client_eof.get()));
            p.insert("client_err".into(), json!(pool.client_err.get()));
            p.insert("forward_error".into(), json!(pool.forward_error.get()));
            p.insert("fragments".into(), json!(pool.fragments.get()));
            p.insert("requests".into(), json!(pool.requests.get()));
            p.insert("request_bytes".into(), json!(pool.request_bytes.get()));
            p.insert("responses".into(), json!(pool.responses.get()));
            p.insert("response_bytes".into(), json!(pool.response_bytes.get()));
            p.insert("server_ejects".into(), json!(pool.server_ejects.get()));

            for (server_name, s) in servers {
                p.insert(
                    server_name.clone(),
                    json!({
                        "server_connections": s.server_connections.get(),
                        "server_eof": s.server_eof.get(),
                        "server_err": s.server_err.get(),
                        "server_timedout": s.server_timedout.get(),
                        "requests": s.requests.get(),
                        "request_bytes": s.request_bytes.get(),
                        "responses": s.responses.get(),
                        "response_bytes": s.response_bytes.get(),
                    }),
                );
            }
            root.insert(name.clone(), serde_json::Value::Object(p));
        }

        serde_json::Value::Object(root)
    }
}

/// Serve the stats endpoint: each accepted connection gets one JSON dump.
pub async fn serve(listener: TcpListener, stats: Arc<Stats>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            accept = listener.accept() => {
                let Ok((mut socket, addr)) = accept else {
                    continue;
                };
                tracing::debug!(?addr, "stats dump");
                let body = stats.snapshot().to_string();
                let _ = socket.write_all(body.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
            _ = shutdown.cancelled() => return,
        }
    }
}
