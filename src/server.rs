//! Proxy Assembly
//!
//! [`Proxy::start`] wires the whole pipeline together in dependency order:
//! stats collector first, then the workers (whose backend connections are
//! established before any client is accepted, so a dead backend fails
//! startup instead of failing jobs), and the listener last. Shutdown runs
//! the same order backwards through the [`Coordinator`].

use crate::config::ProxyConfig;
use crate::lifecycle::Coordinator;
use crate::queue::JobQueue;
use crate::shard::ShardTable;
use crate::stats::{self, Summary};
use crate::worker::Worker;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// A running proxy instance.
#[derive(Debug)]
pub struct Proxy {
    local_addr: SocketAddr,
    queue: Arc<JobQueue>,
    coordinator: Coordinator,
}

impl Proxy {
    /// Validates the configuration, connects every worker to every
    /// backend, binds the listening socket and starts accepting clients.
    pub async fn start(config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let table = ShardTable::new(config.max_keys, config.backend_count());
        let queue = Arc::new(JobQueue::new());

        let (sink, collector) = stats::channel();
        let collector = tokio::spawn(collector.run());

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let worker = Worker::connect(
                id,
                Arc::clone(&config),
                Arc::clone(&table),
                Arc::clone(&queue),
                sink.clone(),
            )
            .await
            .with_context(|| format!("worker {id} failed to connect to its backends"))?;
            workers.push(tokio::spawn(worker.run()));
        }
        // the workers hold the only sinks now; the collector ends when the
        // last worker does
        drop(sink);

        let socket = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let local_addr = socket.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener =
            crate::listener::Listener::new(Arc::clone(&config), Arc::clone(&queue), shutdown_rx);
        let listener = tokio::spawn(listener.run(socket));

        info!(
            addr = %local_addr,
            backends = config.backend_count(),
            workers = config.workers,
            sharded = config.sharded_get,
            "proxy listening"
        );

        Ok(Self {
            local_addr,
            queue,
            coordinator: Coordinator::new(shutdown_tx, listener, workers, collector),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current queue depth, for observation from the outside.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Gracefully stops the proxy: intake first, then the drained workers,
    /// finally the stats collector. Returns the lifetime summary.
    pub async fn shutdown(mut self) -> Summary {
        self.coordinator.prepare_stop(&self.queue).await;
        self.coordinator.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::sync::Mutex;

    /// Minimal in-memory memcached: enough of the text protocol for the
    /// proxy to talk to (get, set, everything else answers ERROR).
    async fn mock_memcached() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut reader = BufReader::new(socket);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        match reader.read_line(&mut line).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                        let fields: Vec<&str> = line.split_whitespace().collect();
                        match fields.first().copied() {
                            Some("set") if fields.len() >= 5 => {
                                let key = fields[1].to_string();
                                let bytes: usize = fields[4].parse().unwrap();
                                let mut data = vec![0u8; bytes + 2];
                                if reader.read_exact(&mut data).await.is_err() {
                                    return;
                                }
                                data.truncate(bytes);
                                store.lock().await.insert(key, data);
                                if reader
                                    .get_mut()
                                    .write_all(b"STORED\r\n")
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Some("get") => {
                                let mut reply = Vec::new();
                                let store = store.lock().await;
                                for key in &fields[1..] {
                                    if let Some(data) = store.get(*key) {
                                        reply.extend_from_slice(
                                            format!("VALUE {} 0 {}\r\n", key, data.len())
                                                .as_bytes(),
                                        );
                                        reply.extend_from_slice(data);
                                        reply.extend_from_slice(b"\r\n");
                                    }
                                }
                                reply.extend_from_slice(b"END\r\n");
                                drop(store);
                                if reader.get_mut().write_all(&reply).await.is_err() {
                                    return;
                                }
                            }
                            _ => {
                                if reader.get_mut().write_all(b"ERROR\r\n").await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn start_proxy(backends: usize, workers: usize, sharded: bool) -> Proxy {
        let mut addrs = Vec::new();
        for _ in 0..backends {
            addrs.push(mock_memcached().await.to_string());
        }
        let config = ProxyConfig {
            listen: "127.0.0.1:0".into(),
            backends: addrs,
            workers,
            sharded_get: sharded,
            ..ProxyConfig::default()
        };
        Proxy::start(config).await.unwrap()
    }

    async fn read_exactly(client: &mut TcpStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&buf),
            String::from_utf8_lossy(expected)
        );
    }

    /// Reads until the reply's terminal `END` line has arrived.
    async fn read_until_end(client: &mut TcpStream) -> Vec<u8> {
        let mut reply = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before END");
            reply.extend_from_slice(&chunk[..n]);
            if reply.ends_with(b"END\r\n") {
                return reply;
            }
        }
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let proxy = start_proxy(1, 2, false).await;
        let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();

        client.write_all(b"set k 0 0 3\r\ncab\r\n").await.unwrap();
        read_exactly(&mut client, b"STORED\r\n").await;

        client.write_all(b"get k\r\n").await.unwrap();
        read_exactly(&mut client, b"VALUE k 0 3\r\ncab\r\nEND\r\n").await;

        // both replies arrived, so nothing can still be queued
        assert_eq!(proxy.queue_len(), 0);

        drop(client);
        let summary = proxy.shutdown().await;
        assert_eq!(summary.jobs, 2);
        assert_eq!(summary.sets, 1);
        assert_eq!(summary.direct_gets, 1);
        assert_eq!(summary.errors, 0);
    }

    #[tokio::test]
    async fn test_get_miss_returns_bare_end() {
        let proxy = start_proxy(1, 1, false).await;
        let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();

        client.write_all(b"get nope\r\n").await.unwrap();
        read_exactly(&mut client, b"END\r\n").await;

        drop(client);
        let summary = proxy.shutdown().await;
        assert_eq!(summary.get_misses, 1);
    }

    #[tokio::test]
    async fn test_sharded_multiget_returns_every_value_and_one_end() {
        let proxy = start_proxy(3, 4, true).await;
        let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();

        // sets replicate, so every backend can answer for every key
        for key in ["a", "b", "c", "d", "e"] {
            let request = format!("set {key} 0 0 1\r\nv\r\n");
            client.write_all(request.as_bytes()).await.unwrap();
            read_exactly(&mut client, b"STORED\r\n").await;
        }

        client.write_all(b"get a b c d e\r\n").await.unwrap();
        let reply = read_until_end(&mut client).await;
        let text = String::from_utf8(reply).unwrap();
        assert_eq!(text.matches("VALUE ").count(), 5);
        assert_eq!(text.matches("END\r\n").count(), 1);
        for key in ["a", "b", "c", "d", "e"] {
            assert!(text.contains(&format!("VALUE {key} 0 1")));
        }

        drop(client);
        let summary = proxy.shutdown().await;
        assert_eq!(summary.sharded_gets, 1);
        assert_eq!(summary.get_hits, 5);
        assert_eq!(summary.get_misses, 0);
    }

    #[tokio::test]
    async fn test_unknown_request_is_dropped_silently() {
        let proxy = start_proxy(1, 1, false).await;
        let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();

        // the unknown request gets no reply at all; the pipelined set after
        // it is served normally
        client
            .write_all(b"version\r\nset k 0 0 1\r\nx\r\n")
            .await
            .unwrap();
        read_exactly(&mut client, b"STORED\r\n").await;

        drop(client);
        let summary = proxy.shutdown().await;
        assert_eq!(summary.unknown, 1);
        assert_eq!(summary.sets, 1);
        assert_eq!(summary.errors, 1);
    }

    #[tokio::test]
    async fn test_startup_fails_when_a_backend_is_down() {
        // a bound-then-dropped socket gives an address nothing listens on
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = dead.local_addr().unwrap();
        drop(dead);

        let config = ProxyConfig {
            listen: "127.0.0.1:0".into(),
            backends: vec![addr.to_string()],
            workers: 1,
            ..ProxyConfig::default()
        };
        assert!(Proxy::start(config).await.is_err());
    }
}
