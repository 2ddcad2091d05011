use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use nodepool::{
    ClientSettings, Connection, ConnectionFactory, IdleReaper, Node, NodeSet, PoolError,
    TcpConnectionFactory, TlsConfig,
};
use tracing::{info, warn};

/// Outcome counts across all probe tasks of one node.
#[derive(Debug, Default)]
struct Tally {
    ok: AtomicU64,
    failed: AtomicU64,
}

pub async fn probe(
    path: &Path,
    rounds: usize,
    concurrency: usize,
    payload: Option<String>,
) -> anyhow::Result<()> {
    let settings = ClientSettings::load(path)?;
    if settings.nodes.is_empty() {
        anyhow::bail!("{} lists no nodes", path.display());
    }

    let factory: Arc<dyn ConnectionFactory> = if settings.tls {
        Arc::new(TcpConnectionFactory::with_tls(
            settings.recv_timeout,
            TlsConfig::with_system_roots()?,
        ))
    } else {
        Arc::new(TcpConnectionFactory::plain(settings.recv_timeout))
    };
    let nodes = NodeSet::from_settings(&settings, factory);
    let reaper = IdleReaper::new(nodes.clone()).spawn(settings.tend_interval);

    info!(
        nodes = nodes.len().await,
        rounds = rounds,
        concurrency = concurrency,
        "starting probe"
    );

    let payload: Arc<[u8]> = Arc::from(payload.unwrap_or_default().into_bytes());
    let mut tasks = Vec::new();
    let mut tallies = Vec::new();
    for node in nodes.nodes().await {
        let tally = Arc::new(Tally::default());
        tallies.push((node.name().to_string(), Arc::clone(&tally)));
        for _ in 0..concurrency.max(1) {
            let node = Arc::clone(&node);
            let tally = Arc::clone(&tally);
            let payload = Arc::clone(&payload);
            let timeout = settings.policy.dial_timeout;
            tasks.push(tokio::spawn(async move {
                run_cycles(&node, rounds, timeout, &payload, &tally).await;
            }));
        }
    }
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "probe task ended abnormally");
        }
    }

    let mut stats = Vec::new();
    for node in nodes.nodes().await {
        node.pool().log_stats();
        stats.push(node.stats());
    }
    for (name, tally) in &tallies {
        info!(
            node = %name,
            ok = tally.ok.load(Ordering::Relaxed),
            failed = tally.failed.load(Ordering::Relaxed),
            "probe finished"
        );
    }
    println!("{}", serde_json::to_string_pretty(&stats)?);

    nodes.close_all().await;
    reaper.shutdown().await;
    Ok(())
}

async fn run_cycles(
    node: &Arc<Node>,
    rounds: usize,
    timeout: std::time::Duration,
    payload: &Arc<[u8]>,
    tally: &Tally,
) {
    for _ in 0..rounds {
        let conn = match node.borrow_connection(timeout).await {
            Ok(conn) => conn,
            Err(e) if e.is_retryable() => {
                warn!(node = %node.name(), error = %e, "borrow failed");
                tally.failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Err(e) => {
                warn!(node = %node.name(), error = %e, "borrow failed, stopping");
                tally.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let mut lease = Lease::new(Arc::clone(node), conn);

        if !payload.is_empty() {
            let payload = Arc::clone(payload);
            // Socket reads and writes block; keep them off the async workers.
            // The lease travels with the request so a panic still releases it.
            let exchanged = tokio::task::spawn_blocking(move || {
                let result = lease
                    .conn
                    .as_mut()
                    .map_or(Ok(()), |conn| exchange(conn, &payload));
                (lease, result)
            })
            .await;
            lease = match exchanged {
                Ok((lease, Ok(()))) => lease,
                Ok((lease, Err(e))) => {
                    warn!(node = %node.name(), conn_id = lease.id(), error = %e, "request failed");
                    tally.failed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(e) => {
                    warn!(node = %node.name(), error = %e, "request task aborted");
                    tally.failed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
        }

        drop(lease);
        tally.ok.fetch_add(1, Ordering::Relaxed);
    }
}

/// A borrowed connection that goes back to its node when dropped.
struct Lease {
    node: Arc<Node>,
    conn: Option<Connection>,
}

impl Lease {
    fn new(node: Arc<Node>, conn: Connection) -> Self {
        Self {
            node,
            conn: Some(conn),
        }
    }

    fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, Connection::id)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.node.release_connection(conn);
        }
    }
}

/// Send the payload and read the same number of bytes back.
fn exchange(conn: &mut Connection, payload: &[u8]) -> Result<(), PoolError> {
    conn.send(payload)?;
    let mut received = 0;
    while received < payload.len() {
        let chunk = conn.recv(payload.len() - received)?;
        if chunk.is_empty() {
            // Peer hung up; make sure the pool discards it.
            let _ = conn.close();
            return Err(PoolError::ConnectionDead { id: conn.id() });
        }
        received += chunk.len();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn start_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
        let addr = listener.local_addr().expect("local addr");
        std::thread::spawn(move || {
            while let Ok((mut stream, _)) = listener.accept() {
                std::thread::spawn(move || {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf) {
                        if n == 0 || stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn probe_runs_against_echo_server() {
        let addr = start_echo_server();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodepool.toml");
        std::fs::write(
            &path,
            format!(
                "[pool]\ncapacity = 2\nexhaustion_grace = \"500ms\"\n\n[[nodes]]\nname = \"echo\"\naddress = \"{addr}\"\n"
            ),
        )
        .unwrap();

        probe(&path, 5, 3, Some("ping".to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn probe_without_nodes_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodepool.toml");
        std::fs::write(&path, "").unwrap();

        let err = probe(&path, 1, 1, None).await.unwrap_err();
        assert!(err.to_string().contains("lists no nodes"));
    }

    #[tokio::test]
    async fn failed_round_trip_kills_connection() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            // Accept and close immediately.
            std::thread::spawn(move || {
                while let Ok((stream, _)) = listener.accept() {
                    drop(stream);
                }
            });
            addr
        };
        let node = tcp_node("dead", &addr.to_string());
        let tally = Tally::default();
        let payload: Arc<[u8]> = Arc::from(b"ping".to_vec());

        run_cycles(&node, 1, std::time::Duration::from_secs(1), &payload, &tally).await;

        assert_eq!(tally.failed.load(Ordering::Relaxed), 1);
        assert_eq!(node.stats().idle, 0, "dead connection was not pooled");
        assert_eq!(node.stats().outstanding, 0);
    }

    fn tcp_node(name: &str, address: &str) -> Arc<Node> {
        Arc::new(Node::new(
            name,
            address,
            nodepool::PoolPolicy::default(),
            Arc::new(TcpConnectionFactory::plain(std::time::Duration::from_secs(1))),
        ))
    }

    #[tokio::test]
    async fn lease_released_when_request_task_panics() {
        let addr = start_echo_server();
        let node = tcp_node("echo", &addr.to_string());
        let conn = node.borrow_connection(std::time::Duration::from_secs(1)).await.unwrap();
        let lease = Lease::new(Arc::clone(&node), conn);

        let joined = tokio::task::spawn_blocking::<_, ()>(move || {
            let _lease = lease;
            panic!("request handler crashed");
        })
        .await;

        assert!(joined.is_err());
        let stats = node.stats();
        assert_eq!(stats.outstanding, 0, "slot given back");
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn retryable_borrow_failures_keep_going() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let node = tcp_node("refused", &addr.to_string());
        let tally = Tally::default();
        let payload: Arc<[u8]> = Arc::from(Vec::new());

        run_cycles(&node, 3, std::time::Duration::from_secs(1), &payload, &tally).await;

        assert_eq!(tally.failed.load(Ordering::Relaxed), 3);
        assert_eq!(node.stats().dial_failures, 3);
    }

    #[tokio::test]
    async fn closed_node_stops_after_first_failure() {
        let addr = start_echo_server();
        let node = tcp_node("echo", &addr.to_string());
        node.close();
        let tally = Tally::default();
        let payload: Arc<[u8]> = Arc::from(Vec::new());

        run_cycles(&node, 5, std::time::Duration::from_secs(1), &payload, &tally).await;

        assert_eq!(tally.failed.load(Ordering::Relaxed), 1);
        assert_eq!(tally.ok.load(Ordering::Relaxed), 0);
    }
}
