//! Pool over real sockets.
//!
//! The stack: `ConnectionPool` → `TcpConnectionFactory` → TCP → echo server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::start_echo_server;
use nodepool::{ConnectionPool, PoolError, PoolPolicy, TcpConnectionFactory};

const T: Duration = Duration::from_secs(2);

fn pool_for(address: &str) -> ConnectionPool {
    common::init_tracing();
    ConnectionPool::new(
        "echo",
        address,
        PoolPolicy {
            capacity: 2,
            ..PoolPolicy::default()
        },
        Arc::new(TcpConnectionFactory::plain(Duration::from_secs(2))),
    )
}

#[tokio::test]
async fn request_roundtrip_reuses_socket() {
    let addr = start_echo_server();
    let pool = pool_for(&addr.to_string());

    let mut conn = pool.borrow(T).await.unwrap();
    let id = conn.id();
    conn.send(b"ping").unwrap();
    assert_eq!(conn.recv(64).unwrap(), b"ping");
    pool.release(conn);

    let mut conn = pool.borrow(T).await.unwrap();
    assert_eq!(conn.id(), id);
    conn.send(b"again").unwrap();
    assert_eq!(conn.recv(64).unwrap(), b"again");
    pool.release(conn);

    let stats = pool.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.reused, 1);
}

#[tokio::test]
async fn unreachable_node_reports_dial_failure() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let pool = pool_for(&addr.to_string());

    let err = pool.borrow(T).await.unwrap_err();
    assert!(matches!(err, PoolError::DialFailed { .. }), "got {err:?}");

    let stats = pool.stats();
    assert_eq!(stats.dial_failures, 1);
    assert_eq!(stats.dialing, 0, "failed dial gives its slot back");
}

#[tokio::test]
async fn close_shuts_idle_sockets() {
    let addr = start_echo_server();
    let pool = pool_for(&addr.to_string());

    let conn = pool.borrow(T).await.unwrap();
    pool.release(conn);

    let report = pool.close();
    assert_eq!(report.closed_idle, 1);
    assert!(report.failures.is_empty());
    assert!(pool.is_closed());
}
