//! A cluster node as seen by request-execution code.
//!
//! # Connection flow
//!
//! ```text
//! request code calls node.borrow_connection(timeout)
//!   → Node delegates to ConnectionPool::borrow()
//! request code sends/receives one request on the connection
//! request code calls node.release_connection(conn)
//!   → Node delegates to ConnectionPool::release()
//!     → live conn → queued for reuse
//!     → dead conn → closed
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::connection::{Connection, ConnectionFactory};
use crate::error::PoolResult;
use crate::pool::{CloseReport, ConnectionPool, PoolPolicy, PoolStats};

/// One server in the cluster, owning exactly one connection pool.
#[derive(Debug)]
pub struct Node {
    name: Arc<str>,
    address: String,
    pool: ConnectionPool,
}

impl Node {
    pub fn new(
        name: &str,
        address: &str,
        policy: PoolPolicy,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let name: Arc<str> = Arc::from(name);
        Self {
            pool: ConnectionPool::new(Arc::clone(&name), address, policy, factory),
            name,
            address: address.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Borrow a connection to this node. See [`ConnectionPool::borrow`].
    pub async fn borrow_connection(&self, creation_timeout: Duration) -> PoolResult<Connection> {
        self.pool.borrow(creation_timeout).await
    }

    /// Hand a connection back after use. See [`ConnectionPool::release`].
    pub fn release_connection(&self, conn: Connection) {
        self.pool.release(conn);
    }

    /// Drain the pool, closing idle connections and revoking borrowed ones.
    pub fn close(&self) -> CloseReport {
        tracing::info!(node = %self.name, address = %self.address, "closing node");
        let report = self.pool.close();
        for failure in &report.failures {
            tracing::warn!(
                node = %self.name,
                conn_id = failure.conn_id,
                error = %failure.error,
                "failed to close connection"
            );
        }
        report
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;
    use crate::testing::MockFactory;

    fn make_node(policy: PoolPolicy) -> (Node, Arc<MockFactory>) {
        let factory = MockFactory::new();
        let node = Node::new("node-a", "10.0.0.1:3000", policy, factory.clone());
        (node, factory)
    }

    #[test]
    fn node_exposes_identity() {
        let (node, _) = make_node(PoolPolicy::default());
        assert_eq!(node.name(), "node-a");
        assert_eq!(node.address(), "10.0.0.1:3000");
        assert_eq!(node.pool().node(), "node-a");
        assert_eq!(node.pool().address(), "10.0.0.1:3000");
        assert!(!node.is_closed());
    }

    #[tokio::test]
    async fn borrow_release_cycle_reuses_one_connection() {
        let (node, factory) = make_node(PoolPolicy::default());

        for _ in 0..100 {
            let conn = node.borrow_connection(Duration::from_secs(1)).await.unwrap();
            node.release_connection(conn);
        }

        assert_eq!(factory.dials(), 1);
        let stats = node.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.reused, 99);
    }

    #[tokio::test]
    async fn close_drains_pool() {
        let (node, factory) = make_node(PoolPolicy::default());
        let a = node.borrow_connection(Duration::from_secs(1)).await.unwrap();
        let b = node.borrow_connection(Duration::from_secs(1)).await.unwrap();
        node.release_connection(a);

        let report = node.close();
        assert_eq!(report.closed_idle, 1);
        assert_eq!(report.revoked, 1);
        assert!(node.is_closed());
        assert!(!b.is_live());

        node.release_connection(b);
        assert_eq!(factory.open_count(), 0);

        let err = node.borrow_connection(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, PoolError::Closed { node } if node == "node-a"));
    }
}
