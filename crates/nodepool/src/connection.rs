//! A single pooled connection and the traits that produce one.
//!
//! A [`Connection`] wraps one [`Transport`] to one node. Its liveness flag is
//! shared with the owning pool so that closing a node can revoke connections
//! that are currently borrowed; everything else about a connection is owned
//! exclusively by whoever holds it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{DialError, PoolError, PoolResult};

/// Byte-level transport underneath a [`Connection`].
///
/// The pool never parses what flows over it. Request framing, handshakes and
/// authentication belong to the callers.
pub trait Transport: Send + std::fmt::Debug {
    /// Send bytes over the transport. Returns bytes sent.
    fn send(&mut self, data: &[u8]) -> std::io::Result<usize>;
    /// Receive up to `max_bytes` from the transport.
    fn recv(&mut self, max_bytes: usize) -> std::io::Result<Vec<u8>>;
    /// Release the underlying socket.
    fn close(&mut self) -> std::io::Result<()>;
}

/// Dials new transports to a node. Injected so pool tests can fake latency and failure.
pub trait ConnectionFactory: Send + Sync {
    /// Establish a new transport to `address`, giving up after `timeout`.
    fn dial(&self, address: &str, timeout: Duration) -> Result<Box<dyn Transport>, DialError>;
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One logical connection to one node.
pub struct Connection {
    id: u64,
    node: Arc<str>,
    created_at: Instant,
    last_used: Instant,
    live: Arc<AtomicBool>,
    transport: Option<Box<dyn Transport>>,
}

impl Connection {
    /// Wrap a freshly dialed transport. The connection starts live and "just used".
    pub fn new(node: impl Into<Arc<str>>, transport: Box<dyn Transport>) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            node: node.into(),
            created_at: now,
            last_used: now,
            live: Arc::new(AtomicBool::new(true)),
            transport: Some(transport),
        }
    }

    /// Process-unique identity of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the node this connection talks to.
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// How long the connection has gone unused as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    /// False forever once the connection has been closed, failed, or revoked.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Close the connection and release its transport.
    ///
    /// Idempotent: only the first call that actually releases the transport
    /// can report a failure.
    pub fn close(&mut self) -> std::io::Result<()> {
        self.live.store(false, Ordering::Release);
        match self.transport.take() {
            Some(mut transport) => {
                tracing::debug!(conn_id = self.id, node = %self.node, "closing connection");
                transport.close()
            }
            None => Ok(()),
        }
    }

    /// Send bytes to the node. A transport error kills the connection.
    pub fn send(&mut self, data: &[u8]) -> PoolResult<usize> {
        let id = self.id;
        let result = self.transport_mut()?.send(data);
        result.map_err(|source| self.fail(id, source))
    }

    /// Receive up to `max_bytes` from the node. A transport error kills the connection.
    pub fn recv(&mut self, max_bytes: usize) -> PoolResult<Vec<u8>> {
        let id = self.id;
        let result = self.transport_mut()?.recv(max_bytes);
        result.map_err(|source| self.fail(id, source))
    }

    pub(crate) fn mark_used(&mut self, now: Instant) {
        self.last_used = now;
    }

    /// The liveness flag, shared with the pool while the connection is borrowed.
    pub(crate) fn liveness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.live)
    }

    fn transport_mut(&mut self) -> PoolResult<&mut Box<dyn Transport>> {
        if !self.is_live() {
            // Revoked while borrowed: the socket is still open until now.
            let _ = self.close();
            return Err(PoolError::ConnectionDead { id: self.id });
        }
        self.transport
            .as_mut()
            .ok_or(PoolError::ConnectionDead { id: self.id })
    }

    fn fail(&mut self, id: u64, source: std::io::Error) -> PoolError {
        tracing::debug!(conn_id = id, node = %self.node, error = %source, "transport error, closing connection");
        let _ = self.close();
        PoolError::Io { id, source }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("live", &self.is_live())
            .field("last_used", &self.last_used)
            .finish_non_exhaustive()
    }
}
