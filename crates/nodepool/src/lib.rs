//! nodepool — per-node connection pooling for cluster database clients.
//!
//! - **connection**: a single transport to one node, with liveness and last-use tracking
//! - **pool**: bounded per-node idle container with hard-limit / soft-cache admission
//! - **node**: the borrow/release/close surface request code talks to
//! - **registry**: the set of nodes the reaper sweeps
//! - **reaper**: periodic idle-connection reclamation (the tend cycle)
//! - **tcp**: the production TCP/TLS dialer
//! - **config**: typed settings resolved from `nodepool.toml`

pub mod config;
pub mod connection;
pub mod error;
pub mod node;
pub mod pool;
pub mod reaper;
pub mod registry;
pub mod tcp;

#[cfg(test)]
mod testing;

pub use config::ClientSettings;
pub use connection::{Connection, ConnectionFactory, Transport};
pub use error::{DialError, PoolError, PoolResult};
pub use node::Node;
pub use pool::{CloseReport, ConnectionPool, PoolMode, PoolPolicy, PoolStats};
pub use reaper::{IdleReaper, ReapReport, ReaperHandle};
pub use registry::NodeSet;
pub use tcp::{TcpConnectionFactory, TcpTransport, TlsConfig};
