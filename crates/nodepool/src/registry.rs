//! The set of nodes a client currently talks to.
//!
//! Membership is fed from outside (static config here); the set only owns the
//! nodes so the reaper and shutdown path can reach every pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::ClientSettings;
use crate::connection::ConnectionFactory;
use crate::node::Node;
use crate::pool::CloseReport;

/// Shared, cloneable handle to the client's nodes, keyed by node name.
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    nodes: Arc<RwLock<HashMap<String, Arc<Node>>>>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one node per configured entry, all sharing the same factory and policy.
    pub fn from_settings(settings: &ClientSettings, factory: Arc<dyn ConnectionFactory>) -> Self {
        let nodes = settings
            .nodes
            .iter()
            .map(|entry| {
                let node = Node::new(
                    &entry.name,
                    &entry.address,
                    settings.policy.clone(),
                    Arc::clone(&factory),
                );
                (entry.name.clone(), Arc::new(node))
            })
            .collect();
        Self {
            nodes: Arc::new(RwLock::new(nodes)),
        }
    }

    /// Add a node. A node already registered under the same name is closed and replaced.
    pub async fn insert(&self, node: Arc<Node>) -> Option<CloseReport> {
        let name = node.name().to_string();
        let old = self.nodes.write().await.insert(name.clone(), node);
        old.map(|old| {
            tracing::info!(node = %name, "replacing node");
            old.close()
        })
    }

    /// Remove and close a node.
    pub async fn remove(&self, name: &str) -> Option<CloseReport> {
        let removed = self.nodes.write().await.remove(name);
        removed.map(|node| node.close())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.read().await.get(name).cloned()
    }

    /// Snapshot of all nodes, ordered by name.
    pub async fn nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Close every node (for graceful shutdown). Nodes stay registered but refuse borrows.
    pub async fn close_all(&self) -> Vec<(String, CloseReport)> {
        let reports: Vec<(String, CloseReport)> = self
            .nodes()
            .await
            .into_iter()
            .map(|node| (node.name().to_string(), node.close()))
            .collect();
        tracing::info!(nodes = reports.len(), "all nodes closed");
        reports
    }
}
