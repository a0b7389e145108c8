//! Node Registry
//!
//! Locally-consistent view of the live node set, partitioned by service
//! type. Fed by the watch projector; read by any number of concurrent
//! readers. One reader/writer lock guards the whole table.

use crate::observability::metrics;
use beacon_core::{Node, NodeEvent, NodeEventKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Concurrent table of live nodes keyed by service type.
///
/// Within a bucket ids are unique; empty buckets are removed.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<String, Vec<Node>>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry with the same `(service_type, id)` in place, else
    /// append.
    pub async fn upsert(&self, node: Node) {
        let mut nodes = self.nodes.write().await;
        let bucket = nodes.entry(node.service_type.clone()).or_default();
        match bucket.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => {
                trace!(node = %node, "Updating node in registry");
                *existing = node;
            }
            None => {
                debug!(node = %node, "Adding node to registry");
                bucket.push(node);
            }
        }
        metrics::set_registry_nodes(total(&nodes));
    }

    /// Remove one node; drops the bucket once it is empty.
    pub async fn remove(&self, service_type: &str, id: u32) -> bool {
        let mut nodes = self.nodes.write().await;
        let Some(bucket) = nodes.get_mut(service_type) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|n| n.id == id) else {
            return false;
        };
        bucket.remove(pos);
        if bucket.is_empty() {
            nodes.remove(service_type);
        }
        debug!(service_type = %service_type, id = id, "Removed node from registry");
        metrics::set_registry_nodes(total(&nodes));
        true
    }

    /// Drop every node of `service_type`. Returns how many were removed.
    pub async fn remove_type(&self, service_type: &str) -> usize {
        let mut nodes = self.nodes.write().await;
        let removed = nodes.remove(service_type).map_or(0, |bucket| bucket.len());
        if removed > 0 {
            debug!(service_type = %service_type, count = removed, "Removed service type from registry");
            metrics::set_registry_nodes(total(&nodes));
        }
        removed
    }

    /// Nodes of `service_type` in insertion order
    pub async fn get(&self, service_type: &str) -> Vec<Node> {
        self.nodes
            .read()
            .await
            .get(service_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of nodes across all types
    pub async fn count(&self) -> usize {
        total(&*self.nodes.read().await)
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Service types with at least one live node, sorted
    pub async fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.nodes.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    pub async fn snapshot(&self) -> HashMap<String, Vec<Node>> {
        self.nodes.read().await.clone()
    }

    /// Pre-populate from a listing, e.g. before opening a watch.
    pub async fn seed(&self, nodes: impl IntoIterator<Item = Node>) {
        for node in nodes {
            self.upsert(node).await;
        }
    }

    /// Fold one watch event into the table.
    pub async fn apply(&self, event: &NodeEvent) {
        match event.kind {
            NodeEventKind::Create | NodeEventKind::Update => {
                if event.node.service_type.is_empty() {
                    debug!(key = %event.key, "Ignoring node without service type");
                    return;
                }
                self.upsert(event.node.clone()).await;
            }
            NodeEventKind::Delete => {
                self.remove(&event.node.service_type, event.node.id).await;
            }
            NodeEventKind::Unknown => {
                trace!(key = %event.key, "Ignoring unknown node event");
            }
        }
    }
}

fn total(nodes: &HashMap<String, Vec<Node>>) -> usize {
    nodes.values().map(Vec::len).sum()
}
