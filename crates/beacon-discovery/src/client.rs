//! Store Client
//!
//! Typed, namespace-aware wrapper over a [`CoordinationStore`]. Every call is
//! bounded by its own timeout so one wedged RPC cannot stall a caller's loop
//! beyond `request_timeout`. No retries happen here.

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result, StoreResult};
use crate::store::{CoordinationStore, KeepAliveStream, LeaseId, RawWatchStream};
use beacon_core::{KeyCodec, Node};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Namespace-aware client over a coordination store
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn CoordinationStore>,
    codec: KeyCodec,
    request_timeout: Duration,
}

impl StoreClient {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &DiscoveryConfig) -> Self {
        Self {
            store,
            codec: KeyCodec::new(config.namespace.clone()),
            request_timeout: config.request_timeout,
        }
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    async fn timed<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DiscoveryError::Timeout {
                op,
                after: self.request_timeout,
            }),
        }
    }

    fn require_lease(lease_id: LeaseId) -> Result<()> {
        if lease_id == 0 {
            return Err(DiscoveryError::Config("empty lease id".into()));
        }
        Ok(())
    }

    /// Count-only existence probe
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let key = self.codec.format(name);
        let count = self.timed("exists", self.store.count(&key)).await?;
        Ok(count > 0)
    }

    pub async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let key = self.codec.format(name);
        self.timed("get", self.store.get(&key)).await
    }

    /// Fetch and decode the node stored under `name`
    pub async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let key = self.codec.format(name);
        let Some(bytes) = self.timed("get", self.store.get(&key)).await? else {
            return Ok(None);
        };
        Node::decode(&bytes)
            .map(Some)
            .map_err(|source| DiscoveryError::Decode { key, source })
    }

    /// Decode every node under the `prefix` directory. Undecodable values are
    /// skipped with a warning.
    pub async fn list(&self, prefix: &str) -> Result<Vec<Node>> {
        let dir = self.codec.format_dir(prefix);
        let kvs = self.timed("list", self.store.get_prefix(&dir)).await?;

        let mut nodes = Vec::with_capacity(kvs.len());
        for kv in kvs {
            match Node::decode(&kv.value) {
                Ok(node) => nodes.push(node),
                Err(e) => warn!(key = %kv.key, error = %e, "Skipping undecodable node"),
            }
        }
        debug!(prefix = %dir, node_count = nodes.len(), "Listed nodes");
        Ok(nodes)
    }

    /// Store raw bytes. Without a lease the key is permanent.
    pub async fn put(&self, name: &str, value: Vec<u8>, lease_id: Option<LeaseId>) -> Result<()> {
        let key = self.codec.format(name);
        self.timed("put", self.store.put(&key, value, lease_id)).await?;
        trace!(key = %key, lease_id = ?lease_id, "Put");
        Ok(())
    }

    pub async fn put_node(&self, name: &str, node: &Node, lease_id: Option<LeaseId>) -> Result<()> {
        let value = node.encode().map_err(DiscoveryError::Encode)?;
        self.put(name, value, lease_id).await
    }

    /// Delete `name`; fails with [`DiscoveryError::NothingDeleted`] when it
    /// did not exist.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let key = self.codec.format(name);
        let deleted = self.timed("delete", self.store.delete(&key)).await?;
        if deleted == 0 {
            return Err(DiscoveryError::NothingDeleted { key });
        }
        Ok(())
    }

    pub async fn grant_lease(&self, ttl_seconds: i64) -> Result<LeaseId> {
        let lease_id = self
            .timed("grant_lease", self.store.lease_grant(ttl_seconds))
            .await?;
        if lease_id <= 0 {
            return Err(DiscoveryError::Config(format!(
                "store granted unusable lease id {lease_id}"
            )));
        }
        debug!(lease_id = lease_id, ttl = ttl_seconds, "Lease granted");
        Ok(lease_id)
    }

    /// Open the renewal stream for `lease_id`; renewal runs until the
    /// stream is dropped or the lease is gone.
    pub async fn renew_lease(&self, lease_id: LeaseId) -> Result<KeepAliveStream> {
        Self::require_lease(lease_id)?;
        self.timed("renew_lease", self.store.lease_keep_alive(lease_id))
            .await
    }

    pub async fn revoke_lease(&self, lease_id: LeaseId) -> Result<()> {
        Self::require_lease(lease_id)?;
        self.timed("revoke_lease", self.store.lease_revoke(lease_id))
            .await?;
        debug!(lease_id = lease_id, "Lease revoked");
        Ok(())
    }

    /// Remaining TTL in seconds, `-1` once the lease is gone
    pub async fn lease_ttl(&self, lease_id: LeaseId) -> Result<i64> {
        Self::require_lease(lease_id)?;
        self.timed("lease_ttl", self.store.lease_time_to_live(lease_id))
            .await
    }

    /// Open a raw watch on the `prefix` directory. Returns the absolute root
    /// that was watched alongside the stream.
    pub async fn watch(&self, prefix: &str) -> Result<(String, RawWatchStream)> {
        let root = self.codec.format_dir(prefix);
        let stream = self.timed("watch", self.store.watch(&root)).await?;
        Ok((root, stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn client() -> (MemoryStore, StoreClient) {
        let store = MemoryStore::new();
        let config = DiscoveryConfig {
            namespace: "/ns".into(),
            ..Default::default()
        };
        let client = StoreClient::new(Arc::new(store.clone()), &config);
        (store, client)
    }

    #[tokio::test]
    async fn test_put_node_under_namespace() {
        let (store, client) = client();
        let node = Node::new("gate", 5).with_uri("tcp://a:1");
        client.put_node("gate/5", &node, None).await.unwrap();

        assert!(store.get("/ns/gate/5").await.unwrap().is_some());
        assert!(client.exists("gate/5").await.unwrap());
        assert!(client.exists("/gate/5").await.unwrap());
        assert_eq!(client.get_node("gate/5").await.unwrap(), Some(node));
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_conflict() {
        let (_, client) = client();
        let err = client.delete("gate/1").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NothingDeleted { ref key } if key == "/ns/gate/1"));
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_values() {
        let (store, client) = client();
        client
            .put_node("gate/1", &Node::new("gate", 1), None)
            .await
            .unwrap();
        store
            .put("/ns/gate/2", b"{not json".to_vec(), None)
            .await
            .unwrap();
        client
            .put_node("gateway/1", &Node::new("gateway", 1), None)
            .await
            .unwrap();

        let nodes = client.list("gate").await.unwrap();
        assert_eq!(nodes, vec![Node::new("gate", 1)]);
        assert_eq!(client.list("/").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_lease_calls_require_lease_id() {
        let (_, client) = client();
        assert!(matches!(
            client.revoke_lease(0).await,
            Err(DiscoveryError::Config(_))
        ));
        assert!(matches!(
            client.renew_lease(0).await,
            Err(DiscoveryError::Config(_))
        ));
        assert!(matches!(client.lease_ttl(0).await, Err(DiscoveryError::Config(_))));
    }

    #[tokio::test]
    async fn test_lease_lifecycle() {
        let (_, client) = client();
        let lease = client.grant_lease(10).await.unwrap();
        assert!(lease > 0);
        client
            .put_node("db/3", &Node::new("db", 3), Some(lease))
            .await
            .unwrap();
        assert!(client.lease_ttl(lease).await.unwrap() > 0);

        client.revoke_lease(lease).await.unwrap();
        assert!(!client.exists("db/3").await.unwrap());
        assert_eq!(client.lease_ttl(lease).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_get_node_decode_error() {
        let (store, client) = client();
        store.put("/ns/db/1", b"garbage".to_vec(), None).await.unwrap();
        assert!(matches!(
            client.get_node("db/1").await,
            Err(DiscoveryError::Decode { .. })
        ));
    }
}
