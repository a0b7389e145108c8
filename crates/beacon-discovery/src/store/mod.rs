//! Coordination Store
//!
//! The raw key-value/lease/watch surface the discovery client needs from the
//! external store. Keys passed here are absolute; namespacing happens in
//! [`StoreClient`](crate::client::StoreClient).
//!
//! Backends:
//! - [`EtcdStore`]: etcd v3 over gRPC
//! - [`MemoryStore`]: in-process store with real lease semantics, used for
//!   tests and local runs

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use crate::error::StoreResult;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Store lease identifier
pub type LeaseId = i64;

/// Renewal acknowledgements for one lease. End of stream means the lease
/// expired, was revoked, or renewal broke.
pub type KeepAliveStream = mpsc::Receiver<KeepAliveAck>;

/// Batches of raw mutations under a watched prefix. The stream ends on
/// close and yields one terminal error on an unrecoverable watch failure.
///
/// [`cancel`](Self::cancel) closes the store-side watch before the stream is
/// released; plain dropping only stops local delivery.
pub struct RawWatchStream {
    events: BoxStream<'static, StoreResult<Vec<RawEvent>>>,
    cancel: Option<BoxFuture<'static, ()>>,
}

impl RawWatchStream {
    pub fn new(events: BoxStream<'static, StoreResult<Vec<RawEvent>>>) -> Self {
        Self {
            events,
            cancel: None,
        }
    }

    /// Attach the request that cancels the watch on the store. It runs only
    /// when [`cancel`](Self::cancel) is awaited.
    pub fn with_cancel(mut self, cancel: BoxFuture<'static, ()>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Cancel the store-side watch, then release the stream.
    pub async fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.await;
        }
    }
}

impl Stream for RawWatchStream {
    type Item = StoreResult<Vec<RawEvent>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

/// One successful lease renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub lease_id: LeaseId,
    /// Remaining TTL reported by the store (seconds)
    pub ttl: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Put,
    Delete,
}

/// A mutation observed on a watched prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub key: String,
    /// Empty for deletes
    pub value: Vec<u8>,
    /// The put created the key rather than overwriting it
    pub is_create: bool,
}

impl RawEvent {
    pub fn put(key: impl Into<String>, value: Vec<u8>, is_create: bool) -> Self {
        Self {
            kind: RawEventKind::Put,
            key: key.into(),
            value,
            is_create,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: RawEventKind::Delete,
            key: key.into(),
            value: Vec::new(),
            is_create: false,
        }
    }
}

/// A stored key/value pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Operations the discovery client consumes from the coordination store.
///
/// Implementations perform no retries; every failure is returned as is.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Number of keys equal to `key` (0 or 1)
    async fn count(&self, key: &str) -> StoreResult<i64>;

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    /// Without a lease the key is permanent
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()>;

    /// Returns the number of keys deleted
    async fn delete(&self, key: &str) -> StoreResult<i64>;

    async fn lease_grant(&self, ttl: i64) -> StoreResult<LeaseId>;

    /// Start renewing `lease` in the background until the returned stream is
    /// dropped or the lease is gone.
    async fn lease_keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream>;

    async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()>;

    /// Remaining TTL in seconds, `-1` if the lease no longer exists
    async fn lease_time_to_live(&self, lease: LeaseId) -> StoreResult<i64>;

    /// Subscribe to mutations of every key under `prefix`, requiring a
    /// leader-backed stream.
    async fn watch(&self, prefix: &str) -> StoreResult<RawWatchStream>;
}
