//! Error types for the discovery client

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Result alias for raw store backends
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures reported by a coordination store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("lease {0} not found")]
    LeaseNotFound(i64),
    #[error("watch canceled by store: {0}")]
    WatchCanceled(String),
    #[error("watch fell behind by {0} events")]
    WatchLagged(u64),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Unusable configuration; never retried
    #[error("configuration error: {0}")]
    Config(String),

    /// Registration is exclusive; another holder owns the key
    #[error("key already registered: {key}")]
    AlreadyRegistered { key: String },

    #[error("nothing deleted: {key} does not exist")]
    NothingDeleted { key: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("failed to decode value at {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode value: {0}")]
    Encode(#[source] serde_json::Error),
}

impl DiscoveryError {
    /// Conflicts are surfaced to the caller but are transient for the
    /// supervisor: the conflicting lease eventually expires.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DiscoveryError::AlreadyRegistered { .. } | DiscoveryError::NothingDeleted { .. }
        )
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, DiscoveryError::Config(_) | DiscoveryError::Encode(_))
    }
}
