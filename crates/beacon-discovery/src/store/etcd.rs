//! Etcd Store
//!
//! etcd v3 backend: connection with exponential backoff, typed wrappers over
//! the KV, lease and watch APIs, and the background keep-alive pump that turns
//! etcd's request/response keep-alive protocol into a [`KeepAliveStream`].

use super::{
    CoordinationStore, KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, RawEvent,
    RawWatchStream,
};
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result, StoreError, StoreResult};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    WatchOptions, WatchStream,
};
use futures::{FutureExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, trace, warn};

/// Lower bound between two keep-alive requests
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(500);

/// etcd-backed [`CoordinationStore`]
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    request_timeout: Duration,
}

impl EtcdStore {
    /// Connect to etcd with exponential backoff.
    ///
    /// The connection requires a leader, so watches never project from a
    /// partitioned member.
    pub async fn connect(config: &DiscoveryConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(DiscoveryError::Config("endpoint list is empty".into()));
        }

        let backoff = ExponentialBackoff {
            initial_interval: config.backoff_initial,
            max_interval: config.backoff_max,
            max_elapsed_time: Some(config.backoff_max_elapsed),
            multiplier: config.backoff_multiplier,
            ..Default::default()
        };

        let endpoints = config.endpoints.clone();
        let connect_timeout = config.connect_timeout;

        let client = retry(backoff, || async {
            let options = ConnectOptions::new()
                .with_connect_timeout(connect_timeout)
                .with_require_leader(true);
            match Client::connect(&endpoints, Some(options)).await {
                Ok(client) => {
                    debug!(endpoints = ?endpoints, "Connected to etcd");
                    Ok(client)
                }
                Err(e) => {
                    warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
        .map_err(StoreError::from)?;

        Ok(Self {
            client,
            request_timeout: config.request_timeout,
        })
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn count(&self, key: &str) -> StoreResult<i64> {
        let mut client = self.client.clone();
        let resp = client
            .get(key, Some(GetOptions::new().with_count_only()))
            .await?;
        Ok(resp.count())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match kv.key_str() {
                Ok(key) => out.push(KeyValue {
                    key: key.to_string(),
                    value: kv.value().to_vec(),
                }),
                Err(e) => warn!(error = %e, "Skipping non UTF-8 key"),
            }
        }
        Ok(out)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<i64> {
        let mut client = self.client.clone();
        let resp = client.delete(key, None).await?;
        Ok(resp.deleted())
    }

    async fn lease_grant(&self, ttl: i64) -> StoreResult<LeaseId> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl, None).await?;
        Ok(resp.id())
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
        let mut client = self.client.clone();
        let (keeper, stream) = client.lease_keep_alive(lease).await?;
        let (tx, rx) = mpsc::channel(1);
        spawn_keepalive_pump(keeper, stream, lease, self.request_timeout, tx);
        Ok(rx)
    }

    async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }

    async fn lease_time_to_live(&self, lease: LeaseId) -> StoreResult<i64> {
        let mut client = self.client.clone();
        let resp = client.lease_time_to_live(lease, None).await?;
        Ok(resp.ttl())
    }

    async fn watch(&self, prefix: &str) -> StoreResult<RawWatchStream> {
        let mut client = self.client.clone();
        let (mut watcher, stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;
        debug!(prefix = %prefix, watch_id = watcher.watch_id(), "Watch stream established");

        let request_timeout = self.request_timeout;
        let prefix = prefix.to_string();
        let cancel = async move {
            match tokio::time::timeout(request_timeout, watcher.cancel()).await {
                Ok(Ok(())) => debug!(prefix = %prefix, "Watch canceled"),
                Ok(Err(e)) => debug!(prefix = %prefix, error = %e, "Watch cancel failed"),
                Err(_) => warn!(prefix = %prefix, "Watch cancel timed out"),
            }
        };
        Ok(into_raw_stream(stream).with_cancel(cancel.boxed()))
    }
}

fn renew_interval(ttl: i64) -> Duration {
    let millis = u64::try_from(ttl.saturating_mul(1000) / 3).unwrap_or(0);
    Duration::from_millis(millis).max(MIN_RENEW_INTERVAL)
}

/// Spawn background task that renews `lease_id` every third of its TTL and
/// forwards acknowledgements to `tx`. Dropping the receiving side stops
/// renewal; any renewal failure ends the stream.
fn spawn_keepalive_pump(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    lease_id: LeaseId,
    request_timeout: Duration,
    tx: mpsc::Sender<KeepAliveAck>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(request_timeout, keeper.keep_alive()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(lease_id = lease_id, error = %e, "Keep-alive send failed");
                    break;
                }
                Err(_) => {
                    error!(lease_id = lease_id, "Keep-alive send timed out");
                    break;
                }
            }

            let interval = match tokio::time::timeout(request_timeout, stream.message()).await {
                Ok(Ok(Some(resp))) if resp.ttl() > 0 => {
                    trace!(lease_id = lease_id, ttl = resp.ttl(), "Keep-alive OK");
                    let ack = KeepAliveAck {
                        lease_id,
                        ttl: resp.ttl(),
                    };
                    if let Err(TrySendError::Closed(_)) = tx.try_send(ack) {
                        break;
                    }
                    renew_interval(resp.ttl())
                }
                Ok(Ok(Some(_))) => {
                    warn!(lease_id = lease_id, "Lease expired or revoked");
                    break;
                }
                Ok(Ok(None)) => {
                    error!(lease_id = lease_id, "Keep-alive stream closed");
                    break;
                }
                Ok(Err(e)) => {
                    error!(lease_id = lease_id, error = %e, "Keep-alive failed");
                    break;
                }
                Err(_) => {
                    error!(lease_id = lease_id, "Keep-alive response timed out");
                    break;
                }
            };

            tokio::select! {
                _ = tx.closed() => {
                    debug!(lease_id = lease_id, "Keep-alive consumer gone, renewal stopped");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}

/// Adapt an etcd watch stream into batches of [`RawEvent`]s.
fn into_raw_stream(stream: WatchStream) -> RawWatchStream {
    let events = futures::stream::unfold(Some(stream), |state| async move {
        let mut stream = state?;
        match stream.message().await {
            Ok(Some(resp)) => {
                if resp.canceled() {
                    let reason = resp.cancel_reason().to_string();
                    warn!(reason = %reason, "Watch canceled by etcd");
                    return Some((Err(StoreError::WatchCanceled(reason)), None));
                }

                let mut batch = Vec::with_capacity(resp.events().len());
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let key = match kv.key_str() {
                        Ok(key) => key.to_string(),
                        Err(e) => {
                            warn!(error = %e, "Skipping watch event with non UTF-8 key");
                            continue;
                        }
                    };
                    batch.push(match event.event_type() {
                        EventType::Put => RawEvent::put(
                            key,
                            kv.value().to_vec(),
                            kv.create_revision() == kv.mod_revision(),
                        ),
                        EventType::Delete => RawEvent::delete(key),
                    });
                }
                Some((Ok(batch), Some(stream)))
            }
            Ok(None) => None,
            Err(e) => Some((Err(StoreError::from(e)), None)),
        }
    })
    .boxed();
    RawWatchStream::new(events)
}
