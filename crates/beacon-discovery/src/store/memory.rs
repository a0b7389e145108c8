//! In-memory Store
//!
//! A single-process [`CoordinationStore`] with the semantics the discovery
//! client relies on: leases expire after their TTL unless renewed, revoking
//! or expiring a lease deletes its keys and closes its keep-alive streams,
//! and prefix watches observe every mutation in order.

use super::{
    CoordinationStore, KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, RawEvent,
    RawWatchStream,
};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Capacity of the mutation fan-out channel shared by all watchers
const WATCH_FANOUT: usize = 1024;

/// Shortest renewal period for in-memory keep-alives
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(50);

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct LeaseRecord {
    ttl: i64,
    deadline: Instant,
    keys: HashSet<String>,
    keepers: HashMap<u64, mpsc::Sender<KeepAliveAck>>,
}

impl LeaseRecord {
    fn refresh(&mut self) {
        self.deadline = Instant::now() + ttl_duration(self.ttl);
    }
}

#[derive(Default)]
struct State {
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_lease: LeaseId,
    next_keeper: u64,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<RawEvent>,
    severed: Mutex<CancellationToken>,
}

enum Renewal {
    Renewed,
    Stop,
}

/// In-process [`CoordinationStore`]. Clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_FANOUT);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
                severed: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Close every keep-alive stream of `lease` without revoking it, as a
    /// broken renewal connection would. The lease then expires after its TTL.
    pub fn close_keep_alives(&self, lease: LeaseId) {
        let mut state = self.inner.state.lock();
        if let Some(record) = state.leases.get_mut(&lease) {
            debug!(lease_id = lease, keepers = record.keepers.len(), "Closing keep-alive streams");
            record.keepers.clear();
        }
    }

    /// End every open watch stream, as a store restart would.
    pub fn sever_watches(&self) {
        let mut token = self.inner.severed.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Ids of all live leases
    pub fn leases(&self) -> Vec<LeaseId> {
        let mut ids: Vec<_> = self.inner.state.lock().leases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Lease a key is currently bound to
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.inner.state.lock().kvs.get(key).and_then(|e| e.lease)
    }
}

impl Inner {
    fn revoke_locked(&self, state: &mut State, lease: LeaseId) -> bool {
        let Some(record) = state.leases.remove(&lease) else {
            return false;
        };
        let mut keys: Vec<_> = record.keys.into_iter().collect();
        keys.sort();
        for key in keys {
            if state.kvs.remove(&key).is_some() {
                let _ = self.events.send(RawEvent::delete(key));
            }
        }
        // Dropping `record.keepers` closes every keep-alive stream
        true
    }

    /// Expire `lease` if its deadline passed. Returns the deadline still to
    /// wait for, or `None` once the lease is gone.
    fn expire_if_due(&self, lease: LeaseId) -> Option<Instant> {
        let mut state = self.state.lock();
        let deadline = state.leases.get(&lease)?.deadline;
        if deadline <= Instant::now() {
            debug!(lease_id = lease, "Lease expired");
            self.revoke_locked(&mut state, lease);
            None
        } else {
            Some(deadline)
        }
    }

    fn renew(&self, lease: LeaseId, keeper: u64) -> Renewal {
        let mut state = self.state.lock();
        let Some(record) = state.leases.get_mut(&lease) else {
            return Renewal::Stop;
        };
        let Some(tx) = record.keepers.get(&keeper).cloned() else {
            return Renewal::Stop;
        };
        if tx.is_closed() {
            record.keepers.remove(&keeper);
            return Renewal::Stop;
        }
        record.refresh();
        let _ = tx.try_send(KeepAliveAck {
            lease_id: lease,
            ttl: record.ttl,
        });
        trace!(lease_id = lease, "Lease renewed");
        Renewal::Renewed
    }
}

fn ttl_duration(ttl: i64) -> Duration {
    Duration::from_secs(u64::try_from(ttl).unwrap_or(0))
}

fn spawn_expiry(inner: Weak<Inner>, lease: LeaseId, mut deadline: Instant) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep_until(deadline).await;
            let Some(inner) = inner.upgrade() else { break };
            match inner.expire_if_due(lease) {
                Some(next) => deadline = next,
                None => break,
            }
        }
    });
}

fn spawn_renewal(inner: Weak<Inner>, lease: LeaseId, keeper: u64, ttl: i64) {
    let interval = (ttl_duration(ttl) / 3).max(MIN_RENEW_INTERVAL);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(inner) = inner.upgrade() else { break };
            if let Renewal::Stop = inner.renew(lease, keeper) {
                break;
            }
        }
    });
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn count(&self, key: &str) -> StoreResult<i64> {
        Ok(i64::from(self.inner.state.lock().kvs.contains_key(key)))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .inner
            .state
            .lock()
            .kvs
            .get(key)
            .map(|e| e.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let state = self.inner.state.lock();
        Ok(state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
            })
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut state = self.inner.state.lock();
        if let Some(id) = lease {
            let record = state.leases.get_mut(&id).ok_or(StoreError::LeaseNotFound(id))?;
            record.keys.insert(key.to_string());
        }

        let previous = state.kvs.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        let is_create = previous.is_none();
        if let Some(old) = previous.and_then(|e| e.lease).filter(|old| Some(*old) != lease) {
            if let Some(record) = state.leases.get_mut(&old) {
                record.keys.remove(key);
            }
        }

        let _ = self.inner.events.send(RawEvent::put(key, value, is_create));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<i64> {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.kvs.remove(key) else {
            return Ok(0);
        };
        if let Some(record) = entry.lease.and_then(|id| state.leases.get_mut(&id)) {
            record.keys.remove(key);
        }
        let _ = self.inner.events.send(RawEvent::delete(key));
        Ok(1)
    }

    async fn lease_grant(&self, ttl: i64) -> StoreResult<LeaseId> {
        let (id, deadline) = {
            let mut state = self.inner.state.lock();
            state.next_lease += 1;
            let id = state.next_lease;
            let deadline = Instant::now() + ttl_duration(ttl);
            state.leases.insert(
                id,
                LeaseRecord {
                    ttl,
                    deadline,
                    keys: HashSet::new(),
                    keepers: HashMap::new(),
                },
            );
            (id, deadline)
        };
        spawn_expiry(Arc::downgrade(&self.inner), id, deadline);
        Ok(id)
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
        let (tx, rx) = mpsc::channel(1);
        let (keeper, ttl) = {
            let mut state = self.inner.state.lock();
            state.next_keeper += 1;
            let keeper = state.next_keeper;
            let record = state
                .leases
                .get_mut(&lease)
                .ok_or(StoreError::LeaseNotFound(lease))?;
            record.keepers.insert(keeper, tx);
            (keeper, record.ttl)
        };
        spawn_renewal(Arc::downgrade(&self.inner), lease, keeper, ttl);
        Ok(rx)
    }

    async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()> {
        let mut state = self.inner.state.lock();
        if self.inner.revoke_locked(&mut state, lease) {
            debug!(lease_id = lease, "Lease revoked");
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn lease_time_to_live(&self, lease: LeaseId) -> StoreResult<i64> {
        let state = self.inner.state.lock();
        Ok(match state.leases.get(&lease) {
            Some(record) => {
                let remaining = record.deadline.saturating_duration_since(Instant::now());
                i64::try_from(remaining.as_secs()).unwrap_or(i64::MAX)
            }
            None => -1,
        })
    }

    async fn watch(&self, prefix: &str) -> StoreResult<RawWatchStream> {
        let rx = self.inner.events.subscribe();
        let severed = self.inner.severed.lock().clone();
        let prefix = prefix.to_string();

        let stream = futures::stream::unfold(Some(rx), move |state| {
            let prefix = prefix.clone();
            let severed = severed.clone();
            async move {
                let mut rx = state?;
                loop {
                    let received = tokio::select! {
                        _ = severed.cancelled() => return None,
                        received = rx.recv() => received,
                    };
                    match received {
                        Ok(event) if event.key.starts_with(&prefix) => {
                            return Some((Ok(vec![event]), Some(rx)));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((Err(StoreError::WatchLagged(n)), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(RawWatchStream::new(stream.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.count("/a").await.unwrap(), 0);

        store.put("/a", b"1".to_vec(), None).await.unwrap();
        assert_eq!(store.count("/a").await.unwrap(), 1);
        assert_eq!(store.get("/a").await.unwrap(), Some(b"1".to_vec()));

        assert_eq!(store.delete("/a").await.unwrap(), 1);
        assert_eq!(store.delete("/a").await.unwrap(), 0);
        assert_eq!(store.get("/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_prefix_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        for key in ["/ns/b/1", "/ns/a/1", "/nsx/a/1", "/other"] {
            store.put(key, Vec::new(), None).await.unwrap();
        }
        let keys: Vec<_> = store
            .get_prefix("/ns/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/ns/a/1", "/ns/b/1"]);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.put("/a", Vec::new(), Some(99)).await,
            Err(StoreError::LeaseNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_revoke_deletes_bound_keys_and_closes_keepalive() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(30).await.unwrap();
        store.put("/a", b"x".to_vec(), Some(lease)).await.unwrap();
        let mut keepalive = store.lease_keep_alive(lease).await.unwrap();

        store.lease_revoke(lease).await.unwrap();

        assert_eq!(store.count("/a").await.unwrap(), 0);
        assert_eq!(keepalive.recv().await, None);
        assert_eq!(store.lease_time_to_live(lease).await.unwrap(), -1);
        assert!(matches!(
            store.lease_revoke(lease).await,
            Err(StoreError::LeaseNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_renewal() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(2).await.unwrap();
        store.put("/a", Vec::new(), Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert_eq!(store.count("/a").await.unwrap(), 0);
        assert!(store.leases().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_extends_lease() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(3).await.unwrap();
        store.put("/a", Vec::new(), Some(lease)).await.unwrap();
        let mut keepalive = store.lease_keep_alive(lease).await.unwrap();

        for _ in 0..5 {
            let ack = keepalive.recv().await.unwrap();
            assert_eq!(ack.lease_id, lease);
        }

        assert_eq!(store.count("/a").await.unwrap(), 1);
        assert_eq!(store.lease_of("/a"), Some(lease));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_keepalive_lets_lease_expire() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(3).await.unwrap();
        store.put("/a", Vec::new(), Some(lease)).await.unwrap();
        let mut keepalive = store.lease_keep_alive(lease).await.unwrap();

        store.close_keep_alives(lease);
        assert_eq!(keepalive.recv().await, None);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.count("/a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_watch_reports_create_update_delete() {
        let store = MemoryStore::new();
        let mut watch = store.watch("/ns/").await.unwrap();

        store.put("/ns/a", b"1".to_vec(), None).await.unwrap();
        store.put("/elsewhere", b"1".to_vec(), None).await.unwrap();
        store.put("/ns/a", b"2".to_vec(), None).await.unwrap();
        store.delete("/ns/a").await.unwrap();

        let mut events = Vec::new();
        for _ in 0..3 {
            events.extend(watch.next().await.unwrap().unwrap());
        }
        assert_eq!(
            events,
            vec![
                RawEvent::put("/ns/a", b"1".to_vec(), true),
                RawEvent::put("/ns/a", b"2".to_vec(), false),
                RawEvent::delete("/ns/a"),
            ]
        );
    }

    #[tokio::test]
    async fn test_sever_ends_watch() {
        let store = MemoryStore::new();
        let mut watch = store.watch("/").await.unwrap();
        store.sever_watches();
        assert!(watch.next().await.is_none());

        // New watches are unaffected
        let mut watch = store.watch("/").await.unwrap();
        store.put("/k", Vec::new(), None).await.unwrap();
        assert!(watch.next().await.unwrap().is_ok());
    }
}
