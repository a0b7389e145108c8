//! End-to-end discovery flows over the in-memory store.

use beacon_discovery::{
    DiscoveryConfig, DiscoveryError, LeaseSupervisor, MemoryStore, Node, NodeEventKind,
    NodeRegistry, StoreClient, WatchProjector,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_millis(50);
const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    store: MemoryStore,
    client: StoreClient,
    supervisor: LeaseSupervisor,
    projector: WatchProjector,
}

fn harness(watch_buffer: usize) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("beacon_discovery=debug")
        .try_init();

    let store = MemoryStore::new();
    let config = DiscoveryConfig {
        namespace: "/ns".into(),
        supervisor_tick: TICK,
        watch_buffer,
        ..Default::default()
    };
    let client = StoreClient::new(Arc::new(store.clone()), &config);
    Harness {
        store,
        supervisor: LeaseSupervisor::new(client.clone(), &config),
        projector: WatchProjector::new(client.clone(), &config),
        client,
    }
}

/// Poll `check` until it holds or `WAIT` elapses.
async fn until(mut check: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Poll the registry until `check` holds for its snapshot or `WAIT` elapses.
async fn registry_until(
    registry: &NodeRegistry,
    check: impl Fn(&HashMap<String, Vec<Node>>) -> bool,
) -> bool {
    tokio::time::timeout(WAIT, async {
        while !check(&registry.snapshot().await) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn register_conflicts_on_live_key() -> anyhow::Result<()> {
    let h = harness(64);
    let cancel = CancellationToken::new();

    let handle = h
        .supervisor
        .register("gate/5", Node::new("gate", 5), 7, &cancel)
        .await?;
    assert!(handle.lease_id().is_some_and(|id| id > 0));

    let err = h
        .supervisor
        .register("gate/5", Node::new("gate", 5), 7, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let listed = h.client.list("gate").await?;
    assert_eq!(listed, vec![Node::new("gate", 5)]);

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn closed_renewal_stream_heals_with_new_lease() -> anyhow::Result<()> {
    let h = harness(64);
    let cancel = CancellationToken::new();

    let handle = h
        .supervisor
        .register_and_keep_alive_forever("gate/5", Node::new("gate", 5), 7, &cancel);
    assert!(handle.wait_alive(WAIT).await);
    let first = handle.lease_id().unwrap();

    h.store.close_keep_alives(first);

    let healed = handle
        .wait_until(WAIT, |s| s.lease_id.is_some_and(|id| id != first))
        .await
        .expect("registration did not heal");
    assert!(handle.is_alive());
    assert_eq!(h.store.lease_of("/ns/gate/5"), healed.lease_id);
    assert!(!h.store.leases().contains(&first));

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn watch_reports_create_then_delete() -> anyhow::Result<()> {
    let h = harness(64);
    let cancel = CancellationToken::new();

    let mut events = h.projector.watch("/", &cancel).await?;
    assert_eq!(events.root(), "/ns/");

    let node = Node::new("gate", 5).with_uri("tcp://10.0.0.5:7000");
    h.client.put_node("gate/5", &node, None).await?;
    h.client.put_node("gate/5", &node, None).await?;
    h.client.delete("gate/5").await?;

    let kinds: Vec<_> = [
        events.recv().await.unwrap(),
        events.recv().await.unwrap(),
        events.recv().await.unwrap(),
    ]
    .into_iter()
    .map(|e| (e.kind, e.node))
    .collect();
    assert_eq!(
        kinds,
        vec![
            (NodeEventKind::Create, node.clone()),
            (NodeEventKind::Update, node),
            (NodeEventKind::Delete, Node::new("gate", 5)),
        ]
    );

    cancel.cancel();
    assert!(tokio::time::timeout(WAIT, events.recv()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn registry_follows_watch() -> anyhow::Result<()> {
    let h = harness(64);
    let cancel = CancellationToken::new();
    let registry = NodeRegistry::new();

    let projection = h.projector.watch_into("/", registry.clone(), &cancel).await?;

    let handle = h
        .supervisor
        .register("gate/5", Node::new("gate", 5), 7, &cancel)
        .await?;
    h.client.put_node("db/1", &Node::new("db", 1), None).await?;

    assert!(registry_until(&registry, |nodes| nodes.values().map(Vec::len).sum::<usize>() == 2).await);
    assert_eq!(registry.types().await, vec!["db", "gate"]);

    // Revoking the lease deletes the key, which the registry observes
    h.supervisor.revoke(&handle).await?;
    assert!(registry_until(&registry, |nodes| !nodes.contains_key("gate")).await);
    assert_eq!(registry.types().await, vec!["db"]);

    cancel.cancel();
    tokio::time::timeout(WAIT, projection).await??;
    Ok(())
}

#[tokio::test]
async fn full_subscriber_drops_overflow() -> anyhow::Result<()> {
    let h = harness(2);
    let cancel = CancellationToken::new();
    let mut events = h.projector.watch("gate", &cancel).await?;

    for id in 1..=5 {
        h.client
            .put_node(&format!("gate/{id}"), &Node::new("gate", id), None)
            .await?;
    }

    assert!(until(|| events.dropped() == 3).await);

    // Only the first two made it through
    assert_eq!(events.recv().await.unwrap().node.id, 1);
    assert_eq!(events.recv().await.unwrap().node.id, 2);

    // Room again: later events are delivered
    h.client.put_node("gate/9", &Node::new("gate", 9), None).await?;
    let next = tokio::time::timeout(WAIT, events.recv()).await?.unwrap();
    assert_eq!(next.node.id, 9);
    assert_eq!(events.dropped(), 3);

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn watch_ends_when_store_severs_it() -> anyhow::Result<()> {
    let h = harness(64);
    let cancel = CancellationToken::new();
    let mut events = h.projector.watch("gate", &cancel).await?;

    h.store.sever_watches();
    assert!(tokio::time::timeout(WAIT, events.recv()).await?.is_none());

    // A fresh subscription still works
    let mut events = h.projector.watch("gate", &cancel).await?;
    h.client.put_node("gate/1", &Node::new("gate", 1), None).await?;
    let event = tokio::time::timeout(WAIT, events.recv()).await?.unwrap();
    assert_eq!(event.kind, NodeEventKind::Create);
    Ok(())
}

#[tokio::test]
async fn watch_ignores_sibling_prefixes() -> anyhow::Result<()> {
    let h = harness(64);
    let cancel = CancellationToken::new();
    let mut events = h.projector.watch("gate", &cancel).await?;

    h.client
        .put_node("gateway/1", &Node::new("gateway", 1), None)
        .await?;
    h.client.put("malformed", b"{}".to_vec(), None).await?;
    h.client.put_node("gate/2", &Node::new("gate", 2), None).await?;

    let event = tokio::time::timeout(WAIT, events.recv()).await?.unwrap();
    assert_eq!(event.node, Node::new("gate", 2));
    Ok(())
}

#[tokio::test]
async fn deregister_missing_key_is_error() {
    let h = harness(64);
    let err = h.client.delete("gate/404").await.unwrap_err();
    assert!(matches!(err, DiscoveryError::NothingDeleted { .. }));
    assert!(err.is_conflict());
}

#[tokio::test]
async fn type_directory_watch_removes_deleted_nodes() -> anyhow::Result<()> {
    let h = harness(64);
    let cancel = CancellationToken::new();
    let registry = NodeRegistry::new();

    let projection = h.projector.watch_into("gate", registry.clone(), &cancel).await?;

    h.client.put_node("gate/5", &Node::new("gate", 5), None).await?;
    h.client.put_node("gate/6", &Node::new("gate", 6), None).await?;
    assert!(registry_until(&registry, |nodes| nodes.get("gate").map_or(0, Vec::len) == 2).await);

    h.client.delete("gate/5").await?;
    assert!(registry_until(&registry, |nodes| nodes["gate"].len() == 1).await);
    assert_eq!(registry.get("gate").await, vec![Node::new("gate", 6)]);

    h.client.delete("gate/6").await?;
    assert!(registry_until(&registry, |nodes| !nodes.contains_key("gate")).await);

    cancel.cancel();
    tokio::time::timeout(WAIT, projection).await??;
    Ok(())
}
