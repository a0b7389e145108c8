//! Watch Projector
//!
//! Turns raw store mutations under a watched directory into typed
//! [`NodeEvent`]s:
//! - put of a new key => `Create`
//! - put of an existing key => `Update`
//! - delete => `Delete`, identity recovered from the key
//!
//! Each subscription owns one bounded channel. A full channel drops the new
//! event with a warning instead of blocking the watch loop. Broken watches
//! are not resubscribed; the stream simply ends.

use crate::client::StoreClient;
use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::observability::{events, metrics};
use crate::registry::NodeRegistry;
use crate::store::{RawEvent, RawEventKind, RawWatchStream};
use beacon_core::{KeyCodec, KeyParsePolicy, Node, NodeEvent, NodeEventKind};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Receiving side of a watch subscription.
///
/// Ends when the underlying watch closes, fails, or is cancelled.
pub struct NodeEventStream {
    root: String,
    rx: mpsc::Receiver<NodeEvent>,
    dropped: Arc<AtomicU64>,
}

impl NodeEventStream {
    /// Absolute key prefix this subscription watches
    pub fn root(&self) -> &str {
        &self.root
    }

    pub async fn recv(&mut self) -> Option<NodeEvent> {
        self.rx.recv().await
    }

    /// Events dropped so far because this subscription was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Stream for NodeEventStream {
    type Item = NodeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Opens watch subscriptions and projects them into node events.
#[derive(Clone)]
pub struct WatchProjector {
    client: StoreClient,
    buffer: usize,
    policy: KeyParsePolicy,
}

impl WatchProjector {
    pub fn new(client: StoreClient, config: &DiscoveryConfig) -> Self {
        Self {
            client,
            buffer: config.watch_buffer.max(1),
            policy: config.key_parse_policy,
        }
    }

    /// Subscribe to node changes under the namespace-relative `dir`.
    pub async fn watch(&self, dir: &str, cancel: &CancellationToken) -> Result<NodeEventStream> {
        let (root, raw) = self.client.watch(dir).await?;
        let (tx, rx) = mpsc::channel(self.buffer);
        let dropped = Arc::new(AtomicU64::new(0));

        debug!(root = %root, buffer = self.buffer, "Watch subscription opened");
        tokio::spawn(run_watch(
            raw,
            Subscription {
                root: root.clone(),
                namespace: self.client.codec().namespace().to_string(),
                policy: self.policy,
                tx,
                dropped: dropped.clone(),
            },
            cancel.clone(),
        ));

        Ok(NodeEventStream { root, rx, dropped })
    }

    /// Subscribe to `dir` and apply every event to `registry` until the
    /// subscription ends.
    pub async fn watch_into(
        &self,
        dir: &str,
        registry: NodeRegistry,
        cancel: &CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let mut stream = self.watch(dir, cancel).await?;
        Ok(tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                registry.apply(&event).await;
            }
            debug!(root = %stream.root(), "Projection finished");
        }))
    }
}

struct Subscription {
    root: String,
    namespace: String,
    policy: KeyParsePolicy,
    tx: mpsc::Sender<NodeEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Hand `event` to the subscriber without ever waiting. Returns false
    /// once the subscriber is gone.
    fn deliver(&self, event: NodeEvent) -> bool {
        let kind = event.kind;
        let (service_type, id, uri) = (
            event.node.service_type.clone(),
            event.node.id,
            event.node.uri.clone(),
        );
        match self.tx.try_send(event) {
            Ok(()) => {
                metrics::record_watch_event(kind);
                match kind {
                    NodeEventKind::Create | NodeEventKind::Update => {
                        events::node_joined(&service_type, id, &uri, kind == NodeEventKind::Create)
                    }
                    NodeEventKind::Delete => events::node_departed(&service_type, id),
                    NodeEventKind::Unknown => {}
                }
                true
            }
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_watch_drop();
                warn!(
                    root = %self.root,
                    key = %event.key,
                    kind = %kind,
                    "Subscriber full, dropping node event"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

async fn run_watch(mut raw: RawWatchStream, sub: Subscription, cancel: CancellationToken) {
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break "cancelled",
            item = raw.next() => match item {
                None => break "closed",
                Some(Err(e)) => {
                    error!(root = %sub.root, error = %e, "Watch failed");
                    break "error";
                }
                Some(Ok(batch)) => {
                    let mut open = true;
                    for raw_event in batch {
                        if let Some(event) = translate(&sub.root, &sub.namespace, raw_event, sub.policy) {
                            open = sub.deliver(event);
                            if !open {
                                break;
                            }
                        }
                    }
                    if !open {
                        break "subscriber dropped";
                    }
                }
            },
        }
    };

    // Close the store subscription before the output channel
    raw.cancel().await;
    events::watch_closed(&sub.root, reason, sub.dropped.load(Ordering::Relaxed));
    drop(sub);
}

/// Map one raw mutation to a node event. Undecodable puts and malformed
/// delete keys produce nothing.
///
/// Delete keys are parsed relative to the watched `root`, then relative to
/// the `namespace` for watches on a single service-type directory.
pub(crate) fn translate(
    root: &str,
    namespace: &str,
    raw: RawEvent,
    policy: KeyParsePolicy,
) -> Option<NodeEvent> {
    match raw.kind {
        RawEventKind::Put => match Node::decode(&raw.value) {
            Ok(node) => {
                let kind = if raw.is_create {
                    NodeEventKind::Create
                } else {
                    NodeEventKind::Update
                };
                Some(NodeEvent::new(kind, raw.key, node))
            }
            Err(e) => {
                error!(key = %raw.key, error = %e, "Dropping undecodable node value");
                None
            }
        },
        RawEventKind::Delete => match KeyCodec::try_parse_node_key(root, &raw.key)
            .or_else(|e| KeyCodec::try_parse_node_key(namespace, &raw.key).map_err(|_| e))
        {
            Ok((service_type, id)) => {
                Some(NodeEvent::new(
                    NodeEventKind::Delete,
                    raw.key,
                    Node::new(service_type, id),
                ))
            }
            Err(e) => {
                match policy {
                    KeyParsePolicy::Tolerant => debug!(error = %e, "Ignoring delete of malformed key"),
                    KeyParsePolicy::Strict => error!(error = %e, "Delete of malformed node key"),
                }
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANT: KeyParsePolicy = KeyParsePolicy::Tolerant;

    fn put(key: &str, node: &Node, is_create: bool) -> RawEvent {
        RawEvent::put(key, node.encode().unwrap(), is_create)
    }

    #[test]
    fn test_translate_put() {
        let node = Node::new("gate", 5).with_uri("tcp://a:1");
        let event = translate("/ns/", "/ns", put("/ns/gate/5", &node, true), TOLERANT).unwrap();
        assert_eq!(event.kind, NodeEventKind::Create);
        assert_eq!(event.node, node);

        let event = translate("/ns/", "/ns", put("/ns/gate/5", &node, false), TOLERANT).unwrap();
        assert_eq!(event.kind, NodeEventKind::Update);
    }

    #[test]
    fn test_translate_delete_recovers_identity() {
        let event = translate("/ns", "/ns", RawEvent::delete("/ns/gate/5"), TOLERANT).unwrap();
        assert_eq!(event.kind, NodeEventKind::Delete);
        assert_eq!(event.key, "/ns/gate/5");
        assert_eq!(event.node, Node::new("gate", 5));
    }

    #[test]
    fn test_translate_delete_under_type_directory() {
        let event =
            translate("/ns/gate/", "/ns", RawEvent::delete("/ns/gate/5"), TOLERANT).unwrap();
        assert_eq!(event.kind, NodeEventKind::Delete);
        assert_eq!(event.node, Node::new("gate", 5));
    }

    #[test]
    fn test_translate_drops_malformed() {
        for policy in [KeyParsePolicy::Tolerant, KeyParsePolicy::Strict] {
            assert!(translate("/ns", "/ns", RawEvent::delete("/ns/malformed"), policy).is_none());
            assert!(
                translate("/ns/gate/", "/ns", RawEvent::delete("/ns/gate/x"), policy).is_none()
            );
        }
        let corrupt = RawEvent::put("/ns/gate/5", b"{\"id\":".to_vec(), true);
        assert!(translate("/ns", "/ns", corrupt, TOLERANT).is_none());
    }

    #[tokio::test]
    async fn test_full_subscription_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let sub = Subscription {
            root: "/ns/".into(),
            namespace: "/ns".into(),
            policy: TOLERANT,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let event = |id| NodeEvent::new(NodeEventKind::Create, format!("/ns/gate/{id}"), Node::new("gate", id));

        assert!(sub.deliver(event(1)));
        assert!(sub.deliver(event(2)));
        assert_eq!(sub.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(rx.recv().await.unwrap().node.id, 1);

        drop(rx);
        assert!(!sub.deliver(event(3)));
    }

    #[tokio::test]
    async fn test_store_watch_cancelled_before_output_closes() {
        use futures::FutureExt;
        use std::sync::atomic::AtomicBool;

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let raw = RawWatchStream::new(futures::stream::pending().boxed()).with_cancel(
            async move {
                flag.store(true, Ordering::SeqCst);
            }
            .boxed(),
        );
        let (tx, mut rx) = mpsc::channel(1);
        let sub = Subscription {
            root: "/ns/".into(),
            namespace: "/ns".into(),
            policy: TOLERANT,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_watch(raw, sub, cancel.clone()));

        cancel.cancel();
        assert!(rx.recv().await.is_none());
        assert!(cancelled.load(Ordering::SeqCst));
        task.await.unwrap();
    }
}
