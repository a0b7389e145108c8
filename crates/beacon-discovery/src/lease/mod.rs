//! Lease Supervisor
//!
//! Owns the lifecycle of lease-backed registrations:
//! 1. Probe: registration is exclusive, an existing key is a conflict
//! 2. Acquire: grant a lease and publish the node under it
//! 3. Keep alive: renew the lease in the background, signal loss once
//! 4. Heal: a 1-tick supervisor loop re-registers whenever not alive
//!
//! Cancelling a registration stops renewal but never revokes the lease;
//! natural TTL expiry cleans up unless [`LeaseSupervisor::revoke`] is called.

mod keepalive;
mod supervisor;

pub use supervisor::LeaseSupervisor;

use crate::client::StoreClient;
use crate::error::{DiscoveryError, Result, StoreError};
use crate::observability::{events, metrics};
use crate::store::LeaseId;
use beacon_core::Node;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Registration state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No lease held; the next tick will try to register
    Unregistered,
    /// A registration attempt is in flight
    Registering,
    /// Node published under a live lease
    Alive,
}

/// Observable snapshot of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationStatus {
    pub state: RegistrationState,
    pub lease_id: Option<LeaseId>,
}

impl RegistrationStatus {
    const UNREGISTERED: Self = Self {
        state: RegistrationState::Unregistered,
        lease_id: None,
    };
}

/// Mutable record of one registration. Never shared across registrations.
pub(crate) struct Registration {
    name: String,
    key: String,
    value: Node,
    ttl: i64,
    /// Current lease; held across a whole attempt so attempts never overlap
    lease: Mutex<Option<LeaseId>>,
    status: watch::Sender<RegistrationStatus>,
}

impl Registration {
    fn new(name: String, key: String, value: Node, ttl: i64) -> Self {
        let (status, _) = watch::channel(RegistrationStatus::UNREGISTERED);
        Self {
            name,
            key,
            value,
            ttl,
            lease: Mutex::new(None),
            status,
        }
    }

    fn publish(&self, state: RegistrationState, lease_id: Option<LeaseId>) {
        self.status.send_replace(RegistrationStatus { state, lease_id });
    }

    fn is_alive(&self) -> bool {
        self.status.borrow().state == RegistrationState::Alive
    }

    /// One registration attempt. A no-op when already alive.
    pub(crate) async fn do_register(
        &self,
        client: &StoreClient,
        stop_tx: &mpsc::Sender<LeaseId>,
        cancel: &CancellationToken,
    ) -> Result<LeaseId> {
        let mut lease = self.lease.lock().await;
        if let Some(lease_id) = *lease {
            return Ok(lease_id);
        }

        self.publish(RegistrationState::Registering, None);
        match self.acquire(client, stop_tx, cancel).await {
            Ok(lease_id) => {
                *lease = Some(lease_id);
                self.publish(RegistrationState::Alive, Some(lease_id));
                events::node_registered(&self.key, lease_id, self.ttl);
                metrics::record_registration();
                Ok(lease_id)
            }
            Err(e) => {
                self.publish(RegistrationState::Unregistered, None);
                Err(e)
            }
        }
    }

    async fn acquire(
        &self,
        client: &StoreClient,
        stop_tx: &mpsc::Sender<LeaseId>,
        cancel: &CancellationToken,
    ) -> Result<LeaseId> {
        if client.exists(&self.name).await? {
            return Err(DiscoveryError::AlreadyRegistered {
                key: self.key.clone(),
            });
        }

        let lease_id = client.grant_lease(self.ttl).await?;

        let published = async {
            client.put_node(&self.name, &self.value, Some(lease_id)).await?;
            client.renew_lease(lease_id).await
        }
        .await;

        match published {
            Ok(stream) => {
                keepalive::spawn_keepalive_watcher(
                    stream,
                    lease_id,
                    self.key.clone(),
                    stop_tx.clone(),
                    cancel.clone(),
                );
                Ok(lease_id)
            }
            Err(e) => {
                // Release the half-registered lease so the next attempt does
                // not conflict with ourselves
                if let Err(revoke_err) = client.revoke_lease(lease_id).await {
                    debug!(lease_id = lease_id, error = %revoke_err, "Failed to release lease");
                }
                Err(e)
            }
        }
    }

    /// Handle a stop signal for `lost`. Signals for a lease that is no
    /// longer current are ignored.
    pub(crate) async fn lease_lost(&self, client: &StoreClient, lost: LeaseId) -> bool {
        let mut lease = self.lease.lock().await;
        if *lease != Some(lost) {
            debug!(key = %self.key, lease_id = lost, "Ignoring stop signal for stale lease");
            return false;
        }

        *lease = None;
        self.publish(RegistrationState::Unregistered, None);
        events::lease_lost(&self.key, lost);
        metrics::record_lease_lost();

        // Renewal is gone but the lease may still be live in the store;
        // revoking frees the key for the next attempt
        match client.revoke_lease(lost).await {
            Ok(()) | Err(DiscoveryError::Store(StoreError::LeaseNotFound(_))) => {}
            Err(e) => debug!(lease_id = lost, error = %e, "Lost lease not revoked"),
        }
        true
    }

    /// Revoke the current lease, if any. Idempotent.
    pub(crate) async fn revoke(&self, client: &StoreClient) -> Result<()> {
        let mut lease = self.lease.lock().await;
        let Some(lease_id) = *lease else {
            return Ok(());
        };

        match client.revoke_lease(lease_id).await {
            Ok(()) | Err(DiscoveryError::Store(StoreError::LeaseNotFound(_))) => {}
            Err(e) => return Err(e),
        }

        *lease = None;
        self.publish(RegistrationState::Unregistered, None);
        events::node_deregistered(&self.key, lease_id);
        Ok(())
    }
}

/// Handle to a supervised registration. Cheap to clone.
#[derive(Clone)]
pub struct RegistrationHandle {
    registration: Arc<Registration>,
    status: watch::Receiver<RegistrationStatus>,
    cancel: CancellationToken,
}

impl RegistrationHandle {
    fn new(registration: Arc<Registration>, cancel: CancellationToken) -> Self {
        let status = registration.status.subscribe();
        Self {
            registration,
            status,
            cancel,
        }
    }

    /// Namespace-relative registration name
    pub fn name(&self) -> &str {
        &self.registration.name
    }

    /// Absolute store key
    pub fn key(&self) -> &str {
        &self.registration.key
    }

    pub fn value(&self) -> &Node {
        &self.registration.value
    }

    pub fn ttl(&self) -> i64 {
        self.registration.ttl
    }

    pub fn status(&self) -> RegistrationStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> RegistrationState {
        self.status().state
    }

    pub fn is_alive(&self) -> bool {
        self.state() == RegistrationState::Alive
    }

    /// Current lease, present only while alive
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.status().lease_id
    }

    /// Wait until `predicate` holds for the status, up to `timeout`.
    pub async fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> Option<RegistrationStatus>
    where
        F: FnMut(&RegistrationStatus) -> bool,
    {
        let mut status = self.status.clone();
        let reached = match tokio::time::timeout(timeout, status.wait_for(|s| predicate(s))).await {
            Ok(Ok(current)) => Some(*current),
            _ => None,
        };
        reached
    }

    /// Wait until the registration is alive, up to `timeout`.
    pub async fn wait_alive(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.state == RegistrationState::Alive)
            .await
            .is_some()
    }

    /// Stop supervising. The lease is left to expire naturally.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for RegistrationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("key", &self.registration.key)
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
