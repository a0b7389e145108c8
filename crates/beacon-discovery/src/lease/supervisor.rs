//! Registration supervisor
//!
//! Runs one loop per registration on a fixed tick: re-register whenever the
//! registration is not alive, handle stop signals from the keep-alive
//! watcher, and exit on cancellation without revoking the lease.

use super::{Registration, RegistrationHandle};
use crate::client::StoreClient;
use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::observability::{events, metrics};
use crate::store::LeaseId;
use beacon_core::Node;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Registers nodes under renewable leases and keeps them registered.
///
/// Failed attempts are retried on every tick unless the error can never
/// clear (e.g. an unusable configuration), which stops that registration.
#[derive(Clone)]
pub struct LeaseSupervisor {
    client: StoreClient,
    config: DiscoveryConfig,
}

impl LeaseSupervisor {
    pub fn new(client: StoreClient, config: &DiscoveryConfig) -> Self {
        Self {
            client,
            config: config.clone(),
        }
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    fn prepare(
        &self,
        name: String,
        value: Node,
        ttl_seconds: i64,
        cancel: &CancellationToken,
    ) -> (Arc<Registration>, RegistrationHandle) {
        let ttl = self.config.effective_ttl(ttl_seconds);
        let key = self.client.codec().format(&name);
        let registration = Arc::new(Registration::new(name, key, value, ttl));
        let handle = RegistrationHandle::new(registration.clone(), cancel.child_token());
        (registration, handle)
    }

    fn spawn_loop(
        &self,
        registration: Arc<Registration>,
        handle: &RegistrationHandle,
        stop: (mpsc::Sender<LeaseId>, mpsc::Receiver<LeaseId>),
    ) {
        tokio::spawn(supervise(
            registration,
            self.client.clone(),
            self.config.supervisor_tick,
            stop,
            handle.cancel.clone(),
        ));
    }

    /// Register `value` under `name` and keep it registered until `cancel`
    /// fires. Never fails: every failed attempt is logged and retried on the
    /// next tick. A non-positive TTL selects the configured default.
    pub fn register_and_keep_alive_forever(
        &self,
        name: impl Into<String>,
        value: Node,
        ttl_seconds: i64,
        cancel: &CancellationToken,
    ) -> RegistrationHandle {
        let (registration, handle) = self.prepare(name.into(), value, ttl_seconds, cancel);
        info!(key = %handle.key(), ttl = handle.ttl(), "Starting registration supervisor");
        self.spawn_loop(registration, &handle, mpsc::channel(1));
        handle
    }

    /// Like [`register_and_keep_alive_forever`](Self::register_and_keep_alive_forever)
    /// but the first attempt runs inline, so a conflict or store failure is
    /// returned to the caller and nothing is left running.
    pub async fn register(
        &self,
        name: impl Into<String>,
        value: Node,
        ttl_seconds: i64,
        cancel: &CancellationToken,
    ) -> Result<RegistrationHandle> {
        let (registration, handle) = self.prepare(name.into(), value, ttl_seconds, cancel);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        registration
            .do_register(&self.client, &stop_tx, &handle.cancel)
            .await?;

        self.spawn_loop(registration, &handle, (stop_tx, stop_rx));
        Ok(handle)
    }

    /// Stop supervising `handle` and revoke its lease if it holds one.
    /// A no-op for registrations that were never alive. Idempotent.
    pub async fn revoke(&self, handle: &RegistrationHandle) -> Result<()> {
        handle.cancel();
        handle.registration.revoke(&self.client).await
    }
}

async fn supervise(
    registration: Arc<Registration>,
    client: StoreClient,
    tick: Duration,
    (stop_tx, mut stop_rx): (mpsc::Sender<LeaseId>, mpsc::Receiver<LeaseId>),
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(key = %registration.key, "Registration supervisor stopped");
                break;
            }

            Some(lost) = stop_rx.recv() => {
                registration.lease_lost(&client, lost).await;
            }

            _ = interval.tick() => {
                if !registration.is_alive() {
                    if let Err(e) = registration.do_register(&client, &stop_tx, &cancel).await {
                        events::registration_failed(&registration.key, &e.to_string(), e.is_conflict());
                        metrics::record_registration_failure(e.is_conflict());
                        if !e.is_retriable() {
                            error!(key = %registration.key, error = %e, "Registration cannot succeed, supervisor stopped");
                            break;
                        }
                    }
                }
            }
        }
    }
}
