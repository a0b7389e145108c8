//! Keep-alive watcher
//!
//! Consumes renewal acknowledgements for one lease and turns the end of the
//! stream into a single stop signal for the supervisor.

use crate::store::{KeepAliveStream, LeaseId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Spawn background task that watches the renewal stream of `lease_id`.
///
/// When the stream ends (lease expired, revoked, or renewal broke) the
/// supervisor is signalled once, without blocking: a full slot means a stop
/// is already pending. Cancellation drops the stream, which stops renewal
/// and leaves the lease to expire on its own.
pub(super) fn spawn_keepalive_watcher(
    mut stream: KeepAliveStream,
    lease_id: LeaseId,
    key: String,
    stop_tx: mpsc::Sender<LeaseId>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(key = %key, lease_id = lease_id, "Registration cancelled, renewal released");
                    return;
                }
                ack = stream.recv() => match ack {
                    Some(ack) => trace!(key = %key, lease_id = lease_id, ttl = ack.ttl, "Lease renewed"),
                    None => break,
                },
            }
        }

        match stop_tx.try_send(lease_id) {
            Ok(()) => debug!(key = %key, lease_id = lease_id, "Keep-alive ended, stop signalled"),
            Err(TrySendError::Full(_)) => {
                debug!(key = %key, lease_id = lease_id, "Keep-alive ended, stop already pending")
            }
            Err(TrySendError::Closed(_)) => {
                debug!(key = %key, lease_id = lease_id, "Keep-alive ended after supervisor exit")
            }
        }
    })
}
