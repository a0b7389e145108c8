//! Structured Events
//!
//! One function per discovery event so field names stay consistent across
//! the registration and watch paths.
//!
//! Event types:
//! - `node_registered` - lease granted and node published
//! - `registration_failed` - a registration attempt failed, will retry
//! - `lease_lost` - keep-alive ended for a live registration
//! - `node_deregistered` - lease explicitly revoked
//! - `node_joined` - create/update observed on a watch
//! - `node_departed` - delete observed on a watch
//! - `watch_closed` - a watch subscription ended

use tracing::{error, info, warn};

/// Emit a node registered event
pub fn node_registered(key: &str, lease_id: i64, ttl: i64) {
    info!(
        event_type = "node_registered",
        key = %key,
        lease_id = lease_id,
        ttl = ttl,
        "Node registered"
    );
}

/// Emit a registration failed event
pub fn registration_failed(key: &str, error: &str, conflict: bool) {
    if conflict {
        warn!(
            event_type = "registration_failed",
            key = %key,
            error = %error,
            conflict = true,
            "Registration conflict, will retry"
        );
    } else {
        error!(
            event_type = "registration_failed",
            key = %key,
            error = %error,
            conflict = false,
            "Registration failed, will retry"
        );
    }
}

/// Emit a lease lost event
pub fn lease_lost(key: &str, lease_id: i64) {
    warn!(
        event_type = "lease_lost",
        key = %key,
        lease_id = lease_id,
        "Lease lost, registration will be renewed"
    );
}

/// Emit a node deregistered event
pub fn node_deregistered(key: &str, lease_id: i64) {
    info!(
        event_type = "node_deregistered",
        key = %key,
        lease_id = lease_id,
        "Node deregistered"
    );
}

/// Emit a node joined event
pub fn node_joined(service_type: &str, id: u32, uri: &str, created: bool) {
    info!(
        event_type = "node_joined",
        service_type = %service_type,
        id = id,
        uri = %uri,
        created = created,
        "Node joined"
    );
}

/// Emit a node departed event
pub fn node_departed(service_type: &str, id: u32) {
    info!(
        event_type = "node_departed",
        service_type = %service_type,
        id = id,
        "Node departed"
    );
}

/// Emit a watch closed event
pub fn watch_closed(root: &str, reason: &str, dropped: u64) {
    info!(
        event_type = "watch_closed",
        root = %root,
        reason = %reason,
        dropped = dropped,
        "Watch closed"
    );
}
