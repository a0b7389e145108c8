//! Beacon Discovery
//!
//! Service-discovery client over a strongly-consistent coordination store:
//! - [`LeaseSupervisor`]: registers nodes under renewable leases and heals
//!   lost registrations
//! - [`WatchProjector`]: turns prefix watches into typed [`NodeEvent`]s
//! - [`NodeRegistry`]: concurrent table of live nodes fed by a projector
//! - [`StoreClient`]: namespaced, timeout-bounded access to the store
//!
//! [`NodeEvent`]: beacon_core::NodeEvent

pub mod client;
pub mod config;
pub mod error;
pub mod lease;
pub mod observability;
pub mod registry;
pub mod store;
pub mod watch;

pub use client::StoreClient;
pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, Result, StoreError};
pub use lease::{LeaseSupervisor, RegistrationHandle, RegistrationState, RegistrationStatus};
pub use registry::NodeRegistry;
pub use store::{CoordinationStore, EtcdStore, MemoryStore};
pub use watch::{NodeEventStream, WatchProjector};

pub use beacon_core::{KeyCodec, KeyParsePolicy, Node, NodeEvent, NodeEventKind};
