//! Node model
//!
//! A [`Node`] is the value stored under `<namespace>/<serviceType>/<id>` for
//! every live service instance. [`NodeEvent`] is the typed change
//! notification produced from the store's watch stream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One live service instance.
///
/// Identity is `(service_type, id)`; every other field is descriptive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Service type, e.g. `gate`
    #[serde(default)]
    pub service_type: String,
    /// Instance id, unique within the service type
    #[serde(default)]
    pub id: u32,
    /// OS process id of the registering instance
    #[serde(default)]
    pub process_id: i64,
    /// Host name the instance runs on
    #[serde(default)]
    pub host: String,
    /// Interface the instance listens on
    #[serde(default)]
    pub bind_interface: String,
    /// Address peers should use to reach the instance
    #[serde(default)]
    pub uri: String,
}

impl Node {
    pub fn new(service_type: impl Into<String>, id: u32) -> Self {
        Self {
            service_type: service_type.into(),
            id,
            ..Default::default()
        }
    }

    pub fn with_process_id(mut self, process_id: i64) -> Self {
        self.process_id = process_id;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_bind_interface(mut self, bind_interface: impl Into<String>) -> Self {
        self.bind_interface = bind_interface.into();
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// True when the node carries no identity (e.g. the payload of a delete).
    pub fn is_empty(&self) -> bool {
        self.service_type.is_empty() && self.id == 0
    }

    /// Namespace-relative registration name, `<serviceType>/<id>`.
    pub fn registration_name(&self) -> String {
        format!("{}/{}", self.service_type, self.id)
    }

    /// Serialize to the stored JSON form.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode the stored JSON form. Integers are decoded exactly; values that
    /// do not fit the field type are rejected rather than widened.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_type, self.id)?;
        if !self.uri.is_empty() {
            write!(f, "@{}", self.uri)?;
        }
        Ok(())
    }
}

/// Kind of change carried by a [`NodeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeEventKind {
    Create,
    Update,
    Delete,
    Unknown,
}

impl NodeEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeEventKind::Create => "create",
            NodeEventKind::Update => "update",
            NodeEventKind::Delete => "delete",
            NodeEventKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NodeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change to the live node set.
///
/// Delete events only carry `service_type` and `id` in `node`, recovered from
/// the key, since the store does not return values for deletions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub key: String,
    pub node: Node,
}

impl NodeEvent {
    pub fn new(kind: NodeEventKind, key: impl Into<String>, node: Node) -> Self {
        Self {
            kind,
            key: key.into(),
            node,
        }
    }
}
