//! Key layout
//!
//! Maps logical names to store keys under a configured namespace, and node
//! keys back to `(service_type, id)` for delete events, which carry no value.
//!
//! Layout: `<namespace>/<serviceType>/<id>`

use std::str::FromStr;
use thiserror::Error;

/// Path separator used in store keys
pub const SEPARATOR: char = '/';

/// Errors produced when a node key does not follow the layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key {key:?} is outside root {root:?}")]
    OutsideRoot { key: String, root: String },
    #[error("key {key:?} has no id segment")]
    MissingId { key: String },
    #[error("key {key:?} has an empty service type")]
    EmptyServiceType { key: String },
    #[error("key {key:?} has invalid id {id:?}")]
    InvalidId { key: String, id: String },
}

/// How malformed keys on delete events are reported.
///
/// Both policies skip the event; `Strict` surfaces the malformed key as an
/// error-level log so key-layout bugs are not silently masked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyParsePolicy {
    #[default]
    Tolerant,
    Strict,
}

impl FromStr for KeyParsePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tolerant" => Ok(KeyParsePolicy::Tolerant),
            "strict" => Ok(KeyParsePolicy::Strict),
            other => Err(format!("unknown key parse policy: {other}")),
        }
    }
}

/// Namespace-aware key formatter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    namespace: String,
}

impl KeyCodec {
    /// Create a codec for `namespace`. Trailing separators are dropped so
    /// `/beacon` and `/beacon/` produce identical keys.
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let namespace = namespace.trim_end_matches(SEPARATOR).to_string();
        Self { namespace }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `namespace + name` when `name` is rooted, else `namespace + "/" + name`.
    pub fn format(&self, name: &str) -> String {
        let mut key = String::with_capacity(self.namespace.len() + name.len() + 1);
        key.push_str(&self.namespace);
        if !name.starts_with(SEPARATOR) {
            key.push(SEPARATOR);
        }
        key.push_str(name);
        key
    }

    /// Directory form of [`format`](Self::format): always ends with the
    /// separator, so `gate` never matches keys under `gateway`.
    pub fn format_dir(&self, dir: &str) -> String {
        let mut key = self.format(dir);
        if !key.ends_with(SEPARATOR) {
            key.push(SEPARATOR);
        }
        key
    }

    /// `<namespace>/<service_type>/<id>`
    pub fn node_key(&self, service_type: &str, id: u32) -> String {
        self.format(&format!("{service_type}{SEPARATOR}{id}"))
    }

    /// Tolerant inverse of [`node_key`](Self::node_key) relative to a watched
    /// `root`. Malformed keys yield `("", 0)`, which callers treat as a no-op.
    pub fn parse_node_key(root: &str, key: &str) -> (String, u32) {
        Self::try_parse_node_key(root, key).unwrap_or_default()
    }

    /// Strict inverse of [`node_key`](Self::node_key) relative to `root`.
    pub fn try_parse_node_key(root: &str, key: &str) -> Result<(String, u32), KeyError> {
        let outside = || KeyError::OutsideRoot {
            key: key.to_string(),
            root: root.to_string(),
        };
        let rest = key.strip_prefix(root).ok_or_else(outside)?;

        // `/ns` must not match `/nsgate/5`
        let rest = match rest.strip_prefix(SEPARATOR) {
            Some(rest) => rest,
            None if rest.is_empty() || root.is_empty() || root.ends_with(SEPARATOR) => rest,
            None => return Err(outside()),
        };

        let (service_type, id) = rest.split_once(SEPARATOR).ok_or_else(|| KeyError::MissingId {
            key: key.to_string(),
        })?;

        if service_type.is_empty() {
            return Err(KeyError::EmptyServiceType {
                key: key.to_string(),
            });
        }

        match id.parse::<u32>() {
            Ok(id) if id > 0 => Ok((service_type.to_string(), id)),
            _ => Err(KeyError::InvalidId {
                key: key.to_string(),
                id: id.to_string(),
            }),
        }
    }
}
