//! Core shared types for beacon
//!
//! This crate contains the value types and key layout shared by the
//! discovery client and its tooling. Nothing in here performs I/O.

pub mod key;
pub mod node;

pub use key::{KeyCodec, KeyError, KeyParsePolicy, SEPARATOR};
pub use node::{Node, NodeEvent, NodeEventKind};
