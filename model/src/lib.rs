//! Shared types for the topology compiler, the worker orchestrator and the
//! per-node agents. Nothing in here talks to the store or the kernel; it is
//! pure data plus the canonicalization rules the rest of the system leans on.

mod epoch;
mod keys;
mod link;
mod node;
mod vni;
mod worker;

pub use epoch::{Epoch, LinkRef, LinkSpec, RunBatch};
pub use keys::Keys;
pub use link::{Link, Shaping};
pub use node::{IpVersion, L3Config, Node, NodeL3Config, RoutingProtocol};
pub use vni::{Vni, VniError, MAX_VNI};
pub use worker::Worker;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A node name as used throughout the store's key space.
///
/// Node names are restricted to characters that are safe to embed in a store
/// key without escaping (`[A-Za-z0-9_-]`), since link keys are built by
/// straight concatenation (see [`Keys::link`]).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeName {
    type Err = InvalidNodeName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(InvalidNodeName(s.to_owned()));
        }

        Ok(Self(s.to_owned()))
    }
}

impl From<&str> for NodeName {
    fn from(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| Self(s.to_owned()))
    }
}

impl From<String> for NodeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid node name: {0:?}")]
pub struct InvalidNodeName(String);

/// Returns `(min, max)` lexicographically, matching §6's canonical ordering
/// rule for link keys.
pub fn canonical_pair<'a>(a: &'a NodeName, b: &'a NodeName) -> (&'a NodeName, &'a NodeName) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
