//! Provenance of a registry mutation.

use crate::server_id::ServerId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Where a mutation came from.
///
/// Only `Local` mutations are fanned out to peers. A mutation received from a
/// peer is applied and stops there, so propagation is always one hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Source {
    /// Direct client action on this server (or this server's own policy, e.g. eviction)
    Local,
    /// Received from the given peer server
    Replicated(ServerId),
}

impl Source {
    pub fn replicated(origin: ServerId) -> Self {
        Self::Replicated(origin)
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    /// The peer this mutation came from, if any.
    pub fn origin(&self) -> Option<&ServerId> {
        match self {
            Self::Local => None,
            Self::Replicated(origin) => Some(origin),
        }
    }

    /// Whether a mutation with this provenance is broadcast to peers.
    pub fn should_replicate(&self) -> bool {
        self.is_local()
    }
}

impl Display for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Replicated(origin) => write!(f, "replicated({})", origin),
        }
    }
}
