//! ServerId: identifier of a registry server in the cluster.
//!
//! Replicated mutations are tagged with the id of the server they came from,
//! so the id has to be stable for the lifetime of a process and printable in
//! logs.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Longest accepted server id.
pub const MAX_SERVER_ID_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServerIdError {
    #[error("Server ID cannot be empty")]
    Empty,
    #[error("Server ID longer than {MAX_SERVER_ID_LEN} characters")]
    TooLong,
    #[error("Server ID contains whitespace or control characters")]
    InvalidCharacter,
}

/// A unique identifier for a registry server.
///
/// # Examples
/// ```
/// use registry_core::ServerId;
///
/// let id: ServerId = "registry-a".parse().unwrap();
/// assert_eq!(id.to_string(), "registry-a");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(String);

impl ServerId {
    /// Generate a new random server ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerId {
    type Err = ServerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ServerIdError::Empty);
        }
        if s.len() > MAX_SERVER_ID_LEN {
            return Err(ServerIdError::TooLong);
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ServerIdError::InvalidCharacter);
        }
        Ok(Self(s.to_string()))
    }
}

// Serialize as a plain string so logs, JSON and bincode frames agree
impl serde::Serialize for ServerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ServerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
