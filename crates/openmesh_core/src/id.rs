//! Identifiers for OpenMesh entities.
//!
//! Node identifiers are chosen by the node operator at registration time.
//! Job identifiers are generated UUIDs.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::MeshError;

/// Node identifier - assigned by the caller that registers the node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node ID from a caller-supplied name
    ///
    /// # Errors
    ///
    /// Returns error if the name is empty or only whitespace
    pub fn new(name: impl Into<String>) -> Result<Self, MeshError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(MeshError::Validation {
                field: "node_id".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(Self(name))
    }

    /// Get as string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Job identifier - generated on submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new random JobId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job_{}", self.0.simple())
    }
}

impl FromStr for JobId {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("job_").unwrap_or(s);
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|e| MeshError::Validation {
                field: "job_id".to_string(),
                reason: e.to_string(),
            })
    }
}
