//! Monotonic versions for job state transitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transition version - bumped on every accepted job state change
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Initial version of a freshly submitted job
    pub const INITIAL: Self = Self(0);

    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Next version
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
