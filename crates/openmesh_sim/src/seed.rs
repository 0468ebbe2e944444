//! Seed management for reproducible simulations.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;

/// Simulation seed
///
/// One base value fans out into independent streams through [`SimSeed::derive`],
/// so adding draws to one stream never shifts another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimSeed {
    /// Base seed value
    pub seed: u64,
    /// Namespace mixed into derived seeds
    pub namespace: String,
}

impl SimSeed {
    /// Create from a literal value
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            namespace: String::new(),
        }
    }

    /// Create from a string by hashing it
    #[must_use]
    pub fn from_string(s: &str) -> Self {
        let mut hasher = fnv::FnvHasher::default();
        hasher.write(s.as_bytes());
        Self::new(hasher.finish())
    }

    /// Set namespace
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Seed for one named stream
    #[must_use]
    pub fn derive(&self, context: &str) -> Self {
        let mut hasher = fnv::FnvHasher::default();
        hasher.write_u64(self.seed);
        hasher.write(self.namespace.as_bytes());
        hasher.write(context.as_bytes());
        Self {
            seed: hasher.finish(),
            namespace: self.namespace.clone(),
        }
    }

    /// RNG for this seed
    #[must_use]
    pub fn rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed)
    }
}

impl Default for SimSeed {
    fn default() -> Self {
        Self::new(42)
    }
}
