//! Snapshot hashing and the per-session determinism digest

use blake3::Hasher as Blake3Hasher;
use serde::Serialize;
use crate::error::SerializationError;
use crate::types::{AccountSnapshot, MarketState, StateHash};

/// Everything observed after one recorded operation
#[derive(Debug, Serialize)]
pub struct ObservedState<'a> {
    pub line: usize,
    pub market: &'a MarketState,
    pub payer: &'a AccountSnapshot,
    pub receiver: &'a AccountSnapshot,
    pub reserve: &'a AccountSnapshot,
}

/// Hashes observed states with blake3 over their bincode encoding and
/// folds them into a running chain.
///
/// Two replays of the same log against fresh ledgers finish with the same
/// chain digest exactly when every recorded row observed the same state.
#[derive(Debug, Clone)]
pub struct SnapshotHasher {
    chain: StateHash,
    links: usize,
}

impl SnapshotHasher {
    pub fn new() -> Self {
        let genesis = Blake3Hasher::new().finalize();
        Self {
            chain: StateHash(*genesis.as_bytes()),
            links: 0,
        }
    }

    /// Hash a single observed state
    pub fn hash(&self, state: &ObservedState<'_>) -> Result<StateHash, SerializationError> {
        let encoded = bincode::serialize(state).map_err(|e| SerializationError::SerializationFailed {
            reason: format!("Bincode serialization failed: {}", e),
        })?;

        let mut hasher = Blake3Hasher::new();
        hasher.update(&encoded);
        Ok(StateHash(*hasher.finalize().as_bytes()))
    }

    /// Hash `state` and append it to the chain, returning the state's own hash
    pub fn record(&mut self, state: &ObservedState<'_>) -> Result<StateHash, SerializationError> {
        let hash = self.hash(state)?;
        self.chain = Self::extend_chain(&self.chain, &hash);
        self.links += 1;
        Ok(hash)
    }

    /// Current chain digest
    pub fn digest(&self) -> StateHash {
        self.chain
    }

    /// Number of states folded into the chain
    pub fn len(&self) -> usize {
        self.links
    }

    pub fn is_empty(&self) -> bool {
        self.links == 0
    }

    fn extend_chain(previous: &StateHash, next: &StateHash) -> StateHash {
        let mut hasher = Blake3Hasher::new();
        hasher.update(&previous.0);
        hasher.update(&next.0);
        StateHash(*hasher.finalize().as_bytes())
    }
}

impl Default for SnapshotHasher {
    fn default() -> Self {
        Self::new()
    }
}
