//! Core traits defining the ledger's seams
//!
//! The state store is the single ownership-held home of all ledger state;
//! components only ever hold references to it. The payout sink is the
//! external value transfer a withdrawal ends in.

use crate::types::*;
use async_trait::async_trait;

/// Result type for ledger operations
pub type SuretyResult<T> = Result<T, crate::error::SuretyError>;

/// State provider trait
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Get the current state version
    async fn version(&self) -> StateVersion;

    /// Get the state root hash
    async fn root(&self) -> StateRoot;

    /// Get a value by key
    async fn get(&self, key: &[u8]) -> SuretyResult<Option<Vec<u8>>>;

    /// Check if a key exists
    async fn exists(&self, key: &[u8]) -> SuretyResult<bool>;
}

/// State mutator trait
#[async_trait]
pub trait StateMutator: StateProvider {
    /// Set a value
    async fn set(&self, key: &[u8], value: &[u8]) -> SuretyResult<()>;

    /// Delete a key
    async fn delete(&self, key: &[u8]) -> SuretyResult<()>;

    /// Apply a batch of changes atomically
    async fn apply_batch(&self, changes: Vec<StateChange>) -> SuretyResult<StateVersion>;
}

/// State change operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl StateChange {
    pub fn key(&self) -> &[u8] {
        match self {
            StateChange::Set { key, .. } | StateChange::Delete { key } => key,
        }
    }
}

/// External value transfer performed by a withdrawal
///
/// Called only after the passenger's credit has been zeroed, so an
/// implementation that re-enters the ledger sees no withdrawable balance.
#[async_trait]
pub trait PayoutSink: Send + Sync {
    async fn transfer(&self, to: &Address, amount: Amount) -> SuretyResult<()>;
}
