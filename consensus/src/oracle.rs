//! Oracle registry and index sampling

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use surety_core::{Address, Amount, OracleIndex, SuretyError, SuretyEvent, SuretyResult};
use surety_crypto::hashing::hash_tagged;
use surety_escrow::{EscrowLedger, LedgerBatch};
use surety_state::{load_record, oracle_key, Record, StateStore};
use tracing::info;

/// Source of oracle and request indexes
pub trait IndexSampler: Send + Sync {
    /// Draw an index in `[0, space)`
    fn sample(&self, seed: u64, nonce: u64, account: &Address, space: u8) -> OracleIndex;
}

/// Deterministic sampler: blake3 over seed, draw counter and account
#[derive(Debug, Clone, Copy, Default)]
pub struct HashSampler;

impl IndexSampler for HashSampler {
    fn sample(&self, seed: u64, nonce: u64, account: &Address, space: u8) -> OracleIndex {
        let digest = hash_tagged(
            b"surety-index",
            &[&seed.to_le_bytes(), &nonce.to_le_bytes(), account.as_bytes()],
        );
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        (u64::from_le_bytes(head) % u64::from(space.max(1))) as OracleIndex
    }
}

/// Registered attestation agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleState {
    /// Sampling slots, duplicates allowed
    pub indexes: [OracleIndex; 3],
    /// Registration fee held by the escrow
    pub stake: Amount,
}

impl OracleState {
    pub fn holds(&self, index: OracleIndex) -> bool {
        self.indexes.contains(&index)
    }
}

impl Record for OracleState {}

/// Oracle registry
pub struct OracleRegistry<S: StateStore> {
    ledger: Arc<EscrowLedger<S>>,
    sampler: Arc<dyn IndexSampler>,
}

impl<S: StateStore + 'static> OracleRegistry<S> {
    pub fn new(ledger: Arc<EscrowLedger<S>>) -> Self {
        Self::with_sampler(ledger, Arc::new(HashSampler))
    }

    pub fn with_sampler(ledger: Arc<EscrowLedger<S>>, sampler: Arc<dyn IndexSampler>) -> Self {
        Self { ledger, sampler }
    }

    /// Register `oracle`, paying `fee` into escrow
    pub async fn register_oracle(
        &self,
        caller: &Address,
        oracle: &Address,
        fee: Amount,
    ) -> SuretyResult<[OracleIndex; 3]> {
        let mut batch = self.ledger.begin(caller).await?;

        let required = self.ledger.config().registration_fee();
        if fee < required {
            return Err(SuretyError::InsufficientFunds {
                required: required.0,
                available: fee.0,
            });
        }
        if self.oracle(oracle).await?.is_some() {
            return Err(SuretyError::invalid_state(format!(
                "oracle {} already registered",
                oracle
            )));
        }

        let indexes = [
            self.draw_index(&mut batch, oracle),
            self.draw_index(&mut batch, oracle),
            self.draw_index(&mut batch, oracle),
        ];

        EscrowLedger::<S>::stage_deposit(&mut batch, fee)?;
        batch.put(oracle_key(oracle), &OracleState { indexes, stake: fee })?;
        batch.emit(SuretyEvent::OracleRegistered {
            oracle: *oracle,
            indexes,
        });
        self.ledger.commit(batch).await?;

        info!("Oracle {} registered with indexes {:?}", oracle, indexes);
        Ok(indexes)
    }

    /// Draw the next index, advancing the ledger's draw counter
    pub fn draw_index(&self, batch: &mut LedgerBatch, account: &Address) -> OracleIndex {
        let space = self.ledger.config().index_space;
        let seed = self.ledger.config().index_seed;
        let meta = batch.meta_mut();
        let nonce = meta.index_nonce;
        meta.index_nonce += 1;
        self.sampler.sample(seed, nonce, account, space)
    }

    pub async fn oracle(&self, oracle: &Address) -> SuretyResult<Option<OracleState>> {
        load_record(self.ledger.state().as_ref(), &oracle_key(oracle)).await
    }

    /// Indexes of a registered oracle
    pub async fn get_my_indexes(&self, oracle: &Address) -> SuretyResult<[OracleIndex; 3]> {
        self.oracle(oracle)
            .await?
            .map(|o| o.indexes)
            .ok_or_else(|| SuretyError::not_found(format!("oracle {}", oracle)))
    }
}
