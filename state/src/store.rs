//! State store trait, key schema and state root computation

use async_trait::async_trait;
use surety_core::{
    Address, FlightKey, Hash, StateMutator, StateProvider, StateRoot, SuretyError,
    SuretyResult,
};
use surety_crypto::hashing::{hash, merkle_root};

use crate::records::{AirlineState, FlightState, LedgerMeta, PassengerState, PolicyState, Record};

/// State entry for merkle tree computation
#[derive(Debug, Clone)]
pub struct StateEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl StateEntry {
    pub fn hash(&self) -> Hash {
        let mut data = Vec::with_capacity(self.key.len() + self.value.len());
        data.extend_from_slice(&self.key);
        data.extend_from_slice(&self.value);
        hash(&data)
    }
}

/// Compute state root from entries
pub fn compute_state_root(entries: &[StateEntry]) -> StateRoot {
    if entries.is_empty() {
        return Hash::ZERO;
    }

    // Sort entries by key for deterministic ordering
    let mut sorted: Vec<_> = entries.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let leaves: Vec<Hash> = sorted.iter().map(|e| e.hash()).collect();
    merkle_root(&leaves)
}

/// Load and decode a record, `None` when the key is absent
pub async fn load_record<S, R>(state: &S, key: &[u8]) -> SuretyResult<Option<R>>
where
    S: StateProvider + ?Sized,
    R: Record,
{
    match state.get(key).await? {
        Some(bytes) => Ok(Some(R::from_bytes(&bytes)?)),
        None => Ok(None),
    }
}

/// Ledger state store with typed record access
#[async_trait]
pub trait StateStore: StateProvider + StateMutator {
    /// Ledger bookkeeping, present once genesis has run
    async fn get_meta(&self) -> SuretyResult<LedgerMeta> {
        load_record(self, META_KEY)
            .await?
            .ok_or_else(|| SuretyError::StateCorruption("ledger meta missing".into()))
    }

    async fn has_meta(&self) -> SuretyResult<bool> {
        self.exists(META_KEY).await
    }

    async fn get_airline(&self, airline: &Address) -> SuretyResult<Option<AirlineState>> {
        load_record(self, &airline_key(airline)).await
    }

    async fn get_flight(&self, flight_key: &FlightKey) -> SuretyResult<Option<FlightState>> {
        load_record(self, &flight_state_key(flight_key)).await
    }

    async fn get_policy(
        &self,
        flight_key: &FlightKey,
        passenger: &Address,
    ) -> SuretyResult<Option<PolicyState>> {
        load_record(self, &policy_key(flight_key, passenger)).await
    }

    async fn get_passenger(&self, passenger: &Address) -> SuretyResult<PassengerState> {
        Ok(load_record(self, &passenger_key(passenger))
            .await?
            .unwrap_or_default())
    }

    async fn is_authorized(&self, caller: &Address) -> SuretyResult<bool> {
        self.exists(&authorized_key(caller)).await
    }

    /// Get all entries for state root computation
    async fn all_entries(&self) -> SuretyResult<Vec<StateEntry>>;

    /// Compute current state root
    async fn compute_root(&self) -> SuretyResult<StateRoot> {
        let entries = self.all_entries().await?;
        Ok(compute_state_root(&entries))
    }
}

/// Key of the ledger bookkeeping record
pub const META_KEY: &[u8] = b"meta";

const AIRLINE_PREFIX: &[u8] = b"airline:";
const FLIGHT_PREFIX: &[u8] = b"flight:";
const POLICY_PREFIX: &[u8] = b"policy:";
const PASSENGER_PREFIX: &[u8] = b"passenger:";
const AUTHORIZED_PREFIX: &[u8] = b"authorized:";
const ORACLE_PREFIX: &[u8] = b"oracle:";
const REQUEST_PREFIX: &[u8] = b"request:";
const CANDIDATE_PREFIX: &[u8] = b"candidate:";

fn prefixed(prefix: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let len = prefix.len() + parts.iter().map(|p| p.len()).sum::<usize>();
    let mut key = Vec::with_capacity(len);
    key.extend_from_slice(prefix);
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

pub fn airline_key(airline: &Address) -> Vec<u8> {
    prefixed(AIRLINE_PREFIX, &[airline.as_bytes()])
}

pub fn flight_state_key(flight_key: &FlightKey) -> Vec<u8> {
    prefixed(FLIGHT_PREFIX, &[flight_key.as_bytes()])
}

pub fn policy_key(flight_key: &FlightKey, passenger: &Address) -> Vec<u8> {
    prefixed(POLICY_PREFIX, &[flight_key.as_bytes(), passenger.as_bytes()])
}

pub fn passenger_key(passenger: &Address) -> Vec<u8> {
    prefixed(PASSENGER_PREFIX, &[passenger.as_bytes()])
}

pub fn authorized_key(caller: &Address) -> Vec<u8> {
    prefixed(AUTHORIZED_PREFIX, &[caller.as_bytes()])
}

pub fn oracle_key(oracle: &Address) -> Vec<u8> {
    prefixed(ORACLE_PREFIX, &[oracle.as_bytes()])
}

pub fn request_key(flight_key: &FlightKey) -> Vec<u8> {
    prefixed(REQUEST_PREFIX, &[flight_key.as_bytes()])
}

pub fn candidate_key(candidate: &Address) -> Vec<u8> {
    prefixed(CANDIDATE_PREFIX, &[candidate.as_bytes()])
}

/// Parse the airline address out of an airline key
pub fn parse_airline_key(key: &[u8]) -> Option<Address> {
    let rest = key.strip_prefix(AIRLINE_PREFIX)?;
    let bytes: [u8; 32] = rest.try_into().ok()?;
    Some(Address::from_bytes(bytes))
}
