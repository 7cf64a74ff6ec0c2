//! Ledger records persisted in the state store

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use surety_core::{
    Address, Amount, FlightKey, FlightRef, StateChange, StatusCode, SuretyError, SuretyResult,
};
use surety_crypto::hashing::hash_tagged;

/// A value stored under a single state key
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn to_bytes(&self) -> SuretyResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> SuretyResult<Self> {
        bincode::deserialize(bytes).map_err(|e| SuretyError::DeserializationError(e.to_string()))
    }

    /// Stage this record under `key`
    fn to_change(&self, key: Vec<u8>) -> SuretyResult<StateChange> {
        Ok(StateChange::Set {
            key,
            value: self.to_bytes()?,
        })
    }
}

/// Process-wide ledger bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMeta {
    /// Administrative owner, the only identity that may toggle the flag
    pub owner: Address,
    pub operational: bool,
    /// Registered airlines
    pub airline_count: usize,
    /// Value held by the escrow: funding, premiums and oracle stakes
    pub escrow_balance: Amount,
    /// Draw counter for oracle index sampling
    pub index_nonce: u64,
}

impl LedgerMeta {
    pub fn new(owner: Address) -> Self {
        Self {
            owner,
            operational: true,
            airline_count: 0,
            escrow_balance: Amount::ZERO,
            index_nonce: 0,
        }
    }
}

impl Record for LedgerMeta {}

/// Federation member
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirlineState {
    pub registered: bool,
    pub funded: bool,
    pub funded_amount: Amount,
}

impl AirlineState {
    pub fn admitted() -> Self {
        Self {
            registered: true,
            funded: false,
            funded_amount: Amount::ZERO,
        }
    }
}

impl Record for AirlineState {}

/// Scheduled flight registered by a funded airline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightState {
    pub flight: FlightRef,
    pub price: Amount,
    pub registered: bool,
    pub status: StatusCode,
    /// An oracle quorum has fixed `status`, `Unknown` included
    pub resolved: bool,
    /// A status request is outstanding
    pub is_open: bool,
    /// Resolved with a paying status and passengers credited
    pub paid_out: bool,
    /// Passengers holding a policy, in purchase order
    pub insurees: Vec<Address>,
}

impl FlightState {
    pub fn new(flight: FlightRef, price: Amount) -> Self {
        Self {
            flight,
            price,
            registered: true,
            status: StatusCode::Unknown,
            resolved: false,
            is_open: false,
            paid_out: false,
            insurees: Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }
}

impl Record for FlightState {}

/// One passenger's insurance on one flight
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyState {
    pub premium_paid: Amount,
    /// Zero until the payout step sets it, exactly once
    pub payout_credit: Amount,
}

impl Record for PolicyState {}

/// Passenger credit account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassengerState {
    /// Credited payouts not yet withdrawn
    pub credit_balance: Amount,
    pub total_credited: Amount,
    pub total_withdrawn: Amount,
}

impl Record for PassengerState {}

/// Grant letting an identity make mutating calls into the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerGrant {
    pub granted_by: Address,
}

impl Record for CallerGrant {}

/// Derive the key of a flight from airline, code and departure
pub fn flight_key(flight: &FlightRef) -> FlightKey {
    hash_tagged(
        b"surety-flight",
        &[
            flight.airline.as_bytes(),
            flight.code.as_bytes(),
            &flight.departure.to_le_bytes(),
        ],
    )
}
