//! Outbound notifications emitted after each committed state change

use serde::{Deserialize, Serialize};

use crate::types::{Address, Amount, FlightKey, FlightRef, OracleIndex, StatusCode};

/// Event appended to the outbound queue once a batch commits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuretyEvent {
    /// Operational flag toggled by the owner
    OperationalChanged { operational: bool },
    /// Caller identity granted or revoked access to the ledger
    CallerAuthorization { caller: Address, authorized: bool },
    /// Airline admitted to the federation
    AirlineRegistered { airline: Address, total: usize },
    /// Vote recorded for a pending airline candidate
    AirlineVoteRecorded {
        candidate: Address,
        voter: Address,
        votes: usize,
        required: usize,
    },
    /// Airline reached the funding threshold
    AirlineFunded { airline: Address, amount: Amount },
    /// Flight registered by a funded airline
    FlightRegistered { flight: FlightRef, price: Amount },
    /// Passenger bought insurance on a flight
    InsurancePurchased {
        passenger: Address,
        flight_key: FlightKey,
        premium: Amount,
    },
    /// Payout credited to a passenger
    PassengerCredited { passenger: Address, amount: Amount },
    /// Passenger withdrew its credit
    Withdrawn { passenger: Address, amount: Amount },
    /// Oracle registered with its sampling indexes
    OracleRegistered {
        oracle: Address,
        indexes: [OracleIndex; 3],
    },
    /// Status request opened and broadcast to eligible oracles
    StatusRequested { index: OracleIndex, flight: FlightRef },
    /// Oracle attestation recorded
    StatusReported {
        oracle: Address,
        flight: FlightRef,
        status: StatusCode,
    },
    /// Status request closed by quorum
    FlightStatusResolved { flight: FlightRef, status: StatusCode },
}

impl SuretyEvent {
    /// Short event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SuretyEvent::OperationalChanged { .. } => "OperationalChanged",
            SuretyEvent::CallerAuthorization { .. } => "CallerAuthorization",
            SuretyEvent::AirlineRegistered { .. } => "AirlineRegistered",
            SuretyEvent::AirlineVoteRecorded { .. } => "AirlineVoteRecorded",
            SuretyEvent::AirlineFunded { .. } => "AirlineFunded",
            SuretyEvent::FlightRegistered { .. } => "FlightRegistered",
            SuretyEvent::InsurancePurchased { .. } => "InsurancePurchased",
            SuretyEvent::PassengerCredited { .. } => "PassengerCredited",
            SuretyEvent::Withdrawn { .. } => "Withdrawn",
            SuretyEvent::OracleRegistered { .. } => "OracleRegistered",
            SuretyEvent::StatusRequested { .. } => "StatusRequested",
            SuretyEvent::StatusReported { .. } => "StatusReported",
            SuretyEvent::FlightStatusResolved { .. } => "FlightStatusResolved",
        }
    }
}
