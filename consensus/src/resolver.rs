//! Flight status resolution by oracle quorum

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use surety_core::{
    Address, FlightKey, FlightRef, OracleIndex, StatusCode, SuretyError, SuretyEvent,
    SuretyResult, Timestamp,
};
use surety_escrow::{Credit, EscrowLedger};
use surety_state::{flight_key, load_record, request_key, Record, StateStore};
use tracing::{debug, info};

use crate::oracle::OracleRegistry;

/// Outstanding or closed status request for one flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {
    pub flight: FlightRef,
    /// Only oracles holding this index may answer
    pub index: OracleIndex,
    pub requester: Address,
    pub is_open: bool,
    /// Status that reached quorum, fixed once set
    pub resolved: Option<StatusCode>,
    /// Distinct oracles per reported status
    pub responses: BTreeMap<StatusCode, BTreeSet<Address>>,
    pub opened_at: Timestamp,
}

impl StatusRequest {
    pub fn new(flight: FlightRef, index: OracleIndex, requester: Address) -> Self {
        Self {
            flight,
            index,
            requester,
            is_open: true,
            resolved: None,
            responses: BTreeMap::new(),
            opened_at: Timestamp::now(),
        }
    }

    /// Record an attestation, returning the number of distinct oracles
    /// reporting `status`
    pub fn record(&mut self, oracle: Address, status: StatusCode) -> usize {
        let voters = self.responses.entry(status).or_default();
        voters.insert(oracle);
        voters.len()
    }

    pub fn count(&self, status: StatusCode) -> usize {
        self.responses.get(&status).map(BTreeSet::len).unwrap_or(0)
    }
}

impl Record for StatusRequest {}

/// Request handle returned to the requester
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTicket {
    pub flight_key: FlightKey,
    pub index: OracleIndex,
}

/// Result of an oracle response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Attestation recorded, `count` oracles now agree on `status`
    Recorded { status: StatusCode, count: usize },
    /// This attestation closed the request
    Finalized {
        status: StatusCode,
        credits: Vec<Credit>,
    },
    /// Request was already closed, attestation recorded without effect
    AlreadyFinalized { status: StatusCode },
}

/// Oracle consensus resolver
pub struct OracleResolver<S: StateStore> {
    ledger: Arc<EscrowLedger<S>>,
    registry: Arc<OracleRegistry<S>>,
}

impl<S: StateStore + 'static> OracleResolver<S> {
    pub fn new(ledger: Arc<EscrowLedger<S>>, registry: Arc<OracleRegistry<S>>) -> Self {
        Self { ledger, registry }
    }

    /// Open a status request for a registered flight and broadcast it.
    /// An already open request is broadcast again unchanged.
    pub async fn request_status(
        &self,
        caller: &Address,
        requester: &Address,
        flight: FlightRef,
    ) -> SuretyResult<RequestTicket> {
        let mut batch = self.ledger.begin(caller).await?;
        let key = flight_key(&flight);

        if let Some(existing) = self.request(&key).await?.filter(|r| r.is_open) {
            debug!("Re-broadcasting open request for {}", flight);
            batch.emit(SuretyEvent::StatusRequested {
                index: existing.index,
                flight,
            });
            self.ledger.commit(batch).await?;
            return Ok(RequestTicket {
                flight_key: key,
                index: existing.index,
            });
        }

        self.ledger.stage_request_opened(&mut batch, &key).await?;

        let index = self.registry.draw_index(&mut batch, requester);
        batch.put(
            request_key(&key),
            &StatusRequest::new(flight.clone(), index, *requester),
        )?;
        batch.emit(SuretyEvent::StatusRequested {
            index,
            flight: flight.clone(),
        });
        self.ledger.commit(batch).await?;

        info!("Status requested for {} at index {}", flight, index);
        Ok(RequestTicket {
            flight_key: key,
            index,
        })
    }

    /// Record an oracle attestation; the first status reported by
    /// `min_responses` distinct oracles closes the request
    pub async fn submit_response(
        &self,
        caller: &Address,
        oracle: &Address,
        index: OracleIndex,
        flight: FlightRef,
        status: StatusCode,
    ) -> SuretyResult<ResponseOutcome> {
        let mut batch = self.ledger.begin(caller).await?;

        let holds_index = self
            .registry
            .oracle(oracle)
            .await?
            .map(|o| o.holds(index))
            .unwrap_or(false);
        if !holds_index {
            return Err(SuretyError::unauthorized(format!(
                "{} is not a registered oracle holding index {}",
                oracle, index
            )));
        }

        let key = flight_key(&flight);
        let mut request = self
            .request(&key)
            .await?
            .ok_or_else(|| SuretyError::not_found(format!("status request for {}", flight)))?;

        if request.index != index {
            return Err(SuretyError::unauthorized(format!(
                "index {} does not match request index {}",
                index, request.index
            )));
        }

        let count = request.record(*oracle, status);
        batch.emit(SuretyEvent::StatusReported {
            oracle: *oracle,
            flight: flight.clone(),
            status,
        });

        let outcome = match request.resolved {
            Some(resolved) if !request.is_open => {
                debug!("Late response from {} for {}", oracle, flight);
                ResponseOutcome::AlreadyFinalized { status: resolved }
            }
            _ if count >= self.ledger.config().min_responses => {
                request.is_open = false;
                request.resolved = Some(status);
                let credits = self.ledger.stage_resolution(&mut batch, &key, status).await?;
                batch.emit(SuretyEvent::FlightStatusResolved {
                    flight: flight.clone(),
                    status,
                });
                info!(
                    "Flight {} resolved as {} ({} passengers credited)",
                    flight,
                    status,
                    credits.len()
                );
                ResponseOutcome::Finalized { status, credits }
            }
            _ => ResponseOutcome::Recorded { status, count },
        };

        batch.put(request_key(&key), &request)?;
        self.ledger.commit(batch).await?;

        Ok(outcome)
    }

    pub async fn request(&self, flight_key: &FlightKey) -> SuretyResult<Option<StatusRequest>> {
        load_record(self.ledger.state().as_ref(), &request_key(flight_key)).await
    }
}
