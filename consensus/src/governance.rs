//! Airline admission state machine

use std::sync::Arc;
use surety_core::{Address, SuretyError, SuretyEvent, SuretyResult};
use surety_escrow::{EscrowLedger, LedgerBatch};
use surety_state::{candidate_key, load_record, StateStore};
use tracing::{debug, info};

use crate::vote::{required_votes, CandidateStatus, CandidateVotes};

/// Admission regime, derived from the number of registered airlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernancePhase {
    /// No members yet, the ledger owner admits the first airline
    Bootstrap,
    /// A single funded member admits a candidate
    Direct,
    /// Funded members vote, half of the membership (rounded up) admits
    Consensus,
}

impl GovernancePhase {
    pub fn for_count(registered: usize, consensus_membership: usize) -> Self {
        if registered == 0 {
            GovernancePhase::Bootstrap
        } else if registered < consensus_membership {
            GovernancePhase::Direct
        } else {
            GovernancePhase::Consensus
        }
    }
}

/// Result of a registration call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Candidate admitted, `total` airlines now registered
    Admitted { total: usize },
    /// Vote recorded, candidate still pending
    VoteRecorded { votes: usize, required: usize },
}

impl AdmissionOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionOutcome::Admitted { .. })
    }
}

/// Governance over airline membership
pub struct AirlineGovernance<S: StateStore> {
    ledger: Arc<EscrowLedger<S>>,
}

impl<S: StateStore + 'static> AirlineGovernance<S> {
    pub fn new(ledger: Arc<EscrowLedger<S>>) -> Self {
        Self { ledger }
    }

    /// Current admission regime
    pub async fn phase(&self) -> SuretyResult<GovernancePhase> {
        let count = self.ledger.airline_count().await?;
        Ok(GovernancePhase::for_count(
            count,
            self.ledger.config().consensus_membership,
        ))
    }

    /// Propose `candidate` for membership on behalf of `proposer`
    pub async fn register_airline(
        &self,
        caller: &Address,
        candidate: &Address,
        proposer: &Address,
    ) -> SuretyResult<AdmissionOutcome> {
        let mut batch = self.ledger.begin(caller).await?;

        if self.ledger.is_airline_registered(candidate).await? {
            return Err(SuretyError::invalid_state(format!(
                "airline {} is already registered",
                candidate
            )));
        }

        let count = batch.meta().airline_count;
        let phase = GovernancePhase::for_count(count, self.ledger.config().consensus_membership);
        debug!(
            "Admission of {} proposed by {} in phase {:?}",
            candidate, proposer, phase
        );

        let outcome = match phase {
            GovernancePhase::Bootstrap => {
                if *proposer != batch.meta().owner {
                    return Err(SuretyError::unauthorized(
                        "only the ledger owner may admit the first airline",
                    ));
                }
                self.admit(&mut batch, candidate).await?
            }
            GovernancePhase::Direct => {
                self.require_funded_member(proposer).await?;
                self.admit(&mut batch, candidate).await?
            }
            GovernancePhase::Consensus => {
                self.require_funded_member(proposer).await?;
                self.vote(&mut batch, candidate, proposer, count).await?
            }
        };

        self.ledger.commit(batch).await?;
        Ok(outcome)
    }

    async fn require_funded_member(&self, proposer: &Address) -> SuretyResult<()> {
        if !self.ledger.is_airline_funded(proposer).await? {
            return Err(SuretyError::unauthorized(format!(
                "proposer {} must be a registered, funded airline",
                proposer
            )));
        }
        Ok(())
    }

    async fn admit(
        &self,
        batch: &mut LedgerBatch,
        candidate: &Address,
    ) -> SuretyResult<AdmissionOutcome> {
        self.ledger.stage_airline_admission(batch, candidate).await?;
        let total = batch.meta().airline_count;
        info!("Airline {} admitted, {} registered", candidate, total);
        Ok(AdmissionOutcome::Admitted { total })
    }

    async fn vote(
        &self,
        batch: &mut LedgerBatch,
        candidate: &Address,
        proposer: &Address,
        registered: usize,
    ) -> SuretyResult<AdmissionOutcome> {
        let mut votes = self.candidate_votes(candidate).await?.unwrap_or_default();
        if votes.has_voted(proposer) {
            return Err(SuretyError::invalid_state(format!(
                "{} already voted for {}",
                proposer, candidate
            )));
        }
        votes.add(*proposer);

        let required = required_votes(registered);
        batch.emit(SuretyEvent::AirlineVoteRecorded {
            candidate: *candidate,
            voter: *proposer,
            votes: votes.total(),
            required,
        });

        if votes.has_consensus(required) {
            batch.delete(candidate_key(candidate));
            return self.admit(batch, candidate).await;
        }

        debug!(
            "Candidate {} has {}/{} votes",
            candidate,
            votes.total(),
            required
        );
        batch.put(candidate_key(candidate), &votes)?;
        Ok(AdmissionOutcome::VoteRecorded {
            votes: votes.total(),
            required,
        })
    }

    async fn candidate_votes(&self, candidate: &Address) -> SuretyResult<Option<CandidateVotes>> {
        load_record(self.ledger.state().as_ref(), &candidate_key(candidate)).await
    }

    /// Votes and current threshold of a pending candidate
    pub async fn pending_candidate(
        &self,
        candidate: &Address,
    ) -> SuretyResult<Option<CandidateStatus>> {
        let Some(votes) = self.candidate_votes(candidate).await? else {
            return Ok(None);
        };
        let registered = self.ledger.airline_count().await?;
        Ok(Some(CandidateStatus {
            votes: votes.total(),
            required: required_votes(registered),
        }))
    }
}
