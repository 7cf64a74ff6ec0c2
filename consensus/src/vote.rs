//! Vote tally for pending airline candidates

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use surety_core::Address;
use surety_state::Record;

/// Votes collected for one airline candidate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateVotes {
    pub voters: BTreeSet<Address>,
}

impl CandidateVotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vote (returns false if duplicate)
    pub fn add(&mut self, voter: Address) -> bool {
        self.voters.insert(voter)
    }

    pub fn has_voted(&self, voter: &Address) -> bool {
        self.voters.contains(voter)
    }

    /// Check if the admission quorum is reached
    pub fn has_consensus(&self, required: usize) -> bool {
        self.voters.len() >= required
    }

    /// Total votes
    pub fn total(&self) -> usize {
        self.voters.len()
    }
}

impl Record for CandidateVotes {}

/// Votes needed to admit a candidate: half the registered members, rounded up
pub fn required_votes(registered: usize) -> usize {
    registered.div_ceil(2)
}

/// Vote count and threshold of a pending candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateStatus {
    pub votes: usize,
    pub required: usize,
}
