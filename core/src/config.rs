//! Configuration types for the flight surety ledger

use serde::{Deserialize, Serialize};

use crate::error::SuretyError;
use crate::types::Amount;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name for logging
    pub name: String,

    /// Logging level
    pub log_level: String,

    /// Capacity of the outbound event queue
    pub event_buffer: usize,

    /// Protocol parameters
    #[serde(default)]
    pub surety: SuretyConfig,

    /// Simulated oracle fleet
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "surety-node".to_string(),
            log_level: "info".to_string(),
            event_buffer: 1024,
            surety: SuretyConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn to_json(&self) -> Result<String, SuretyError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SuretyError> {
        let config: NodeConfig = serde_json::from_str(json)
            .map_err(|e| SuretyError::DeserializationError(e.to_string()))?;
        config.surety.validate()?;
        Ok(config)
    }
}

/// How a premium above the listed flight price is treated at purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PremiumPolicy {
    /// Accept the premium as paid
    #[default]
    Accept,
    /// Insure at most the listed price
    Cap,
    /// Reject the purchase
    Reject,
}

/// Protocol parameters of the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuretyConfig {
    /// Cumulative funding an airline needs before it may act
    pub funding_threshold: u128,

    /// Stake an oracle pays to register
    pub registration_fee: u128,

    /// Payout as a percentage of the premium paid
    pub payout_percent: u32,

    /// Matching attestations needed to close a status request
    pub min_responses: usize,

    /// Size of the oracle index space `[0, index_space)`
    pub index_space: u8,

    /// Registered airlines at which admission switches to voting
    pub consensus_membership: usize,

    /// Treatment of premiums above the flight price
    pub premium_policy: PremiumPolicy,

    /// Seed mixed into oracle index sampling
    pub index_seed: u64,
}

impl Default for SuretyConfig {
    fn default() -> Self {
        Self {
            funding_threshold: Amount::from_units(10).0,
            registration_fee: Amount::from_units(10).0,
            payout_percent: 150,
            min_responses: 3,
            index_space: 10,
            consensus_membership: 4,
            premium_policy: PremiumPolicy::Accept,
            index_seed: 0,
        }
    }
}

impl SuretyConfig {
    pub fn funding_threshold(&self) -> Amount {
        Amount::new(self.funding_threshold)
    }

    pub fn registration_fee(&self) -> Amount {
        Amount::new(self.registration_fee)
    }

    pub fn validate(&self) -> Result<(), SuretyError> {
        if self.index_space == 0 {
            return Err(SuretyError::ConfigError("index_space must be >= 1".into()));
        }
        if self.min_responses == 0 {
            return Err(SuretyError::ConfigError("min_responses must be >= 1".into()));
        }
        if self.consensus_membership == 0 {
            return Err(SuretyError::ConfigError(
                "consensus_membership must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Simulated oracle fleet driven by the node binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of oracles registered at startup
    pub oracle_count: usize,

    /// Number of insured passengers per flight
    pub passengers_per_flight: usize,

    /// Flight codes registered by the first airline
    pub flights: Vec<String>,

    /// Status every oracle reports; random when unset
    pub reported_status: Option<u8>,

    /// Premium paid by every passenger, in thousandths of a unit
    pub premium_milli: u64,

    /// Listed flight price, in thousandths of a unit
    pub price_milli: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            oracle_count: 20,
            passengers_per_flight: 3,
            flights: vec!["NDB01".to_string(), "ND1309".to_string()],
            reported_status: None,
            premium_milli: 100,
            price_milli: 500,
        }
    }
}
