//! Genesis configuration for the escrow ledger

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use surety_core::{Address, SuretyConfig, SuretyError, SuretyResult};
use surety_state::StateStore;
use tracing::info;

use crate::ledger::EscrowLedger;

/// Genesis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Deployment name
    pub chain_name: String,
    /// Ledger owner (hex address)
    pub owner: String,
    /// Identities allowed to make mutating calls (hex addresses)
    #[serde(default)]
    pub authorized_callers: Vec<String>,
    /// Airline admitted by the owner right after genesis
    #[serde(default)]
    pub first_airline: Option<String>,
    /// Protocol parameters
    #[serde(default)]
    pub surety: SuretyConfig,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            chain_name: "Flight Surety".to_string(),
            owner: Address::ZERO.to_hex(),
            authorized_callers: vec![],
            first_airline: None,
            surety: SuretyConfig::default(),
        }
    }
}

impl GenesisConfig {
    /// Create a devnet genesis config for development
    pub fn devnet(owner: &Address) -> Self {
        Self {
            chain_name: "Flight Surety Devnet".to_string(),
            owner: owner.to_hex(),
            ..Default::default()
        }
    }

    /// Add an authorized caller
    pub fn add_caller(mut self, address: &Address) -> Self {
        self.authorized_callers.push(address.to_hex());
        self
    }

    /// Set the first airline
    pub fn with_first_airline(mut self, address: &Address) -> Self {
        self.first_airline = Some(address.to_hex());
        self
    }

    pub fn with_surety(mut self, surety: SuretyConfig) -> Self {
        self.surety = surety;
        self
    }

    pub fn parse_owner(&self) -> SuretyResult<Address> {
        parse_address(&self.owner)
    }

    pub fn parse_callers(&self) -> SuretyResult<Vec<Address>> {
        self.authorized_callers
            .iter()
            .map(|s| parse_address(s))
            .collect()
    }

    pub fn parse_first_airline(&self) -> SuretyResult<Option<Address>> {
        self.first_airline.as_deref().map(parse_address).transpose()
    }

    /// Save to JSON
    pub fn to_json(&self) -> SuretyResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SuretyError::SerializationError(e.to_string()))
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> SuretyResult<Self> {
        let config: GenesisConfig = serde_json::from_str(json)
            .map_err(|e| SuretyError::DeserializationError(e.to_string()))?;
        config.surety.validate()?;
        Ok(config)
    }
}

fn parse_address(s: &str) -> SuretyResult<Address> {
    Address::from_hex(s).map_err(|e| SuretyError::InvalidAddress(format!("{}: {}", s, e)))
}

/// Initialize genesis state
pub struct GenesisInitializer<S: StateStore> {
    ledger: Arc<EscrowLedger<S>>,
    config: GenesisConfig,
}

impl<S: StateStore + 'static> GenesisInitializer<S> {
    pub fn new(ledger: Arc<EscrowLedger<S>>, config: GenesisConfig) -> Self {
        Self { ledger, config }
    }

    /// Write the ledger bookkeeping and the initial caller grants.
    /// The ledger must run on the protocol parameters the genesis names.
    pub async fn initialize(&self) -> SuretyResult<Address> {
        info!("Initializing genesis for: {}", self.config.chain_name);

        self.config.surety.validate()?;
        if self.config.surety != *self.ledger.config() {
            return Err(SuretyError::ConfigError(
                "genesis protocol parameters differ from the ledger's".into(),
            ));
        }

        let owner = self.config.parse_owner()?;
        let callers = self.config.parse_callers()?;
        let genesis_hash = compute_genesis_hash(&self.config)?;

        self.ledger.initialize(owner).await?;

        for caller in &callers {
            self.ledger.authorize_caller(&owner, caller).await?;
            info!("Genesis caller: {}", caller);
        }

        info!("Genesis complete, owner {} hash {}", owner, genesis_hash);
        Ok(owner)
    }
}

/// Genesis hash computation
pub fn compute_genesis_hash(config: &GenesisConfig) -> SuretyResult<surety_core::Hash> {
    let json = config.to_json()?;
    Ok(surety_crypto::hashing::hash(json.as_bytes()))
}
