//! Runtime builder

use std::sync::Arc;
use surety_consensus::{HashSampler, IndexSampler};
use surety_core::{NodeConfig, SuretyEvent, SuretyResult};
use surety_crypto::keys::{derive_account, KeyPair};
use surety_escrow::GenesisConfig;
use tokio::sync::mpsc;

use crate::runtime::SuretyRuntime;

/// Builder for a runtime and its event receiver
pub struct RuntimeBuilder {
    config: NodeConfig,
    app: Option<KeyPair>,
    sampler: Option<Arc<dyn IndexSampler>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            app: None,
            sampler: None,
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the ledger on the protocol parameters fixed by `genesis`
    pub fn genesis(mut self, genesis: &GenesisConfig) -> Self {
        self.config.surety = genesis.surety.clone();
        self
    }

    /// Identity the runtime calls the ledger with
    pub fn app(mut self, app: KeyPair) -> Self {
        self.app = Some(app);
        self
    }

    pub fn sampler(mut self, sampler: Arc<dyn IndexSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn build(self) -> SuretyResult<(SuretyRuntime, mpsc::Receiver<SuretyEvent>)> {
        self.config.surety.validate()?;
        let app = self.app.unwrap_or_else(|| derive_account("app", 0));
        let sampler = self.sampler.unwrap_or_else(|| Arc::new(HashSampler));
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let runtime = SuretyRuntime::new(self.config, app, sampler, tx)?;
        Ok((runtime, rx))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
