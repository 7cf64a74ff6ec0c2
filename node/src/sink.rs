//! Payout sink recording every outbound transfer

use async_trait::async_trait;
use dashmap::DashMap;
use surety_core::{Address, Amount, PayoutSink, SuretyResult};
use tracing::info;

/// Stands in for the external value transfer; keeps per-recipient totals
#[derive(Debug, Default)]
pub struct RecordingPayoutSink {
    paid: DashMap<Address, Amount>,
}

impl RecordingPayoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total transferred to `recipient`
    pub fn paid_to(&self, recipient: &Address) -> Amount {
        self.paid.get(recipient).map(|v| *v).unwrap_or(Amount::ZERO)
    }

    pub fn total_paid(&self) -> Amount {
        self.paid
            .iter()
            .fold(Amount::ZERO, |acc, entry| acc.saturating_add(*entry.value()))
    }
}

#[async_trait]
impl PayoutSink for RecordingPayoutSink {
    async fn transfer(&self, to: &Address, amount: Amount) -> SuretyResult<()> {
        {
            let mut entry = self.paid.entry(*to).or_insert(Amount::ZERO);
            let total = entry.saturating_add(amount);
            *entry = total;
        }
        info!("Transferred {} to {}", amount, to);
        Ok(())
    }
}
