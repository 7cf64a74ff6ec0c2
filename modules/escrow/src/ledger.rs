//! Escrow Ledger - funding, insurance, payout credits and withdrawals

use std::sync::Arc;
use surety_core::{
    Address, Amount, FlightKey, FlightRef, PayoutSink, PremiumPolicy, StateVersion, StatusCode,
    SuretyConfig, SuretyError, SuretyEvent, SuretyResult,
};
use surety_state::{
    airline_key, authorized_key, flight_key, flight_state_key, parse_airline_key, passenger_key,
    policy_key, AirlineState, CallerGrant, FlightState, LedgerMeta, PassengerState, PolicyState,
    Record, StateStore,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::batch::LedgerBatch;

/// A payout credited to one passenger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    pub passenger: Address,
    pub amount: Amount,
}

/// Escrow ledger holding all value movement of the federation
pub struct EscrowLedger<S: StateStore> {
    state: Arc<S>,
    config: SuretyConfig,
    event_tx: Option<mpsc::Sender<SuretyEvent>>,
}

impl<S: StateStore + 'static> EscrowLedger<S> {
    pub fn new(state: Arc<S>, config: SuretyConfig) -> Self {
        Self {
            state,
            config,
            event_tx: None,
        }
    }

    /// Set event channel
    pub fn set_event_channel(&mut self, tx: mpsc::Sender<SuretyEvent>) {
        self.event_tx = Some(tx);
    }

    /// Write the bookkeeping record; fails if the ledger already exists
    pub async fn initialize(&self, owner: Address) -> SuretyResult<()> {
        if self.state.has_meta().await? {
            return Err(SuretyError::invalid_state("ledger already initialized"));
        }

        let batch = {
            let mut batch = LedgerBatch::new(LedgerMeta::new(owner));
            batch.meta_mut();
            batch
        };
        self.commit(batch).await?;

        info!("Escrow ledger initialized, owner {}", owner);
        Ok(())
    }

    // ============ Access ============

    /// Start a mutating call: the ledger must be operational and the caller
    /// an authorized identity
    pub async fn begin(&self, caller: &Address) -> SuretyResult<LedgerBatch> {
        let meta = self.state.get_meta().await?;
        if !meta.operational {
            return Err(SuretyError::NotOperational);
        }
        if !self.state.is_authorized(caller).await? {
            return Err(SuretyError::unauthorized(format!(
                "{} is not an authorized caller",
                caller
            )));
        }
        Ok(LedgerBatch::new(meta))
    }

    /// Apply a staged batch atomically, then publish its events
    pub async fn commit(&self, batch: LedgerBatch) -> SuretyResult<StateVersion> {
        let (changes, events) = batch.into_parts()?;

        let version = if changes.is_empty() {
            self.state.version().await
        } else {
            self.state.apply_batch(changes).await?
        };

        for event in events {
            self.emit_event(event);
        }

        Ok(version)
    }

    /// Toggle the operational flag (owner only, allowed while halted)
    pub async fn set_operational(&self, caller: &Address, operational: bool) -> SuretyResult<()> {
        let meta = self.state.get_meta().await?;
        if *caller != meta.owner {
            return Err(SuretyError::unauthorized(
                "only the ledger owner may change the operational flag",
            ));
        }
        if meta.operational == operational {
            return Ok(());
        }

        let mut batch = LedgerBatch::new(meta);
        batch.meta_mut().operational = operational;
        batch.emit(SuretyEvent::OperationalChanged { operational });
        self.commit(batch).await?;

        warn!("Ledger operational flag set to {}", operational);
        Ok(())
    }

    /// Allow `target` to make mutating calls (owner only)
    pub async fn authorize_caller(&self, caller: &Address, target: &Address) -> SuretyResult<()> {
        let meta = self.owner_call(caller).await?;
        if self.state.is_authorized(target).await? {
            return Ok(());
        }

        let mut batch = LedgerBatch::new(meta);
        batch.put(authorized_key(target), &CallerGrant { granted_by: *caller })?;
        batch.emit(SuretyEvent::CallerAuthorization {
            caller: *target,
            authorized: true,
        });
        self.commit(batch).await?;

        info!("Authorized caller {}", target);
        Ok(())
    }

    /// Revoke a caller grant (owner only)
    pub async fn deauthorize_caller(&self, caller: &Address, target: &Address) -> SuretyResult<()> {
        let meta = self.owner_call(caller).await?;
        if !self.state.is_authorized(target).await? {
            return Ok(());
        }

        let mut batch = LedgerBatch::new(meta);
        batch.delete(authorized_key(target));
        batch.emit(SuretyEvent::CallerAuthorization {
            caller: *target,
            authorized: false,
        });
        self.commit(batch).await?;

        info!("Deauthorized caller {}", target);
        Ok(())
    }

    async fn owner_call(&self, caller: &Address) -> SuretyResult<LedgerMeta> {
        let meta = self.state.get_meta().await?;
        if !meta.operational {
            return Err(SuretyError::NotOperational);
        }
        if *caller != meta.owner {
            return Err(SuretyError::unauthorized("only the ledger owner may manage callers"));
        }
        Ok(meta)
    }

    // ============ Airlines ============

    /// Stage admission of a new airline (`registered`, not yet funded)
    pub async fn stage_airline_admission(
        &self,
        batch: &mut LedgerBatch,
        candidate: &Address,
    ) -> SuretyResult<()> {
        if self.is_airline_registered(candidate).await? {
            return Err(SuretyError::invalid_state(format!(
                "airline {} is already registered",
                candidate
            )));
        }

        batch.put(airline_key(candidate), &AirlineState::admitted())?;
        let meta = batch.meta_mut();
        meta.airline_count += 1;
        let total = meta.airline_count;
        batch.emit(SuretyEvent::AirlineRegistered {
            airline: *candidate,
            total,
        });

        Ok(())
    }

    /// Accumulate airline funding; the airline becomes funded once the
    /// cumulative amount reaches the funding threshold
    pub async fn fund(
        &self,
        caller: &Address,
        airline: &Address,
        amount: Amount,
    ) -> SuretyResult<AirlineState> {
        let mut batch = self.begin(caller).await?;

        if amount.is_zero() {
            return Err(SuretyError::InvalidAmount("funding must be positive".into()));
        }

        let mut record = self
            .state
            .get_airline(airline)
            .await?
            .filter(|a| a.registered)
            .ok_or_else(|| {
                SuretyError::unauthorized(format!("{} is not a registered airline", airline))
            })?;

        record.funded_amount = record
            .funded_amount
            .checked_add(amount)
            .ok_or_else(|| SuretyError::InvalidAmount("funding overflow".into()))?;

        if !record.funded && record.funded_amount >= self.config.funding_threshold() {
            record.funded = true;
            batch.emit(SuretyEvent::AirlineFunded {
                airline: *airline,
                amount: record.funded_amount,
            });
            info!("Airline {} funded with {}", airline, record.funded_amount);
        } else {
            debug!(
                "Airline {} funding now {} (funded={})",
                airline, record.funded_amount, record.funded
            );
        }

        Self::stage_deposit(&mut batch, amount)?;
        batch.put(airline_key(airline), &record)?;
        self.commit(batch).await?;

        Ok(record)
    }

    /// Stage value received by the escrow
    pub fn stage_deposit(batch: &mut LedgerBatch, amount: Amount) -> SuretyResult<()> {
        let meta = batch.meta_mut();
        meta.escrow_balance = meta
            .escrow_balance
            .checked_add(amount)
            .ok_or_else(|| SuretyError::InvalidAmount("escrow overflow".into()))?;
        Ok(())
    }

    // ============ Flights ============

    /// Register a flight of a registered, funded airline
    pub async fn register_flight(
        &self,
        caller: &Address,
        flight: FlightRef,
        price: Amount,
    ) -> SuretyResult<FlightKey> {
        let mut batch = self.begin(caller).await?;

        if !self.is_airline_funded(&flight.airline).await? {
            return Err(SuretyError::unauthorized(format!(
                "airline {} must be registered and funded to register flights",
                flight.airline
            )));
        }
        if flight.code.is_empty() {
            return Err(SuretyError::invalid_state("flight code must not be empty"));
        }
        if price.is_zero() {
            return Err(SuretyError::InvalidAmount("flight price must be positive".into()));
        }

        let key = flight_key(&flight);
        if self.state.get_flight(&key).await?.is_some() {
            return Err(SuretyError::invalid_state(format!(
                "flight {} already registered",
                flight
            )));
        }

        batch.put(flight_state_key(&key), &FlightState::new(flight.clone(), price))?;
        batch.emit(SuretyEvent::FlightRegistered {
            flight: flight.clone(),
            price,
        });
        self.commit(batch).await?;

        info!("Flight registered: {} price={}", flight, price);
        Ok(key)
    }

    /// Stage an outstanding status request on a flight
    pub async fn stage_request_opened(
        &self,
        batch: &mut LedgerBatch,
        flight_key: &FlightKey,
    ) -> SuretyResult<FlightState> {
        let mut flight = self.require_flight(flight_key).await?;
        if flight.is_resolved() {
            return Err(SuretyError::invalid_state(format!(
                "flight {} already resolved as {}",
                flight.flight, flight.status
            )));
        }

        flight.is_open = true;
        batch.put(flight_state_key(flight_key), &flight)?;
        Ok(flight)
    }

    /// Stage the final status of a flight, crediting insured passengers
    /// when the status is an airline-caused delay. Any other status,
    /// `Unknown` included, is final with no monetary effect.
    pub async fn stage_resolution(
        &self,
        batch: &mut LedgerBatch,
        flight_key: &FlightKey,
        status: StatusCode,
    ) -> SuretyResult<Vec<Credit>> {
        let mut flight = self.require_flight(flight_key).await?;
        if flight.is_resolved() {
            return Err(SuretyError::invalid_state(format!(
                "flight {} already resolved as {}",
                flight.flight, flight.status
            )));
        }

        flight.status = status;
        flight.resolved = true;
        flight.is_open = false;

        let credits = if status.triggers_payout() {
            self.stage_payout(batch, flight_key, &mut flight).await?
        } else {
            Vec::new()
        };

        batch.put(flight_state_key(flight_key), &flight)?;
        Ok(credits)
    }

    // ============ Insurance ============

    /// Buy (or top up) insurance on a registered, unresolved flight.
    /// Returns the premium actually insured.
    pub async fn buy_insurance(
        &self,
        caller: &Address,
        passenger: &Address,
        flight_key: &FlightKey,
        premium: Amount,
    ) -> SuretyResult<Amount> {
        let mut batch = self.begin(caller).await?;

        if premium.is_zero() {
            return Err(SuretyError::InvalidAmount("premium must be positive".into()));
        }

        let mut flight = self
            .state
            .get_flight(flight_key)
            .await?
            .filter(|f| f.registered)
            .ok_or_else(|| SuretyError::not_found(format!("flight {}", flight_key)))?;

        if flight.is_resolved() {
            return Err(SuretyError::invalid_state(format!(
                "flight {} already resolved as {}",
                flight.flight, flight.status
            )));
        }

        let insured = self.apply_premium_policy(premium, flight.price)?;

        let mut policy = match self.state.get_policy(flight_key, passenger).await? {
            Some(policy) => policy,
            None => {
                flight.insurees.push(*passenger);
                batch.put(flight_state_key(flight_key), &flight)?;
                PolicyState::default()
            }
        };
        policy.premium_paid = policy
            .premium_paid
            .checked_add(insured)
            .ok_or_else(|| SuretyError::InvalidAmount("premium overflow".into()))?;

        Self::stage_deposit(&mut batch, insured)?;
        batch.put(policy_key(flight_key, passenger), &policy)?;
        batch.emit(SuretyEvent::InsurancePurchased {
            passenger: *passenger,
            flight_key: *flight_key,
            premium: insured,
        });
        self.commit(batch).await?;

        info!(
            "Passenger {} insured {} for {}",
            passenger, insured, flight.flight
        );
        Ok(insured)
    }

    fn apply_premium_policy(&self, premium: Amount, price: Amount) -> SuretyResult<Amount> {
        match self.config.premium_policy {
            PremiumPolicy::Accept => Ok(premium),
            PremiumPolicy::Cap => Ok(premium.min(price)),
            PremiumPolicy::Reject if premium > price => Err(SuretyError::InvalidAmount(format!(
                "premium {} exceeds flight price {}",
                premium, price
            ))),
            PremiumPolicy::Reject => Ok(premium),
        }
    }

    /// Payout owed for a premium
    pub fn payout_for(&self, premium: Amount) -> SuretyResult<Amount> {
        premium
            .checked_percent(self.config.payout_percent)
            .ok_or_else(|| SuretyError::InvalidAmount("payout overflow".into()))
    }

    // ============ Payouts ============

    /// Credit every insured passenger of a flight resolved as an
    /// airline-caused delay. Re-invocation credits nothing.
    pub async fn credit_payout(
        &self,
        caller: &Address,
        flight_key: &FlightKey,
    ) -> SuretyResult<Vec<Credit>> {
        let mut batch = self.begin(caller).await?;

        let mut flight = self.require_flight(flight_key).await?;
        if !flight.status.triggers_payout() {
            return Err(SuretyError::invalid_state(format!(
                "flight {} has status {}, no payout due",
                flight.flight, flight.status
            )));
        }

        let credits = self.stage_payout(&mut batch, flight_key, &mut flight).await?;
        batch.put(flight_state_key(flight_key), &flight)?;
        self.commit(batch).await?;

        Ok(credits)
    }

    async fn stage_payout(
        &self,
        batch: &mut LedgerBatch,
        flight_key: &FlightKey,
        flight: &mut FlightState,
    ) -> SuretyResult<Vec<Credit>> {
        let mut credits = Vec::new();

        if flight.paid_out {
            debug!("Flight {} already paid out", flight.flight);
            return Ok(credits);
        }

        for passenger in &flight.insurees {
            let Some(mut policy) = self.state.get_policy(flight_key, passenger).await? else {
                continue;
            };
            if !policy.payout_credit.is_zero() || policy.premium_paid.is_zero() {
                continue;
            }

            let amount = self.payout_for(policy.premium_paid)?;
            policy.payout_credit = amount;

            let mut account = self.state.get_passenger(passenger).await?;
            account.credit_balance = account
                .credit_balance
                .checked_add(amount)
                .ok_or_else(|| SuretyError::InvalidAmount("credit overflow".into()))?;
            account.total_credited = account.total_credited.saturating_add(amount);

            batch.put(policy_key(flight_key, passenger), &policy)?;
            batch.put(passenger_key(passenger), &account)?;
            batch.emit(SuretyEvent::PassengerCredited {
                passenger: *passenger,
                amount,
            });
            credits.push(Credit {
                passenger: *passenger,
                amount,
            });
        }

        flight.paid_out = true;
        info!(
            "Credited {} passengers of {}",
            credits.len(),
            flight.flight
        );

        Ok(credits)
    }

    /// Pay out a passenger's whole credit balance.
    ///
    /// The balance is zeroed and committed before the external transfer runs;
    /// if the transfer fails the credit is restored.
    pub async fn withdraw(
        &self,
        caller: &Address,
        passenger: &Address,
        sink: &dyn PayoutSink,
    ) -> SuretyResult<Amount> {
        let mut batch = self.begin(caller).await?;

        let mut account = self.state.get_passenger(passenger).await?;
        let amount = account.credit_balance;
        if amount.is_zero() {
            return Err(SuretyError::InsufficientCredit);
        }

        let escrow = batch.meta().escrow_balance;
        let remaining = escrow
            .checked_sub(amount)
            .ok_or(SuretyError::InsufficientFunds {
                required: amount.0,
                available: escrow.0,
            })?;

        batch.meta_mut().escrow_balance = remaining;
        account.credit_balance = Amount::ZERO;
        account.total_withdrawn = account.total_withdrawn.saturating_add(amount);
        batch.put(passenger_key(passenger), &account)?;
        self.commit(batch).await?;

        if let Err(e) = sink.transfer(passenger, amount).await {
            warn!("Transfer of {} to {} failed: {}", amount, passenger, e);
            self.restore_credit(passenger, amount).await?;
            return Err(SuretyError::TransferFailed(e.to_string()));
        }

        self.emit_event(SuretyEvent::Withdrawn {
            passenger: *passenger,
            amount,
        });
        info!("Passenger {} withdrew {}", passenger, amount);

        Ok(amount)
    }

    async fn restore_credit(&self, passenger: &Address, amount: Amount) -> SuretyResult<()> {
        let mut batch = LedgerBatch::new(self.state.get_meta().await?);

        let mut account = self.state.get_passenger(passenger).await?;
        account.credit_balance = account.credit_balance.saturating_add(amount);
        account.total_withdrawn = account.total_withdrawn.saturating_sub(amount);

        let meta = batch.meta_mut();
        meta.escrow_balance = meta.escrow_balance.saturating_add(amount);
        batch.put(passenger_key(passenger), &account)?;
        self.commit(batch).await?;

        Ok(())
    }

    // ============ Queries ============

    pub async fn meta(&self) -> SuretyResult<LedgerMeta> {
        self.state.get_meta().await
    }

    pub async fn is_operational(&self) -> SuretyResult<bool> {
        Ok(self.state.get_meta().await?.operational)
    }

    pub async fn is_authorized(&self, caller: &Address) -> SuretyResult<bool> {
        self.state.is_authorized(caller).await
    }

    pub async fn airline(&self, airline: &Address) -> SuretyResult<Option<AirlineState>> {
        self.state.get_airline(airline).await
    }

    pub async fn is_airline_registered(&self, airline: &Address) -> SuretyResult<bool> {
        Ok(self
            .state
            .get_airline(airline)
            .await?
            .map(|a| a.registered)
            .unwrap_or(false))
    }

    pub async fn is_airline_funded(&self, airline: &Address) -> SuretyResult<bool> {
        Ok(self
            .state
            .get_airline(airline)
            .await?
            .map(|a| a.registered && a.funded)
            .unwrap_or(false))
    }

    pub async fn airline_count(&self) -> SuretyResult<usize> {
        Ok(self.state.get_meta().await?.airline_count)
    }

    /// All registered airlines, ordered by address
    pub async fn registered_airlines(&self) -> SuretyResult<Vec<Address>> {
        let mut airlines = Vec::new();
        for entry in self.state.all_entries().await? {
            let Some(address) = parse_airline_key(&entry.key) else {
                continue;
            };
            if AirlineState::from_bytes(&entry.value)?.registered {
                airlines.push(address);
            }
        }
        airlines.sort();
        Ok(airlines)
    }

    pub async fn flight(&self, flight_key: &FlightKey) -> SuretyResult<Option<FlightState>> {
        self.state.get_flight(flight_key).await
    }

    pub async fn require_flight(&self, flight_key: &FlightKey) -> SuretyResult<FlightState> {
        self.state
            .get_flight(flight_key)
            .await?
            .filter(|f| f.registered)
            .ok_or_else(|| SuretyError::not_found(format!("flight {}", flight_key)))
    }

    pub async fn policy(
        &self,
        flight_key: &FlightKey,
        passenger: &Address,
    ) -> SuretyResult<Option<PolicyState>> {
        self.state.get_policy(flight_key, passenger).await
    }

    /// Payout a policy would receive if the flight is delayed by the airline
    pub async fn coverage(&self, flight_key: &FlightKey, passenger: &Address) -> SuretyResult<Amount> {
        match self.state.get_policy(flight_key, passenger).await? {
            Some(policy) => self.payout_for(policy.premium_paid),
            None => Ok(Amount::ZERO),
        }
    }

    /// Withdrawable credit of a passenger
    pub async fn credit(&self, passenger: &Address) -> SuretyResult<Amount> {
        Ok(self.state.get_passenger(passenger).await?.credit_balance)
    }

    pub async fn passenger(&self, passenger: &Address) -> SuretyResult<PassengerState> {
        self.state.get_passenger(passenger).await
    }

    pub async fn escrow_balance(&self) -> SuretyResult<Amount> {
        Ok(self.state.get_meta().await?.escrow_balance)
    }

    /// Get configuration
    pub fn config(&self) -> &SuretyConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    fn emit_event(&self, event: SuretyEvent) {
        debug!("Event: {}", event.name());
        if let Some(tx) = &self.event_tx {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    warn!("Event queue full, dropped {}", event.name());
                }
                Err(mpsc::error::TrySendError::Closed(event)) => {
                    debug!("Event queue closed, dropped {}", event.name());
                }
            }
        }
    }
}

/// Shared ledger type
pub type SharedLedger<S> = Arc<EscrowLedger<S>>;

/// Create the outbound event channel
pub fn create_event_channel(
    capacity: usize,
) -> (mpsc::Sender<SuretyEvent>, mpsc::Receiver<SuretyEvent>) {
    mpsc::channel(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use surety_core::{StateProvider, SuretyConfig};
    use surety_crypto::keys::KeyPair;
    use surety_state::MemoryStateStore;

    struct Fixture {
        ledger: SharedLedger<MemoryStateStore>,
        owner: Address,
        app: Address,
    }

    async fn setup_ledger_with(config: SuretyConfig) -> Fixture {
        let state = Arc::new(MemoryStateStore::new());
        let ledger = Arc::new(EscrowLedger::new(state, config));

        let owner = KeyPair::generate().address();
        let app = KeyPair::generate().address();

        ledger.initialize(owner).await.unwrap();
        ledger.authorize_caller(&owner, &app).await.unwrap();

        Fixture { ledger, owner, app }
    }

    async fn setup_ledger() -> Fixture {
        setup_ledger_with(SuretyConfig::default()).await
    }

    async fn admit(fx: &Fixture, airline: &Address) {
        let mut batch = fx.ledger.begin(&fx.app).await.unwrap();
        fx.ledger.stage_airline_admission(&mut batch, airline).await.unwrap();
        fx.ledger.commit(batch).await.unwrap();
    }

    /// Funded airline with one registered flight priced at 0.5
    async fn setup_flight(fx: &Fixture) -> (Address, FlightKey) {
        let airline = KeyPair::generate().address();
        admit(fx, &airline).await;
        fx.ledger
            .fund(&fx.app, &airline, Amount::from_units(10))
            .await
            .unwrap();

        let flight = FlightRef::new(airline, "NDB01", 1558232053);
        let key = fx
            .ledger
            .register_flight(&fx.app, flight, Amount::from_milli(500))
            .await
            .unwrap();
        (airline, key)
    }

    async fn resolve(fx: &Fixture, key: &FlightKey, status: StatusCode) -> Vec<Credit> {
        let mut batch = fx.ledger.begin(&fx.app).await.unwrap();
        let credits = fx.ledger.stage_resolution(&mut batch, key, status).await.unwrap();
        fx.ledger.commit(batch).await.unwrap();
        credits
    }

    #[derive(Default)]
    struct RecordingSink {
        paid: Mutex<Vec<(Address, Amount)>>,
    }

    #[async_trait]
    impl PayoutSink for RecordingSink {
        async fn transfer(&self, to: &Address, amount: Amount) -> SuretyResult<()> {
            self.paid.lock().push((*to, amount));
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl PayoutSink for FailingSink {
        async fn transfer(&self, _to: &Address, _amount: Amount) -> SuretyResult<()> {
            Err(SuretyError::Internal("recipient rejected transfer".into()))
        }
    }

    /// Sink that tries to withdraw again from inside the transfer
    struct ReentrantSink {
        ledger: SharedLedger<MemoryStateStore>,
        app: Address,
        transfers: Mutex<Vec<Amount>>,
        reentry: Mutex<Option<SuretyResult<Amount>>>,
    }

    #[async_trait]
    impl PayoutSink for ReentrantSink {
        async fn transfer(&self, to: &Address, amount: Amount) -> SuretyResult<()> {
            self.transfers.lock().push(amount);
            let first = self.reentry.lock().is_none();
            if first {
                let result = self.ledger.withdraw(&self.app, to, self).await;
                *self.reentry.lock() = Some(result);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_initialize_twice_rejected() {
        let fx = setup_ledger().await;
        let result = fx.ledger.initialize(fx.owner).await;
        assert!(matches!(result, Err(SuretyError::InvalidState(_))));
        assert!(fx.ledger.is_operational().await.unwrap());
    }

    #[tokio::test]
    async fn test_funding_threshold_reached_exactly_once() {
        let fx = setup_ledger().await;
        let airline = KeyPair::generate().address();
        admit(&fx, &airline).await;

        let (tx, mut rx) = create_event_channel(16);
        let ledger = {
            let mut ledger = EscrowLedger::new(fx.ledger.state().clone(), SuretyConfig::default());
            ledger.set_event_channel(tx);
            ledger
        };

        let steps = [4u64, 5, 1, 3];
        let expected_funded = [false, false, true, true];
        for (units, expected) in steps.iter().zip(expected_funded) {
            let record = ledger
                .fund(&fx.app, &airline, Amount::from_units(*units))
                .await
                .unwrap();
            assert_eq!(record.funded, expected);
        }

        let record = ledger.airline(&airline).await.unwrap().unwrap();
        assert_eq!(record.funded_amount, Amount::from_units(13));

        let mut funded_events = 0;
        while let Ok(event) = rx.try_recv() {
            if let SuretyEvent::AirlineFunded { amount, .. } = event {
                assert_eq!(amount, Amount::from_units(10));
                funded_events += 1;
            }
        }
        assert_eq!(funded_events, 1);
        assert_eq!(ledger.escrow_balance().await.unwrap(), Amount::from_units(13));
    }

    #[tokio::test]
    async fn test_fund_requires_registered_airline() {
        let fx = setup_ledger().await;
        let stranger = KeyPair::generate().address();

        let result = fx.ledger.fund(&fx.app, &stranger, Amount::from_units(10)).await;
        assert!(matches!(result, Err(SuretyError::Unauthorized(_))));
        assert_eq!(fx.ledger.escrow_balance().await.unwrap(), Amount::ZERO);
    }

    #[tokio::test]
    async fn test_unfunded_airline_cannot_register_flight() {
        let fx = setup_ledger().await;
        let airline = KeyPair::generate().address();
        admit(&fx, &airline).await;
        fx.ledger
            .fund(&fx.app, &airline, Amount::from_units(9))
            .await
            .unwrap();

        let result = fx
            .ledger
            .register_flight(
                &fx.app,
                FlightRef::new(airline, "NDB01", 1558232053),
                Amount::from_milli(500),
            )
            .await;
        assert!(matches!(result, Err(SuretyError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_duplicate_flight_rejected() {
        let fx = setup_ledger().await;
        let (airline, _) = setup_flight(&fx).await;

        let result = fx
            .ledger
            .register_flight(
                &fx.app,
                FlightRef::new(airline, "NDB01", 1558232053),
                Amount::from_milli(500),
            )
            .await;
        assert!(matches!(result, Err(SuretyError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_buy_insurance_rejections() {
        let fx = setup_ledger().await;
        let (_, key) = setup_flight(&fx).await;
        let passenger = KeyPair::generate().address();

        let zero = fx.ledger.buy_insurance(&fx.app, &passenger, &key, Amount::ZERO).await;
        assert!(matches!(zero, Err(SuretyError::InvalidAmount(_))));

        let unknown = surety_core::Hash::from_bytes([9u8; 32]);
        let missing = fx
            .ledger
            .buy_insurance(&fx.app, &passenger, &unknown, Amount::from_milli(100))
            .await;
        assert!(matches!(missing, Err(SuretyError::NotFound(_))));

        resolve(&fx, &key, StatusCode::OnTime).await;
        let resolved = fx
            .ledger
            .buy_insurance(&fx.app, &passenger, &key, Amount::from_milli(100))
            .await;
        assert!(matches!(resolved, Err(SuretyError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_premium_policies() {
        for (policy, expected) in [
            (PremiumPolicy::Accept, Some(Amount::from_milli(800))),
            (PremiumPolicy::Cap, Some(Amount::from_milli(500))),
            (PremiumPolicy::Reject, None),
        ] {
            let config = SuretyConfig {
                premium_policy: policy,
                ..Default::default()
            };
            let fx = setup_ledger_with(config).await;
            let (_, key) = setup_flight(&fx).await;
            let passenger = KeyPair::generate().address();

            let result = fx
                .ledger
                .buy_insurance(&fx.app, &passenger, &key, Amount::from_milli(800))
                .await;
            match expected {
                Some(insured) => {
                    assert_eq!(result.unwrap(), insured);
                    let policy = fx.ledger.policy(&key, &passenger).await.unwrap().unwrap();
                    assert_eq!(policy.premium_paid, insured);
                }
                None => assert!(matches!(result, Err(SuretyError::InvalidAmount(_)))),
            }
        }
    }

    #[tokio::test]
    async fn test_payout_credits_one_and_a_half() {
        let fx = setup_ledger().await;
        let (_, key) = setup_flight(&fx).await;
        let passenger = KeyPair::generate().address();

        fx.ledger
            .buy_insurance(&fx.app, &passenger, &key, Amount::from_milli(100))
            .await
            .unwrap();
        assert_eq!(
            fx.ledger.coverage(&key, &passenger).await.unwrap(),
            Amount::new(150_000_000_000_000_000)
        );
        assert_eq!(fx.ledger.credit(&passenger).await.unwrap(), Amount::ZERO);

        let credits = resolve(&fx, &key, StatusCode::LateAirline).await;
        assert_eq!(
            credits,
            vec![Credit {
                passenger,
                amount: Amount::from_milli(150)
            }]
        );
        assert_eq!(fx.ledger.credit(&passenger).await.unwrap(), Amount::from_milli(150));

        let policy = fx.ledger.policy(&key, &passenger).await.unwrap().unwrap();
        assert_eq!(policy.payout_credit, Amount::from_milli(150));
    }

    #[tokio::test]
    async fn test_non_airline_status_pays_nothing() {
        let fx = setup_ledger().await;
        let (_, key) = setup_flight(&fx).await;
        let passenger = KeyPair::generate().address();
        fx.ledger
            .buy_insurance(&fx.app, &passenger, &key, Amount::from_milli(100))
            .await
            .unwrap();

        let credits = resolve(&fx, &key, StatusCode::LateWeather).await;
        assert!(credits.is_empty());
        assert_eq!(fx.ledger.credit(&passenger).await.unwrap(), Amount::ZERO);

        let direct = fx.ledger.credit_payout(&fx.app, &key).await;
        assert!(matches!(direct, Err(SuretyError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_full_event_queue_does_not_fail_commit() {
        let state = Arc::new(MemoryStateStore::new());
        let mut ledger = EscrowLedger::new(state, SuretyConfig::default());
        let (tx, mut rx) = create_event_channel(1);
        ledger.set_event_channel(tx);

        let owner = KeyPair::generate().address();
        ledger.initialize(owner).await.unwrap();
        ledger.set_operational(&owner, false).await.unwrap();
        ledger.set_operational(&owner, true).await.unwrap();

        assert!(ledger.is_operational().await.unwrap());
        assert!(matches!(
            rx.try_recv(),
            Ok(SuretyEvent::OperationalChanged { operational: false })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_resolution_is_final() {
        let fx = setup_ledger().await;
        let (_, key) = setup_flight(&fx).await;
        let passenger = KeyPair::generate().address();
        fx.ledger
            .buy_insurance(&fx.app, &passenger, &key, Amount::from_milli(100))
            .await
            .unwrap();

        assert!(resolve(&fx, &key, StatusCode::Unknown).await.is_empty());
        let flight = fx.ledger.flight(&key).await.unwrap().unwrap();
        assert!(flight.is_resolved());
        assert_eq!(flight.status, StatusCode::Unknown);

        let buy = fx
            .ledger
            .buy_insurance(&fx.app, &passenger, &key, Amount::from_milli(100))
            .await;
        assert!(matches!(buy, Err(SuretyError::InvalidState(_))));

        let mut batch = fx.ledger.begin(&fx.app).await.unwrap();
        let reopen = fx.ledger.stage_request_opened(&mut batch, &key).await;
        assert!(matches!(reopen, Err(SuretyError::InvalidState(_))));
        let again = fx
            .ledger
            .stage_resolution(&mut batch, &key, StatusCode::LateAirline)
            .await;
        assert!(matches!(again, Err(SuretyError::InvalidState(_))));
        assert_eq!(fx.ledger.credit(&passenger).await.unwrap(), Amount::ZERO);
    }

    #[tokio::test]
    async fn test_credit_payout_is_idempotent() {
        let fx = setup_ledger().await;
        let (_, key) = setup_flight(&fx).await;
        let first = KeyPair::generate().address();
        let second = KeyPair::generate().address();

        for passenger in [&first, &second] {
            fx.ledger
                .buy_insurance(&fx.app, passenger, &key, Amount::from_milli(100))
                .await
                .unwrap();
        }
        // Top-up on an existing policy
        fx.ledger
            .buy_insurance(&fx.app, &second, &key, Amount::from_milli(100))
            .await
            .unwrap();

        let credits = resolve(&fx, &key, StatusCode::LateAirline).await;
        assert_eq!(credits.len(), 2);

        for _ in 0..3 {
            let again = fx.ledger.credit_payout(&fx.app, &key).await.unwrap();
            assert!(again.is_empty());
        }

        assert_eq!(fx.ledger.credit(&first).await.unwrap(), Amount::from_milli(150));
        assert_eq!(fx.ledger.credit(&second).await.unwrap(), Amount::from_milli(300));
    }

    #[tokio::test]
    async fn test_withdraw_flow() {
        let fx = setup_ledger().await;
        let (_, key) = setup_flight(&fx).await;
        let passenger = KeyPair::generate().address();
        fx.ledger
            .buy_insurance(&fx.app, &passenger, &key, Amount::from_milli(100))
            .await
            .unwrap();
        resolve(&fx, &key, StatusCode::LateAirline).await;

        let escrow_before = fx.ledger.escrow_balance().await.unwrap();
        let sink = RecordingSink::default();
        let paid = fx.ledger.withdraw(&fx.app, &passenger, &sink).await.unwrap();

        assert_eq!(paid, Amount::from_milli(150));
        assert_eq!(sink.paid.lock().clone(), vec![(passenger, paid)]);
        assert_eq!(fx.ledger.credit(&passenger).await.unwrap(), Amount::ZERO);
        assert_eq!(
            fx.ledger.escrow_balance().await.unwrap(),
            escrow_before.checked_sub(paid).unwrap()
        );

        let account = fx.ledger.passenger(&passenger).await.unwrap();
        assert_eq!(account.total_withdrawn, paid);
        // Historical credit record is kept
        let policy = fx.ledger.policy(&key, &passenger).await.unwrap().unwrap();
        assert_eq!(policy.payout_credit, paid);

        let again = fx.ledger.withdraw(&fx.app, &passenger, &sink).await;
        assert!(matches!(again, Err(SuretyError::InsufficientCredit)));
        assert_eq!(sink.paid.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_reentrant_withdraw_sees_zero_balance() {
        let fx = setup_ledger().await;
        let (_, key) = setup_flight(&fx).await;
        let passenger = KeyPair::generate().address();
        fx.ledger
            .buy_insurance(&fx.app, &passenger, &key, Amount::from_milli(100))
            .await
            .unwrap();
        resolve(&fx, &key, StatusCode::LateAirline).await;

        let sink = ReentrantSink {
            ledger: fx.ledger.clone(),
            app: fx.app,
            transfers: Mutex::new(Vec::new()),
            reentry: Mutex::new(None),
        };

        let paid = fx.ledger.withdraw(&fx.app, &passenger, &sink).await.unwrap();
        assert_eq!(paid, Amount::from_milli(150));
        assert_eq!(sink.transfers.lock().clone(), vec![paid]);
        assert!(matches!(
            sink.reentry.lock().take(),
            Some(Err(SuretyError::InsufficientCredit))
        ));
        assert_eq!(fx.ledger.credit(&passenger).await.unwrap(), Amount::ZERO);
    }

    #[tokio::test]
    async fn test_failed_transfer_restores_credit() {
        let fx = setup_ledger().await;
        let (_, key) = setup_flight(&fx).await;
        let passenger = KeyPair::generate().address();
        fx.ledger
            .buy_insurance(&fx.app, &passenger, &key, Amount::from_milli(100))
            .await
            .unwrap();
        resolve(&fx, &key, StatusCode::LateAirline).await;
        let escrow_before = fx.ledger.escrow_balance().await.unwrap();

        let result = fx.ledger.withdraw(&fx.app, &passenger, &FailingSink).await;
        assert!(matches!(result, Err(SuretyError::TransferFailed(_))));
        assert_eq!(fx.ledger.credit(&passenger).await.unwrap(), Amount::from_milli(150));
        assert_eq!(fx.ledger.escrow_balance().await.unwrap(), escrow_before);
    }

    #[tokio::test]
    async fn test_not_operational_rejects_and_leaves_state() {
        let fx = setup_ledger().await;
        let (airline, key) = setup_flight(&fx).await;
        let passenger = KeyPair::generate().address();

        fx.ledger.set_operational(&fx.owner, false).await.unwrap();
        let root_before = fx.ledger.state().root().await;

        let fund = fx.ledger.fund(&fx.app, &airline, Amount::from_units(1)).await;
        assert!(matches!(fund, Err(SuretyError::NotOperational)));
        let buy = fx
            .ledger
            .buy_insurance(&fx.app, &passenger, &key, Amount::from_milli(100))
            .await;
        assert!(matches!(buy, Err(SuretyError::NotOperational)));
        let withdraw = fx
            .ledger
            .withdraw(&fx.app, &passenger, &RecordingSink::default())
            .await;
        assert!(matches!(withdraw, Err(SuretyError::NotOperational)));
        let authorize = fx.ledger.authorize_caller(&fx.owner, &passenger).await;
        assert!(matches!(authorize, Err(SuretyError::NotOperational)));

        assert_eq!(fx.ledger.state().root().await, root_before);

        fx.ledger.set_operational(&fx.owner, true).await.unwrap();
        fx.ledger
            .buy_insurance(&fx.app, &passenger, &key, Amount::from_milli(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_owner_only_administration() {
        let fx = setup_ledger().await;
        let intruder = KeyPair::generate().address();

        let toggle = fx.ledger.set_operational(&intruder, false).await;
        assert!(matches!(toggle, Err(SuretyError::Unauthorized(_))));
        assert!(fx.ledger.is_operational().await.unwrap());

        let grant = fx.ledger.authorize_caller(&intruder, &intruder).await;
        assert!(matches!(grant, Err(SuretyError::Unauthorized(_))));
        assert!(!fx.ledger.is_authorized(&intruder).await.unwrap());
    }

    #[tokio::test]
    async fn test_unauthorized_caller_rejected() {
        let fx = setup_ledger().await;
        let (airline, _) = setup_flight(&fx).await;
        let other = KeyPair::generate().address();

        let result = fx.ledger.fund(&other, &airline, Amount::from_units(1)).await;
        assert!(matches!(result, Err(SuretyError::Unauthorized(_))));

        fx.ledger.deauthorize_caller(&fx.owner, &fx.app).await.unwrap();
        let revoked = fx.ledger.fund(&fx.app, &airline, Amount::from_units(1)).await;
        assert!(matches!(revoked, Err(SuretyError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_registered_airlines_listing() {
        let fx = setup_ledger().await;
        let mut expected = Vec::new();
        for _ in 0..3 {
            let airline = KeyPair::generate().address();
            admit(&fx, &airline).await;
            expected.push(airline);
        }
        expected.sort();

        assert_eq!(fx.ledger.registered_airlines().await.unwrap(), expected);
        assert_eq!(fx.ledger.airline_count().await.unwrap(), 3);
    }
}
