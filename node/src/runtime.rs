//! Runtime facade combining all components

use std::sync::Arc;
use surety_consensus::{
    AdmissionOutcome, AirlineGovernance, CandidateStatus, IndexSampler, OracleRegistry,
    OracleResolver, RequestTicket, ResponseOutcome,
};
use surety_core::{
    Address, Amount, FlightKey, FlightRef, NodeConfig, OracleIndex, StateProvider, StateRoot,
    StateVersion, StatusCode, SuretyEvent, SuretyResult,
};
use surety_crypto::keys::KeyPair;
use surety_escrow::{EscrowLedger, GenesisConfig, GenesisInitializer};
use surety_state::{
    create_memory_store, flight_key, AirlineState, FlightState, MemoryStateStore,
    SharedMemoryStateStore,
};
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::sink::RecordingPayoutSink;

/// Runtime holding the ledger and acting as its authorized caller
///
/// Mutating calls are serialized through one sequencer, so they are applied
/// strictly one at a time in arrival order.
pub struct SuretyRuntime {
    config: NodeConfig,
    app: KeyPair,
    state: SharedMemoryStateStore,
    ledger: Arc<EscrowLedger<MemoryStateStore>>,
    governance: AirlineGovernance<MemoryStateStore>,
    registry: Arc<OracleRegistry<MemoryStateStore>>,
    resolver: OracleResolver<MemoryStateStore>,
    sink: RecordingPayoutSink,
    sequencer: Mutex<()>,
}

impl SuretyRuntime {
    /// Create a new runtime publishing events to `event_tx`
    pub fn new(
        config: NodeConfig,
        app: KeyPair,
        sampler: Arc<dyn IndexSampler>,
        event_tx: mpsc::Sender<SuretyEvent>,
    ) -> SuretyResult<Self> {
        config.surety.validate()?;
        let state = create_memory_store();

        let mut ledger = EscrowLedger::new(state.clone(), config.surety.clone());
        ledger.set_event_channel(event_tx);
        let ledger = Arc::new(ledger);

        let governance = AirlineGovernance::new(ledger.clone());
        let registry = Arc::new(OracleRegistry::with_sampler(ledger.clone(), sampler));
        let resolver = OracleResolver::new(ledger.clone(), registry.clone());

        Ok(Self {
            config,
            app,
            state,
            ledger,
            governance,
            registry,
            resolver,
            sink: RecordingPayoutSink::new(),
            sequencer: Mutex::new(()),
        })
    }

    /// Initialize genesis state: owner, caller grants (this runtime included)
    /// and the first airline, admitted by the owner
    pub async fn initialize_genesis(&self, genesis: GenesisConfig) -> SuretyResult<Address> {
        let _guard = self.sequencer.lock().await;

        let mut genesis = genesis;
        let app = self.app_address();
        if !genesis.parse_callers()?.contains(&app) {
            genesis = genesis.add_caller(&app);
        }
        let first_airline = genesis.parse_first_airline()?;

        let initializer = GenesisInitializer::new(self.ledger.clone(), genesis);
        let owner = initializer.initialize().await?;

        if let Some(airline) = first_airline {
            self.governance
                .register_airline(&app, &airline, &owner)
                .await?;
            info!("Genesis airline: {}", airline);
        }

        Ok(owner)
    }

    // ============ Airlines ============

    pub async fn register_airline(
        &self,
        candidate: &Address,
        proposer: &Address,
    ) -> SuretyResult<AdmissionOutcome> {
        let _guard = self.sequencer.lock().await;
        self.governance
            .register_airline(&self.app_address(), candidate, proposer)
            .await
    }

    pub async fn fund(&self, airline: &Address, amount: Amount) -> SuretyResult<AirlineState> {
        let _guard = self.sequencer.lock().await;
        self.ledger.fund(&self.app_address(), airline, amount).await
    }

    pub async fn register_flight(
        &self,
        airline: &Address,
        code: &str,
        departure: u64,
        price: Amount,
    ) -> SuretyResult<FlightKey> {
        let _guard = self.sequencer.lock().await;
        self.ledger
            .register_flight(&self.app_address(), FlightRef::new(*airline, code, departure), price)
            .await
    }

    // ============ Passengers ============

    /// Buy insurance on a flight, returns the insured premium
    pub async fn buy(
        &self,
        passenger: &Address,
        airline: &Address,
        code: &str,
        departure: u64,
        premium: Amount,
    ) -> SuretyResult<Amount> {
        let _guard = self.sequencer.lock().await;
        let key = flight_key(&FlightRef::new(*airline, code, departure));
        self.ledger
            .buy_insurance(&self.app_address(), passenger, &key, premium)
            .await
    }

    /// Withdraw the passenger's whole credit through the payout sink
    pub async fn withdraw(&self, passenger: &Address) -> SuretyResult<Amount> {
        let _guard = self.sequencer.lock().await;
        self.ledger
            .withdraw(&self.app_address(), passenger, &self.sink)
            .await
    }

    pub async fn get_credit(&self, passenger: &Address) -> SuretyResult<Amount> {
        self.ledger.credit(passenger).await
    }

    /// Payout the passenger would receive on an airline-caused delay
    pub async fn subscribed_insurance(
        &self,
        airline: &Address,
        code: &str,
        departure: u64,
        passenger: &Address,
    ) -> SuretyResult<Amount> {
        let key = flight_key(&FlightRef::new(*airline, code, departure));
        self.ledger.coverage(&key, passenger).await
    }

    // ============ Oracles ============

    pub async fn register_oracle(
        &self,
        oracle: &Address,
        fee: Amount,
    ) -> SuretyResult<[OracleIndex; 3]> {
        let _guard = self.sequencer.lock().await;
        self.registry
            .register_oracle(&self.app_address(), oracle, fee)
            .await
    }

    pub async fn get_my_indexes(&self, oracle: &Address) -> SuretyResult<[OracleIndex; 3]> {
        self.registry.get_my_indexes(oracle).await
    }

    /// Open (or re-broadcast) a status request for a flight
    pub async fn fetch_flight_status(
        &self,
        requester: &Address,
        airline: &Address,
        code: &str,
        departure: u64,
    ) -> SuretyResult<RequestTicket> {
        let _guard = self.sequencer.lock().await;
        self.resolver
            .request_status(
                &self.app_address(),
                requester,
                FlightRef::new(*airline, code, departure),
            )
            .await
    }

    /// Submit an oracle attestation with a raw status code
    pub async fn submit_oracle_response(
        &self,
        oracle: &Address,
        index: OracleIndex,
        airline: &Address,
        code: &str,
        departure: u64,
        status: u8,
    ) -> SuretyResult<ResponseOutcome> {
        let status = StatusCode::try_from(status)?;
        let _guard = self.sequencer.lock().await;
        self.resolver
            .submit_response(
                &self.app_address(),
                oracle,
                index,
                FlightRef::new(*airline, code, departure),
                status,
            )
            .await
    }

    // ============ Administration ============

    pub async fn set_operational(&self, owner: &Address, operational: bool) -> SuretyResult<()> {
        let _guard = self.sequencer.lock().await;
        self.ledger.set_operational(owner, operational).await
    }

    pub async fn is_operational(&self) -> SuretyResult<bool> {
        self.ledger.is_operational().await
    }

    pub async fn authorize_caller(&self, owner: &Address, target: &Address) -> SuretyResult<()> {
        let _guard = self.sequencer.lock().await;
        self.ledger.authorize_caller(owner, target).await
    }

    pub async fn deauthorize_caller(&self, owner: &Address, target: &Address) -> SuretyResult<()> {
        let _guard = self.sequencer.lock().await;
        self.ledger.deauthorize_caller(owner, target).await
    }

    // ============ Queries ============

    pub async fn airline(&self, airline: &Address) -> SuretyResult<Option<AirlineState>> {
        self.ledger.airline(airline).await
    }

    pub async fn is_airline_registered(&self, airline: &Address) -> SuretyResult<bool> {
        self.ledger.is_airline_registered(airline).await
    }

    pub async fn is_airline_funded(&self, airline: &Address) -> SuretyResult<bool> {
        self.ledger.is_airline_funded(airline).await
    }

    pub async fn total_airlines(&self) -> SuretyResult<usize> {
        self.ledger.airline_count().await
    }

    pub async fn registered_airlines(&self) -> SuretyResult<Vec<Address>> {
        self.ledger.registered_airlines().await
    }

    pub async fn pending_candidate(
        &self,
        candidate: &Address,
    ) -> SuretyResult<Option<CandidateStatus>> {
        self.governance.pending_candidate(candidate).await
    }

    pub fn get_flight_key(&self, airline: &Address, code: &str, departure: u64) -> FlightKey {
        flight_key(&FlightRef::new(*airline, code, departure))
    }

    pub async fn flight(&self, flight_key: &FlightKey) -> SuretyResult<Option<FlightState>> {
        self.ledger.flight(flight_key).await
    }

    pub fn registration_fee(&self) -> Amount {
        self.config.surety.registration_fee()
    }

    pub async fn escrow_balance(&self) -> SuretyResult<Amount> {
        self.ledger.escrow_balance().await
    }

    /// Get current state version
    pub async fn state_version(&self) -> StateVersion {
        self.state.version().await
    }

    /// Get current state root
    pub async fn state_root(&self) -> StateRoot {
        self.state.root().await
    }

    /// Identity the ledger knows this runtime by
    pub fn app_address(&self) -> Address {
        self.app.address()
    }

    pub fn sink(&self) -> &RecordingPayoutSink {
        &self.sink
    }

    /// Get config reference
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Get ledger reference
    pub fn ledger(&self) -> &Arc<EscrowLedger<MemoryStateStore>> {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use surety_core::SuretyError;
    use surety_crypto::keys::derive_account;

    /// Every draw lands on the same index
    struct FixedSampler(OracleIndex);

    impl IndexSampler for FixedSampler {
        fn sample(&self, _: u64, _: u64, _: &Address, _: u8) -> OracleIndex {
            self.0
        }
    }

    const DEPARTURE: u64 = 1558232053;

    struct Harness {
        runtime: SuretyRuntime,
        events: mpsc::Receiver<SuretyEvent>,
        owner: Address,
        first_airline: Address,
    }

    async fn create_test_runtime(index: OracleIndex) -> Harness {
        let config = NodeConfig::default();
        let (tx, events) = mpsc::channel(config.event_buffer);
        let runtime = SuretyRuntime::new(
            config,
            derive_account("app", 0),
            Arc::new(FixedSampler(index)),
            tx,
        )
        .unwrap();

        let owner = derive_account("owner", 0).address();
        let first_airline = derive_account("airline", 0).address();
        let genesis = GenesisConfig::devnet(&owner).with_first_airline(&first_airline);
        assert_eq!(runtime.initialize_genesis(genesis).await.unwrap(), owner);

        Harness {
            runtime,
            events,
            owner,
            first_airline,
        }
    }

    /// First airline funded with NDB01 registered at 0.5
    async fn create_flight_runtime(index: OracleIndex) -> Harness {
        let h = create_test_runtime(index).await;
        h.runtime
            .fund(&h.first_airline, Amount::from_units(10))
            .await
            .unwrap();
        h.runtime
            .register_flight(&h.first_airline, "NDB01", DEPARTURE, Amount::from_milli(500))
            .await
            .unwrap();
        h
    }

    async fn register_oracles(runtime: &SuretyRuntime, count: u64) -> Vec<Address> {
        let mut oracles = Vec::new();
        for i in 0..count {
            let oracle = derive_account("oracle", i).address();
            runtime
                .register_oracle(&oracle, runtime.registration_fee())
                .await
                .unwrap();
            oracles.push(oracle);
        }
        oracles
    }

    fn drain(events: &mut mpsc::Receiver<SuretyEvent>) -> Vec<SuretyEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    /// All orderings of `items`
    fn permutations(items: &[u8]) -> Vec<Vec<u8>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_genesis_state() {
        let mut h = create_test_runtime(0).await;

        assert!(h.runtime.is_operational().await.unwrap());
        assert_eq!(h.runtime.total_airlines().await.unwrap(), 1);
        assert!(h.runtime.is_airline_registered(&h.first_airline).await.unwrap());
        assert!(!h.runtime.is_airline_funded(&h.first_airline).await.unwrap());
        assert_eq!(h.runtime.registration_fee(), Amount::from_units(10));

        let events = drain(&mut h.events);
        assert!(events.contains(&SuretyEvent::AirlineRegistered {
            airline: h.first_airline,
            total: 1
        }));
    }

    #[tokio::test]
    async fn test_delayed_flight_pays_and_withdraws() {
        let mut h = create_flight_runtime(4).await;
        let passenger = derive_account("passenger", 0).address();

        h.runtime
            .buy(&passenger, &h.first_airline, "NDB01", DEPARTURE, Amount::from_milli(100))
            .await
            .unwrap();
        assert_eq!(
            h.runtime
                .subscribed_insurance(&h.first_airline, "NDB01", DEPARTURE, &passenger)
                .await
                .unwrap(),
            Amount::from_milli(150)
        );

        let oracles = register_oracles(&h.runtime, 3).await;
        assert_eq!(h.runtime.get_my_indexes(&oracles[0]).await.unwrap(), [4, 4, 4]);

        let ticket = h
            .runtime
            .fetch_flight_status(&passenger, &h.first_airline, "NDB01", DEPARTURE)
            .await
            .unwrap();
        assert_eq!(ticket.index, 4);

        let mut last = None;
        for oracle in &oracles {
            last = Some(
                h.runtime
                    .submit_oracle_response(oracle, 4, &h.first_airline, "NDB01", DEPARTURE, 20)
                    .await
                    .unwrap(),
            );
        }
        assert!(matches!(
            last,
            Some(ResponseOutcome::Finalized {
                status: StatusCode::LateAirline,
                ..
            })
        ));
        assert_eq!(h.runtime.get_credit(&passenger).await.unwrap(), Amount::from_milli(150));

        let paid = h.runtime.withdraw(&passenger).await.unwrap();
        assert_eq!(paid, Amount::from_milli(150));
        assert_eq!(h.runtime.get_credit(&passenger).await.unwrap(), Amount::ZERO);
        assert_eq!(h.runtime.sink().paid_to(&passenger), paid);

        let events = drain(&mut h.events);
        let names: Vec<&str> = events.iter().map(SuretyEvent::name).collect();
        for expected in [
            "AirlineFunded",
            "FlightRegistered",
            "InsurancePurchased",
            "StatusRequested",
            "StatusReported",
            "FlightStatusResolved",
            "PassengerCredited",
            "Withdrawn",
        ] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
    }

    #[tokio::test]
    async fn test_fifth_airline_admitted_by_second_vote() {
        let h = create_test_runtime(0).await;
        let mut airlines = vec![h.first_airline];
        h.runtime
            .fund(&h.first_airline, Amount::from_units(10))
            .await
            .unwrap();

        for i in 1..4 {
            let airline = derive_account("airline", i).address();
            let outcome = h
                .runtime
                .register_airline(&airline, &h.first_airline)
                .await
                .unwrap();
            assert!(outcome.is_admitted());
            h.runtime.fund(&airline, Amount::from_units(10)).await.unwrap();
            airlines.push(airline);
        }

        let fifth = derive_account("airline", 4).address();
        let first_vote = h.runtime.register_airline(&fifth, &airlines[0]).await.unwrap();
        assert_eq!(
            first_vote,
            AdmissionOutcome::VoteRecorded {
                votes: 1,
                required: 2
            }
        );
        assert!(!h.runtime.is_airline_registered(&fifth).await.unwrap());

        let second_vote = h.runtime.register_airline(&fifth, &airlines[1]).await.unwrap();
        assert_eq!(second_vote, AdmissionOutcome::Admitted { total: 5 });
        assert!(h.runtime.is_airline_registered(&fifth).await.unwrap());
        assert_eq!(h.runtime.registered_airlines().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_response_order_does_not_matter() {
        // Three oracles report 20, one reports 10, one reports 30
        let reports = [20u8, 20, 20, 10, 30];
        let orderings = permutations(&[0, 1, 2, 3, 4]);
        assert_eq!(orderings.len(), 120);

        for ordering in orderings {
            let h = create_flight_runtime(2).await;
            let passenger = derive_account("passenger", 0).address();
            h.runtime
                .buy(&passenger, &h.first_airline, "NDB01", DEPARTURE, Amount::from_milli(100))
                .await
                .unwrap();
            let oracles = register_oracles(&h.runtime, 5).await;
            let ticket = h
                .runtime
                .fetch_flight_status(&passenger, &h.first_airline, "NDB01", DEPARTURE)
                .await
                .unwrap();

            for slot in &ordering {
                let slot = *slot as usize;
                h.runtime
                    .submit_oracle_response(
                        &oracles[slot],
                        2,
                        &h.first_airline,
                        "NDB01",
                        DEPARTURE,
                        reports[slot],
                    )
                    .await
                    .unwrap();
            }

            let flight = h.runtime.flight(&ticket.flight_key).await.unwrap().unwrap();
            assert_eq!(flight.status, StatusCode::LateAirline, "ordering {:?}", ordering);
            assert_eq!(
                h.runtime.get_credit(&passenger).await.unwrap(),
                Amount::from_milli(150),
                "ordering {:?}",
                ordering
            );
        }
    }

    #[tokio::test]
    async fn test_index_outside_oracle_slots_rejected() {
        let h = create_flight_runtime(6).await;
        let passenger = derive_account("passenger", 0).address();
        let oracles = register_oracles(&h.runtime, 1).await;
        h.runtime
            .fetch_flight_status(&passenger, &h.first_airline, "NDB01", DEPARTURE)
            .await
            .unwrap();

        let result = h
            .runtime
            .submit_oracle_response(&oracles[0], 7, &h.first_airline, "NDB01", DEPARTURE, 20)
            .await;
        assert!(matches!(result, Err(SuretyError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_unknown_status_code_rejected() {
        let h = create_flight_runtime(1).await;
        let passenger = derive_account("passenger", 0).address();
        let oracles = register_oracles(&h.runtime, 1).await;
        h.runtime
            .fetch_flight_status(&passenger, &h.first_airline, "NDB01", DEPARTURE)
            .await
            .unwrap();

        let result = h
            .runtime
            .submit_oracle_response(&oracles[0], 1, &h.first_airline, "NDB01", DEPARTURE, 25)
            .await;
        assert!(matches!(result, Err(SuretyError::InvalidStatusCode(25))));
    }

    #[tokio::test]
    async fn test_halted_runtime_rejects_calls() {
        let h = create_flight_runtime(0).await;
        let passenger = derive_account("passenger", 0).address();

        let intruder = derive_account("intruder", 0).address();
        assert!(matches!(
            h.runtime.set_operational(&intruder, false).await,
            Err(SuretyError::Unauthorized(_))
        ));

        h.runtime.set_operational(&h.owner, false).await.unwrap();
        assert!(!h.runtime.is_operational().await.unwrap());
        let root = h.runtime.state_root().await;

        let buy = h
            .runtime
            .buy(&passenger, &h.first_airline, "NDB01", DEPARTURE, Amount::from_milli(100))
            .await;
        assert!(matches!(buy, Err(SuretyError::NotOperational)));
        let oracle = h
            .runtime
            .register_oracle(&passenger, Amount::from_units(10))
            .await;
        assert!(matches!(oracle, Err(SuretyError::NotOperational)));
        assert_eq!(h.runtime.state_root().await, root);

        h.runtime.set_operational(&h.owner, true).await.unwrap();
        h.runtime
            .buy(&passenger, &h.first_airline, "NDB01", DEPARTURE, Amount::from_milli(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deauthorized_runtime_is_locked_out() {
        let h = create_flight_runtime(0).await;
        let app = h.runtime.app_address();

        h.runtime.deauthorize_caller(&h.owner, &app).await.unwrap();
        let fund = h.runtime.fund(&h.first_airline, Amount::from_units(1)).await;
        assert!(matches!(fund, Err(SuretyError::Unauthorized(_))));

        h.runtime.authorize_caller(&h.owner, &app).await.unwrap();
        h.runtime
            .fund(&h.first_airline, Amount::from_units(1))
            .await
            .unwrap();
    }
}
