//! Simulated oracle fleet and end-to-end scenario driver

use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use surety_consensus::ResponseOutcome;
use surety_core::{
    Address, Amount, FlightRef, OracleIndex, SimulationConfig, StatusCode, SuretyError,
    SuretyEvent, SuretyResult,
};
use surety_crypto::keys::derive_account;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::runtime::SuretyRuntime;

/// Departure used for every simulated flight
pub const SIMULATED_DEPARTURE: u64 = 1558232053;

/// Registered oracle identities and their sampling slots
pub struct OracleFleet {
    oracles: Vec<(Address, [OracleIndex; 3])>,
    reported_status: Option<StatusCode>,
}

impl OracleFleet {
    /// Register `count` derived oracle accounts, each paying the registration fee
    pub async fn register(
        runtime: &SuretyRuntime,
        count: usize,
        reported_status: Option<StatusCode>,
    ) -> SuretyResult<Self> {
        let fee = runtime.registration_fee();
        let mut oracles = Vec::with_capacity(count);

        for i in 0..count {
            let oracle = derive_account("oracle", i as u64).address();
            match runtime.register_oracle(&oracle, fee).await {
                Ok(indexes) => {
                    debug!("Oracle {} holds {:?}", oracle, indexes);
                    oracles.push((oracle, indexes));
                }
                Err(e) => warn!("Oracle {} failed to register: {}", oracle, e),
            }
        }

        info!("Registered {} oracles", oracles.len());
        Ok(Self {
            oracles,
            reported_status,
        })
    }

    pub fn len(&self) -> usize {
        self.oracles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oracles.is_empty()
    }

    /// Oracles holding `index`
    pub fn eligible(&self, index: OracleIndex) -> Vec<Address> {
        self.oracles
            .iter()
            .filter(|(_, indexes)| indexes.contains(&index))
            .map(|(oracle, _)| *oracle)
            .collect()
    }

    /// One status per request, shared by every answering oracle
    fn pick_status(&self) -> StatusCode {
        if let Some(status) = self.reported_status {
            return status;
        }
        let candidates = &StatusCode::ALL[1..];
        let mut rng = rand::thread_rng();
        candidates
            .choose(&mut rng)
            .copied()
            .unwrap_or(StatusCode::Unknown)
    }

    /// Answer a status request with every eligible oracle
    pub async fn respond(
        &self,
        runtime: &SuretyRuntime,
        index: OracleIndex,
        flight: &FlightRef,
    ) -> Vec<ResponseOutcome> {
        let status = self.pick_status();
        let mut outcomes = Vec::new();

        for oracle in self.eligible(index) {
            let result = runtime
                .submit_oracle_response(
                    &oracle,
                    index,
                    &flight.airline,
                    &flight.code,
                    flight.departure,
                    status.code(),
                )
                .await;
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("Oracle {} response rejected: {}", oracle, e),
            }
        }

        outcomes
    }
}

/// Final state of one simulated flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlightReport {
    pub code: String,
    pub status: StatusCode,
    pub is_open: bool,
}

/// Outcome of a simulation run
#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    pub flights: Vec<FlightReport>,
    pub withdrawn: BTreeMap<Address, Amount>,
    pub escrow_balance: Amount,
    pub events: usize,
}

impl SimulationReport {
    pub fn total_withdrawn(&self) -> Amount {
        self.withdrawn
            .values()
            .fold(Amount::ZERO, |acc, amount| acc.saturating_add(*amount))
    }
}

/// Scenario driver: funds the genesis airline, registers flights, insures
/// passengers, asks for every flight's status and withdraws the credits
pub struct Simulation<'a> {
    runtime: &'a SuretyRuntime,
    events: mpsc::Receiver<SuretyEvent>,
    config: SimulationConfig,
    event_count: usize,
}

impl<'a> Simulation<'a> {
    pub fn new(
        runtime: &'a SuretyRuntime,
        events: mpsc::Receiver<SuretyEvent>,
        config: SimulationConfig,
    ) -> Self {
        Self {
            runtime,
            events,
            config,
            event_count: 0,
        }
    }

    pub async fn run(mut self, airline: &Address) -> SuretyResult<SimulationReport> {
        let runtime = self.runtime;
        let reported = self
            .config
            .reported_status
            .map(StatusCode::try_from)
            .transpose()?;

        let threshold = runtime.ledger().config().funding_threshold();
        runtime.fund(airline, threshold).await?;

        let price = Amount::from_milli(self.config.price_milli);
        let premium = Amount::from_milli(self.config.premium_milli);
        let flights: Vec<FlightRef> = self
            .config
            .flights
            .iter()
            .map(|code| FlightRef::new(*airline, code.as_str(), SIMULATED_DEPARTURE))
            .collect();

        for flight in &flights {
            runtime
                .register_flight(airline, &flight.code, flight.departure, price)
                .await?;
        }
        self.pump(None).await;

        let fleet = OracleFleet::register(runtime, self.config.oracle_count, reported).await?;
        if fleet.is_empty() {
            return Err(SuretyError::invalid_state("no oracle could register"));
        }

        let mut passengers = Vec::new();
        for (f, flight) in flights.iter().enumerate() {
            for p in 0..self.config.passengers_per_flight {
                let passenger =
                    derive_account("passenger", (f * self.config.passengers_per_flight + p) as u64)
                        .address();
                runtime
                    .buy(&passenger, airline, &flight.code, flight.departure, premium)
                    .await?;
                passengers.push(passenger);
            }
        }
        self.pump(None).await;

        for (f, flight) in flights.iter().enumerate() {
            let requester = passengers
                .get(f * self.config.passengers_per_flight)
                .copied()
                .unwrap_or(*airline);
            runtime
                .fetch_flight_status(&requester, airline, &flight.code, flight.departure)
                .await?;
            self.pump(Some(&fleet)).await;
        }

        let mut report = SimulationReport::default();
        for passenger in passengers {
            match runtime.withdraw(&passenger).await {
                Ok(amount) => {
                    report.withdrawn.insert(passenger, amount);
                }
                Err(SuretyError::InsufficientCredit) => {}
                Err(e) => return Err(e),
            }
        }
        self.pump(None).await;

        for flight in &flights {
            let key = runtime.get_flight_key(&flight.airline, &flight.code, flight.departure);
            if let Some(state) = runtime.flight(&key).await? {
                report.flights.push(FlightReport {
                    code: flight.code.clone(),
                    status: state.status,
                    is_open: state.is_open,
                });
            }
        }
        report.escrow_balance = runtime.escrow_balance().await?;
        report.events = self.event_count;

        info!(
            "Simulation finished: {} flights, {} withdrawn, escrow {}",
            report.flights.len(),
            report.total_withdrawn(),
            report.escrow_balance
        );
        Ok(report)
    }

    /// Drain queued events, logging each; status requests are answered by
    /// the fleet, which queues further events
    async fn pump(&mut self, fleet: Option<&OracleFleet>) {
        while let Ok(event) = self.events.try_recv() {
            self.event_count += 1;
            log_event(&event);

            if let (Some(fleet), SuretyEvent::StatusRequested { index, flight }) = (fleet, &event) {
                let outcomes = fleet.respond(self.runtime, *index, flight).await;
                debug!("{} responses for {}", outcomes.len(), flight);
            }
        }
    }
}

fn log_event(event: &SuretyEvent) {
    match event {
        SuretyEvent::AirlineRegistered { airline, total } => {
            info!("{} has been registered ({} airlines)", airline, total)
        }
        SuretyEvent::AirlineFunded { airline, amount } => {
            info!("{} has funded {}", airline, amount)
        }
        SuretyEvent::FlightRegistered { flight, price } => {
            info!("Flight registered => {} price {}", flight, price)
        }
        SuretyEvent::InsurancePurchased {
            passenger, premium, ..
        } => info!("Insurance bought => passenger {} premium {}", passenger, premium),
        SuretyEvent::PassengerCredited { passenger, amount } => {
            info!("Credited => passenger {} amount {}", passenger, amount)
        }
        SuretyEvent::Withdrawn { passenger, amount } => {
            info!("Paid => recipient {} amount {}", passenger, amount)
        }
        SuretyEvent::StatusRequested { index, flight } => {
            info!("Oracle request => {} index {}", flight, index)
        }
        SuretyEvent::FlightStatusResolved { flight, status } => {
            info!("Flight processed => {} status {} ({})", flight, status.code(), status)
        }
        other => debug!("Event: {:?}", other),
    }
}
