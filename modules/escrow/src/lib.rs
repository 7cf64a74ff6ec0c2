//! Escrow Ledger for the flight surety ledger
//! 
//! Holds airline funding, passenger premiums and oracle stakes, and enforces:
//! - Airline funding threshold
//! - Insurance purchase on registered, unresolved flights
//! - Idempotent payout crediting
//! - Checks-effects-interactions withdrawals

pub mod batch;
pub mod ledger;
pub mod genesis;

pub use batch::*;
pub use ledger::*;
pub use genesis::*;
