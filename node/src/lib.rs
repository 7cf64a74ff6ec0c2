//! Flight surety node
//!
//! Wires the ledger components behind a single authorized caller:
//! - Runtime facade sequencing every inbound call
//! - Payout sink for withdrawals
//! - Simulated oracle fleet answering status requests

mod builder;
mod runtime;
mod simulation;
mod sink;

pub use builder::*;
pub use runtime::*;
pub use simulation::*;
pub use sink::*;
