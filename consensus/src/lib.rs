//! Flight surety consensus
//!
//! Two quorum mechanisms sit on top of the escrow ledger:
//! - Airline admission: direct while the federation is small, then majority
//!   voting among funded members
//! - Flight status resolution: index-sampled oracles attest, and the first
//!   status reaching the response quorum becomes authoritative

pub mod governance;
pub mod oracle;
pub mod resolver;
pub mod vote;

pub use governance::*;
pub use oracle::*;
pub use resolver::*;
pub use vote::*;
