//! Flight Surety Core Library
//! 
//! Core types, events, traits, and configuration shared by the escrow ledger,
//! the airline governance state machine, and the oracle status resolver.

pub mod types;
pub mod traits;
pub mod error;
pub mod config;
pub mod events;

pub use types::*;
pub use traits::*;
pub use error::*;
pub use config::*;
pub use events::*;
