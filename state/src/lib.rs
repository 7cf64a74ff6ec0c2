//! Flight Surety State Management
//! 
//! Provides the ledger records, the key schema, and the state store.
//! Uses a key-value model where state = { key → bincode(record) }

pub mod records;
pub mod store;
pub mod memory;

pub use records::*;
pub use store::*;
pub use memory::*;
