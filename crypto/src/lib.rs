//! Flight Surety Cryptography Module
//! 
//! Provides:
//! - BLAKE3 hashing and merkle roots for state commitments
//! - Ed25519 key pairs and address derivation for account identities

pub mod hashing;
pub mod keys;

pub use hashing::*;
pub use keys::*;
