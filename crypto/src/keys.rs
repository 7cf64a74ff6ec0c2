//! Key management for ledger identities
//!
//! Every account (owner, airline, passenger, oracle) is an address derived
//! from the BLAKE3 hash of an Ed25519 public key.

use ed25519_dalek::{SigningKey as Ed25519SigningKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use surety_core::{Address, PublicKey, SuretyError, SuretyResult};

use crate::hashing::hash;

/// A keypair backing an account identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: Ed25519SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = Ed25519SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create keypair from seed bytes
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = Ed25519SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Create keypair from secret key bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> SuretyResult<Self> {
        if bytes.len() != SECRET_KEY_LENGTH {
            return Err(SuretyError::InvalidAddress("secret key must be 32 bytes".into()));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(bytes);
        Ok(Self::from_seed(&seed))
    }

    /// Get the public key
    pub fn public_key(&self) -> PublicKey {
        let verifying_key = self.signing_key.verifying_key();
        PublicKey::from_bytes(verifying_key.to_bytes())
    }

    /// Get the address (hash of public key)
    pub fn address(&self) -> Address {
        address_from_public_key(&self.public_key())
    }
}

/// Derive address from public key using BLAKE3 hash
pub fn address_from_public_key(public_key: &PublicKey) -> Address {
    let hash = hash(public_key.as_bytes());
    Address::from_bytes(*hash.as_bytes())
}

/// Verify that an address matches a public key
pub fn verify_address(address: &Address, public_key: &PublicKey) -> bool {
    address == &address_from_public_key(public_key)
}

/// Deterministic identity for a labelled role, e.g. simulated accounts
pub fn derive_account(label: &str, index: u64) -> KeyPair {
    let seed = crate::hashing::hash_tagged(b"surety-account", &[label.as_bytes(), &index.to_le_bytes()]);
    KeyPair::from_seed(seed.as_bytes())
}

/// Serializable public key info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub public_key: String,
    pub address: String,
}

impl From<&KeyPair> for PublicKeyInfo {
    fn from(keypair: &KeyPair) -> Self {
        Self {
            public_key: keypair.public_key().to_hex(),
            address: keypair.address().to_hex(),
        }
    }
}
