//! Cryptographic operations for the ledger
//!
//! This module provides:
//! - Ed25519 key pair generation, signing, and verification (snapshots, audit packs)
//! - SHA-256 hashing, hash chaining and Merkle roots

use crate::{Error, Result};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Ed25519 key pair for signing
#[derive(Debug)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from a 64-character hex seed
    pub fn from_hex_seed(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| Error::Config(format!("Invalid signing seed: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Config("Signing seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Get public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Sign a message, returning the 64-byte signature
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Verify a signature
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        verify_with(&self.verifying_key, message, signature)
    }
}

/// Verify a signature with a public key
pub fn verify_signature(message: &[u8], signature: &[u8], public_key: &[u8; 32]) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| Error::SignatureError(format!("Invalid public key: {}", e)))?;
    verify_with(&verifying_key, message, signature)
}

fn verify_with(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> Result<()> {
    let dalek_sig = DalekSignature::from_slice(signature)
        .map_err(|e| Error::SignatureError(format!("Malformed signature: {}", e)))?;
    key.verify(message, &dalek_sig)
        .map_err(|e| Error::SignatureError(format!("Verification failed: {}", e)))
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Extend a hash chain: `sha256(previous || next)`
pub fn chain_hash(previous: &[u8; 32], next: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(previous);
    hasher.update(next);
    hasher.finalize().into()
}

/// Create a Merkle root from leaf hashes
///
/// If a level has odd length, the last hash is duplicated.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }

    let mut current_level: Vec<[u8; 32]> = leaves.to_vec();

    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => chain_hash(left, right),
                [single] => chain_hash(single, single),
                _ => [0u8; 32],
            })
            .collect();
    }

    current_level[0]
}

/// Lowercase hex rendering of a digest
pub fn to_hex(digest: &[u8]) -> String {
    hex::encode(digest)
}
