// =============================================================================
// TIDESWAP - Hash-Commitment Generator
// =============================================================================
//
// The initiator generates a 32-byte secret and publishes commitment =
// SHA256(secret) before the secret itself. Revealing the secret is
// verifiable by recomputing the hash. Secrets are never reused across
// orders.
//
// =============================================================================

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SwapError;
use crate::{HASH_SIZE, SECRET_SIZE};

// =============================================================================
// Secret
// =============================================================================

/// 32-byte swap preimage
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret(pub [u8; SECRET_SIZE]);

impl Secret {
    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, SwapError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| SwapError::Validation(format!("Invalid secret hex: {}", e)))?;
        if bytes.len() != SECRET_SIZE {
            return Err(SwapError::Validation(format!(
                "Secret must be {} bytes, got {}",
                SECRET_SIZE,
                bytes.len()
            )));
        }
        let mut buf = [0u8; SECRET_SIZE];
        buf.copy_from_slice(&bytes);
        Ok(Secret(buf))
    }
}

// Keep preimages out of logs
impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(..)")
    }
}

// =============================================================================
// Commitment
// =============================================================================

/// SHA-256 hash of a secret, published before the secret
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment(pub [u8; HASH_SIZE]);

impl Commitment {
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, SwapError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| SwapError::Validation(format!("Invalid commitment hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SwapError> {
        if bytes.len() != HASH_SIZE {
            return Err(SwapError::Validation(format!(
                "Commitment must be {} bytes, got {}",
                HASH_SIZE,
                bytes.len()
            )));
        }
        let mut buf = [0u8; HASH_SIZE];
        buf.copy_from_slice(bytes);
        Ok(Commitment(buf))
    }
}

impl std::fmt::Display for Commitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// =============================================================================
// Generation and Verification
// =============================================================================

/// Generate a fresh secret from the OS CSPRNG.
///
/// Fails loudly if the secure random source is unavailable rather than
/// degrading to a weaker source.
pub fn generate_secret() -> Result<Secret, SwapError> {
    let mut buf = [0u8; SECRET_SIZE];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| SwapError::Rng(e.to_string()))?;
    Ok(Secret(buf))
}

/// Compute the commitment for a secret. Pure and deterministic.
pub fn commit(secret: &Secret) -> Commitment {
    let mut hasher = Sha256::new();
    hasher.update(secret.0);
    let digest = hasher.finalize();
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&digest);
    Commitment(hash)
}

/// Verify a revealed secret against a commitment
pub fn verify(secret: &Secret, commitment: &Commitment) -> bool {
    commit(secret) == *commitment
}

// =============================================================================
// Tests
// =============================================================================
