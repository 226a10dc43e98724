// =============================================================================
// TIDESWAP - Protocol Constants and Crate Root
// =============================================================================
//
// HTLC transaction engine and cross-chain swap state machine for the
// UTXO-model side of a UTXO <-> EVM atomic swap.
//
// A swap works like this:
// 1. The initiator requests a quote from the counter-chain service
// 2. The engine generates a secret and publishes its SHA-256 commitment
// 3. Funds are locked in an HTLC output on the UTXO chain
//    (claimable with the secret preimage, refundable after the timelock)
// 4. The confirmation tracker watches the funding transaction
// 5. When the secret is revealed the claimant spends the HTLC output;
//    if the timelock elapses first the funder reclaims via the refund branch
//
// =============================================================================

pub mod builder;
pub mod counterchain;
pub mod engine;
pub mod error;
pub mod fees;
pub mod gateway;
pub mod htlc;
pub mod order;
pub mod secret;
pub mod store;
pub mod tracker;
pub mod tx;
pub mod utxo;

// =============================================================================
// Constants
// =============================================================================

/// Secret/preimage size in bytes
pub const SECRET_SIZE: usize = 32;

/// Commitment hash size in bytes (SHA-256)
pub const HASH_SIZE: usize = 32;

/// Compressed secp256k1 public key size
pub const PUBKEY_SIZE: usize = 33;

/// Minimum relayable output amount. Smaller change is folded into the fee.
pub const DUST_THRESHOLD: u64 = 546;

/// Default flat fee per transaction (base units)
pub const DEFAULT_FLAT_FEE: u64 = 1_000;

/// Funding is considered final at this inclusion depth
pub const DEFAULT_CONFIRMATION_DEPTH: i64 = 3;

/// Default HTLC timelock: one hour from funding
pub const DEFAULT_TIMELOCK_SECS: u64 = 3_600;

/// Locktime values below this are block heights, at or above are unix times
pub const LOCKTIME_TIME_THRESHOLD: u32 = 500_000_000;

/// Confirmation tracker poll interval (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Consecutive gateway failures before confirmation status becomes Unknown
pub const MAX_POLL_FAILURES: u32 = 5;

/// Consecutive not-found polls before broadcast funding counts as evicted
pub const EVICTION_POLLS: u32 = 3;

/// Backoff ceiling for the poll loop (seconds)
pub const MAX_BACKOFF_SECS: u64 = 300;

// =============================================================================
// Helpers
// =============================================================================

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Format base units as a decimal coin amount
pub fn format_units(units: u64) -> String {
    let whole = units / 100_000_000;
    let frac = units % 100_000_000;
    if frac == 0 {
        format!("{}", whole)
    } else {
        format!("{}.{:08}", whole, frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_units() {
        assert_eq!(format_units(100_000_000), "1");
        assert_eq!(format_units(150_000_000), "1.50000000");
        assert_eq!(format_units(546), "0.00000546");
    }
}
