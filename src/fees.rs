// =============================================================================
// TIDESWAP - Fee Policies
// =============================================================================
//
// The transaction builder estimates fees as a function of input/output
// count through a pluggable policy. A flat fee is the default (good
// enough for a first implementation and matches the reference relays);
// a per-byte policy is available when a rate is known.
//
// =============================================================================

use crate::DEFAULT_FLAT_FEE;

// =============================================================================
// Constants
// =============================================================================

/// Overhead bytes of a transaction envelope
const TX_BASE_SIZE: usize = 10;

/// Typical size of a signed P2PKH input (bytes)
const INPUT_SIZE: usize = 148;

/// Typical size of an output (bytes)
const OUTPUT_SIZE: usize = 34;

/// Fee rate floor (units per byte)
const MIN_FEE_RATE: u64 = 1;

/// Fee rate ceiling, to bound a misconfigured rate
const MAX_FEE_RATE: u64 = 1_000;

// =============================================================================
// Fee Policy
// =============================================================================

/// Fee as a function of transaction shape
pub trait FeePolicy: Send + Sync {
    fn fee_for(&self, num_inputs: usize, num_outputs: usize) -> u64;
}

/// Fixed fee regardless of transaction size
#[derive(Clone, Copy, Debug)]
pub struct FlatFee(pub u64);

impl Default for FlatFee {
    fn default() -> Self {
        FlatFee(DEFAULT_FLAT_FEE)
    }
}

impl FeePolicy for FlatFee {
    fn fee_for(&self, _num_inputs: usize, _num_outputs: usize) -> u64 {
        self.0
    }
}

/// Rate times estimated serialized size
#[derive(Clone, Copy, Debug)]
pub struct PerByteFee {
    rate: u64,
}

impl PerByteFee {
    pub fn new(rate: u64) -> Self {
        PerByteFee {
            rate: rate.clamp(MIN_FEE_RATE, MAX_FEE_RATE),
        }
    }

    /// Estimated size of a transaction with the given shape
    pub fn estimated_size(num_inputs: usize, num_outputs: usize) -> usize {
        TX_BASE_SIZE + num_inputs * INPUT_SIZE + num_outputs * OUTPUT_SIZE
    }
}

impl FeePolicy for PerByteFee {
    fn fee_for(&self, num_inputs: usize, num_outputs: usize) -> u64 {
        self.rate * Self::estimated_size(num_inputs, num_outputs) as u64
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_fee_ignores_shape() {
        let policy = FlatFee::default();
        assert_eq!(policy.fee_for(1, 1), DEFAULT_FLAT_FEE);
        assert_eq!(policy.fee_for(10, 3), DEFAULT_FLAT_FEE);
    }

    #[test]
    fn test_per_byte_fee_grows_with_inputs() {
        let policy = PerByteFee::new(2);
        assert!(policy.fee_for(2, 2) > policy.fee_for(1, 2));
        assert_eq!(
            policy.fee_for(1, 2),
            2 * PerByteFee::estimated_size(1, 2) as u64
        );
    }

    #[test]
    fn test_rate_clamped() {
        assert_eq!(PerByteFee::new(0).fee_for(1, 1), PerByteFee::new(1).fee_for(1, 1));
        assert_eq!(
            PerByteFee::new(u64::MAX).fee_for(1, 1),
            PerByteFee::new(1_000).fee_for(1, 1)
        );
    }
}
