// =============================================================================
// TIDESWAP - Unspent Outputs and Reservations
// =============================================================================
//
// The UTXO set for a funding address is shared across concurrent order
// creations. Input selection leases outpoints through the reservation
// table so two in-flight builds can never spend the same output; leases
// are released on build failure or once the funding transaction reaches
// final confirmation.
//
// =============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::SwapError;
use crate::order::OrderId;
use crate::tx::OutPoint;

// =============================================================================
// Unspent Output
// =============================================================================

/// An unspent output as reported by the chain data gateway
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
    /// Address the gateway reports this output under
    pub address: String,
    /// 0 = mempool only
    pub confirmations: i64,
}

// =============================================================================
// Reservation Table
// =============================================================================

/// Leases on outpoints held by in-flight funding builds
#[derive(Default)]
pub struct UtxoReservations {
    leases: Mutex<HashMap<OutPoint, OrderId>>,
}

impl UtxoReservations {
    pub fn new() -> Self {
        UtxoReservations {
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// True if any order currently holds a lease on this outpoint
    pub fn is_reserved(&self, outpoint: &OutPoint) -> bool {
        self.leases.lock().unwrap().contains_key(outpoint)
    }

    /// True if a different order holds a lease on this outpoint. A
    /// retried build may reuse outpoints it leased itself.
    pub fn is_reserved_by_other(&self, outpoint: &OutPoint, order: &OrderId) -> bool {
        self.leases
            .lock()
            .unwrap()
            .get(outpoint)
            .map(|holder| holder != order)
            .unwrap_or(false)
    }

    /// Lease a set of outpoints for one order. Atomic: if any outpoint is
    /// already leased by a different order, nothing is taken.
    pub fn reserve(&self, outpoints: &[OutPoint], order: OrderId) -> Result<(), SwapError> {
        let mut leases = self.leases.lock().unwrap();

        for outpoint in outpoints {
            if let Some(holder) = leases.get(outpoint) {
                if *holder != order {
                    return Err(SwapError::Validation(format!(
                        "Output {} already reserved by order {}",
                        outpoint, holder
                    )));
                }
            }
        }
        for outpoint in outpoints {
            leases.insert(outpoint.clone(), order);
        }
        Ok(())
    }

    /// Release every lease held by an order (build failed or funding final)
    pub fn release_order(&self, order: &OrderId) {
        self.leases.lock().unwrap().retain(|_, holder| holder != order);
    }

    pub fn reserved_count(&self) -> usize {
        self.leases.lock().unwrap().len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn op(n: u8) -> OutPoint {
        OutPoint::new(hex::encode([n; 32]), 0)
    }

    #[test]
    fn test_reserve_and_release() {
        let table = UtxoReservations::new();
        let order = OrderId::generate().unwrap();

        table.reserve(&[op(1), op(2)], order).unwrap();
        assert!(table.is_reserved(&op(1)));
        assert_eq!(table.reserved_count(), 2);

        table.release_order(&order);
        assert!(!table.is_reserved(&op(1)));
        assert_eq!(table.reserved_count(), 0);
    }

    #[test]
    fn test_conflicting_reservation_rejected() {
        let table = UtxoReservations::new();
        let first = OrderId::generate().unwrap();
        let second = OrderId::generate().unwrap();

        table.reserve(&[op(1)], first).unwrap();

        // Overlapping set: nothing from it is taken
        let err = table.reserve(&[op(1), op(2)], second);
        assert!(err.is_err());
        assert!(!table.is_reserved(&op(2)));

        // Releasing the first order frees the outpoint
        table.release_order(&first);
        table.reserve(&[op(1), op(2)], second).unwrap();
    }

    #[test]
    fn test_reserved_by_other() {
        let table = UtxoReservations::new();
        let owner = OrderId::generate().unwrap();
        let other = OrderId::generate().unwrap();

        table.reserve(&[op(1)], owner).unwrap();
        assert!(!table.is_reserved_by_other(&op(1), &owner));
        assert!(table.is_reserved_by_other(&op(1), &other));
        assert!(!table.is_reserved_by_other(&op(2), &other));
    }

    #[test]
    fn test_rereserve_same_order_is_idempotent() {
        let table = UtxoReservations::new();
        let order = OrderId::generate().unwrap();

        table.reserve(&[op(1)], order).unwrap();
        table.reserve(&[op(1)], order).unwrap();
        assert_eq!(table.reserved_count(), 1);
    }
}
