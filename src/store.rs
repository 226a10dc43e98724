// =============================================================================
// TIDESWAP - Order Store
// =============================================================================
//
// Durable order records in an embedded sled tree, bincode-encoded,
// keyed by the order id. Every status transition is persisted before it
// is acted on, so a restart resumes from the last recorded state.
// Updates go through a closure under the store handle; sled serializes
// writes per key, and the engine holds a per-order lock above this
// layer, so a read-modify-write here never interleaves with another
// writer of the same order.
//
// =============================================================================

use std::path::Path;

use tracing::info;

use crate::error::SwapError;
use crate::order::{Order, OrderId};

const ORDERS_TREE: &str = "orders";

pub struct OrderStore {
    db: sled::Db,
    orders: sled::Tree,
}

impl OrderStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SwapError> {
        let db = sled::open(path.as_ref())
            .map_err(|e| SwapError::Store(format!("Failed to open order store: {}", e)))?;
        let orders = db
            .open_tree(ORDERS_TREE)
            .map_err(|e| SwapError::Store(format!("Failed to open orders tree: {}", e)))?;

        info!(target: "store", "order store open at {:?}, {} orders", path.as_ref(), orders.len());
        Ok(OrderStore { db, orders })
    }

    /// Persist a new order. Rejects duplicates; an order id is written
    /// exactly once at creation.
    pub fn create(&self, order: &Order) -> Result<(), SwapError> {
        let key = order.id.to_hex();
        let value = encode(order)?;

        let previous = self
            .orders
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(value))
            .map_err(|e| SwapError::Store(e.to_string()))?;
        if previous.is_err() {
            return Err(SwapError::Store(format!("Order {} already exists", order.id)));
        }
        self.flush()
    }

    pub fn get(&self, id: &OrderId) -> Result<Order, SwapError> {
        let bytes = self
            .orders
            .get(id.to_hex().as_bytes())
            .map_err(|e| SwapError::Store(e.to_string()))?
            .ok_or_else(|| SwapError::NotFound(format!("Order {}", id)))?;
        decode(&bytes)
    }

    /// Read-modify-write an existing order. The mutation is persisted
    /// only if the closure succeeds.
    pub fn update<F>(&self, id: &OrderId, mutate: F) -> Result<Order, SwapError>
    where
        F: FnOnce(&mut Order) -> Result<(), SwapError>,
    {
        let mut order = self.get(id)?;
        mutate(&mut order)?;

        self.orders
            .insert(id.to_hex().as_bytes(), encode(&order)?)
            .map_err(|e| SwapError::Store(e.to_string()))?;
        self.flush()?;
        Ok(order)
    }

    pub fn list(&self) -> Result<Vec<Order>, SwapError> {
        let mut orders = Vec::new();
        for entry in self.orders.iter() {
            let (_, bytes) = entry.map_err(|e| SwapError::Store(e.to_string()))?;
            orders.push(decode(&bytes)?);
        }
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    /// Orders in a non-terminal status, for resume after restart
    pub fn list_active(&self) -> Result<Vec<Order>, SwapError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|o| o.status.is_active())
            .collect())
    }

    pub fn flush(&self) -> Result<(), SwapError> {
        self.db
            .flush()
            .map_err(|e| SwapError::Store(e.to_string()))?;
        Ok(())
    }
}

fn encode(order: &Order) -> Result<Vec<u8>, SwapError> {
    bincode::serialize(order).map_err(|e| SwapError::Store(format!("Encode failed: {}", e)))
}

fn decode(bytes: &[u8]) -> Result<Order, SwapError> {
    bincode::deserialize(bytes)
        .map_err(|e| SwapError::Store(format!("Corrupt order record: {}", e)))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{tests::sample_order, OrderStatus};

    fn open_store() -> (tempfile::TempDir, OrderStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::open(dir.path().join("orders")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_and_get() {
        let (_dir, store) = open_store();
        let order = sample_order();

        store.create(&order).unwrap();
        let loaded = store.get(&order.id).unwrap();
        assert_eq!(loaded.id, order.id);
        assert_eq!(loaded.status, OrderStatus::Created);
        assert_eq!(loaded.commitment, order.commitment);
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let (_dir, store) = open_store();
        let order = sample_order();

        store.create(&order).unwrap();
        assert!(matches!(store.create(&order), Err(SwapError::Store(_))));
    }

    #[test]
    fn test_missing_order_is_not_found() {
        let (_dir, store) = open_store();
        let id = crate::order::OrderId::generate().unwrap();
        assert!(matches!(store.get(&id), Err(SwapError::NotFound(_))));
    }

    #[test]
    fn test_update_persists_transition() {
        let (_dir, store) = open_store();
        let order = sample_order();
        store.create(&order).unwrap();

        store
            .update(&order.id, |o| {
                o.transition_to(OrderStatus::FundingBroadcast)?;
                o.funding_txid = Some("ff".repeat(32));
                Ok(())
            })
            .unwrap();

        let loaded = store.get(&order.id).unwrap();
        assert_eq!(loaded.status, OrderStatus::FundingBroadcast);
        assert!(loaded.funding_txid.is_some());
    }

    #[test]
    fn test_failed_update_leaves_record_untouched() {
        let (_dir, store) = open_store();
        let order = sample_order();
        store.create(&order).unwrap();

        // An illegal transition aborts the write
        let err = store.update(&order.id, |o| o.transition_to(OrderStatus::Claimed));
        assert!(matches!(err, Err(SwapError::InvalidTransition { .. })));
        assert_eq!(store.get(&order.id).unwrap().status, OrderStatus::Created);
    }

    #[test]
    fn test_list_active_skips_terminal() {
        let (_dir, store) = open_store();

        let live = sample_order();
        store.create(&live).unwrap();

        let abandoned = sample_order();
        store.create(&abandoned).unwrap();
        store
            .update(&abandoned.id, |o| o.transition_to(OrderStatus::Abandoned))
            .unwrap();

        let active = store.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, live.id);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let order = sample_order();

        {
            let store = OrderStore::open(dir.path().join("orders")).unwrap();
            store.create(&order).unwrap();
        }

        let store = OrderStore::open(dir.path().join("orders")).unwrap();
        assert_eq!(store.get(&order.id).unwrap().id, order.id);
    }
}
