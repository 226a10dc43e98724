// =============================================================================
// TIDESWAP - Swap Engine
// =============================================================================
//
// Orchestrates the order lifecycle: quote and placement on the relay,
// HTLC funding on the UTXO chain, secret reveal, and the claim/refund
// resolution. The engine is the sole writer of order status. Each
// operation takes the order's own async lock first, so two tasks acting
// on the same order serialize; operations on different orders run
// concurrently and contend only on the shared UTXO reservation table.
//
// Error handling splits on the taxonomy: fatal errors (signing, rejected
// broadcast, failed randomness) move the order to Failed and release its
// input leases; transient gateway errors leave the status untouched for
// a later retry.
//
// =============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tracing::{info, warn};

use crate::builder::HtlcTxBuilder;
use crate::counterchain::CounterChain;
use crate::error::SwapError;
use crate::gateway::ChainGateway;
use crate::htlc::{self, HtlcParams};
use crate::order::{ChainKind, Order, OrderId, OrderStatus, Provenance};
use crate::secret::{self, commit, generate_secret, Secret};
use crate::store::OrderStore;
use crate::tx::{pubkey_to_address, Network};
use crate::utxo::UtxoReservations;
use crate::{unix_now, DEFAULT_CONFIRMATION_DEPTH, DEFAULT_TIMELOCK_SECS};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub network: Network,
    /// Depth at which funding counts as final
    pub confirmation_depth: i64,
    /// Seconds added to now for the HTLC locktime
    pub default_timelock_secs: u64,
    pub provenance: Provenance,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            network: Network::Testnet,
            confirmation_depth: DEFAULT_CONFIRMATION_DEPTH,
            default_timelock_secs: DEFAULT_TIMELOCK_SECS,
            provenance: Provenance::Live,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct SwapEngine {
    store: Arc<OrderStore>,
    gateway: Arc<dyn ChainGateway>,
    relay: Arc<dyn CounterChain>,
    builder: HtlcTxBuilder,
    reservations: Arc<UtxoReservations>,
    config: EngineConfig,

    funder_key: SecretKey,
    funder_pubkey: [u8; 33],
    funder_address: String,

    /// Per-order async locks; entries are created on first touch
    locks: Mutex<HashMap<OrderId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SwapEngine {
    pub fn new(
        store: Arc<OrderStore>,
        gateway: Arc<dyn ChainGateway>,
        relay: Arc<dyn CounterChain>,
        builder: HtlcTxBuilder,
        reservations: Arc<UtxoReservations>,
        funder_key: SecretKey,
        config: EngineConfig,
    ) -> Self {
        let secp = Secp256k1::new();
        let funder_pubkey = PublicKey::from_secret_key(&secp, &funder_key).serialize();
        let funder_address = pubkey_to_address(&funder_pubkey, config.network);

        SwapEngine {
            store,
            gateway,
            relay,
            builder,
            reservations,
            config,
            funder_key,
            funder_pubkey,
            funder_address,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn funder_address(&self) -> &str {
        &self.funder_address
    }

    fn order_lock(&self, id: OrderId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create a new swap order: quote the pair on the relay, generate the
    /// secret and commitment, derive the HTLC address, and place the
    /// destination-side order under the commitment. Nothing touches the
    /// chain yet.
    pub async fn create_order(
        &self,
        source_chain: &str,
        dest_chain: &str,
        amount: u64,
        claimant_pubkey: &[u8],
    ) -> Result<Order, SwapError> {
        let source_kind = ChainKind::resolve(source_chain)?;
        let dest_kind = ChainKind::resolve(dest_chain)?;
        if source_kind != ChainKind::UtxoModel {
            return Err(SwapError::Validation(format!(
                "Source chain {} is not a UTXO-model chain",
                source_chain
            )));
        }

        let quote = self.relay.get_quote(source_chain, dest_chain, amount).await?;

        let swap_secret = generate_secret()?;
        let commitment = commit(&swap_secret);
        // CLTV locktimes are 32-bit; an expiry past that range can never
        // validate on chain
        let timelock = u32::try_from(unix_now().saturating_add(self.config.default_timelock_secs))
            .map_err(|_| {
                SwapError::Validation("Timelock exceeds the 32-bit locktime range".into())
            })?;

        let params = HtlcParams::new(commitment, timelock, claimant_pubkey, &self.funder_pubkey)?;
        let redeem_script = htlc::build_script(&params);
        let htlc_address =
            htlc::p2sh_address(&redeem_script, self.config.network.p2sh_version());

        let ack = self.relay.place_order(&quote, &commitment).await?;

        let now = unix_now();
        let order = Order {
            id: OrderId::generate()?,
            source_chain: source_chain.to_string(),
            dest_chain: dest_chain.to_string(),
            source_kind,
            dest_kind,
            amount,
            commitment,
            secret: Some(swap_secret),
            timelock,
            htlc_address,
            redeem_script,
            funding_txid: None,
            funding_vout: 0,
            claim_txid: None,
            refund_txid: None,
            counter_order_id: Some(ack.order_id),
            provenance: self.config.provenance,
            status: OrderStatus::Created,
            failure: None,
            created_at: now,
            updated_at: now,
        };

        self.store.create(&order)?;
        info!(target: "engine", "order {} created, HTLC {} for {}",
            order.id, order.htlc_address, order.amount);
        Ok(order)
    }

    // =========================================================================
    // Funding
    // =========================================================================

    /// Build, sign and broadcast the funding transaction. The order moves
    /// to FundingBroadcast with its txid bound, or to Failed if every
    /// relay endpoint rejects the transaction.
    pub async fn fund_order(&self, id: OrderId) -> Result<Order, SwapError> {
        let lock = self.order_lock(id);
        let _guard = lock.lock().await;

        let order = self.store.get(&id)?;
        if order.status != OrderStatus::Created {
            return Err(SwapError::InvalidTransition {
                from: order.status.to_string(),
                to: OrderStatus::FundingBroadcast.to_string(),
            });
        }

        let params = self.htlc_params(&order)?;
        let build = self
            .builder
            .build_funding_transaction(
                &self.funder_key,
                &self.funder_address,
                order.amount,
                &params,
                id,
            )
            .await?;

        match self.gateway.broadcast(&build.tx.to_bytes()).await {
            Ok(txid) => {
                info!(target: "engine", "order {} funding broadcast: {}", id, txid);
                self.store.update(&id, |o| {
                    o.transition_to(OrderStatus::FundingBroadcast)?;
                    o.funding_txid = Some(txid.clone());
                    o.funding_vout = 0;
                    Ok(())
                })
            }
            Err(e) => self.handle_failure(id, e).await,
        }
    }

    /// Record a confirmation depth observed for the funding transaction.
    /// At the configured depth the order becomes FundingConfirmed and its
    /// input leases are released; the outputs are spent on chain and no
    /// longer need protection.
    pub async fn on_confirmation(&self, id: OrderId, depth: i64) -> Result<Order, SwapError> {
        let lock = self.order_lock(id);
        let _guard = lock.lock().await;

        let order = self.store.get(&id)?;
        if order.status != OrderStatus::FundingBroadcast {
            return Ok(order);
        }
        if depth < self.config.confirmation_depth {
            return Ok(order);
        }

        let updated = self
            .store
            .update(&id, |o| o.transition_to(OrderStatus::FundingConfirmed))?;
        self.reservations.release_order(&id);
        info!(target: "engine", "order {} funding final at depth {}", id, depth);
        Ok(updated)
    }

    // =========================================================================
    // Secret Reveal
    // =========================================================================

    /// Record a secret observed on the destination chain. Verified
    /// against the commitment before any state moves.
    pub async fn observe_secret(&self, id: OrderId, observed: &Secret) -> Result<Order, SwapError> {
        let lock = self.order_lock(id);
        let _guard = lock.lock().await;

        let order = self.store.get(&id)?;
        if !secret::verify(observed, &order.commitment) {
            return Err(SwapError::Validation(
                "Observed secret does not match the order commitment".into(),
            ));
        }

        self.store.update(&id, |o| {
            o.transition_to(OrderStatus::SecretRevealed)?;
            o.secret = Some(*observed);
            Ok(())
        })
    }

    /// Reveal this order's secret to the relay so the destination-side
    /// claim can execute. The funding must be final first; revealing
    /// earlier would let the counter-party claim while our leg can still
    /// reorg out.
    pub async fn submit_secret(&self, id: OrderId) -> Result<Order, SwapError> {
        let lock = self.order_lock(id);
        let _guard = lock.lock().await;

        let order = self.store.get(&id)?;
        if order.status != OrderStatus::FundingConfirmed {
            return Err(SwapError::InvalidTransition {
                from: order.status.to_string(),
                to: OrderStatus::SecretRevealed.to_string(),
            });
        }
        let held = order
            .secret
            .ok_or_else(|| SwapError::Validation("Order holds no secret".into()))?;
        let counter_id = order
            .counter_order_id
            .clone()
            .ok_or_else(|| SwapError::Validation("Order has no relay handle".into()))?;

        let receipt = self.relay.submit_secret(&counter_id, &held).await?;
        if !receipt.success {
            return Err(SwapError::Gateway(format!(
                "Relay refused secret for order {}",
                counter_id
            )));
        }

        info!(target: "engine", "order {} secret submitted", id);
        self.store
            .update(&id, |o| o.transition_to(OrderStatus::SecretRevealed))
    }

    /// Reconcile against the relay's view of the destination-side order.
    /// An executed counter-order means the secret is out, so the order
    /// moves to SecretRevealed; a repudiated counter-order is logged and
    /// left in FundingConfirmed, where the timelock refund path reclaims
    /// the funds. A no-op in every other status.
    pub async fn reconcile_counter_order(&self, id: OrderId) -> Result<Order, SwapError> {
        let lock = self.order_lock(id);
        let _guard = lock.lock().await;

        let order = self.store.get(&id)?;
        if order.status != OrderStatus::FundingConfirmed {
            return Ok(order);
        }
        let counter_id = match order.counter_order_id.clone() {
            Some(counter_id) => counter_id,
            None => return Ok(order),
        };

        let remote = self.relay.order_status(&counter_id).await?;
        match remote.status.as_str() {
            "claimed" | "filled" | "executed" => {
                info!(target: "engine",
                    "order {} counter-order {} executed ({} confirmations)",
                    id, counter_id, remote.confirmations
                );
                self.store
                    .update(&id, |o| o.transition_to(OrderStatus::SecretRevealed))
            }
            "cancelled" | "rejected" | "expired" => {
                // The counter-party walked away. The secret stays here
                // and the HTLC comes back through the refund branch
                // after the timelock.
                warn!(target: "engine",
                    "order {} counter-order {} repudiated ({})",
                    id, counter_id, remote.status
                );
                Ok(order)
            }
            _ => Ok(order),
        }
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Spend the HTLC output to the claimant with the revealed secret
    pub async fn claim_order(
        &self,
        id: OrderId,
        claimant_key: &SecretKey,
        payout_address: &str,
    ) -> Result<Order, SwapError> {
        let lock = self.order_lock(id);
        let _guard = lock.lock().await;

        let order = self.store.get(&id)?;
        if order.status != OrderStatus::SecretRevealed {
            return Err(SwapError::InvalidTransition {
                from: order.status.to_string(),
                to: OrderStatus::Claimed.to_string(),
            });
        }
        let revealed = order
            .secret
            .ok_or_else(|| SwapError::Validation("Order holds no secret".into()))?;
        let funding_txid = order
            .funding_txid
            .clone()
            .ok_or_else(|| SwapError::Validation("Order has no funding transaction".into()))?;

        let params = self.htlc_params(&order)?;
        let build = self
            .builder
            .build_claim_transaction(
                claimant_key,
                &funding_txid,
                order.funding_vout,
                &revealed,
                &params,
                payout_address,
            )
            .await?;

        match self.gateway.broadcast(&build.tx.to_bytes()).await {
            Ok(txid) => {
                info!(target: "engine", "order {} claimed: {}", id, txid);
                self.store.update(&id, |o| {
                    o.transition_to(OrderStatus::Claimed)?;
                    o.claim_txid = Some(txid.clone());
                    Ok(())
                })
            }
            Err(e) => self.handle_failure(id, e).await,
        }
    }

    /// Mark the order timelock-expired once the locktime has passed.
    /// A no-op before expiry and in any other status.
    pub async fn check_timelock(&self, id: OrderId) -> Result<Order, SwapError> {
        let lock = self.order_lock(id);
        let _guard = lock.lock().await;

        let order = self.store.get(&id)?;
        if order.status != OrderStatus::FundingConfirmed {
            return Ok(order);
        }

        let expired = if order.timelock >= crate::LOCKTIME_TIME_THRESHOLD {
            unix_now() >= order.timelock as u64
        } else {
            self.gateway.tip_height().await? >= order.timelock as u64
        };
        if !expired {
            return Ok(order);
        }

        warn!(target: "engine", "order {} timelock expired", id);
        self.store
            .update(&id, |o| o.transition_to(OrderStatus::TimelockExpired))
    }

    /// Spend the HTLC output back to the funder. Only legal after the
    /// order is TimelockExpired; earlier attempts are a timelock
    /// violation, not a state error.
    pub async fn refund_order(&self, id: OrderId) -> Result<Order, SwapError> {
        let lock = self.order_lock(id);
        let _guard = lock.lock().await;

        let order = self.store.get(&id)?;
        if order.status == OrderStatus::FundingConfirmed {
            return Err(SwapError::TimelockViolation {
                timelock: order.timelock,
            });
        }
        if order.status != OrderStatus::TimelockExpired {
            return Err(SwapError::InvalidTransition {
                from: order.status.to_string(),
                to: OrderStatus::Refunded.to_string(),
            });
        }
        let funding_txid = order
            .funding_txid
            .clone()
            .ok_or_else(|| SwapError::Validation("Order has no funding transaction".into()))?;

        let params = self.htlc_params(&order)?;
        let build = self
            .builder
            .build_refund_transaction(
                &self.funder_key,
                &funding_txid,
                order.funding_vout,
                &params,
                &self.funder_address,
            )
            .await?;

        match self.gateway.broadcast(&build.tx.to_bytes()).await {
            Ok(txid) => {
                info!(target: "engine", "order {} refunded: {}", id, txid);
                self.store.update(&id, |o| {
                    o.transition_to(OrderStatus::Refunded)?;
                    o.refund_txid = Some(txid.clone());
                    Ok(())
                })
            }
            Err(e) => self.handle_failure(id, e).await,
        }
    }

    /// Record an unrecoverable failure observed outside an engine
    /// operation, e.g. a funding transaction evicted after broadcast
    pub async fn fail_order(&self, id: OrderId, reason: &str) -> Result<Order, SwapError> {
        let lock = self.order_lock(id);
        let _guard = lock.lock().await;

        warn!(target: "engine", "order {} failed: {}", id, reason);
        self.reservations.release_order(&id);
        self.store.update(&id, |o| o.fail(reason))
    }

    /// Abandon an order that never broadcast funding
    pub async fn abandon_order(&self, id: OrderId) -> Result<Order, SwapError> {
        let lock = self.order_lock(id);
        let _guard = lock.lock().await;

        let updated = self
            .store
            .update(&id, |o| o.transition_to(OrderStatus::Abandoned))?;
        self.reservations.release_order(&id);
        Ok(updated)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Orders to resume tracking after a restart
    pub fn recover(&self) -> Result<Vec<Order>, SwapError> {
        let active = self.store.list_active()?;
        info!(target: "engine", "recovered {} active orders", active.len());
        Ok(active)
    }

    pub fn get_order(&self, id: &OrderId) -> Result<Order, SwapError> {
        self.store.get(id)
    }

    pub fn list_orders(&self) -> Result<Vec<Order>, SwapError> {
        self.store.list()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn htlc_params(&self, order: &Order) -> Result<HtlcParams, SwapError> {
        HtlcParams::from_redeem_script(&order.redeem_script)
    }

    /// Fatal errors fail the order and release its input leases;
    /// transient errors pass through with status untouched
    async fn handle_failure(&self, id: OrderId, error: SwapError) -> Result<Order, SwapError> {
        if error.is_fatal() {
            warn!(target: "engine", "order {} failed: {}", id, error);
            self.reservations.release_order(&id);
            self.store.update(&id, |o| o.fail(&error.to_string()))?;
        }
        Err(error)
    }
}

// =============================================================================
// Tests
// =============================================================================
