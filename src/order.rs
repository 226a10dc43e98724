// =============================================================================
// TIDESWAP - Swap Order Record
// =============================================================================
//
// The order is the aggregate swap record tying a UTXO-chain HTLC to a
// counter-party claim on the account-model chain. The state machine in
// engine.rs is the sole writer of the status field; everything else
// reads it or requests a transition. The legal transition edges live
// here so illegal ones are rejected at the type boundary.
//
// =============================================================================

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::SwapError;
use crate::secret::{Commitment, Secret};
use crate::unix_now;

// =============================================================================
// Order Identifier
// =============================================================================

/// Unique order identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub [u8; 32]);

impl OrderId {
    pub fn generate() -> Result<Self, SwapError> {
        let mut buf = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| SwapError::Rng(e.to_string()))?;
        Ok(OrderId(buf))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, SwapError> {
        let bytes = hex::decode(s)
            .map_err(|e| SwapError::Validation(format!("Invalid order id: {}", e)))?;
        if bytes.len() != 32 {
            return Err(SwapError::Validation(format!(
                "Order id must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&bytes);
        Ok(OrderId(buf))
    }

    /// Short display form
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

// =============================================================================
// Chain Kind
// =============================================================================

/// Transaction model of a chain, resolved once at order creation and
/// carried on the order record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainKind {
    UtxoModel,
    AccountModel,
}

impl ChainKind {
    /// Closed resolution table for the supported chain identifiers
    pub fn resolve(chain_id: &str) -> Result<Self, SwapError> {
        match chain_id {
            "bitcoin_mainnet" | "bitcoin_testnet" => Ok(ChainKind::UtxoModel),
            // Ethereum, Optimism, Polygon, Base, Arbitrum
            "1" | "10" | "137" | "8453" | "42161" => Ok(ChainKind::AccountModel),
            other => Err(SwapError::Validation(format!(
                "Unknown chain identifier: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Provenance
// =============================================================================

/// Whether the order runs against live chains or a simulated backend.
/// Kept separate from status; never folded into a message string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    Live,
    Simulated,
}

// =============================================================================
// Order Status
// =============================================================================

/// Finite order lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    FundingBroadcast,
    FundingConfirmed,
    SecretRevealed,
    Claimed,
    TimelockExpired,
    Refunded,
    Failed,
    Abandoned,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Claimed
                | OrderStatus::Refunded
                | OrderStatus::Failed
                | OrderStatus::Abandoned
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Legal transition edges. A refund path is unreachable once the
    /// secret is revealed, so a claim and a refund can never both happen.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (*self, next) {
            (Created, FundingBroadcast) => true,
            (Created, Abandoned) => true,
            (FundingBroadcast, FundingConfirmed) => true,
            (FundingConfirmed, SecretRevealed) => true,
            (FundingConfirmed, TimelockExpired) => true,
            (SecretRevealed, Claimed) => true,
            (TimelockExpired, Refunded) => true,
            // Unrecoverable errors can strike any live order
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrderStatus::Created => "created",
            OrderStatus::FundingBroadcast => "funding_broadcast",
            OrderStatus::FundingConfirmed => "funding_confirmed",
            OrderStatus::SecretRevealed => "secret_revealed",
            OrderStatus::Claimed => "claimed",
            OrderStatus::TimelockExpired => "timelock_expired",
            OrderStatus::Refunded => "refunded",
            OrderStatus::Failed => "failed",
            OrderStatus::Abandoned => "abandoned",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Order
// =============================================================================

/// The aggregate swap record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,

    /// Chain identifiers as understood by the counter-chain service
    pub source_chain: String,
    pub dest_chain: String,

    /// Transaction models, resolved once at creation
    pub source_kind: ChainKind,
    pub dest_kind: ChainKind,

    /// Amount locked in the HTLC (base units of the source chain)
    pub amount: u64,

    /// Published hash commitment
    pub commitment: Commitment,

    /// Preimage; present on the initiator side, absent until reveal
    /// elsewhere
    pub secret: Option<Secret>,

    /// Absolute HTLC locktime
    pub timelock: u32,

    /// P2SH address and redeem script of the HTLC output
    pub htlc_address: String,
    pub redeem_script: Vec<u8>,

    /// Funding transaction, bound 1:1 to the order once broadcast
    pub funding_txid: Option<String>,
    pub funding_vout: u32,

    /// Final spend of the HTLC output, one of the two
    pub claim_txid: Option<String>,
    pub refund_txid: Option<String>,

    /// Order handle on the counter-chain service
    pub counter_order_id: Option<String>,

    pub provenance: Provenance,
    pub status: OrderStatus,

    /// Triggering error when status is Failed
    pub failure: Option<String>,

    pub created_at: u64,
    pub updated_at: u64,
}

impl Order {
    /// Move to a new status, enforcing the legal-edge table
    pub fn transition_to(&mut self, next: OrderStatus) -> Result<(), SwapError> {
        if !self.status.can_transition_to(next) {
            return Err(SwapError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = unix_now();
        Ok(())
    }

    /// Record an unrecoverable failure
    pub fn fail(&mut self, reason: &str) -> Result<(), SwapError> {
        self.transition_to(OrderStatus::Failed)?;
        self.failure = Some(reason.to_string());
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::secret::{commit, generate_secret};

    pub(crate) fn sample_order() -> Order {
        let secret = generate_secret().unwrap();
        Order {
            id: OrderId::generate().unwrap(),
            source_chain: "bitcoin_testnet".into(),
            dest_chain: "1".into(),
            source_kind: ChainKind::UtxoModel,
            dest_kind: ChainKind::AccountModel,
            amount: 100_000,
            commitment: commit(&secret),
            secret: Some(secret),
            timelock: 1_700_003_600,
            htlc_address: "2NTest".into(),
            redeem_script: vec![0x63],
            funding_txid: None,
            funding_vout: 0,
            claim_txid: None,
            refund_txid: None,
            counter_order_id: None,
            provenance: Provenance::Simulated,
            status: OrderStatus::Created,
            failure: None,
            created_at: unix_now(),
            updated_at: unix_now(),
        }
    }

    #[test]
    fn test_chain_kind_resolution() {
        assert_eq!(
            ChainKind::resolve("bitcoin_testnet").unwrap(),
            ChainKind::UtxoModel
        );
        assert_eq!(ChainKind::resolve("137").unwrap(), ChainKind::AccountModel);
        assert!(ChainKind::resolve("dogecoin").is_err());
    }

    #[test]
    fn test_success_path() {
        let mut order = sample_order();
        order.transition_to(OrderStatus::FundingBroadcast).unwrap();
        order.transition_to(OrderStatus::FundingConfirmed).unwrap();
        order.transition_to(OrderStatus::SecretRevealed).unwrap();
        order.transition_to(OrderStatus::Claimed).unwrap();
        assert!(order.status.is_terminal());
    }

    #[test]
    fn test_refund_path() {
        let mut order = sample_order();
        order.transition_to(OrderStatus::FundingBroadcast).unwrap();
        order.transition_to(OrderStatus::FundingConfirmed).unwrap();
        order.transition_to(OrderStatus::TimelockExpired).unwrap();
        order.transition_to(OrderStatus::Refunded).unwrap();
    }

    #[test]
    fn test_no_refund_after_reveal() {
        let mut order = sample_order();
        order.transition_to(OrderStatus::FundingBroadcast).unwrap();
        order.transition_to(OrderStatus::FundingConfirmed).unwrap();
        order.transition_to(OrderStatus::SecretRevealed).unwrap();

        let err = order.transition_to(OrderStatus::TimelockExpired);
        assert!(matches!(err, Err(SwapError::InvalidTransition { .. })));
        assert_eq!(order.status, OrderStatus::SecretRevealed);
    }

    #[test]
    fn test_claimed_and_refunded_mutually_exclusive() {
        // Walk every legal path: no status sequence reaches both Claimed
        // and Refunded. Claimed requires SecretRevealed, Refunded requires
        // TimelockExpired, and those two are alternatives out of
        // FundingConfirmed with no edge between the branches.
        use OrderStatus::*;
        for status in [Created, FundingBroadcast, FundingConfirmed, SecretRevealed,
                       Claimed, TimelockExpired, Refunded, Failed, Abandoned] {
            if status.can_transition_to(Claimed) {
                assert_eq!(status, SecretRevealed);
            }
            if status.can_transition_to(Refunded) {
                assert_eq!(status, TimelockExpired);
            }
        }
        assert!(!SecretRevealed.can_transition_to(TimelockExpired));
        assert!(!TimelockExpired.can_transition_to(SecretRevealed));
        assert!(!Claimed.can_transition_to(Refunded));
        assert!(!Refunded.can_transition_to(Claimed));
    }

    #[test]
    fn test_abandon_only_before_broadcast() {
        let mut order = sample_order();
        order.transition_to(OrderStatus::FundingBroadcast).unwrap();
        assert!(order.transition_to(OrderStatus::Abandoned).is_err());

        let mut fresh = sample_order();
        fresh.transition_to(OrderStatus::Abandoned).unwrap();
    }

    #[test]
    fn test_failed_from_any_active_state() {
        let mut order = sample_order();
        order.transition_to(OrderStatus::FundingBroadcast).unwrap();
        order.fail("broadcast rejected by every endpoint").unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert!(order.failure.is_some());

        // But not from a terminal state
        assert!(order.transition_to(OrderStatus::Failed).is_err());
    }

    #[test]
    fn test_order_id_round_trip() {
        let id = OrderId::generate().unwrap();
        assert_eq!(OrderId::from_hex(&id.to_hex()).unwrap(), id);
    }
}
