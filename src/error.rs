// =============================================================================
// TIDESWAP - Error Taxonomy
// =============================================================================
//
// Every fallible path in the crate surfaces one of these variants. The
// gateway wraps transport errors before they reach the state machine, so
// the engine never inspects transport-level error shapes.
//
// =============================================================================

/// Crate-wide error type
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SwapError {
    /// Malformed script or order parameters. Never retried.
    Validation(String),

    /// No UTXO subset covers the requested amount plus fee.
    /// Retried only after new funds arrive.
    InsufficientFunds { required: u64, available: u64 },

    /// Transient network or indexer fault. Retried with backoff.
    Gateway(String),

    /// Every configured relay endpoint rejected the transaction.
    /// The caller must rebuild with fresh UTXOs before retrying.
    Broadcast(String),

    /// Key/script mismatch detected while signing. Fatal.
    Signing(String),

    /// Refund attempted before the timelock elapsed.
    /// Fatal to the attempt, not to the order.
    TimelockViolation { timelock: u32 },

    /// Requested state transition is not a legal edge
    InvalidTransition { from: String, to: String },

    /// Secure random source unavailable. Never degraded silently.
    Rng(String),

    /// Durable store failure
    Store(String),

    /// Unknown order or transaction
    NotFound(String),
}

impl SwapError {
    /// Errors that may succeed on retry without operator intervention
    pub fn is_transient(&self) -> bool {
        matches!(self, SwapError::Gateway(_))
    }

    /// Errors that should transition the order to Failed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SwapError::Signing(_) | SwapError::Broadcast(_) | SwapError::Rng(_)
        )
    }
}

impl std::fmt::Display for SwapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwapError::Validation(s) => write!(f, "Validation error: {}", s),
            SwapError::InsufficientFunds { required, available } => write!(
                f,
                "Insufficient funds: required {} but only {} available",
                required, available
            ),
            SwapError::Gateway(s) => write!(f, "Gateway error: {}", s),
            SwapError::Broadcast(s) => write!(f, "Broadcast rejected: {}", s),
            SwapError::Signing(s) => write!(f, "Signing error: {}", s),
            SwapError::TimelockViolation { timelock } => {
                write!(f, "Timelock {} has not elapsed", timelock)
            }
            SwapError::InvalidTransition { from, to } => {
                write!(f, "Invalid transition: {} -> {}", from, to)
            }
            SwapError::Rng(s) => write!(f, "Secure random source unavailable: {}", s),
            SwapError::Store(s) => write!(f, "Store error: {}", s),
            SwapError::NotFound(s) => write!(f, "Not found: {}", s),
        }
    }
}

impl std::error::Error for SwapError {}
