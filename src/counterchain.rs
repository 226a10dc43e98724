// =============================================================================
// TIDESWAP - Counter-Chain Service Client
// =============================================================================
//
// Client for the relay service coordinating the account-model leg of a
// swap. The engine publishes the hash commitment here at order
// placement, and submits the secret once the UTXO-side funding is
// final. Like the chain gateway this layer carries no business logic;
// transport and HTTP failures surface as transient gateway errors so
// the caller can retry without touching order state.
//
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SwapError;
use crate::secret::{Commitment, Secret};

// =============================================================================
// Wire Types
// =============================================================================

/// Price quote for a cross-chain swap
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Quote {
    pub src_chain: String,
    pub dst_chain: String,
    /// Amount offered on the source chain, base units
    pub amount: u64,
    /// Estimated amount received on the destination chain, base units
    pub estimated_amount: u64,
    pub fee: u64,
    /// Set when the two legs use different transaction models
    pub is_cross_model: bool,
}

/// Acknowledgement of a placed order
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: String,
}

/// Result of submitting the secret for the destination-side claim
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretReceipt {
    pub success: bool,
    pub txid: Option<String>,
}

/// Destination-side order progress
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CounterOrderStatus {
    pub status: String,
    pub confirmations: u64,
}

// =============================================================================
// Trait
// =============================================================================

#[async_trait]
pub trait CounterChain: Send + Sync {
    async fn get_quote(
        &self,
        src_chain: &str,
        dst_chain: &str,
        amount: u64,
    ) -> Result<Quote, SwapError>;

    /// Place the destination-side order under the hash commitment.
    /// Only the commitment crosses this boundary, never the secret.
    async fn place_order(&self, quote: &Quote, commitment: &Commitment)
        -> Result<OrderAck, SwapError>;

    /// Reveal the secret so the counter-party claim can execute
    async fn submit_secret(
        &self,
        order_id: &str,
        secret: &Secret,
    ) -> Result<SecretReceipt, SwapError>;

    async fn order_status(&self, order_id: &str) -> Result<CounterOrderStatus, SwapError>;
}

// =============================================================================
// HTTP Client
// =============================================================================

#[derive(Serialize)]
struct PlaceOrderRequest<'a> {
    src_chain: &'a str,
    dst_chain: &'a str,
    amount: u64,
    hashlock: String,
}

#[derive(Serialize)]
struct SubmitSecretRequest<'a> {
    order_id: &'a str,
    secret: String,
}

/// Relay client over a single base URL with optional bearer auth
pub struct RelayClient {
    base_url: String,
    auth_key: Option<String>,
    client: reqwest::Client,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>, auth_key: Option<String>) -> Self {
        RelayClient {
            base_url: base_url.into(),
            auth_key,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.auth_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        path: &str,
        resp: reqwest::Response,
    ) -> Result<T, SwapError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SwapError::Gateway(format!(
                "{}: HTTP {} {}",
                path,
                status,
                body.trim()
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| SwapError::Gateway(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl CounterChain for RelayClient {
    async fn get_quote(
        &self,
        src_chain: &str,
        dst_chain: &str,
        amount: u64,
    ) -> Result<Quote, SwapError> {
        let path = format!(
            "/quote?src={}&dst={}&amount={}",
            src_chain, dst_chain, amount
        );
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|e| SwapError::Gateway(format!("{}: {}", path, e)))?;
        Self::read_json(&path, resp).await
    }

    async fn place_order(
        &self,
        quote: &Quote,
        commitment: &Commitment,
    ) -> Result<OrderAck, SwapError> {
        let path = "/orders";
        let body = PlaceOrderRequest {
            src_chain: &quote.src_chain,
            dst_chain: &quote.dst_chain,
            amount: quote.amount,
            hashlock: commitment.to_hex(),
        };
        let resp = self
            .request(reqwest::Method::POST, path)
            .json(&body)
            .send()
            .await
            .map_err(|e| SwapError::Gateway(format!("{}: {}", path, e)))?;

        let ack: OrderAck = Self::read_json(path, resp).await?;
        debug!(target: "counterchain", "placed order {} ({})", ack.order_id, ack.status);
        Ok(ack)
    }

    async fn submit_secret(
        &self,
        order_id: &str,
        secret: &Secret,
    ) -> Result<SecretReceipt, SwapError> {
        let path = "/secrets";
        let body = SubmitSecretRequest {
            order_id,
            secret: secret.to_hex(),
        };
        let resp = self
            .request(reqwest::Method::POST, path)
            .json(&body)
            .send()
            .await
            .map_err(|e| SwapError::Gateway(format!("{}: {}", path, e)))?;
        Self::read_json(path, resp).await
    }

    async fn order_status(&self, order_id: &str) -> Result<CounterOrderStatus, SwapError> {
        let path = format!("/orders/{}", order_id);
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|e| SwapError::Gateway(format!("{}: {}", path, e)))?;
        Self::read_json(&path, resp).await
    }
}

// =============================================================================
// Mock Client (test support)
// =============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockState {
        pub placed: Vec<(Quote, Commitment)>,
        pub secrets: Vec<(String, Secret)>,
        pub offline: bool,
        pub next_order_id: u64,
        /// When set, order_status reports this instead of the derived state
        pub status_override: Option<String>,
    }

    /// In-memory counter-chain for tests
    #[derive(Default)]
    pub struct MockCounterChain {
        pub state: Mutex<MockState>,
    }

    impl MockCounterChain {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn placed_count(&self) -> usize {
            self.state.lock().unwrap().placed.len()
        }

        pub fn submitted_secrets(&self) -> Vec<Secret> {
            self.state
                .lock()
                .unwrap()
                .secrets
                .iter()
                .map(|(_, s)| *s)
                .collect()
        }
    }

    #[async_trait]
    impl CounterChain for MockCounterChain {
        async fn get_quote(
            &self,
            src_chain: &str,
            dst_chain: &str,
            amount: u64,
        ) -> Result<Quote, SwapError> {
            if self.state.lock().unwrap().offline {
                return Err(SwapError::Gateway("mock relay offline".into()));
            }
            let src_kind = crate::order::ChainKind::resolve(src_chain)?;
            let dst_kind = crate::order::ChainKind::resolve(dst_chain)?;
            Ok(Quote {
                src_chain: src_chain.to_string(),
                dst_chain: dst_chain.to_string(),
                amount,
                estimated_amount: amount.saturating_sub(amount / 100),
                fee: amount / 100,
                is_cross_model: src_kind != dst_kind,
            })
        }

        async fn place_order(
            &self,
            quote: &Quote,
            commitment: &Commitment,
        ) -> Result<OrderAck, SwapError> {
            let mut state = self.state.lock().unwrap();
            if state.offline {
                return Err(SwapError::Gateway("mock relay offline".into()));
            }
            state.placed.push((quote.clone(), *commitment));
            state.next_order_id += 1;
            Ok(OrderAck {
                order_id: format!("relay-{}", state.next_order_id),
                status: "open".into(),
            })
        }

        async fn submit_secret(
            &self,
            order_id: &str,
            secret: &Secret,
        ) -> Result<SecretReceipt, SwapError> {
            let mut state = self.state.lock().unwrap();
            if state.offline {
                return Err(SwapError::Gateway("mock relay offline".into()));
            }
            state.secrets.push((order_id.to_string(), *secret));
            Ok(SecretReceipt {
                success: true,
                txid: Some("ee".repeat(32)),
            })
        }

        async fn order_status(&self, order_id: &str) -> Result<CounterOrderStatus, SwapError> {
            let state = self.state.lock().unwrap();
            if state.offline {
                return Err(SwapError::Gateway("mock relay offline".into()));
            }
            if let Some(status) = state.status_override.clone() {
                let confirmations = if status == "claimed" { 1 } else { 0 };
                return Ok(CounterOrderStatus { status, confirmations });
            }
            let revealed = state.secrets.iter().any(|(id, _)| id == order_id);
            Ok(CounterOrderStatus {
                status: if revealed { "claimed" } else { "open" }.into(),
                confirmations: if revealed { 1 } else { 0 },
            })
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
