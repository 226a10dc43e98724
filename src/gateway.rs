// =============================================================================
// TIDESWAP - Chain Data Gateway
// =============================================================================
//
// Thin I/O boundary over a remote Esplora-style indexer. This layer has
// no business logic: it fetches balances, unspent outputs and raw
// transactions, broadcasts signed transactions, and reports inclusion
// depth. Every other component depends on the trait's return types only,
// never on the transport, and transport errors are wrapped into the
// crate error taxonomy before they leave this module.
//
// =============================================================================

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::SwapError;
use crate::tx::OutPoint;
use crate::utxo::Utxo;

// =============================================================================
// Gateway Trait
// =============================================================================

/// Confirmed/unconfirmed balance split for an address
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Balance {
    pub confirmed: u64,
    pub unconfirmed: u64,
}

#[async_trait]
pub trait ChainGateway: Send + Sync {
    async fn get_balance(&self, address: &str) -> Result<Balance, SwapError>;

    async fn list_unspent(&self, address: &str) -> Result<Vec<Utxo>, SwapError>;

    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, SwapError>;

    /// Broadcast a signed transaction, returning its txid.
    /// Tries each configured relay endpoint in order, first success wins.
    async fn broadcast(&self, tx_bytes: &[u8]) -> Result<String, SwapError>;

    /// Inclusion depth: 0 = in mempool, negative = not found/evicted
    async fn confirmation_depth(&self, txid: &str) -> Result<i64, SwapError>;

    async fn tip_height(&self) -> Result<u64, SwapError>;
}

// =============================================================================
// Esplora REST Gateway
// =============================================================================

/// Gateway over one or more Esplora-style REST endpoints
/// (e.g. https://blockstream.info/testnet/api)
pub struct EsploraGateway {
    endpoints: Vec<String>,
    client: reqwest::Client,
}

// Esplora response shapes

#[derive(Deserialize)]
struct AddressStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

#[derive(Deserialize)]
struct AddressInfo {
    chain_stats: AddressStats,
    mempool_stats: AddressStats,
}

#[derive(Deserialize)]
struct UtxoStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

#[derive(Deserialize)]
struct UtxoInfo {
    txid: String,
    vout: u32,
    value: u64,
    status: UtxoStatus,
}

#[derive(Deserialize)]
struct TxInfo {
    status: UtxoStatus,
}

impl EsploraGateway {
    pub fn new(endpoints: Vec<String>) -> Result<Self, SwapError> {
        if endpoints.is_empty() {
            return Err(SwapError::Validation(
                "At least one gateway endpoint is required".into(),
            ));
        }
        Ok(EsploraGateway {
            endpoints,
            client: reqwest::Client::new(),
        })
    }

    /// GET a JSON resource, trying each endpoint until one answers
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, SwapError> {
        let mut last_error = String::new();

        for endpoint in &self.endpoints {
            let url = format!("{}{}", endpoint, path);
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<T>()
                        .await
                        .map_err(|e| SwapError::Gateway(format!("{}: {}", url, e)));
                }
                Ok(resp) => {
                    last_error = format!("{}: HTTP {}", url, resp.status());
                }
                Err(e) => {
                    last_error = format!("{}: {}", url, e);
                }
            }
            debug!(target: "gateway", "endpoint failed: {}", last_error);
        }

        Err(SwapError::Gateway(last_error))
    }

    /// GET a plain-text resource, trying each endpoint until one answers.
    /// `Ok(None)` only after every endpoint had its say: a lagging or
    /// pruned indexer answers 404 for a transaction its peers still have,
    /// so a single 404 must not count as absence.
    async fn get_text(&self, path: &str) -> Result<Option<String>, SwapError> {
        let mut last_error = String::new();
        let mut not_found = false;

        for endpoint in &self.endpoints {
            let url = format!("{}{}", endpoint, path);
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .text()
                        .await
                        .map(Some)
                        .map_err(|e| SwapError::Gateway(format!("{}: {}", url, e)));
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    not_found = true;
                    debug!(target: "gateway", "{}: HTTP 404", url);
                }
                Ok(resp) => {
                    last_error = format!("{}: HTTP {}", url, resp.status());
                }
                Err(e) => {
                    last_error = format!("{}: {}", url, e);
                }
            }
        }

        if not_found {
            return Ok(None);
        }
        Err(SwapError::Gateway(last_error))
    }
}

#[async_trait]
impl ChainGateway for EsploraGateway {
    async fn get_balance(&self, address: &str) -> Result<Balance, SwapError> {
        let info: AddressInfo = self.get_json(&format!("/address/{}", address)).await?;
        Ok(Balance {
            confirmed: info
                .chain_stats
                .funded_txo_sum
                .saturating_sub(info.chain_stats.spent_txo_sum),
            unconfirmed: info
                .mempool_stats
                .funded_txo_sum
                .saturating_sub(info.mempool_stats.spent_txo_sum),
        })
    }

    async fn list_unspent(&self, address: &str) -> Result<Vec<Utxo>, SwapError> {
        let tip = self.tip_height().await?;
        let entries: Vec<UtxoInfo> = self
            .get_json(&format!("/address/{}/utxo", address))
            .await?;

        Ok(entries
            .into_iter()
            .map(|u| {
                let confirmations = match (u.status.confirmed, u.status.block_height) {
                    (true, Some(h)) => (tip.saturating_sub(h) + 1) as i64,
                    _ => 0,
                };
                Utxo {
                    outpoint: OutPoint::new(u.txid, u.vout),
                    value: u.value,
                    address: address.to_string(),
                    confirmations,
                }
            })
            .collect())
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, SwapError> {
        let hex = self
            .get_text(&format!("/tx/{}/hex", txid))
            .await?
            .ok_or_else(|| SwapError::NotFound(format!("Transaction {}", txid)))?;
        hex::decode(hex.trim())
            .map_err(|e| SwapError::Gateway(format!("Invalid raw tx hex for {}: {}", txid, e)))
    }

    async fn broadcast(&self, tx_bytes: &[u8]) -> Result<String, SwapError> {
        let body = hex::encode(tx_bytes);
        let mut last_error = String::new();

        for endpoint in &self.endpoints {
            let url = format!("{}/tx", endpoint);
            match self.client.post(&url).body(body.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let txid = resp
                        .text()
                        .await
                        .map_err(|e| SwapError::Gateway(format!("{}: {}", url, e)))?;
                    return Ok(txid.trim().to_string());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let reason = resp.text().await.unwrap_or_default();
                    last_error = format!("{}: HTTP {} {}", url, status, reason.trim());
                }
                Err(e) => {
                    last_error = format!("{}: {}", url, e);
                }
            }
            warn!(target: "gateway", "broadcast attempt failed: {}", last_error);
        }

        Err(SwapError::Broadcast(last_error))
    }

    async fn confirmation_depth(&self, txid: &str) -> Result<i64, SwapError> {
        // 404 means not found or evicted from the mempool
        let info = match self.get_text(&format!("/tx/{}", txid)).await? {
            Some(body) => serde_json::from_str::<TxInfo>(&body)
                .map_err(|e| SwapError::Gateway(format!("Invalid tx status for {}: {}", txid, e)))?,
            None => return Ok(-1),
        };

        match (info.status.confirmed, info.status.block_height) {
            (true, Some(height)) => {
                let tip = self.tip_height().await?;
                Ok((tip.saturating_sub(height) + 1) as i64)
            }
            _ => Ok(0),
        }
    }

    async fn tip_height(&self) -> Result<u64, SwapError> {
        let text = self
            .get_text("/blocks/tip/height")
            .await?
            .ok_or_else(|| SwapError::Gateway("Tip height unavailable".into()))?;
        text.trim()
            .parse::<u64>()
            .map_err(|e| SwapError::Gateway(format!("Invalid tip height: {}", e)))
    }
}

// =============================================================================
// Mock Gateway (test support)
// =============================================================================


// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::mock::MockGateway;
    use super::*;

    #[test]
    fn test_empty_endpoints_rejected() {
        assert!(EsploraGateway::new(vec![]).is_err());
    }

    #[tokio::test]
    async fn test_mock_round_trip() {
        let gw = MockGateway::new();
        gw.add_utxo("tb1qtest", &"11".repeat(32), 0, 60_000);
        gw.add_utxo("tb1qtest", &"22".repeat(32), 1, 50_000);

        let balance = gw.get_balance("tb1qtest").await.unwrap();
        assert_eq!(balance.confirmed, 110_000);

        let utxos = gw.list_unspent("tb1qtest").await.unwrap();
        assert_eq!(utxos.len(), 2);

        assert_eq!(gw.confirmation_depth("unknown").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_mock_offline_is_gateway_error() {
        let gw = MockGateway::new();
        gw.state.lock().unwrap().offline = true;

        let err = gw.get_balance("tb1qtest").await.unwrap_err();
        assert!(err.is_transient());
    }
}
