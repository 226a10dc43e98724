// =============================================================================
// TIDESWAP - Transaction Builder / Signer
// =============================================================================
//
// Builds and signs the three transactions of a swap's UTXO leg:
//
// - funding: selects inputs from the funder's unspent outputs, pays the
//   HTLC P2SH output, returns change above the dust threshold
// - claim: spends the HTLC output with the secret preimage
// - refund: spends the HTLC output after the timelock
//
// Input selection is largest-first and re-estimates the fee as inputs
// accumulate. Outputs leased by other in-flight builds are never
// selected. A failure to fetch any selected input's source transaction
// fails the whole build naming the input; proceeding with fewer inputs
// than the fee estimate accounted for could produce an under-funded
// transaction.
//
// =============================================================================

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use std::sync::Arc;
use tracing::debug;

use crate::error::SwapError;
use crate::fees::FeePolicy;
use crate::gateway::ChainGateway;
use crate::htlc::{self, HtlcParams};
use crate::order::OrderId;
use crate::secret::{self, Secret};
use crate::tx::{
    address_to_script_pubkey, p2pkh_script_sig, p2sh_script, pubkey_to_address, sighash, txid,
    Network, OutPoint, Tx, TxIn, TxOut,
};
use crate::utxo::UtxoReservations;
use crate::{DUST_THRESHOLD, LOCKTIME_TIME_THRESHOLD};

// =============================================================================
// Build Results
// =============================================================================

/// A signed funding transaction and its accounting
#[derive(Clone, Debug)]
pub struct FundingBuild {
    pub tx: Tx,
    pub txid: String,
    pub htlc_address: String,
    pub selected: Vec<OutPoint>,
    pub fee: u64,
    pub change: u64,
}

/// A signed claim or refund transaction
#[derive(Clone, Debug)]
pub struct SpendBuild {
    pub tx: Tx,
    pub txid: String,
    pub fee: u64,
}

// =============================================================================
// Builder
// =============================================================================

pub struct HtlcTxBuilder {
    gateway: Arc<dyn ChainGateway>,
    fee_policy: Arc<dyn FeePolicy>,
    reservations: Arc<UtxoReservations>,
    network: Network,
}

impl HtlcTxBuilder {
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        fee_policy: Arc<dyn FeePolicy>,
        reservations: Arc<UtxoReservations>,
        network: Network,
    ) -> Self {
        HtlcTxBuilder {
            gateway,
            fee_policy,
            reservations,
            network,
        }
    }

    // =========================================================================
    // Funding
    // =========================================================================

    /// Build and sign the transaction that locks `amount` in the HTLC
    /// output. Selected inputs are leased to `order` until the build fails
    /// or the funding reaches final confirmation.
    pub async fn build_funding_transaction(
        &self,
        funder_key: &SecretKey,
        funding_address: &str,
        amount: u64,
        params: &HtlcParams,
        order: OrderId,
    ) -> Result<FundingBuild, SwapError> {
        if amount <= DUST_THRESHOLD {
            return Err(SwapError::Validation(format!(
                "HTLC amount {} is at or below the dust threshold",
                amount
            )));
        }

        let secp = Secp256k1::new();
        let pubkey = PublicKey::from_secret_key(&secp, funder_key);
        let pubkey_bytes = pubkey.serialize();
        if pubkey_to_address(&pubkey_bytes, self.network) != funding_address {
            return Err(SwapError::Signing(format!(
                "Funder key does not control address {}",
                funding_address
            )));
        }

        // Largest-first selection over unreserved outputs, re-estimating
        // the fee as the input count grows
        let mut candidates: Vec<_> = self
            .gateway
            .list_unspent(funding_address)
            .await?
            .into_iter()
            .filter(|u| !self.reservations.is_reserved_by_other(&u.outpoint, &order))
            .collect();
        candidates.sort_by(|a, b| b.value.cmp(&a.value));
        let available: u64 = candidates.iter().map(|u| u.value).sum();

        let mut selected = Vec::new();
        let mut total = 0u64;
        let mut fee = 0u64;
        let mut covered = false;
        for utxo in candidates {
            total += utxo.value;
            selected.push(utxo);
            fee = self.fee_policy.fee_for(selected.len(), 2);
            if total >= amount + fee {
                covered = true;
                break;
            }
        }
        if !covered {
            return Err(SwapError::InsufficientFunds {
                required: amount + fee,
                available,
            });
        }

        // Change above dust goes back to the funder; below, into the fee
        let remainder = total - amount - fee;
        let change = if remainder > DUST_THRESHOLD { remainder } else { 0 };
        if change == 0 {
            fee += remainder;
        }

        let outpoints: Vec<OutPoint> =
            selected.iter().map(|u| u.outpoint.clone()).collect();
        self.reservations.reserve(&outpoints, order)?;

        match self
            .assemble_funding(&secp, funder_key, &pubkey_bytes, funding_address, amount,
                              params, &outpoints, fee, change)
            .await
        {
            Ok(build) => Ok(build),
            Err(e) => {
                self.reservations.release_order(&order);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn assemble_funding(
        &self,
        secp: &Secp256k1<secp256k1::All>,
        funder_key: &SecretKey,
        pubkey_bytes: &[u8; 33],
        funding_address: &str,
        amount: u64,
        params: &HtlcParams,
        outpoints: &[OutPoint],
        fee: u64,
        change: u64,
    ) -> Result<FundingBuild, SwapError> {
        // Every selected input's source transaction must be fetchable; a
        // partial failure fails the whole build naming the input
        for outpoint in outpoints {
            self.gateway
                .get_raw_transaction(&outpoint.txid)
                .await
                .map_err(|e| {
                    SwapError::Gateway(format!("Input {} unavailable: {}", outpoint, e))
                })?;
        }

        let redeem_script = htlc::build_script(params);
        let script_hash = htlc::script_hash(&redeem_script);
        let htlc_address =
            crate::tx::hash_to_address(self.network.p2sh_version(), &script_hash);

        let mut outputs = vec![TxOut {
            value: amount,
            script_pubkey: p2sh_script(&script_hash),
        }];
        if change > 0 {
            outputs.push(TxOut {
                value: change,
                script_pubkey: address_to_script_pubkey(funding_address, self.network)?,
            });
        }

        let mut tx = Tx {
            inputs: outpoints
                .iter()
                .map(|o| TxIn::new(o.clone()))
                .collect(),
            outputs,
            locktime: 0,
        };

        let digest = sighash(&tx);
        let message = Message::from_digest(digest);
        let sig = secp.sign_ecdsa(&message, funder_key);
        let mut sig_bytes = sig.serialize_der().to_vec();
        sig_bytes.push(0x01); // SIGHASH_ALL

        for input in &mut tx.inputs {
            input.script_sig = p2pkh_script_sig(&sig_bytes, pubkey_bytes);
        }

        let id = txid(&tx);
        debug!(target: "builder",
            "funding build {}: {} inputs, fee {}, change {}",
            id, tx.inputs.len(), fee, change
        );

        Ok(FundingBuild {
            tx,
            txid: id,
            htlc_address,
            selected: outpoints.to_vec(),
            fee,
            change,
        })
    }

    // =========================================================================
    // Claim
    // =========================================================================

    /// Spend the HTLC output to the claimant with the secret preimage.
    /// The secret is verified against the commitment before anything is
    /// signed.
    pub async fn build_claim_transaction(
        &self,
        claimant_key: &SecretKey,
        funding_txid: &str,
        vout: u32,
        secret: &Secret,
        params: &HtlcParams,
        claimant_address: &str,
    ) -> Result<SpendBuild, SwapError> {
        if !secret::verify(secret, &params.commitment) {
            return Err(SwapError::Validation(
                "Secret does not match the order commitment".into(),
            ));
        }

        let secp = Secp256k1::new();
        let pubkey = PublicKey::from_secret_key(&secp, claimant_key);
        if pubkey.serialize() != params.claimant_pubkey {
            return Err(SwapError::Signing(
                "Claimant key does not match the HTLC claim branch".into(),
            ));
        }

        let redeem_script = htlc::build_script(params);
        let htlc_value = self
            .fetch_htlc_output(funding_txid, vout, &redeem_script)
            .await?;

        let fee = self.fee_policy.fee_for(1, 1);
        let payout = self.spend_value(htlc_value, fee)?;

        let mut tx = Tx {
            inputs: vec![TxIn::new(OutPoint::new(funding_txid, vout))],
            outputs: vec![TxOut {
                value: payout,
                script_pubkey: address_to_script_pubkey(claimant_address, self.network)?,
            }],
            locktime: 0,
        };

        let sig_bytes = sign_sighash(&secp, &tx, claimant_key);
        tx.inputs[0].script_sig = htlc::claim_script_sig(&sig_bytes, secret, &redeem_script);

        let id = txid(&tx);
        Ok(SpendBuild { tx, txid: id, fee })
    }

    // =========================================================================
    // Refund
    // =========================================================================

    /// Spend the HTLC output back to the funder after the timelock.
    /// Checked against chain height or wall clock depending on the
    /// locktime style; before expiry this is a TimelockViolation.
    pub async fn build_refund_transaction(
        &self,
        funder_key: &SecretKey,
        funding_txid: &str,
        vout: u32,
        params: &HtlcParams,
        funder_address: &str,
    ) -> Result<SpendBuild, SwapError> {
        let expired = if params.timelock >= LOCKTIME_TIME_THRESHOLD {
            crate::unix_now() >= params.timelock as u64
        } else {
            self.gateway.tip_height().await? >= params.timelock as u64
        };
        if !expired {
            return Err(SwapError::TimelockViolation {
                timelock: params.timelock,
            });
        }

        let secp = Secp256k1::new();
        let pubkey = PublicKey::from_secret_key(&secp, funder_key);
        if pubkey.serialize() != params.funder_pubkey {
            return Err(SwapError::Signing(
                "Funder key does not match the HTLC refund branch".into(),
            ));
        }

        let redeem_script = htlc::build_script(params);
        let htlc_value = self
            .fetch_htlc_output(funding_txid, vout, &redeem_script)
            .await?;

        let fee = self.fee_policy.fee_for(1, 1);
        let payout = self.spend_value(htlc_value, fee)?;

        // Locktime must be set and the input sequence non-final for CLTV
        let mut tx = Tx {
            inputs: vec![TxIn::with_locktime_enabled(OutPoint::new(funding_txid, vout))],
            outputs: vec![TxOut {
                value: payout,
                script_pubkey: address_to_script_pubkey(funder_address, self.network)?,
            }],
            locktime: params.timelock,
        };

        let sig_bytes = sign_sighash(&secp, &tx, funder_key);
        tx.inputs[0].script_sig = htlc::refund_script_sig(&sig_bytes, &redeem_script);

        let id = txid(&tx);
        Ok(SpendBuild { tx, txid: id, fee })
    }

    // =========================================================================
    // Shared
    // =========================================================================

    /// Fetch the funding transaction and return the HTLC output's value,
    /// verifying it really pays the expected redeem script
    async fn fetch_htlc_output(
        &self,
        funding_txid: &str,
        vout: u32,
        redeem_script: &[u8],
    ) -> Result<u64, SwapError> {
        let raw = self.gateway.get_raw_transaction(funding_txid).await?;
        let funding_tx = Tx::from_bytes(&raw)?;

        let output = funding_tx.outputs.get(vout as usize).ok_or_else(|| {
            SwapError::Validation(format!(
                "Funding transaction {} has no output {}",
                funding_txid, vout
            ))
        })?;

        let expected = p2sh_script(&htlc::script_hash(redeem_script));
        if output.script_pubkey != expected {
            return Err(SwapError::Validation(format!(
                "Output {}:{} is not the expected HTLC script",
                funding_txid, vout
            )));
        }

        Ok(output.value)
    }

    fn spend_value(&self, htlc_value: u64, fee: u64) -> Result<u64, SwapError> {
        let payout = htlc_value.saturating_sub(fee);
        if payout <= DUST_THRESHOLD {
            return Err(SwapError::InsufficientFunds {
                required: fee + DUST_THRESHOLD + 1,
                available: htlc_value,
            });
        }
        Ok(payout)
    }
}

fn sign_sighash(secp: &Secp256k1<secp256k1::All>, tx: &Tx, key: &SecretKey) -> Vec<u8> {
    let message = Message::from_digest(sighash(tx));
    let sig = secp.sign_ecdsa(&message, key);
    let mut bytes = sig.serialize_der().to_vec();
    bytes.push(0x01); // SIGHASH_ALL
    bytes
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::FlatFee;
    use crate::gateway::mock::MockGateway;
    use crate::secret::{commit, generate_secret};
    use crate::unix_now;

    fn keypair(byte: u8) -> (SecretKey, [u8; 33]) {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[byte; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &key).serialize();
        (key, pubkey)
    }

    struct Fixture {
        gateway: Arc<MockGateway>,
        reservations: Arc<UtxoReservations>,
        builder: HtlcTxBuilder,
        funder_key: SecretKey,
        funder_address: String,
        claimant_key: SecretKey,
        claimant_address: String,
        params: HtlcParams,
        secret: Secret,
    }

    fn fixture(timelock: u32) -> Fixture {
        let (funder_key, funder_pubkey) = keypair(1);
        let (claimant_key, claimant_pubkey) = keypair(2);
        let secret = generate_secret().unwrap();
        let params = HtlcParams::new(
            commit(&secret),
            timelock,
            &claimant_pubkey,
            &funder_pubkey,
        )
        .unwrap();

        let gateway = Arc::new(MockGateway::new());
        let reservations = Arc::new(UtxoReservations::new());
        let builder = HtlcTxBuilder::new(
            gateway.clone(),
            Arc::new(FlatFee(1_000)),
            reservations.clone(),
            Network::Testnet,
        );

        Fixture {
            gateway,
            reservations,
            builder,
            funder_key,
            funder_address: pubkey_to_address(&funder_pubkey, Network::Testnet),
            claimant_key,
            claimant_address: pubkey_to_address(&claimant_pubkey, Network::Testnet),
            params,
            secret,
        }
    }

    fn far_future() -> u32 {
        (unix_now() + 3_600) as u32
    }

    #[tokio::test]
    async fn test_funding_selection_scenario() {
        // 100_000 requested from [60_000, 50_000] at flat fee 1_000:
        // both inputs selected, change 9_000, fee 1_000
        let fx = fixture(far_future());
        fx.gateway.add_utxo(&fx.funder_address, &"11".repeat(32), 0, 60_000);
        fx.gateway.add_utxo(&fx.funder_address, &"22".repeat(32), 1, 50_000);

        let order = OrderId::generate().unwrap();
        let build = fx
            .builder
            .build_funding_transaction(
                &fx.funder_key,
                &fx.funder_address,
                100_000,
                &fx.params,
                order,
            )
            .await
            .unwrap();

        assert_eq!(build.selected.len(), 2);
        assert_eq!(build.fee, 1_000);
        assert_eq!(build.change, 9_000);
        assert_eq!(build.tx.outputs[0].value, 100_000);
        assert_eq!(build.tx.outputs[1].value, 9_000);

        // sum(inputs) == sum(outputs) + fee
        assert_eq!(60_000 + 50_000, build.tx.output_sum() + build.fee);

        // Every input is signed
        assert!(build.tx.inputs.iter().all(|i| !i.script_sig.is_empty()));
    }

    #[tokio::test]
    async fn test_funding_insufficient_funds() {
        let fx = fixture(far_future());
        fx.gateway.add_utxo(&fx.funder_address, &"11".repeat(32), 0, 50_000);

        let err = fx
            .builder
            .build_funding_transaction(
                &fx.funder_key,
                &fx.funder_address,
                100_000,
                &fx.params,
                OrderId::generate().unwrap(),
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SwapError::InsufficientFunds { required: 101_000, available: 50_000 }
        );
    }

    #[tokio::test]
    async fn test_sub_dust_change_folded_into_fee() {
        let fx = fixture(far_future());
        // 101_200 total: remainder after amount+fee is 200, below dust
        fx.gateway.add_utxo(&fx.funder_address, &"11".repeat(32), 0, 101_200);

        let build = fx
            .builder
            .build_funding_transaction(
                &fx.funder_key,
                &fx.funder_address,
                100_000,
                &fx.params,
                OrderId::generate().unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(build.change, 0);
        assert_eq!(build.tx.outputs.len(), 1);
        assert_eq!(build.fee, 1_200);
        assert_eq!(101_200, build.tx.output_sum() + build.fee);
    }

    #[tokio::test]
    async fn test_reserved_inputs_not_selected() {
        let fx = fixture(far_future());
        fx.gateway.add_utxo(&fx.funder_address, &"11".repeat(32), 0, 60_000);
        fx.gateway.add_utxo(&fx.funder_address, &"22".repeat(32), 1, 50_000);

        let first = OrderId::generate().unwrap();
        fx.builder
            .build_funding_transaction(
                &fx.funder_key,
                &fx.funder_address,
                100_000,
                &fx.params,
                first,
            )
            .await
            .unwrap();

        // Both outputs are now leased to the first order; a concurrent
        // build for the same address must not double-spend them
        let err = fx
            .builder
            .build_funding_transaction(
                &fx.funder_key,
                &fx.funder_address,
                50_000,
                &fx.params,
                OrderId::generate().unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::InsufficientFunds { available: 0, .. }));
    }

    #[tokio::test]
    async fn test_missing_input_source_fails_whole_build() {
        let fx = fixture(far_future());
        let missing = "33".repeat(32);
        fx.gateway.add_utxo(&fx.funder_address, &"11".repeat(32), 0, 60_000);
        fx.gateway.add_utxo(&fx.funder_address, &missing, 1, 50_000);
        fx.gateway.state.lock().unwrap().missing_raw.push(missing.clone());

        let order = OrderId::generate().unwrap();
        let err = fx
            .builder
            .build_funding_transaction(
                &fx.funder_key,
                &fx.funder_address,
                100_000,
                &fx.params,
                order,
            )
            .await
            .unwrap_err();

        match err {
            SwapError::Gateway(msg) => assert!(msg.contains(&missing)),
            other => panic!("expected Gateway error, got {:?}", other),
        }

        // The failed build released its leases
        assert_eq!(fx.reservations.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_funder_key_is_signing_error() {
        let fx = fixture(far_future());
        let (other_key, _) = keypair(9);

        let err = fx
            .builder
            .build_funding_transaction(
                &other_key,
                &fx.funder_address,
                100_000,
                &fx.params,
                OrderId::generate().unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::Signing(_)));
    }

    async fn funded(fx: &Fixture) -> FundingBuild {
        fx.gateway.add_utxo(&fx.funder_address, &"11".repeat(32), 0, 200_000);
        let build = fx
            .builder
            .build_funding_transaction(
                &fx.funder_key,
                &fx.funder_address,
                100_000,
                &fx.params,
                OrderId::generate().unwrap(),
            )
            .await
            .unwrap();
        fx.gateway.broadcast(&build.tx.to_bytes()).await.unwrap();
        build
    }

    #[tokio::test]
    async fn test_claim_spends_htlc_output() {
        let fx = fixture(far_future());
        let funding = funded(&fx).await;

        let claim = fx
            .builder
            .build_claim_transaction(
                &fx.claimant_key,
                &funding.txid,
                0,
                &fx.secret,
                &fx.params,
                &fx.claimant_address,
            )
            .await
            .unwrap();

        assert_eq!(claim.tx.inputs.len(), 1);
        assert_eq!(claim.tx.outputs[0].value, 100_000 - claim.fee);
        // Preimage travels in the unlocking script
        let script_hex = hex::encode(&claim.tx.inputs[0].script_sig);
        assert!(script_hex.contains(&fx.secret.to_hex()));
    }

    #[tokio::test]
    async fn test_claim_with_wrong_secret_rejected() {
        let fx = fixture(far_future());
        let funding = funded(&fx).await;
        let broadcasts_before = fx.gateway.broadcast_count();

        let wrong = generate_secret().unwrap();
        let err = fx
            .builder
            .build_claim_transaction(
                &fx.claimant_key,
                &funding.txid,
                0,
                &wrong,
                &fx.params,
                &fx.claimant_address,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SwapError::Validation(_)));
        // Nothing was signed or broadcast
        assert_eq!(fx.gateway.broadcast_count(), broadcasts_before);
    }

    #[tokio::test]
    async fn test_refund_before_timelock_rejected() {
        let fx = fixture(far_future());
        let funding = funded(&fx).await;

        let err = fx
            .builder
            .build_refund_transaction(
                &fx.funder_key,
                &funding.txid,
                0,
                &fx.params,
                &fx.funder_address,
            )
            .await
            .unwrap_err();
        assert_eq!(err, SwapError::TimelockViolation { timelock: fx.params.timelock });
    }

    #[tokio::test]
    async fn test_refund_after_height_timelock() {
        // Height-style timelock, expired once the tip passes it
        let fx = fixture(500);
        fx.gateway.state.lock().unwrap().tip = 1_000;
        let funding = funded(&fx).await;

        let refund = fx
            .builder
            .build_refund_transaction(
                &fx.funder_key,
                &funding.txid,
                0,
                &fx.params,
                &fx.funder_address,
            )
            .await
            .unwrap();

        assert_eq!(refund.tx.locktime, 500);
        assert_eq!(refund.tx.inputs[0].sequence, 0xfffffffe);
        assert_eq!(refund.tx.outputs[0].value, 100_000 - refund.fee);
    }

    #[tokio::test]
    async fn test_refund_with_wrong_key_is_signing_error() {
        let fx = fixture(500);
        fx.gateway.state.lock().unwrap().tip = 1_000;
        let funding = funded(&fx).await;

        let err = fx
            .builder
            .build_refund_transaction(
                &fx.claimant_key,
                &funding.txid,
                0,
                &fx.params,
                &fx.funder_address,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::Signing(_)));
    }

    #[tokio::test]
    async fn test_claim_wrong_output_script_rejected() {
        let fx = fixture(far_future());
        let funding = funded(&fx).await;

        // vout 1 is the change output, not the HTLC
        let err = fx
            .builder
            .build_claim_transaction(
                &fx.claimant_key,
                &funding.txid,
                1,
                &fx.secret,
                &fx.params,
                &fx.claimant_address,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::Validation(_)));
    }
}
