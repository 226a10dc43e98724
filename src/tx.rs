// =============================================================================
// TIDESWAP - Transactions (UTXO Model)
// =============================================================================
//
// Wire model for the UTXO chain: ordered inputs referencing previous
// outputs, ordered outputs paying script pubkeys. Txids and signature
// hashes are double SHA-256 over the bincode encoding, with unlocking
// data cleared for the signature hash.
//
// =============================================================================

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SwapError;
use crate::htlc::opcodes;

// =============================================================================
// Network
// =============================================================================

/// Address version bytes for the supported networks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn p2pkh_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet => 0x6f,
        }
    }

    pub fn p2sh_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x05,
            Network::Testnet => 0xc4,
        }
    }
}

// =============================================================================
// Transaction Model
// =============================================================================

/// Reference to a previous transaction output
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        OutPoint { txid: txid.into(), vout }
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// Transaction input: previous output plus unlocking data
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(previous_output: OutPoint) -> Self {
        TxIn {
            previous_output,
            script_sig: Vec::new(),
            sequence: 0xffffffff,
        }
    }

    /// Input with a non-final sequence so the transaction locktime applies
    pub fn with_locktime_enabled(previous_output: OutPoint) -> Self {
        TxIn {
            previous_output,
            script_sig: Vec::new(),
            sequence: 0xfffffffe,
        }
    }
}

/// Transaction output: amount and locking script
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// Complete transaction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tx {
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub locktime: u32,
}

impl Tx {
    pub fn output_sum(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("Tx serialization cannot fail")
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SwapError> {
        bincode::deserialize(bytes)
            .map_err(|e| SwapError::Validation(format!("Invalid transaction bytes: {}", e)))
    }
}

/// Transaction id: double SHA-256 of the full encoding, hex
pub fn txid(tx: &Tx) -> String {
    let data = tx.to_bytes();
    let first = Sha256::digest(&data);
    let second = Sha256::digest(first);
    hex::encode(second)
}

/// Signature hash: double SHA-256 of the encoding with unlocking data
/// cleared from every input
pub fn sighash(tx: &Tx) -> [u8; 32] {
    let mut copy = tx.clone();
    for input in &mut copy.inputs {
        input.script_sig.clear();
    }
    let data = copy.to_bytes();
    let first = Sha256::digest(&data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

// =============================================================================
// Standard Scripts and Addresses
// =============================================================================

/// P2PKH locking script for a 20-byte pubkey hash
pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(opcodes::OP_DUP);
    script.push(opcodes::OP_HASH160);
    script.push(20);
    script.extend_from_slice(pubkey_hash);
    script.push(opcodes::OP_EQUALVERIFY);
    script.push(opcodes::OP_CHECKSIG);
    script
}

/// P2SH locking script for a 20-byte script hash
pub fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(opcodes::OP_HASH160);
    script.push(20);
    script.extend_from_slice(script_hash);
    script.push(opcodes::OP_EQUAL);
    script
}

/// P2PKH unlocking script: signature then public key
pub fn p2pkh_script_sig(signature: &[u8], pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(2 + signature.len() + pubkey.len());
    script.push(signature.len() as u8);
    script.extend_from_slice(signature);
    script.push(pubkey.len() as u8);
    script.extend_from_slice(pubkey);
    script
}

/// HASH160 of a serialized public key
pub fn pubkey_hash(pubkey: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(pubkey);
    let hash160 = ripemd::Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash160);
    out
}

/// Base58check address for a version byte and 20-byte hash
pub fn hash_to_address(version: u8, hash: &[u8; 20]) -> String {
    let mut payload = vec![version];
    payload.extend_from_slice(hash);
    let checksum = Sha256::digest(Sha256::digest(&payload));
    payload.extend_from_slice(&checksum[..4]);
    bs58::encode(payload).into_string()
}

/// P2PKH address for a compressed public key
pub fn pubkey_to_address(pubkey: &[u8], network: Network) -> String {
    hash_to_address(network.p2pkh_version(), &pubkey_hash(pubkey))
}

/// Decode a base58check address into its version byte and hash
pub fn decode_address(address: &str) -> Result<(u8, [u8; 20]), SwapError> {
    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|e| SwapError::Validation(format!("Invalid address encoding: {}", e)))?;

    if decoded.len() != 25 {
        return Err(SwapError::Validation(format!(
            "Invalid address length: {}",
            decoded.len()
        )));
    }

    let payload = &decoded[..21];
    let checksum = &decoded[21..];
    let computed = Sha256::digest(Sha256::digest(payload));
    if &computed[..4] != checksum {
        return Err(SwapError::Validation("Invalid address checksum".into()));
    }

    let mut hash = [0u8; 20];
    hash.copy_from_slice(&decoded[1..21]);
    Ok((decoded[0], hash))
}

/// Locking script for an address on the given network
pub fn address_to_script_pubkey(address: &str, network: Network) -> Result<Vec<u8>, SwapError> {
    let (version, hash) = decode_address(address)?;
    if version == network.p2pkh_version() {
        Ok(p2pkh_script(&hash))
    } else if version == network.p2sh_version() {
        Ok(p2sh_script(&hash))
    } else {
        Err(SwapError::Validation(format!(
            "Address version {:#04x} does not match network {:?}",
            version, network
        )))
    }
}

// =============================================================================
// Tests
// =============================================================================
