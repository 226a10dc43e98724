// =============================================================================
// TIDESWAP - HTLC Script Builder
// =============================================================================
//
// Script templates for the Hash Time Lock Contract that carries the swap.
//
// Redeem script structure:
// OP_IF
//     OP_SHA256 <commitment> OP_EQUALVERIFY
//     <claimant_pubkey> OP_CHECKSIG
// OP_ELSE
//     <timelock> OP_CHECKLOCKTIMEVERIFY OP_DROP
//     <funder_pubkey> OP_CHECKSIG
// OP_ENDIF
//
// To claim with the secret:
//     <signature> <preimage> OP_TRUE <redeem_script>
//
// To refund after the timelock:
//     <signature> OP_FALSE <redeem_script>
//
// Exactly one branch can execute for a given spend, and the compiled
// bytes are deterministic for identical parameters.
//
// =============================================================================

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::SwapError;
use crate::secret::{Commitment, Secret};
use crate::PUBKEY_SIZE;

// =============================================================================
// Script Opcodes
// =============================================================================

pub mod opcodes {
    pub const OP_FALSE: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_TRUE: u8 = 0x51;
    pub const OP_IF: u8 = 0x63;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_SHA256: u8 = 0xa8;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
}

// =============================================================================
// HTLC Parameters
// =============================================================================

/// Validated parameters for an HTLC redeem script. Orders persist only
/// the compiled redeem script; parameters are recovered from it with
/// `from_redeem_script`, so this type never hits storage or the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HtlcParams {
    /// SHA-256 commitment to the swap secret
    pub commitment: Commitment,

    /// Absolute locktime: block height below 500_000_000, unix time above
    pub timelock: u32,

    /// Public key that can claim with the preimage (compressed)
    pub claimant_pubkey: [u8; PUBKEY_SIZE],

    /// Public key that can refund after the timelock (compressed)
    pub funder_pubkey: [u8; PUBKEY_SIZE],
}

impl HtlcParams {
    /// Validate and build HTLC parameters.
    ///
    /// The claimant and funder keys must differ; a same-key HTLC makes the
    /// two branches indistinguishable in ownership and is only useful as a
    /// test fixture (see `degenerate_for_tests`).
    pub fn new(
        commitment: Commitment,
        timelock: u32,
        claimant_pubkey: &[u8],
        funder_pubkey: &[u8],
    ) -> Result<Self, SwapError> {
        if timelock == 0 {
            return Err(SwapError::Validation("Timelock must be non-zero".into()));
        }
        let claimant = check_pubkey(claimant_pubkey, "claimant")?;
        let funder = check_pubkey(funder_pubkey, "funder")?;
        if claimant == funder {
            return Err(SwapError::Validation(
                "Claimant and funder keys must differ".into(),
            ));
        }
        Ok(HtlcParams {
            commitment,
            timelock,
            claimant_pubkey: claimant,
            funder_pubkey: funder,
        })
    }

    /// Same-key HTLC, accepted only as a degenerate fixture for tests and
    /// demos. Production order creation goes through `new`.
    pub fn degenerate_for_tests(
        commitment: Commitment,
        timelock: u32,
        pubkey: &[u8],
    ) -> Result<Self, SwapError> {
        if timelock == 0 {
            return Err(SwapError::Validation("Timelock must be non-zero".into()));
        }
        let key = check_pubkey(pubkey, "shared")?;
        Ok(HtlcParams {
            commitment,
            timelock,
            claimant_pubkey: key,
            funder_pubkey: key,
        })
    }

    /// Recover the parameters from a compiled redeem script. Inverse of
    /// `build_script`; rejects anything that is not this exact template.
    pub fn from_redeem_script(script: &[u8]) -> Result<Self, SwapError> {
        use opcodes::*;

        let mut cursor = ScriptCursor::new(script);

        cursor.expect_op(OP_IF)?;
        cursor.expect_op(OP_SHA256)?;
        let commitment = Commitment::from_slice(cursor.take_push()?)?;
        cursor.expect_op(OP_EQUALVERIFY)?;
        let claimant = cursor.take_push()?.to_vec();
        cursor.expect_op(OP_CHECKSIG)?;

        cursor.expect_op(OP_ELSE)?;
        let timelock = decode_locktime(cursor.take_push()?);
        cursor.expect_op(OP_CHECKLOCKTIMEVERIFY)?;
        cursor.expect_op(OP_DROP)?;
        let funder = cursor.take_push()?.to_vec();
        cursor.expect_op(OP_CHECKSIG)?;

        cursor.expect_op(OP_ENDIF)?;
        cursor.expect_end()?;

        if timelock == 0 {
            return Err(SwapError::Validation(
                "Redeem script has a zero timelock".into(),
            ));
        }
        Ok(HtlcParams {
            commitment,
            timelock,
            claimant_pubkey: check_pubkey(&claimant, "claimant")?,
            funder_pubkey: check_pubkey(&funder, "funder")?,
        })
    }
}

struct ScriptCursor<'a> {
    script: &'a [u8],
    pos: usize,
}

impl<'a> ScriptCursor<'a> {
    fn new(script: &'a [u8]) -> Self {
        ScriptCursor { script, pos: 0 }
    }

    fn expect_op(&mut self, op: u8) -> Result<(), SwapError> {
        match self.script.get(self.pos) {
            Some(&byte) if byte == op => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(SwapError::Validation(format!(
                "Not an HTLC redeem script: expected opcode {:#04x} at offset {}",
                op, self.pos
            ))),
        }
    }

    fn take_push(&mut self) -> Result<&'a [u8], SwapError> {
        let len = match self.script.get(self.pos) {
            Some(&n) if (1..=75).contains(&n) => {
                self.pos += 1;
                n as usize
            }
            Some(&op) if op == opcodes::OP_PUSHDATA1 => {
                let n = *self.script.get(self.pos + 1).ok_or_else(|| {
                    SwapError::Validation("Truncated PUSHDATA1 in redeem script".into())
                })?;
                self.pos += 2;
                n as usize
            }
            _ => {
                return Err(SwapError::Validation(format!(
                    "Not an HTLC redeem script: expected data push at offset {}",
                    self.pos
                )))
            }
        };
        let data = self
            .script
            .get(self.pos..self.pos + len)
            .ok_or_else(|| SwapError::Validation("Truncated push in redeem script".into()))?;
        self.pos += len;
        Ok(data)
    }

    fn expect_end(&self) -> Result<(), SwapError> {
        if self.pos == self.script.len() {
            Ok(())
        } else {
            Err(SwapError::Validation(
                "Trailing bytes after HTLC redeem script".into(),
            ))
        }
    }
}

fn check_pubkey(bytes: &[u8], who: &str) -> Result<[u8; PUBKEY_SIZE], SwapError> {
    if bytes.len() != PUBKEY_SIZE {
        return Err(SwapError::Validation(format!(
            "Invalid {} pubkey length: {} (expected {})",
            who,
            bytes.len(),
            PUBKEY_SIZE
        )));
    }
    // Compressed keys start with 0x02 or 0x03
    if bytes[0] != 0x02 && bytes[0] != 0x03 {
        return Err(SwapError::Validation(format!(
            "Invalid {} pubkey prefix: {:#04x}",
            who, bytes[0]
        )));
    }
    let mut buf = [0u8; PUBKEY_SIZE];
    buf.copy_from_slice(bytes);
    Ok(buf)
}

// =============================================================================
// Script Compilation
// =============================================================================

/// Compile the HTLC redeem script. Byte-stable for identical parameters.
pub fn build_script(params: &HtlcParams) -> Vec<u8> {
    use opcodes::*;

    let mut script = Vec::with_capacity(128);

    // Claim branch: preimage hash check, then claimant signature
    script.push(OP_IF);
    script.push(OP_SHA256);
    push_data(&mut script, params.commitment.as_bytes());
    script.push(OP_EQUALVERIFY);
    push_data(&mut script, &params.claimant_pubkey);
    script.push(OP_CHECKSIG);

    // Refund branch: locktime check, then funder signature
    script.push(OP_ELSE);
    push_data(&mut script, &encode_locktime(params.timelock));
    script.push(OP_CHECKLOCKTIMEVERIFY);
    script.push(OP_DROP);
    push_data(&mut script, &params.funder_pubkey);
    script.push(OP_CHECKSIG);

    script.push(OP_ENDIF);
    script
}

/// Unlocking script for the claim branch
pub fn claim_script_sig(signature: &[u8], secret: &Secret, redeem_script: &[u8]) -> Vec<u8> {
    use opcodes::*;

    let mut script = Vec::new();
    push_data(&mut script, signature);
    push_data(&mut script, secret.as_bytes());
    script.push(OP_TRUE);
    push_data(&mut script, redeem_script);
    script
}

/// Unlocking script for the refund branch
pub fn refund_script_sig(signature: &[u8], redeem_script: &[u8]) -> Vec<u8> {
    use opcodes::*;

    let mut script = Vec::new();
    push_data(&mut script, signature);
    script.push(OP_FALSE);
    push_data(&mut script, redeem_script);
    script
}

/// Push a data element with the minimal push opcode
fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(data.len() <= 255, "push_data supports up to 255 bytes");
    if data.len() <= 75 {
        script.push(data.len() as u8);
    } else {
        script.push(opcodes::OP_PUSHDATA1);
        script.push(data.len() as u8);
    }
    script.extend_from_slice(data);
}

// =============================================================================
// Script Hash and Address
// =============================================================================

/// HASH160 of a script (for P2SH)
pub fn script_hash(script: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(script);
    let hash160 = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash160);
    out
}

/// Base58check P2SH address for a redeem script
pub fn p2sh_address(script: &[u8], version: u8) -> String {
    crate::tx::hash_to_address(version, &script_hash(script))
}

// =============================================================================
// Locktime Encoding
// =============================================================================

/// Encode a locktime as a minimal script number (little-endian, sign bit
/// padded)
pub fn encode_locktime(locktime: u32) -> Vec<u8> {
    if locktime == 0 {
        return vec![];
    }

    let mut bytes = locktime.to_le_bytes().to_vec();
    while bytes.len() > 1 && bytes.last() == Some(&0) {
        bytes.pop();
    }
    // Keep the number positive if the high bit is set
    if bytes.last().map(|b| b & 0x80 != 0).unwrap_or(false) {
        bytes.push(0x00);
    }
    bytes
}

/// Decode a script-number locktime
pub fn decode_locktime(bytes: &[u8]) -> u32 {
    if bytes.is_empty() {
        return 0;
    }

    let mut value: u32 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if i < 4 {
            value |= (byte as u32) << (i * 8);
        }
    }

    if bytes.len() <= 4 && bytes.last().map(|b| b & 0x80 != 0).unwrap_or(false) {
        let sign_bit = 1u32 << (bytes.len() * 8 - 1);
        value &= !sign_bit;
    }

    value
}

// =============================================================================
// Disassembler
// =============================================================================

/// Human-readable form of an HTLC script, for logs and debugging
pub fn disassemble(script: &[u8]) -> String {
    use opcodes::*;

    let mut result = String::new();
    let mut i = 0;

    while i < script.len() {
        let op = script[i];

        let op_name = match op {
            OP_FALSE => "OP_FALSE",
            OP_TRUE => "OP_TRUE",
            OP_IF => "OP_IF",
            OP_ELSE => "OP_ELSE",
            OP_ENDIF => "OP_ENDIF",
            OP_DROP => "OP_DROP",
            OP_DUP => "OP_DUP",
            OP_EQUAL => "OP_EQUAL",
            OP_EQUALVERIFY => "OP_EQUALVERIFY",
            OP_SHA256 => "OP_SHA256",
            OP_HASH160 => "OP_HASH160",
            OP_CHECKSIG => "OP_CHECKSIG",
            OP_CHECKLOCKTIMEVERIFY => "OP_CLTV",
            1..=75 => {
                let len = op as usize;
                if i + 1 + len <= script.len() {
                    let data = &script[i + 1..i + 1 + len];
                    result.push_str(&format!("<{}> ", hex::encode(data)));
                    i += 1 + len;
                    continue;
                }
                "PUSH?"
            }
            OP_PUSHDATA1 => {
                if i + 1 < script.len() {
                    let len = script[i + 1] as usize;
                    if i + 2 + len <= script.len() {
                        let data = &script[i + 2..i + 2 + len];
                        result.push_str(&format!("<{}> ", hex::encode(data)));
                        i += 2 + len;
                        continue;
                    }
                }
                "PUSHDATA1?"
            }
            _ => "?",
        };

        result.push_str(op_name);
        result.push(' ');
        i += 1;
    }

    result.trim().to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::{commit, generate_secret};
    use crate::SECRET_SIZE;

    fn sample_params() -> HtlcParams {
        HtlcParams::new(
            Commitment([0xAB; 32]),
            500_000,
            &[0x02; 33],
            &[0x03; 33],
        )
        .unwrap()
    }

    #[test]
    fn test_build_script_structure() {
        let script = build_script(&sample_params());

        assert_eq!(script[0], opcodes::OP_IF);
        assert_eq!(script.last(), Some(&opcodes::OP_ENDIF));
        assert!(script.contains(&opcodes::OP_SHA256));
        assert!(script.contains(&opcodes::OP_CHECKLOCKTIMEVERIFY));

        let disasm = disassemble(&script);
        assert!(disasm.contains("OP_IF"));
        assert!(disasm.contains("OP_CLTV"));
        assert!(disasm.contains(&hex::encode([0xAB; 32])));
    }

    #[test]
    fn test_build_script_deterministic() {
        let params = sample_params();
        assert_eq!(build_script(&params), build_script(&params));
    }

    #[test]
    fn test_distinct_inputs_distinct_scripts() {
        let a = sample_params();
        let mut b = sample_params();
        b.timelock += 1;
        assert_ne!(build_script(&a), build_script(&b));
    }

    #[test]
    fn test_same_key_rejected() {
        let result = HtlcParams::new(Commitment([1; 32]), 100, &[0x02; 33], &[0x02; 33]);
        assert!(matches!(result, Err(SwapError::Validation(_))));

        // Explicit degenerate constructor still works for fixtures
        let fixture =
            HtlcParams::degenerate_for_tests(Commitment([1; 32]), 100, &[0x02; 33]);
        assert!(fixture.is_ok());
    }

    #[test]
    fn test_bad_params_rejected() {
        let c = Commitment([1; 32]);
        assert!(HtlcParams::new(c, 0, &[0x02; 33], &[0x03; 33]).is_err());
        assert!(HtlcParams::new(c, 100, &[0x02; 32], &[0x03; 33]).is_err());
        assert!(HtlcParams::new(c, 100, &[0x04; 33], &[0x03; 33]).is_err());
    }

    #[test]
    fn test_claim_script_sig() {
        let secret = generate_secret().unwrap();
        let params = HtlcParams::new(
            commit(&secret),
            500_000,
            &[0x02; 33],
            &[0x03; 33],
        )
        .unwrap();
        let redeem = build_script(&params);
        let sig = vec![0x30; 71];

        let script_sig = claim_script_sig(&sig, &secret, &redeem);

        // Redeem script is the final push; OP_TRUE selects the claim branch
        let marker_pos = 1 + sig.len() + 1 + SECRET_SIZE;
        assert_eq!(script_sig[marker_pos], opcodes::OP_TRUE);
        assert_eq!(&script_sig[script_sig.len() - redeem.len()..], &redeem[..]);
    }

    #[test]
    fn test_refund_script_sig() {
        let redeem = build_script(&sample_params());
        let sig = vec![0x30; 71];

        let script_sig = refund_script_sig(&sig, &redeem);
        assert_eq!(script_sig[1 + sig.len()], opcodes::OP_FALSE);
        assert_eq!(&script_sig[script_sig.len() - redeem.len()..], &redeem[..]);
    }

    #[test]
    fn test_pushdata1_for_long_pushes() {
        // The redeem script itself is > 75 bytes, so pushing it needs
        // OP_PUSHDATA1
        let redeem = build_script(&sample_params());
        assert!(redeem.len() > 75);

        let script_sig = refund_script_sig(&[0x30; 71], &redeem);
        let marker = 1 + 71 + 1;
        assert_eq!(script_sig[marker], opcodes::OP_PUSHDATA1);
        assert_eq!(script_sig[marker + 1] as usize, redeem.len());
    }

    #[test]
    fn test_params_recovered_from_script() {
        let params = sample_params();
        let script = build_script(&params);
        assert_eq!(HtlcParams::from_redeem_script(&script).unwrap(), params);

        // Time-style locktime survives the round trip too
        let timed = HtlcParams::new(
            Commitment([0xCD; 32]),
            1_700_003_600,
            &[0x02; 33],
            &[0x03; 33],
        )
        .unwrap();
        let script = build_script(&timed);
        assert_eq!(HtlcParams::from_redeem_script(&script).unwrap(), timed);
    }

    #[test]
    fn test_foreign_script_rejected() {
        assert!(HtlcParams::from_redeem_script(&[]).is_err());
        assert!(HtlcParams::from_redeem_script(&[opcodes::OP_TRUE]).is_err());

        // A truncated real script is rejected
        let script = build_script(&sample_params());
        assert!(HtlcParams::from_redeem_script(&script[..script.len() - 1]).is_err());
    }

    #[test]
    fn test_encode_decode_locktime() {
        for locktime in [0u32, 100, 500_000, 2_016_000, 1_700_000_000, 0x7FFFFFFF] {
            let encoded = encode_locktime(locktime);
            assert_eq!(decode_locktime(&encoded), locktime, "Failed for {}", locktime);
        }
    }

    #[test]
    fn test_p2sh_address() {
        let script = build_script(&sample_params());
        let hash = script_hash(&script);
        assert_eq!(hash.len(), 20);

        let addr = p2sh_address(&script, 0xc4);
        assert!(!addr.is_empty());
        // Same script, same address
        assert_eq!(addr, p2sh_address(&script, 0xc4));
        // One base58check derivation for every address form
        assert_eq!(addr, crate::tx::hash_to_address(0xc4, &hash));
        // Round-trips through the generic address decoder
        let (version, decoded) = crate::tx::decode_address(&addr).unwrap();
        assert_eq!(version, 0xc4);
        assert_eq!(decoded, hash);
    }
}
