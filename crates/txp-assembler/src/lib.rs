//! Transaction Assembler — pure construction of the data-carrier transaction.
//!
//! Given one acquired output and a caller payload, produce the serialized
//! transaction that spends the output into a single zero-value embed script
//! (fee = the output's whole value; outputs are pre-sized so there is no
//! change). No storage, no clock, no network: same inputs, same bytes.
//!
//! Script and sighash forms follow the aggregator's expectations:
//! - embed script: `OP_FALSE OP_RETURN <minimal push of payload>`
//! - signature: ECDSA over the BIP143-form preimage, sighash `ALL|FORKID`
//! - unlock: `<sig+hashtype> <compressed pubkey>`

use anyhow::{Context, Result};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

const OP_FALSE: u8 = 0x00;
const OP_RETURN: u8 = 0x6a;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;

const TX_VERSION: u32 = 1;
const SEQUENCE_FINAL: u32 = 0xffff_ffff;
const SIGHASH_ALL_FORKID: u32 = 0x41;

// ---------------------------------------------------------------------------
// AssembleError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    PayloadTooLarge { len: usize, max: usize },
}

impl std::fmt::Display for AssembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssembleError::PayloadTooLarge { len, max } => {
                write!(f, "payload of {} bytes exceeds the {} byte ceiling", len, max)
            }
        }
    }
}

impl std::error::Error for AssembleError {}

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// The previous output being consumed, as handed over by the pool.
#[derive(Debug, Clone)]
pub struct PrevOutput {
    /// Display-order (big-endian) transaction id hex.
    pub txid: String,
    pub vout: u32,
    pub value_satoshis: u64,
    pub locking_script: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Assembled {
    pub raw_tx: Vec<u8>,
    pub txid: String,
}

/// Publishing key material. The secret key never leaves this struct.
#[derive(Clone)]
pub struct SigningKey {
    secret: SecretKey,
    public: PublicKey,
}

impl SigningKey {
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex.trim()).context("publishing key is not hex")?;
        let secret =
            SecretKey::from_slice(&bytes).context("publishing key is not a valid secret key")?;
        let public = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
        Ok(Self { secret, public })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("SigningKey")
            .field("public", &self.public_key_hex())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Build and sign the one-input, one-output carrier transaction.
pub fn assemble(
    prev: &PrevOutput,
    payload: &[u8],
    key: &SigningKey,
    max_payload: usize,
) -> Result<Assembled> {
    if payload.len() > max_payload {
        return Err(AssembleError::PayloadTooLarge {
            len: payload.len(),
            max: max_payload,
        }
        .into());
    }

    let embed = embed_script(payload);
    let prev_txid_le = txid_to_le_bytes(&prev.txid)?;

    let sighash = sighash_preimage_digest(prev, &prev_txid_le, &embed);
    let script_sig = unlock_script(&sighash, key);

    let raw_tx = serialize_tx(&prev_txid_le, prev.vout, &script_sig, &embed);
    let txid = txid_hex(&raw_tx);

    Ok(Assembled { raw_tx, txid })
}

/// `OP_FALSE OP_RETURN` followed by the minimal canonical push of `payload`.
///
/// Push form by length: direct opcode (≤ 75), `OP_PUSHDATA1` (≤ 255),
/// `OP_PUSHDATA2` (≤ 65535), `OP_PUSHDATA4` above that.
pub fn embed_script(payload: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(payload.len() + 7);
    script.push(OP_FALSE);
    script.push(OP_RETURN);
    push_data(&mut script, payload);
    script
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len <= 75 {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xffff {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

fn write_var_int(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Display-order txid hex → wire-order (little-endian) bytes.
fn txid_to_le_bytes(txid: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(txid).context("previous txid is not hex")?;
    anyhow::ensure!(bytes.len() == 32, "previous txid must be 32 bytes");
    let mut le = [0u8; 32];
    for (i, b) in bytes.iter().rev().enumerate() {
        le[i] = *b;
    }
    Ok(le)
}

/// Transaction id: byte-reversed hex of the double-SHA256 of the raw bytes.
pub fn txid_hex(raw_tx: &[u8]) -> String {
    let mut digest = double_sha256(raw_tx);
    digest.reverse();
    hex::encode(digest)
}

/// The sole output: zero value, embed script.
fn serialize_output(embed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + embed.len());
    out.extend_from_slice(&0u64.to_le_bytes());
    write_var_int(&mut out, embed.len() as u64);
    out.extend_from_slice(embed);
    out
}

/// BIP143-form preimage digest for the single input, sighash `ALL|FORKID`.
fn sighash_preimage_digest(prev: &PrevOutput, prev_txid_le: &[u8; 32], embed: &[u8]) -> [u8; 32] {
    let mut outpoint = Vec::with_capacity(36);
    outpoint.extend_from_slice(prev_txid_le);
    outpoint.extend_from_slice(&prev.vout.to_le_bytes());

    let hash_prevouts = double_sha256(&outpoint);
    let hash_sequence = double_sha256(&SEQUENCE_FINAL.to_le_bytes());
    let hash_outputs = double_sha256(&serialize_output(embed));

    let mut preimage = Vec::with_capacity(156 + prev.locking_script.len());
    preimage.extend_from_slice(&TX_VERSION.to_le_bytes());
    preimage.extend_from_slice(&hash_prevouts);
    preimage.extend_from_slice(&hash_sequence);
    preimage.extend_from_slice(&outpoint);
    write_var_int(&mut preimage, prev.locking_script.len() as u64);
    preimage.extend_from_slice(&prev.locking_script);
    preimage.extend_from_slice(&prev.value_satoshis.to_le_bytes());
    preimage.extend_from_slice(&SEQUENCE_FINAL.to_le_bytes());
    preimage.extend_from_slice(&hash_outputs);
    preimage.extend_from_slice(&0u32.to_le_bytes()); // locktime
    preimage.extend_from_slice(&SIGHASH_ALL_FORKID.to_le_bytes());

    double_sha256(&preimage)
}

/// `<DER sig + hashtype byte> <compressed pubkey>`.
fn unlock_script(sighash: &[u8; 32], key: &SigningKey) -> Vec<u8> {
    let secp = Secp256k1::new();
    let message = Message::from_digest(*sighash);
    let signature = secp.sign_ecdsa(&message, &key.secret);

    let mut sig_bytes = signature.serialize_der().to_vec();
    sig_bytes.push(SIGHASH_ALL_FORKID as u8);

    let pubkey = key.public.serialize();

    let mut script = Vec::with_capacity(sig_bytes.len() + pubkey.len() + 2);
    push_data(&mut script, &sig_bytes);
    push_data(&mut script, &pubkey);
    script
}

fn serialize_tx(prev_txid_le: &[u8; 32], vout: u32, script_sig: &[u8], embed: &[u8]) -> Vec<u8> {
    let mut tx = Vec::with_capacity(128 + script_sig.len() + embed.len());
    tx.extend_from_slice(&TX_VERSION.to_le_bytes());

    // One input.
    write_var_int(&mut tx, 1);
    tx.extend_from_slice(prev_txid_le);
    tx.extend_from_slice(&vout.to_le_bytes());
    write_var_int(&mut tx, script_sig.len() as u64);
    tx.extend_from_slice(script_sig);
    tx.extend_from_slice(&SEQUENCE_FINAL.to_le_bytes());

    // One output.
    write_var_int(&mut tx, 1);
    tx.extend_from_slice(&serialize_output(embed));

    // Locktime.
    tx.extend_from_slice(&0u32.to_le_bytes());
    tx
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SigningKey {
        SigningKey::from_hex("000000000000000000000000000000000000000000000000000000000000002a")
            .unwrap()
    }

    fn test_prev() -> PrevOutput {
        PrevOutput {
            txid: "aa".repeat(32),
            vout: 3,
            value_satoshis: 550,
            locking_script: hex::decode("76a914000000000000000000000000000000000000000088ac")
                .unwrap(),
        }
    }

    #[test]
    fn embed_uses_direct_push_up_to_75() {
        for len in [0usize, 1, 75] {
            let payload = vec![0x42u8; len];
            let script = embed_script(&payload);
            assert_eq!(&script[..2], &[OP_FALSE, OP_RETURN]);
            assert_eq!(script[2], len as u8, "direct push opcode for len {len}");
            assert_eq!(script.len(), 3 + len);
        }
    }

    #[test]
    fn embed_uses_pushdata1_from_76_to_255() {
        for len in [76usize, 255] {
            let payload = vec![0x42u8; len];
            let script = embed_script(&payload);
            assert_eq!(script[2], OP_PUSHDATA1, "pushdata1 for len {len}");
            assert_eq!(script[3], len as u8);
            assert_eq!(script.len(), 4 + len);
        }
    }

    #[test]
    fn embed_uses_pushdata2_from_256() {
        let payload = vec![0x42u8; 256];
        let script = embed_script(&payload);
        assert_eq!(script[2], OP_PUSHDATA2);
        assert_eq!(&script[3..5], &256u16.to_le_bytes());
        assert_eq!(script.len(), 5 + 256);
    }

    #[test]
    fn embed_uses_pushdata4_past_65535() {
        let payload = vec![0x42u8; 70_000];
        let script = embed_script(&payload);
        assert_eq!(script[2], OP_PUSHDATA4);
        assert_eq!(&script[3..7], &70_000u32.to_le_bytes());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; 101];
        let err = assemble(&test_prev(), &payload, &test_key(), 100).unwrap_err();
        let refusal = err.downcast_ref::<AssembleError>().expect("typed refusal");
        assert_eq!(
            *refusal,
            AssembleError::PayloadTooLarge { len: 101, max: 100 }
        );
    }

    #[test]
    fn payload_at_ceiling_is_accepted() {
        let payload = vec![0u8; 100];
        assert!(assemble(&test_prev(), &payload, &test_key(), 100).is_ok());
    }

    #[test]
    fn assembled_tx_has_expected_shape() {
        let assembled = assemble(&test_prev(), b"hello", &test_key(), 1024).unwrap();
        let tx = &assembled.raw_tx;

        // version 1
        assert_eq!(&tx[..4], &1u32.to_le_bytes());
        // one input
        assert_eq!(tx[4], 1);
        // previous txid in wire (reversed) order — all-0xaa is its own reverse
        assert_eq!(&tx[5..37], &[0xaa; 32]);
        // previous vout
        assert_eq!(&tx[37..41], &3u32.to_le_bytes());

        // txid is 32 bytes of hex and deterministic
        assert_eq!(assembled.txid.len(), 64);
        let again = assemble(&test_prev(), b"hello", &test_key(), 1024).unwrap();
        assert_eq!(assembled.txid, again.txid);
        assert_eq!(assembled.raw_tx, again.raw_tx);

        // sole output is zero-value and starts the embed script correctly
        let tail = &tx[tx.len() - (4 + 8 + 1 + 2 + 1 + 5)..];
        assert_eq!(&tail[..8], &0u64.to_le_bytes());
        // varint(script len 8) then OP_FALSE OP_RETURN push(5) "hello"
        assert_eq!(tail[8], 8);
        assert_eq!(&tail[9..12], &[OP_FALSE, OP_RETURN, 5]);
        assert_eq!(&tail[12..17], b"hello");
        // locktime 0
        assert_eq!(&tail[17..], &0u32.to_le_bytes());
    }

    #[test]
    fn signature_verifies_against_publishing_key() {
        let prev = test_prev();
        let key = test_key();
        let payload = b"payload";
        let embed = embed_script(payload);
        let prev_txid_le = txid_to_le_bytes(&prev.txid).unwrap();
        let digest = sighash_preimage_digest(&prev, &prev_txid_le, &embed);

        let script = unlock_script(&digest, &key);
        // First push is <DER sig + hashtype>, second is the compressed pubkey.
        let sig_len = script[0] as usize;
        let sig_der = &script[1..sig_len]; // drop trailing hashtype byte
        let hashtype = script[sig_len];
        assert_eq!(hashtype, SIGHASH_ALL_FORKID as u8);
        let pub_len = script[sig_len + 1] as usize;
        let pub_bytes = &script[sig_len + 2..sig_len + 2 + pub_len];
        assert_eq!(pub_len, 33);

        let secp = Secp256k1::new();
        let sig = secp256k1::ecdsa::Signature::from_der(sig_der).unwrap();
        let pubkey = PublicKey::from_slice(pub_bytes).unwrap();
        let msg = Message::from_digest(digest);
        assert!(secp.verify_ecdsa(&msg, &sig, &pubkey).is_ok());
    }

    #[test]
    fn txid_is_reversed_double_sha256() {
        let raw = b"raw transaction bytes";
        let txid = txid_hex(raw);
        let mut digest = {
            let first = Sha256::digest(raw);
            Sha256::digest(first).to_vec()
        };
        digest.reverse();
        assert_eq!(txid, hex::encode(digest));
    }
}
