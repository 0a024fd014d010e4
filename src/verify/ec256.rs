use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, VerifyingKey};

use super::SignatureScheme;
use crate::fih::{FihRet, FlowCounter};
use crate::image::{tlv, IMAGE_HASH_SIZE};

// DER signatures of P-256 are at most 72 bytes.
const MAX_SIGNATURE_LENGTH: usize = 72;

// SubjectPublicKeyInfo header of an uncompressed P-256 key.
const SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08, 0x2a,
    0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

const CF_KEY: u32 = 3;
const CF_SIG: u32 = 5;
const CF_VERIFY: u32 = 7;

fn import_key(key: &[u8]) -> Option<VerifyingKey> {
    let sec1 = key.strip_prefix(&SPKI_PREFIX[..]).unwrap_or(key);
    VerifyingKey::from_sec1_bytes(sec1).ok()
}

fn verdict(flow: &FlowCounter) -> FihRet {
    if flow.reached(CF_KEY + CF_SIG + CF_VERIFY) {
        FihRet::SUCCESS
    } else {
        FihRet::FAILURE
    }
}

/// ECDSA P-256 with DER encoded signatures.
pub struct EcdsaP256;

impl SignatureScheme for EcdsaP256 {
    const SIG_TLV: u16 = tlv::ECDSA_SIG;
    const MAX_SIG_LEN: usize = MAX_SIGNATURE_LENGTH;

    fn verify_hash(hash: &[u8], sig: &[u8], key: &[u8]) -> FihRet {
        if hash.len() != IMAGE_HASH_SIZE {
            return FihRet::FAILURE;
        }
        let mut flow = FlowCounter::new();
        let Some(key) = import_key(key) else {
            return FihRet::FAILURE;
        };
        flow.pass(CF_KEY);
        let Ok(sig) = Signature::from_der(sig) else {
            return FihRet::FAILURE;
        };
        flow.pass(CF_SIG);
        if key.verify_prehash(hash, &sig).is_err() {
            return FihRet::FAILURE;
        }
        flow.pass(CF_VERIFY);
        verdict(&flow)
    }

    fn verify_message(msg: &[u8], sig: &[u8], key: &[u8]) -> FihRet {
        let mut flow = FlowCounter::new();
        let Some(key) = import_key(key) else {
            return FihRet::FAILURE;
        };
        flow.pass(CF_KEY);
        let Ok(sig) = Signature::from_der(sig) else {
            return FihRet::FAILURE;
        };
        flow.pass(CF_SIG);
        if key.verify(msg, &sig).is_err() {
            return FihRet::FAILURE;
        }
        flow.pass(CF_VERIFY);
        verdict(&flow)
    }
}
