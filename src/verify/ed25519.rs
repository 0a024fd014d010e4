use ed25519_dalek::{Signature, VerifyingKey};

use super::SignatureScheme;
use crate::fih::{FihRet, FlowCounter};
use crate::image::{tlv, IMAGE_HASH_SIZE};

const SIGNATURE_LENGTH: usize = 64;
const KEY_LENGTH: usize = 32;

// SubjectPublicKeyInfo wrapping of an Ed25519 key, as emitted by imgtool.
const SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

const CF_KEY: u32 = 3;
const CF_SIG: u32 = 5;
const CF_VERIFY: u32 = 7;

/// Accepts a raw 32 byte key or its SubjectPublicKeyInfo DER form.
fn import_key(key: &[u8]) -> Option<VerifyingKey> {
    let raw = match key.len() {
        KEY_LENGTH => key,
        len if len == SPKI_PREFIX.len() + KEY_LENGTH && key.starts_with(&SPKI_PREFIX) => {
            &key[SPKI_PREFIX.len()..]
        }
        _ => return None,
    };
    let raw: &[u8; KEY_LENGTH] = raw.try_into().ok()?;
    VerifyingKey::from_bytes(raw).ok()
}

/// Ed25519 over the SHA-256 image digest, or over a complete image.
pub struct Ed25519;

impl SignatureScheme for Ed25519 {
    const SIG_TLV: u16 = tlv::ED25519;
    const MAX_SIG_LEN: usize = SIGNATURE_LENGTH;

    fn verify_hash(hash: &[u8], sig: &[u8], key: &[u8]) -> FihRet {
        if hash.len() != IMAGE_HASH_SIZE {
            return FihRet::FAILURE;
        }
        Self::verify_message(hash, sig, key)
    }

    fn verify_message(msg: &[u8], sig: &[u8], key: &[u8]) -> FihRet {
        let mut flow = FlowCounter::new();
        let Some(key) = import_key(key) else {
            return FihRet::FAILURE;
        };
        flow.pass(CF_KEY);
        let Ok(sig) = <&[u8; SIGNATURE_LENGTH]>::try_from(sig) else {
            return FihRet::FAILURE;
        };
        flow.pass(CF_SIG);
        let sig = Signature::from_bytes(sig);
        if key.verify_strict(msg, &sig).is_err() {
            return FihRet::FAILURE;
        }
        flow.pass(CF_VERIFY);
        if flow.reached(CF_KEY + CF_SIG + CF_VERIFY) {
            FihRet::SUCCESS
        } else {
            FihRet::FAILURE
        }
    }
}
