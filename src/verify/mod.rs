//! Signature verification over image digests.
//!
//! The algorithm is a build-time choice: each backend implements [`SignatureScheme`] behind its
//! own Cargo feature and the bootloader is generic over it, so exactly one backend is compiled
//! into a target. Keys come from a [`KeyStore`], which may expose several revocable slots.

#[cfg(feature = "sign-ec256")]
pub mod ec256;
#[cfg(feature = "sign-ed25519")]
pub mod ed25519;
pub mod revoke;

use core::marker::PhantomData;

use sha2::{Digest, Sha256};

use crate::fih::{fih_memequal, FihRet};
use crate::image::IMAGE_HASH_SIZE;
use crate::log;

#[cfg(feature = "sign-ed25519")]
pub type DefaultScheme = ed25519::Ed25519;
#[cfg(all(feature = "sign-ec256", not(feature = "sign-ed25519")))]
pub type DefaultScheme = ec256::EcdsaP256;

/// Index of a key in its [`KeyStore`]. Lower ids are tried first.
pub type KeyId = u8;

pub trait SignatureScheme {
    /// TLV type holding the signature in the image trailer.
    const SIG_TLV: u16;
    /// Longest signature encoding accepted from the trailer.
    const MAX_SIG_LEN: usize;

    /// Verifies `sig` over an image digest. Fails closed unless `hash` has the digest length.
    fn verify_hash(hash: &[u8], sig: &[u8], key: &[u8]) -> FihRet;

    /// Verifies `sig` over a complete message.
    fn verify_message(msg: &[u8], sig: &[u8], key: &[u8]) -> FihRet;
}

/// Source of public keys trusted to sign images.
pub trait KeyStore {
    fn key_count(&self) -> usize;

    fn key(&self, id: KeyId) -> Option<&[u8]>;

    /// Revoked keys are skipped during verification.
    fn is_revoked(&self, _id: KeyId) -> bool {
        false
    }
}

/// Keys compiled into the bootloader image.
pub struct StaticKeys<'a> {
    keys: &'a [&'a [u8]],
}

impl<'a> StaticKeys<'a> {
    pub const fn new(keys: &'a [&'a [u8]]) -> Self {
        Self { keys }
    }
}

impl KeyStore for StaticKeys<'_> {
    fn key_count(&self) -> usize {
        self.keys.len()
    }

    fn key(&self, id: KeyId) -> Option<&[u8]> {
        self.keys.get(usize::from(id)).copied()
    }
}

/// Runs a [`SignatureScheme`] against the keys of a [`KeyStore`] and remembers which key
/// produced the last successful verification.
pub struct Verifier<'k, S: SignatureScheme, K: KeyStore> {
    keys: &'k K,
    validated: Option<KeyId>,
    _scheme: PhantomData<S>,
}

impl<'k, S: SignatureScheme, K: KeyStore> Verifier<'k, S, K> {
    pub fn new(keys: &'k K) -> Self {
        Self {
            keys,
            validated: None,
            _scheme: PhantomData,
        }
    }

    /// Key that verified the most recent successful signature.
    pub fn validated_key(&self) -> Option<KeyId> {
        self.validated
    }

    /// Finds the key whose SHA-256 digest equals `key_hash`.
    pub fn find_key(&self, key_hash: &[u8]) -> Option<KeyId> {
        let mut found = None;
        for id in 0..self.key_count() {
            let Some(key) = self.keys.key(id) else {
                continue;
            };
            let digest = Sha256::digest(key);
            if fih_memequal(digest.as_slice(), key_hash) == FihRet::SUCCESS && found.is_none() {
                found = Some(id);
            }
        }
        found
    }

    fn key_count(&self) -> KeyId {
        KeyId::try_from(self.keys.key_count()).unwrap_or(KeyId::MAX)
    }

    /// Verifies `sig` over `hash`. With `key` set only that key is tried, otherwise every key
    /// that is not revoked is tried in priority order and the first match wins.
    pub fn verify(&mut self, hash: &[u8], sig: &[u8], key: Option<KeyId>) -> FihRet {
        if hash.len() != IMAGE_HASH_SIZE {
            log::error!("Digest length {} does not match the scheme", hash.len());
            return FihRet::FAILURE;
        }
        self.run(key, |key| S::verify_hash(hash, sig, key))
    }

    /// Like [`Verifier::verify`], over a complete message instead of a digest.
    pub fn verify_message(&mut self, msg: &[u8], sig: &[u8], key: Option<KeyId>) -> FihRet {
        self.run(key, |key| S::verify_message(msg, sig, key))
    }

    fn run(&mut self, key: Option<KeyId>, check: impl Fn(&[u8]) -> FihRet) -> FihRet {
        self.validated = None;
        let candidates = match key {
            Some(id) => id..id.saturating_add(1),
            None => 0..self.key_count(),
        };
        for id in candidates {
            if self.keys.is_revoked(id) {
                log::warn!("Skipping revoked key {}", id);
                continue;
            }
            let Some(material) = self.keys.key(id) else {
                continue;
            };
            if check(material) == FihRet::SUCCESS {
                log::debug!("Signature verified with key {}", id);
                self.validated = Some(id);
                return FihRet::SUCCESS;
            }
        }
        FihRet::FAILURE
    }
}
