//! Authenticity check of a candidate image.

use embedded_storage::nor_flash::ReadNorFlash;
use sha2::{Digest, Sha256};

use super::tlv::{self, TlvEntry, TlvIter};
use super::{ImageError, ImageHeader, Malformed, IMAGE_HASH_SIZE};
use crate::compression::{self, Decompressor};
use crate::fih::{fih_memequal, FihRet, FlowCounter};
use crate::hardware::FlashArea;
use crate::log;
use crate::verify::{KeyId, KeyStore, SignatureScheme, Verifier};
use crate::Address;

/// Largest signature TLV any scheme produces.
pub const MAX_SIGNATURE_LEN: usize = 128;

const CF_HASH: u32 = 3;
const CF_SIGNATURE: u32 = 5;
const CF_DECOMPRESSED: u32 = 7;

/// SHA-256 over header, body and protected TLVs, read through `scratch` in chunks.
pub fn image_hash<F: ReadNorFlash>(
    flash: &mut F,
    area: &FlashArea,
    hdr: &ImageHeader,
    scratch: &mut [u8],
) -> Result<[u8; IMAGE_HASH_SIZE], ImageError> {
    if scratch.is_empty() {
        return Err(ImageError::Unsupported);
    }
    let size = hdr.hashed_size()?;
    if size > area.size() {
        return Err(Malformed::TooLarge.into());
    }
    let mut sha = Sha256::new();
    let mut off: Address = 0;
    while off < size {
        let n = (size - off).min(scratch.len() as Address) as usize;
        area.read(flash, off, &mut scratch[..n])?;
        sha.update(&scratch[..n]);
        off += n as Address;
    }
    Ok(sha.finalize().into())
}

fn read_digest<F: ReadNorFlash>(
    flash: &mut F,
    area: &FlashArea,
    entry: &TlvEntry,
) -> Result<[u8; IMAGE_HASH_SIZE], ImageError> {
    if usize::from(entry.len) != IMAGE_HASH_SIZE {
        return Err(Malformed::TlvLength.into());
    }
    let mut buf = [0u8; IMAGE_HASH_SIZE];
    area.read(flash, entry.off, &mut buf)?;
    Ok(buf)
}

/// Validates images against the keys of a [`KeyStore`] with the scheme `S`.
pub struct ImageValidator<'k, S: SignatureScheme, K: KeyStore> {
    verifier: Verifier<'k, S, K>,
    security_counter: Option<u32>,
}

impl<'k, S: SignatureScheme, K: KeyStore> ImageValidator<'k, S, K> {
    pub fn new(keys: &'k K) -> Self {
        Self {
            verifier: Verifier::new(keys),
            security_counter: None,
        }
    }

    /// Key that verified the last accepted signature.
    pub fn validated_key(&self) -> Option<KeyId> {
        self.verifier.validated_key()
    }

    /// Security counter of the last validated image, when it carried one.
    pub fn security_counter(&self) -> Option<u32> {
        self.security_counter
    }

    fn read_signature<F: ReadNorFlash>(
        flash: &mut F,
        area: &FlashArea,
        entry: &TlvEntry,
        buf: &mut [u8; MAX_SIGNATURE_LEN],
    ) -> Result<usize, ImageError> {
        let len = usize::from(entry.len);
        if len == 0 || len > S::MAX_SIG_LEN || len > buf.len() {
            return Err(Malformed::TlvLength.into());
        }
        area.read(flash, entry.off, &mut buf[..len])?;
        Ok(len)
    }

    /// Checks the image in `area` described by `hdr`. Structural problems are errors, a
    /// cryptographic mismatch is an `Ok` verdict other than [`FihRet::SUCCESS`]. Never writes.
    pub fn validate<F: ReadNorFlash, D: Decompressor>(
        &mut self,
        flash: &mut F,
        area: &FlashArea,
        hdr: &ImageHeader,
        scratch: &mut [u8],
        dec: &mut D,
    ) -> Result<FihRet, ImageError> {
        let mut flow = FlowCounter::new();
        self.security_counter = None;

        let hash = image_hash(flash, area, hdr, scratch)?;

        let mut hash_rc = FihRet::FAILURE;
        let mut found_hash = false;
        let mut key_hash = None;
        let mut signature = None;

        let mut it = TlvIter::begin(flash, area, hdr, None, false)?;
        while let Some(entry) = it.next(flash, area)? {
            if it.is_protected(entry.off) {
                if entry.kind == tlv::SEC_CNT {
                    self.security_counter = Some(self.read_counter(flash, area, &entry)?);
                }
                continue;
            }
            match entry.kind {
                tlv::SHA256 => {
                    let expected = read_digest(flash, area, &entry)?;
                    if !found_hash {
                        hash_rc = fih_memequal(&hash, &expected);
                        found_hash = true;
                    }
                }
                tlv::KEYHASH => {
                    key_hash = Some(read_digest(flash, area, &entry)?);
                }
                kind if kind == S::SIG_TLV => {
                    if usize::from(entry.len) > S::MAX_SIG_LEN {
                        return Err(Malformed::TlvLength.into());
                    }
                    signature = Some(entry);
                }
                _ => {}
            }
        }

        if !found_hash {
            log::error!("Image in area {} carries no hash", area.id);
            return Err(Malformed::MissingHash.into());
        }
        let Some(signature) = signature else {
            log::error!("Image in area {} carries no signature", area.id);
            return Err(Malformed::MissingSignature.into());
        };

        if hash_rc != FihRet::SUCCESS {
            log::warn!("Image hash mismatch in area {}", area.id);
            return Ok(FihRet::FAILURE);
        }
        flow.pass(CF_HASH);

        let key = match key_hash {
            Some(digest) => match self.verifier.find_key(&digest) {
                Some(id) => Some(id),
                None => {
                    log::warn!("Image in area {} is signed with an unknown key", area.id);
                    return Ok(FihRet::FAILURE);
                }
            },
            None => None,
        };

        let mut sig = [0u8; MAX_SIGNATURE_LEN];
        let len = Self::read_signature(flash, area, &signature, &mut sig)?;
        if self.verifier.verify(&hash, &sig[..len], key) != FihRet::SUCCESS {
            log::warn!("Image signature mismatch in area {}", area.id);
            return Ok(FihRet::FAILURE);
        }
        flow.pass(CF_SIGNATURE);

        let mut expected_flow = CF_HASH + CF_SIGNATURE;
        if hdr.flags.is_compressed() {
            let key = key.or(self.verifier.validated_key());
            if self.validate_decompressed(flash, area, hdr, scratch, dec, key)? != FihRet::SUCCESS
            {
                return Ok(FihRet::FAILURE);
            }
            flow.pass(CF_DECOMPRESSED);
            expected_flow += CF_DECOMPRESSED;
        }

        if flow.reached(expected_flow) {
            log::info!("Image in area {} validated", area.id);
            Ok(FihRet::SUCCESS)
        } else {
            Ok(FihRet::FAILURE)
        }
    }

    fn read_counter<F: ReadNorFlash>(
        &self,
        flash: &mut F,
        area: &FlashArea,
        entry: &TlvEntry,
    ) -> Result<u32, ImageError> {
        if entry.len != 4 {
            return Err(Malformed::TlvLength.into());
        }
        let mut buf = [0u8; 4];
        area.read(flash, entry.off, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Checks the digest and signature the decompressed form of a compressed image must have.
    fn validate_decompressed<F: ReadNorFlash, D: Decompressor>(
        &mut self,
        flash: &mut F,
        area: &FlashArea,
        hdr: &ImageHeader,
        scratch: &mut [u8],
        dec: &mut D,
        key: Option<KeyId>,
    ) -> Result<FihRet, ImageError> {
        let digest = compression::hash_decompressed(flash, area, hdr, dec, scratch)?;

        let mut expected = None;
        let mut signature = None;
        let mut it = TlvIter::begin(flash, area, hdr, None, true)?;
        while let Some(entry) = it.next(flash, area)? {
            match entry.kind {
                tlv::DECOMP_SHA => expected = Some(read_digest(flash, area, &entry)?),
                tlv::DECOMP_SIGNATURE => signature = Some(entry),
                _ => {}
            }
        }
        let Some(expected) = expected else {
            return Err(Malformed::MissingHash.into());
        };
        let Some(signature) = signature else {
            return Err(Malformed::MissingSignature.into());
        };

        if fih_memequal(&digest, &expected) != FihRet::SUCCESS {
            log::warn!("Decompressed image hash mismatch in area {}", area.id);
            return Ok(FihRet::FAILURE);
        }
        let mut sig = [0u8; MAX_SIGNATURE_LEN];
        let len = Self::read_signature(flash, area, &signature, &mut sig)?;
        Ok(self.verifier.verify(&digest, &sig[..len], key))
    }
}
