#![allow(dead_code)]

use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};
use swapboot::boot::{BootResponse, Bootloader};
use swapboot::compression::Decompressor;
use swapboot::embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash,
};
use swapboot::hardware::processor::Processor;
use swapboot::hardware::{Config, FlashArea};
use swapboot::image::tlv;
use swapboot::verify::ed25519::Ed25519;
use swapboot::verify::{KeyId, KeyStore};
use swapboot::Context;

pub const SECTOR: u32 = 1024;
pub const SLOT_SECTORS: u32 = 12;
pub const SLOT_SIZE: u32 = SECTOR * SLOT_SECTORS;
pub const MAX_SECTORS: u32 = 16;
pub const SCRATCH: usize = 256;

/// In-memory NOR flash: programming may only touch erased bytes, every mutating operation is
/// counted and power can be cut before the next N operations.
#[derive(Clone)]
pub struct MemFlash {
    pub mem: Vec<u8>,
    pub ops: usize,
    budget: Option<usize>,
}

impl MemFlash {
    pub fn new(size: u32) -> Self {
        Self {
            mem: vec![0xff; size as usize],
            ops: 0,
            budget: None,
        }
    }

    /// Lets `ops` more mutating operations succeed, the following ones fail.
    pub fn cut_power_after(&mut self, ops: usize) {
        self.budget = Some(ops);
    }

    pub fn restore_power(&mut self) {
        self.budget = None;
    }

    fn spend(&mut self) -> Result<(), NorFlashErrorKind> {
        if let Some(budget) = self.budget.as_mut() {
            if *budget == 0 {
                return Err(NorFlashErrorKind::Other);
            }
            *budget -= 1;
        }
        self.ops += 1;
        Ok(())
    }

    /// Programs `bytes` at the start of `area`, bypassing the counters.
    pub fn load(&mut self, area: &FlashArea, bytes: &[u8]) {
        let start = area.offset as usize;
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn area(&self, area: &FlashArea) -> &[u8] {
        &self.mem[area.offset as usize..(area.offset + area.size) as usize]
    }
}

impl ErrorType for MemFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for MemFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.mem.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        bytes.copy_from_slice(&self.mem[start..end]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl NorFlash for MemFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = SECTOR as usize;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if to as usize > self.mem.len() || from > to {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        self.spend()?;
        self.mem[from as usize..to as usize].fill(0xff);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let start = offset as usize;
        if start + bytes.len() > self.mem.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        self.spend()?;
        for (i, (cell, b)) in self.mem[start..].iter_mut().zip(bytes).enumerate() {
            assert_eq!(*cell, 0xff, "programming a non-erased byte at {:#x}", start + i);
            *cell = *b;
        }
        Ok(())
    }
}

pub fn primary() -> FlashArea {
    FlashArea {
        id: 1,
        device_id: 0,
        offset: 0,
        size: SLOT_SIZE,
        sector_size: SECTOR,
        erased_val: 0xff,
    }
}

pub fn secondary() -> FlashArea {
    FlashArea {
        id: 2,
        device_id: 0,
        offset: SLOT_SIZE,
        size: SLOT_SIZE,
        sector_size: SECTOR,
        erased_val: 0xff,
    }
}

pub fn config() -> Config {
    let mut config = Config::new(primary(), secondary());
    config.max_image_sectors = MAX_SECTORS;
    config
}

pub fn flash() -> MemFlash {
    MemFlash::new(2 * SLOT_SIZE)
}

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Public keys held by the bootloader, optionally with revoked slots.
#[derive(Clone, Default)]
pub struct TestKeys {
    pub keys: Vec<[u8; 32]>,
    pub revoked: Vec<bool>,
}

impl TestKeys {
    pub fn of(signers: &[&SigningKey]) -> Self {
        Self {
            keys: signers.iter().map(|k| k.verifying_key().to_bytes()).collect(),
            revoked: vec![false; signers.len()],
        }
    }
}

impl KeyStore for TestKeys {
    fn key_count(&self) -> usize {
        self.keys.len()
    }

    fn key(&self, id: KeyId) -> Option<&[u8]> {
        self.keys.get(usize::from(id)).map(|k| &k[..])
    }

    fn is_revoked(&self, id: KeyId) -> bool {
        self.revoked.get(usize::from(id)).copied().unwrap_or(false)
    }
}

/// Run-length decoder standing in for LZMA: pairs of (count, byte).
pub struct Rle {
    pending: Option<u8>,
    out: Vec<u8>,
    pub chunk: usize,
}

impl Rle {
    pub fn new() -> Self {
        Self {
            pending: None,
            out: Vec::new(),
            chunk: 16,
        }
    }
}

impl Decompressor for Rle {
    type Error = &'static str;

    fn init(&mut self) -> Result<(), Self::Error> {
        self.pending = None;
        Ok(())
    }

    fn deinit(&mut self) {
        self.out.clear();
    }

    fn bytes_needed(&self) -> usize {
        self.chunk
    }

    fn decompress(&mut self, input: &[u8], last: bool) -> Result<(usize, &[u8]), Self::Error> {
        self.out.clear();
        for b in input {
            match self.pending.take() {
                None => self.pending = Some(*b),
                Some(count) => self.out.extend(std::iter::repeat(*b).take(usize::from(count))),
            }
        }
        if last && self.pending.is_some() {
            return Err("truncated stream");
        }
        Ok((input.len(), &self.out))
    }
}

pub fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        let mut n = 1;
        while i + n < data.len() && data[i + n] == b && n < 255 {
            n += 1;
        }
        out.push(n as u8);
        out.push(b);
        i += n;
    }
    out
}

/// A decoder that never consumes input.
pub struct Stalled;

impl Decompressor for Stalled {
    type Error = ();

    fn init(&mut self) -> Result<(), ()> {
        Ok(())
    }

    fn deinit(&mut self) {}

    fn bytes_needed(&self) -> usize {
        16
    }

    fn decompress(&mut self, _input: &[u8], _last: bool) -> Result<(usize, &[u8]), ()> {
        Ok((0, &[]))
    }
}

pub struct NoJump;

impl Processor for NoJump {
    fn do_jump(&mut self, response: &BootResponse) -> ! {
        panic!("jump to image in area {}", response.area.id)
    }

    fn setup(&mut self, _config: &Config) {}
}

pub struct TestContext;

impl Context for TestContext {
    type Flash = MemFlash;
    type Scheme = Ed25519;
    type Keys = TestKeys;
    type Decompressor = Rle;
    type Processor = NoJump;
}

pub type TestBootloader = Bootloader<TestContext, SCRATCH>;

pub fn bootloader(config: Config, flash: MemFlash, keys: TestKeys) -> TestBootloader {
    Bootloader::new(config, flash, keys, Rle::new(), NoJump)
}

/// Deterministic pseudo random image body.
pub fn body(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect()
}

/// Body that compresses well under [`rle_encode`].
pub fn runs(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i / 37) as u8).collect()
}

fn tlv_area(magic: u16, entries: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let tot: usize = 4 + entries.iter().map(|(_, d)| 4 + d.len()).sum::<usize>();
    let mut out = Vec::with_capacity(tot);
    out.extend_from_slice(&magic.to_le_bytes());
    out.extend_from_slice(&(tot as u16).to_le_bytes());
    for (kind, data) in entries {
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        out.extend_from_slice(data);
    }
    out
}

#[derive(Clone)]
pub struct ImageBuilder {
    pub hdr_size: u16,
    pub body: Vec<u8>,
    pub flags: u32,
    pub version: (u8, u8, u16, u32),
    pub protected: Vec<(u16, Vec<u8>)>,
    pub unprotected: Vec<(u16, Vec<u8>)>,
    pub key_hash: bool,
    pub signature_first: bool,
}

impl ImageBuilder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            hdr_size: 0x40,
            body,
            flags: 0,
            version: (1, 0, 0, 0),
            protected: Vec::new(),
            unprotected: Vec::new(),
            key_hash: false,
            signature_first: false,
        }
    }

    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.version = (major, minor, 0, 0);
        self
    }

    pub fn protected(mut self, kind: u16, data: &[u8]) -> Self {
        self.protected.push((kind, data.to_vec()));
        self
    }

    pub fn unprotected(mut self, kind: u16, data: &[u8]) -> Self {
        self.unprotected.push((kind, data.to_vec()));
        self
    }

    pub fn key_hash(mut self) -> Self {
        self.key_hash = true;
        self
    }

    pub fn signature_first(mut self) -> Self {
        self.signature_first = true;
        self
    }

    fn protected_area(&self) -> Vec<u8> {
        if self.protected.is_empty() {
            Vec::new()
        } else {
            tlv_area(tlv::TLV_PROT_INFO_MAGIC, &self.protected)
        }
    }

    /// Header, padding, body and protected TLVs: the bytes the image hash covers.
    pub fn hashed(&self) -> Vec<u8> {
        let prot = self.protected_area();
        let mut out = Vec::new();
        out.extend_from_slice(&0x96f3_b83du32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.hdr_size.to_le_bytes());
        out.extend_from_slice(&(prot.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.push(self.version.0);
        out.push(self.version.1);
        out.extend_from_slice(&self.version.2.to_le_bytes());
        out.extend_from_slice(&self.version.3.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.resize(usize::from(self.hdr_size), 0xff);
        out.extend_from_slice(&self.body);
        out.extend_from_slice(&prot);
        out
    }

    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(self.hashed()).into()
    }

    pub fn build(&self, key: &SigningKey) -> Vec<u8> {
        let hash = self.hash();
        let sig = key.sign(&hash).to_bytes().to_vec();
        let mut entries = Vec::new();
        if self.signature_first {
            entries.push((tlv::ED25519, sig.clone()));
        }
        entries.push((tlv::SHA256, hash.to_vec()));
        if self.key_hash {
            let digest = Sha256::digest(key.verifying_key().to_bytes());
            entries.push((tlv::KEYHASH, digest.to_vec()));
        }
        if !self.signature_first {
            entries.push((tlv::ED25519, sig));
        }
        entries.extend(self.unprotected.iter().cloned());

        let mut out = self.hashed();
        out.extend_from_slice(&tlv_area(tlv::TLV_INFO_MAGIC, &entries));
        out
    }

    /// Offset of the first unprotected TLV record.
    pub fn unprotected_offset(&self) -> usize {
        usize::from(self.hdr_size) + self.body.len() + self.protected_area().len() + 4
    }

    /// The compressed form of this image: RLE coded body, carrying the digest and signature of
    /// this image in its protected trailer.
    pub fn compressed(&self, key: &SigningKey) -> ImageBuilder {
        let hash = self.hash();
        let sig = key.sign(&hash).to_bytes();
        let mut packed = self.clone();
        packed.body = rle_encode(&self.body);
        packed.flags = self.flags | 0x400;
        packed.protected.push((tlv::DECOMP_SIZE, (self.body.len() as u32).to_le_bytes().to_vec()));
        packed.protected.push((tlv::DECOMP_SHA, hash.to_vec()));
        packed.protected.push((tlv::DECOMP_SIGNATURE, sig.to_vec()));
        packed
    }
}
