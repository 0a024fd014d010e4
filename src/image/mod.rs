//! MCUboot image header and trailer format.
//!
//! ```text
//! +--------------+ 0
//! | header       |   32 bytes, padded to hdr_size
//! +--------------+ hdr_size
//! | body         |   img_size bytes
//! +--------------+ hdr_size + img_size
//! | protected    |   optional, protect_tlv_size bytes, covered by the image hash
//! | TLVs         |
//! +--------------+
//! | unprotected  |   hash, signature, key hash
//! | TLVs         |
//! +--------------+
//! ```

pub mod tlv;
pub mod validate;

use core::cmp::Ordering;

use bitflags::bitflags;
use embedded_storage::nor_flash::ReadNorFlash;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::hardware::{FlashArea, FlashError};
use crate::Address;

pub const IMAGE_MAGIC: u32 = 0x96f3_b83d;
pub const IMAGE_HEADER_SIZE: usize = 32;
/// Digest length of the image hash.
pub const IMAGE_HASH_SIZE: usize = 32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageFlags: u32 {
        const PIC = 0x0000_0001;
        const ENCRYPTED_AES128 = 0x0000_0004;
        const ENCRYPTED_AES256 = 0x0000_0008;
        const NON_BOOTABLE = 0x0000_0010;
        const RAM_LOAD = 0x0000_0020;
        const ROM_FIXED = 0x0000_0100;
        const COMPRESSED_LZMA1 = 0x0000_0200;
        const COMPRESSED_LZMA2 = 0x0000_0400;
        const COMPRESSED_ARM_THUMB = 0x0000_0800;
    }
}

impl ImageFlags {
    pub const COMPRESSED: ImageFlags = ImageFlags::COMPRESSED_LZMA1
        .union(ImageFlags::COMPRESSED_LZMA2)
        .union(ImageFlags::COMPRESSED_ARM_THUMB);

    pub fn is_compressed(&self) -> bool {
        self.intersects(ImageFlags::COMPRESSED_LZMA1 | ImageFlags::COMPRESSED_LZMA2)
    }
}

/// Structural violations of the image format. Always fatal to the candidate.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    HeaderTooSmall,
    SizeOverflow,
    TooLarge,
    TlvInfo,
    TlvOutOfBounds,
    TlvLength,
    MissingHash,
    MissingSignature,
    BadCompressionFlags,
    MissingDecompressedSize,
    NoUnprotectedTlvs,
    DecoderStalled,
    DecoderNoOutput,
    OutputOversize,
    OutputSizeMismatch,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    Flash(FlashError),
    /// The slot does not start with an image header
    BadMagic,
    Malformed(Malformed),
    /// The decompressor collaborator reported an error
    Decoder,
    /// The image uses a feature this build cannot process
    Unsupported,
}

impl From<FlashError> for ImageError {
    fn from(err: FlashError) -> Self {
        ImageError::Flash(err)
    }
}

impl From<Malformed> for ImageError {
    fn from(err: Malformed) -> Self {
        ImageError::Malformed(err)
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "derive", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build_num: u32,
}

impl PartialOrd for ImageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ImageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.revision, self.build_num).cmp(&(
            other.major,
            other.minor,
            other.revision,
            other.build_num,
        ))
    }
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawHeader {
    magic: U32,
    load_addr: U32,
    hdr_size: U16,
    protect_tlv_size: U16,
    img_size: U32,
    flags: U32,
    ver_major: u8,
    ver_minor: u8,
    ver_revision: U16,
    ver_build_num: U32,
    pad1: U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub load_addr: u32,
    pub hdr_size: u16,
    pub protect_tlv_size: u16,
    pub img_size: u32,
    pub flags: ImageFlags,
    pub version: ImageVersion,
}

#[cfg(feature = "defmt")]
impl defmt::Format for ImageHeader {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(
            f,
            "ImageHeader {{ hdr_size: {}, img_size: {}, protect_tlv_size: {}, flags: {=u32:#x}, version: {} }}",
            self.hdr_size,
            self.img_size,
            self.protect_tlv_size,
            self.flags.bits(),
            self.version
        )
    }
}

impl ImageHeader {
    /// Parses a header, `Err(BadMagic)` means the slot holds no image.
    pub fn parse(bytes: &[u8; IMAGE_HEADER_SIZE]) -> Result<Self, ImageError> {
        let raw = RawHeader::read_from_bytes(&bytes[..]).map_err(|_| ImageError::BadMagic)?;
        if raw.magic.get() != IMAGE_MAGIC {
            return Err(ImageError::BadMagic);
        }
        if usize::from(raw.hdr_size.get()) < IMAGE_HEADER_SIZE {
            return Err(Malformed::HeaderTooSmall.into());
        }
        Ok(Self {
            load_addr: raw.load_addr.get(),
            hdr_size: raw.hdr_size.get(),
            protect_tlv_size: raw.protect_tlv_size.get(),
            img_size: raw.img_size.get(),
            flags: ImageFlags::from_bits_retain(raw.flags.get()),
            version: ImageVersion {
                major: raw.ver_major,
                minor: raw.ver_minor,
                revision: raw.ver_revision.get(),
                build_num: raw.ver_build_num.get(),
            },
        })
    }

    pub fn read<F: ReadNorFlash>(flash: &mut F, area: &FlashArea) -> Result<Self, ImageError> {
        let mut buf = [0u8; IMAGE_HEADER_SIZE];
        area.read(flash, 0, &mut buf)?;
        Self::parse(&buf)
    }

    pub fn to_bytes(&self) -> [u8; IMAGE_HEADER_SIZE] {
        let raw = RawHeader {
            magic: U32::new(IMAGE_MAGIC),
            load_addr: U32::new(self.load_addr),
            hdr_size: U16::new(self.hdr_size),
            protect_tlv_size: U16::new(self.protect_tlv_size),
            img_size: U32::new(self.img_size),
            flags: U32::new(self.flags.bits()),
            ver_major: self.version.major,
            ver_minor: self.version.minor,
            ver_revision: U16::new(self.version.revision),
            ver_build_num: U32::new(self.version.build_num),
            pad1: U32::new(0),
        };
        let mut out = [0u8; IMAGE_HEADER_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Offset of the first TLV info record.
    pub fn tlv_offset(&self) -> Result<Address, ImageError> {
        u32::from(self.hdr_size)
            .checked_add(self.img_size)
            .ok_or(ImageError::Malformed(Malformed::SizeOverflow))
    }

    /// Number of bytes covered by the image hash: header, body and protected TLVs.
    pub fn hashed_size(&self) -> Result<Address, ImageError> {
        self.tlv_offset()?
            .checked_add(u32::from(self.protect_tlv_size))
            .ok_or(ImageError::Malformed(Malformed::SizeOverflow))
    }
}

/// Total size of the image as stored, trailer TLVs included.
pub fn image_size<F: ReadNorFlash>(
    flash: &mut F,
    area: &FlashArea,
    hdr: &ImageHeader,
) -> Result<Address, ImageError> {
    let iter = tlv::TlvIter::begin(flash, area, hdr, None, false)?;
    Ok(iter.end())
}
