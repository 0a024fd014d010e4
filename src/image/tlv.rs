//! Iteration over the TLV trailer of an image.

use embedded_storage::nor_flash::ReadNorFlash;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{ImageError, ImageHeader, Malformed};
use crate::hardware::FlashArea;
use crate::log;
use crate::Address;

pub const TLV_INFO_MAGIC: u16 = 0x6907;
pub const TLV_PROT_INFO_MAGIC: u16 = 0x6908;

pub const KEYHASH: u16 = 0x01;
pub const PUBKEY: u16 = 0x02;
pub const SHA256: u16 = 0x10;
pub const ECDSA_SIG: u16 = 0x22;
pub const ED25519: u16 = 0x24;
pub const DEPENDENCY: u16 = 0x40;
pub const SEC_CNT: u16 = 0x50;
pub const DECOMP_SIZE: u16 = 0x70;
pub const DECOMP_SHA: u16 = 0x71;
pub const DECOMP_SIGNATURE: u16 = 0x72;
pub const ANY: u16 = 0xffff;

/// TLVs that only describe the compressed form and vanish from the decompressed image.
pub fn is_decompression_only(kind: u16) -> bool {
    matches!(kind, DECOMP_SIZE | DECOMP_SHA | DECOMP_SIGNATURE)
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
pub struct TlvInfo {
    pub magic: U16,
    pub tlv_tot: U16,
}

impl TlvInfo {
    pub const SIZE: u32 = 4;

    pub fn new(magic: u16, tlv_tot: u16) -> Self {
        Self {
            magic: U16::new(magic),
            tlv_tot: U16::new(tlv_tot),
        }
    }
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
pub struct TlvHeader {
    pub kind: U16,
    pub len: U16,
}

impl TlvHeader {
    pub const SIZE: u32 = 4;

    pub fn new(kind: u16, len: u16) -> Self {
        Self {
            kind: U16::new(kind),
            len: U16::new(len),
        }
    }
}

/// One entry yielded by [`TlvIter::next`]: `off` points at the entry data.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvEntry {
    pub kind: u16,
    pub off: Address,
    pub len: u16,
}

fn read_info<F: ReadNorFlash>(
    flash: &mut F,
    area: &FlashArea,
    off: Address,
) -> Result<TlvInfo, ImageError> {
    let mut buf = [0u8; TlvInfo::SIZE as usize];
    area.read(flash, off, &mut buf)?;
    TlvInfo::read_from_bytes(&buf[..]).map_err(|_| ImageError::Malformed(Malformed::TlvInfo))
}

/// Walks the TLV records of an image. Holds no borrow of the flash, so the data of a yielded
/// entry can be read between calls to [`TlvIter::next`].
#[derive(Debug, Clone)]
pub struct TlvIter {
    filter: Option<u16>,
    prot_only: bool,
    has_prot: bool,
    prot_end: Address,
    tlv_off: Address,
    tlv_end: Address,
}

impl TlvIter {
    /// Positions the iterator on the first record. `filter` of `None` yields every type, and
    /// `prot_only` stops at the end of the protected region.
    pub fn begin<F: ReadNorFlash>(
        flash: &mut F,
        area: &FlashArea,
        hdr: &ImageHeader,
        filter: Option<u16>,
        prot_only: bool,
    ) -> Result<Self, ImageError> {
        let off = hdr.tlv_offset()?;
        let mut info = read_info(flash, area, off)?;
        let prot_size = u32::from(hdr.protect_tlv_size);

        if info.magic.get() == TLV_PROT_INFO_MAGIC {
            if prot_size != u32::from(info.tlv_tot.get()) {
                log::error!(
                    "Protected TLV size mismatch: header {} info {}",
                    prot_size,
                    info.tlv_tot.get()
                );
                return Err(Malformed::TlvInfo.into());
            }
            let unprot = off
                .checked_add(prot_size)
                .ok_or(ImageError::Malformed(Malformed::SizeOverflow))?;
            info = read_info(flash, area, unprot)?;
        } else if prot_size != 0 {
            return Err(Malformed::TlvInfo.into());
        }

        if info.magic.get() != TLV_INFO_MAGIC {
            return Err(Malformed::TlvInfo.into());
        }
        if u32::from(info.tlv_tot.get()) < TlvInfo::SIZE {
            return Err(Malformed::TlvInfo.into());
        }

        let prot_end = off + prot_size;
        let tlv_end = prot_end
            .checked_add(u32::from(info.tlv_tot.get()))
            .ok_or(ImageError::Malformed(Malformed::SizeOverflow))?;
        if tlv_end > area.size() {
            return Err(Malformed::TooLarge.into());
        }

        Ok(Self {
            filter: filter.filter(|kind| *kind != ANY),
            prot_only,
            has_prot: prot_size > 0,
            prot_end,
            tlv_off: off + TlvInfo::SIZE,
            tlv_end,
        })
    }

    /// Returns the next matching entry, `None` at the end of the trailer.
    pub fn next<F: ReadNorFlash>(
        &mut self,
        flash: &mut F,
        area: &FlashArea,
    ) -> Result<Option<TlvEntry>, ImageError> {
        while self.tlv_off < self.tlv_end {
            if self.has_prot && self.tlv_off == self.prot_end {
                self.tlv_off += TlvInfo::SIZE;
                continue;
            }
            if self.prot_only && self.tlv_off >= self.prot_end {
                return Ok(None);
            }

            let data_off = self.tlv_off + TlvHeader::SIZE;
            if data_off > self.tlv_end {
                return Err(Malformed::TlvOutOfBounds.into());
            }
            let mut buf = [0u8; TlvHeader::SIZE as usize];
            area.read(flash, self.tlv_off, &mut buf)?;
            let tlv = TlvHeader::read_from_bytes(&buf[..])
                .map_err(|_| ImageError::Malformed(Malformed::TlvOutOfBounds))?;
            let len = tlv.len.get();
            let next = data_off + u32::from(len);

            // A record may neither run past the trailer nor straddle the protected boundary.
            let limit = if self.has_prot && self.tlv_off < self.prot_end {
                self.prot_end
            } else {
                self.tlv_end
            };
            if next > limit {
                log::error!(
                    "TLV {:#x} at {:#x} with length {} overruns trailer end {:#x}",
                    tlv.kind.get(),
                    self.tlv_off,
                    len,
                    limit
                );
                return Err(Malformed::TlvOutOfBounds.into());
            }

            self.tlv_off = next;
            let kind = tlv.kind.get();
            if self.filter.map_or(true, |f| f == kind) {
                return Ok(Some(TlvEntry {
                    kind,
                    off: data_off,
                    len,
                }));
            }
        }
        Ok(None)
    }

    /// Whether the data at `off` lies in the protected region.
    pub fn is_protected(&self, off: Address) -> bool {
        off < self.prot_end
    }

    /// Offset one past the last trailer byte.
    pub fn end(&self) -> Address {
        self.tlv_end
    }
}
