//! Streaming decompression of compressed update images.
//!
//! A compressed image is stored with its own hash and signature, and carries the size, digest
//! and signature of the decompressed image in protected TLVs. One sequential scan of the
//! compressed slot either hashes the image the decompression would produce, or writes it to the
//! destination slot. Both paths emit exactly the same byte stream:
//!
//! 1. the header with the compression flags cleared and the sizes replaced, padded to `hdr_size`
//!    with the erased value
//! 2. the decompressed body, through the ARM-Thumb filter when flagged
//! 3. the protected TLVs minus the decompression-only entries
//! 4. on the copy path only, the unprotected TLVs with hash and signature swapped for the
//!    decompressed ones
//!
//! The decoder itself is a collaborator behind [`Decompressor`].

pub mod thumb;

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use sha2::{Digest, Sha256};
use zerocopy::IntoBytes;

use crate::hardware::FlashArea;
use crate::image::tlv::{self, TlvHeader, TlvInfo, TlvIter};
use crate::image::{ImageError, ImageFlags, ImageHeader, Malformed, IMAGE_HASH_SIZE, IMAGE_HEADER_SIZE};
use crate::log;
use crate::Address;

use self::thumb::ThumbFilter;

/// Consecutive calls consuming no input after which the decoder is considered stuck.
pub const OFFSET_ZERO_CHECK_TIMES: u32 = 3;
/// Output buffer of the copy path, a multiple of every supported write size.
pub const DECOMPRESSION_BUFFER_SIZE: usize = 256;

/// A streaming decoder, LZMA1 or LZMA2 depending on the target.
pub trait Decompressor {
    type Error: core::fmt::Debug;

    /// Prepares the decoder for a new stream.
    fn init(&mut self) -> Result<(), Self::Error>;

    fn deinit(&mut self);

    /// Preferred size of the next input chunk.
    fn bytes_needed(&self) -> usize;

    /// Feeds `input` and returns how many bytes were consumed together with the output this
    /// call produced. Partial input the decoder cannot act on yet is buffered internally and
    /// counts as consumed. `last` marks the final chunk of the stream.
    fn decompress(&mut self, input: &[u8], last: bool) -> Result<(usize, &[u8]), Self::Error>;
}

/// Decoder for builds without compression support, every compressed image is rejected.
pub struct NoDecompression;

impl Decompressor for NoDecompression {
    type Error = ();

    fn init(&mut self) -> Result<(), ()> {
        Err(())
    }

    fn deinit(&mut self) {}

    fn bytes_needed(&self) -> usize {
        0
    }

    fn decompress(&mut self, _input: &[u8], _last: bool) -> Result<(usize, &[u8]), ()> {
        Err(())
    }
}

/// Receiver of the reconstructed image stream.
pub(crate) trait Sink<F> {
    fn feed(&mut self, flash: &mut F, data: &[u8]) -> Result<(), ImageError>;
}

struct HashSink(Sha256);

impl<F> Sink<F> for HashSink {
    fn feed(&mut self, _flash: &mut F, data: &[u8]) -> Result<(), ImageError> {
        self.0.update(data);
        Ok(())
    }
}

struct CountSink(u32);

impl<F> Sink<F> for CountSink {
    fn feed(&mut self, _flash: &mut F, data: &[u8]) -> Result<(), ImageError> {
        self.0 += data.len() as u32;
        Ok(())
    }
}

/// Buffers output and writes it to the destination in whole buffers, so every write is
/// aligned regardless of how the stream is chunked.
struct FlashSink {
    area: FlashArea,
    off: Address,
    buf: [u8; DECOMPRESSION_BUFFER_SIZE],
    len: usize,
}

impl FlashSink {
    fn new(area: FlashArea) -> Self {
        Self {
            area,
            off: 0,
            buf: [0; DECOMPRESSION_BUFFER_SIZE],
            len: 0,
        }
    }

    /// Writes the final partial buffer, padded to the write size with the erased value.
    fn flush<F: NorFlash>(&mut self, flash: &mut F) -> Result<(), ImageError> {
        if self.len == 0 {
            return Ok(());
        }
        let align = self.area.align::<F>();
        let padded = self.len.div_ceil(align) * align;
        self.buf[self.len..padded].fill(self.area.erased_value());
        self.area.write(flash, self.off, &self.buf[..padded])?;
        self.off += padded as Address;
        self.len = 0;
        Ok(())
    }
}

impl<F: NorFlash> Sink<F> for FlashSink {
    fn feed(&mut self, flash: &mut F, mut data: &[u8]) -> Result<(), ImageError> {
        while !data.is_empty() {
            let n = data.len().min(self.buf.len() - self.len);
            self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
            self.len += n;
            data = &data[n..];
            if self.len == self.buf.len() {
                self.area.write(flash, self.off, &self.buf)?;
                self.off += self.buf.len() as Address;
                self.len = 0;
            }
        }
        Ok(())
    }
}

fn copy_data<F: ReadNorFlash, S: Sink<F>>(
    flash: &mut F,
    area: &FlashArea,
    off: Address,
    len: u16,
    scratch: &mut [u8],
    sink: &mut S,
) -> Result<(), ImageError> {
    let mut done = 0u32;
    let len = u32::from(len);
    while done < len {
        let n = (len - done).min(scratch.len() as u32) as usize;
        area.read(flash, off + done, &mut scratch[..n])?;
        sink.feed(flash, &scratch[..n])?;
        done += n as u32;
    }
    Ok(())
}

/// Decompressed image size recorded in the protected trailer.
pub fn decompressed_size<F: ReadNorFlash>(
    flash: &mut F,
    area: &FlashArea,
    hdr: &ImageHeader,
) -> Result<u32, ImageError> {
    let mut it = TlvIter::begin(flash, area, hdr, Some(tlv::DECOMP_SIZE), true)?;
    let Some(entry) = it.next(flash, area)? else {
        return Err(Malformed::MissingDecompressedSize.into());
    };
    if entry.len != 4 {
        return Err(Malformed::TlvLength.into());
    }
    let mut buf = [0u8; 4];
    area.read(flash, entry.off, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn find_protected<F: ReadNorFlash>(
    flash: &mut F,
    area: &FlashArea,
    hdr: &ImageHeader,
    kind: u16,
) -> Result<Option<tlv::TlvEntry>, ImageError> {
    TlvIter::begin(flash, area, hdr, Some(kind), true)?.next(flash, area)
}

fn emit_protected_entries<F: ReadNorFlash, S: Sink<F>>(
    flash: &mut F,
    area: &FlashArea,
    hdr: &ImageHeader,
    scratch: &mut [u8],
    sink: &mut S,
) -> Result<(), ImageError> {
    let mut it = TlvIter::begin(flash, area, hdr, None, true)?;
    while let Some(entry) = it.next(flash, area)? {
        if tlv::is_decompression_only(entry.kind) {
            continue;
        }
        sink.feed(flash, TlvHeader::new(entry.kind, entry.len).as_bytes())?;
        copy_data(flash, area, entry.off, entry.len, scratch, sink)?;
    }
    Ok(())
}

fn emit_unprotected_entries<F: ReadNorFlash, S: Sink<F>>(
    flash: &mut F,
    area: &FlashArea,
    hdr: &ImageHeader,
    sig_tlv: u16,
    scratch: &mut [u8],
    sink: &mut S,
) -> Result<(), ImageError> {
    let mut it = TlvIter::begin(flash, area, hdr, None, false)?;
    while let Some(entry) = it.next(flash, area)? {
        if it.is_protected(entry.off) {
            continue;
        }
        let source = if entry.kind == tlv::SHA256 {
            find_protected(flash, area, hdr, tlv::DECOMP_SHA)?
                .ok_or(ImageError::Malformed(Malformed::MissingHash))?
        } else if entry.kind == sig_tlv {
            find_protected(flash, area, hdr, tlv::DECOMP_SIGNATURE)?
                .ok_or(ImageError::Malformed(Malformed::MissingSignature))?
        } else {
            entry
        };
        sink.feed(flash, TlvHeader::new(entry.kind, source.len).as_bytes())?;
        copy_data(flash, area, source.off, source.len, scratch, sink)?;
    }
    Ok(())
}

/// Size of the protected TLV area of the decompressed image, 0 when no entry survives.
pub fn protected_size<F: ReadNorFlash>(
    flash: &mut F,
    area: &FlashArea,
    hdr: &ImageHeader,
    scratch: &mut [u8],
) -> Result<u32, ImageError> {
    if hdr.protect_tlv_size == 0 {
        return Ok(0);
    }
    let mut count = CountSink(0);
    emit_protected_entries(flash, area, hdr, scratch, &mut count)?;
    Ok(if count.0 == 0 { 0 } else { count.0 + TlvInfo::SIZE })
}

/// Size of the unprotected TLV area of the decompressed image.
pub fn unprotected_size<F: ReadNorFlash>(
    flash: &mut F,
    area: &FlashArea,
    hdr: &ImageHeader,
    sig_tlv: u16,
    scratch: &mut [u8],
) -> Result<u32, ImageError> {
    let mut count = CountSink(0);
    emit_unprotected_entries(flash, area, hdr, sig_tlv, scratch, &mut count)?;
    if count.0 == 0 {
        log::error!("No unprotected TLVs in decompressed image");
        return Err(Malformed::NoUnprotectedTlvs.into());
    }
    Ok(count.0 + TlvInfo::SIZE)
}

/// Rejects compressed images whose flags are inconsistent or whose decompressed form cannot
/// fit a slot of `slot_size` bytes.
pub fn check_header<F: ReadNorFlash>(
    flash: &mut F,
    area: &FlashArea,
    hdr: &ImageHeader,
    slot_size: Address,
    scratch: &mut [u8],
) -> Result<(), ImageError> {
    let lzma = ImageFlags::COMPRESSED_LZMA1 | ImageFlags::COMPRESSED_LZMA2;
    if hdr.flags.contains(lzma) || !hdr.flags.intersects(lzma) {
        return Err(Malformed::BadCompressionFlags.into());
    }
    let size = decompressed_size(flash, area, hdr)?;
    let prot = protected_size(flash, area, hdr, scratch)?;
    let total = u32::from(hdr.hdr_size)
        .checked_add(size)
        .and_then(|t| t.checked_add(prot))
        .ok_or(ImageError::Malformed(Malformed::SizeOverflow))?;
    if total >= slot_size {
        log::error!(
            "Decompressed image of {} bytes does not fit slot of {} bytes",
            total,
            slot_size
        );
        return Err(Malformed::TooLarge.into());
    }
    Ok(())
}

fn stream_body<F, D, S>(
    flash: &mut F,
    area: &FlashArea,
    hdr: &ImageHeader,
    expected: u32,
    dec: &mut D,
    scratch: &mut [u8],
    sink: &mut S,
) -> Result<(), ImageError>
where
    F: ReadNorFlash,
    D: Decompressor,
    S: Sink<F>,
{
    if hdr.img_size == 0 {
        return Err(Malformed::DecoderNoOutput.into());
    }
    let body = u32::from(hdr.hdr_size);
    let mut read_pos = 0u32;
    let mut produced = 0u32;
    let mut stalls = 0u32;

    while read_pos < hdr.img_size {
        let copy_size = (hdr.img_size - read_pos).min(scratch.len() as u32) as usize;
        area.read(flash, body + read_pos, &mut scratch[..copy_size])?;

        let mut tmp_off = 0usize;
        while tmp_off < copy_size {
            let chunk = dec.bytes_needed().min(copy_size - tmp_off);
            let last = read_pos as usize + tmp_off + chunk >= hdr.img_size as usize;
            let (consumed, out) = dec
                .decompress(&scratch[tmp_off..tmp_off + chunk], last)
                .map_err(|e| {
                    log::error!("Decompression failed: {:?}", e);
                    ImageError::Decoder
                })?;
            if consumed > chunk {
                return Err(ImageError::Decoder);
            }

            produced = produced.saturating_add(out.len() as u32);
            if produced > expected {
                log::error!(
                    "Decompressed output exceeds the declared size of {} bytes",
                    expected
                );
                return Err(Malformed::OutputOversize.into());
            }
            if last && produced == 0 {
                return Err(Malformed::DecoderNoOutput.into());
            }
            sink.feed(flash, out)?;

            if consumed == 0 {
                stalls += 1;
                if stalls > OFFSET_ZERO_CHECK_TIMES {
                    log::error!("Decoder consumed no input {} times in a row", stalls);
                    return Err(Malformed::DecoderStalled.into());
                }
                continue;
            }
            stalls = 0;
            tmp_off += consumed;
        }
        read_pos += copy_size as u32;
    }

    if produced != expected {
        log::error!(
            "Decompressed {} bytes, header declares {}",
            produced,
            expected
        );
        return Err(Malformed::OutputSizeMismatch.into());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn emit<F, D, S>(
    flash: &mut F,
    area: &FlashArea,
    hdr: &ImageHeader,
    dec: &mut D,
    scratch: &mut [u8],
    sink: &mut S,
    unprotected: Option<u16>,
) -> Result<(), ImageError>
where
    F: ReadNorFlash,
    D: Decompressor,
    S: Sink<F>,
{
    if scratch.is_empty() {
        return Err(ImageError::Unsupported);
    }
    let size = decompressed_size(flash, area, hdr)?;
    let prot_size = protected_size(flash, area, hdr, scratch)?;

    let mut out_hdr = *hdr;
    out_hdr.flags.remove(ImageFlags::COMPRESSED);
    out_hdr.img_size = size;
    out_hdr.protect_tlv_size =
        u16::try_from(prot_size).map_err(|_| ImageError::Malformed(Malformed::SizeOverflow))?;
    sink.feed(flash, &out_hdr.to_bytes())?;

    let pad = [area.erased_value(); IMAGE_HEADER_SIZE];
    let mut left = usize::from(hdr.hdr_size) - IMAGE_HEADER_SIZE;
    while left > 0 {
        let n = left.min(pad.len());
        sink.feed(flash, &pad[..n])?;
        left -= n;
    }

    let thumb = hdr.flags.contains(ImageFlags::COMPRESSED_ARM_THUMB);
    dec.init().map_err(|e| {
        log::error!("Decompressor init failed: {:?}", e);
        ImageError::Decoder
    })?;
    let mut body = ThumbFilter::new(sink, thumb);
    let streamed = stream_body(flash, area, hdr, size, dec, scratch, &mut body);
    dec.deinit();
    streamed?;
    let sink = body.finish(flash)?;

    if prot_size > 0 {
        sink.feed(
            flash,
            TlvInfo::new(tlv::TLV_PROT_INFO_MAGIC, out_hdr.protect_tlv_size).as_bytes(),
        )?;
        emit_protected_entries(flash, area, hdr, scratch, sink)?;
    }

    if let Some(sig_tlv) = unprotected {
        let unprot_size = unprotected_size(flash, area, hdr, sig_tlv, scratch)?;
        let unprot_size = u16::try_from(unprot_size)
            .map_err(|_| ImageError::Malformed(Malformed::SizeOverflow))?;
        sink.feed(flash, TlvInfo::new(tlv::TLV_INFO_MAGIC, unprot_size).as_bytes())?;
        emit_unprotected_entries(flash, area, hdr, sig_tlv, scratch, sink)?;
    }
    Ok(())
}

/// Digest of the image the decompression of `area` would produce, computed without writing.
pub fn hash_decompressed<F, D>(
    flash: &mut F,
    area: &FlashArea,
    hdr: &ImageHeader,
    dec: &mut D,
    scratch: &mut [u8],
) -> Result<[u8; IMAGE_HASH_SIZE], ImageError>
where
    F: ReadNorFlash,
    D: Decompressor,
{
    let mut sink = HashSink(Sha256::new());
    emit(flash, area, hdr, dec, scratch, &mut sink, None)?;
    Ok(sink.0.finalize().into())
}

/// Decompresses the image in `src` into the erased area `dst`, rebuilding its trailer so it
/// validates like an uncompressed image signed with the decompressed signature.
pub fn copy_decompressed<F, D>(
    flash: &mut F,
    src: &FlashArea,
    dst: &FlashArea,
    hdr: &ImageHeader,
    sig_tlv: u16,
    dec: &mut D,
    scratch: &mut [u8],
) -> Result<Address, ImageError>
where
    F: NorFlash,
    D: Decompressor,
{
    let mut sink = FlashSink::new(*dst);
    emit(flash, src, hdr, dec, scratch, &mut sink, Some(sig_tlv))?;
    sink.flush(flash)?;
    log::info!("Decompressed image into area {}: {} bytes", dst.id, sink.off);
    Ok(sink.off)
}
