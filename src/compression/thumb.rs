//! ARM-Thumb branch filter (BCJ) applied after LZMA decompression.
//!
//! The encoder rewrote the targets of Thumb `BL` instruction pairs from relative to absolute
//! addresses, the decoder turns them back. An instruction pair spans four bytes, so the last
//! bytes of a chunk can only be decided once the next chunk arrives; they wait in a small ring
//! buffer and are prepended to the following chunk.

use heapless::Deque;

use super::Sink;
use crate::image::ImageError;

const CHUNK: usize = 64;
// Undecided bytes never exceed three, the fourth slot keeps the ring from ever filling.
const CARRY: usize = 4;

/// Runs the BCJ ARM-Thumb transform over `buf` in place, `now_pos` being the stream offset of
/// `buf[0]`. Returns how many leading bytes are final.
pub fn arm_thumb_code(buf: &mut [u8], now_pos: u32, encode: bool) -> usize {
    let mut i = 0usize;
    while i + 4 <= buf.len() {
        if (buf[i + 1] & 0xf8) == 0xf0 && (buf[i + 3] & 0xf8) == 0xf8 {
            let src = ((u32::from(buf[i + 1]) & 7) << 19)
                | (u32::from(buf[i]) << 11)
                | ((u32::from(buf[i + 3]) & 7) << 8)
                | u32::from(buf[i + 2]);
            let src = src << 1;
            let pc = now_pos.wrapping_add(i as u32).wrapping_add(4);
            let dest = if encode {
                pc.wrapping_add(src)
            } else {
                src.wrapping_sub(pc)
            } >> 1;
            buf[i + 1] = 0xf0 | ((dest >> 19) & 0x7) as u8;
            buf[i] = (dest >> 11) as u8;
            buf[i + 3] = 0xf8 | ((dest >> 8) & 0x7) as u8;
            buf[i + 2] = dest as u8;
            i += 2;
        }
        i += 2;
    }
    i.min(buf.len())
}

/// Decoding stage between the decompressor and the image sink. Disabled instances pass data
/// through untouched.
pub(crate) struct ThumbFilter<'s, S> {
    inner: &'s mut S,
    enabled: bool,
    carry: Deque<u8, CARRY>,
    pos: u32,
}

impl<'s, S> ThumbFilter<'s, S> {
    pub(crate) fn new(inner: &'s mut S, enabled: bool) -> Self {
        Self {
            inner,
            enabled,
            carry: Deque::new(),
            pos: 0,
        }
    }

    /// Emits the undecided tail unfiltered and hands the sink back.
    pub(crate) fn finish<F>(mut self, flash: &mut F) -> Result<&'s mut S, ImageError>
    where
        S: Sink<F>,
    {
        let mut tail = [0u8; CARRY];
        let mut len = 0;
        while let Some(b) = self.carry.pop_front() {
            tail[len] = b;
            len += 1;
        }
        self.inner.feed(flash, &tail[..len])?;
        Ok(self.inner)
    }
}

impl<F, S: Sink<F>> Sink<F> for ThumbFilter<'_, S> {
    fn feed(&mut self, flash: &mut F, data: &[u8]) -> Result<(), ImageError> {
        if !self.enabled {
            return self.inner.feed(flash, data);
        }

        let mut rest = data;
        while !rest.is_empty() {
            let mut work = [0u8; CHUNK + CARRY];
            let mut len = 0;
            while let Some(b) = self.carry.pop_front() {
                work[len] = b;
                len += 1;
            }
            let take = rest.len().min(work.len() - len);
            work[len..len + take].copy_from_slice(&rest[..take]);
            rest = &rest[take..];
            len += take;

            let done = arm_thumb_code(&mut work[..len], self.pos, false);
            for b in &work[done..len] {
                // cannot overflow, see CARRY
                let pushed = self.carry.push_back(*b);
                debug_assert!(pushed.is_ok());
            }
            self.inner.feed(flash, &work[..done])?;
            self.pos = self.pos.wrapping_add(done as u32);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect {
        out: [u8; 512],
        len: usize,
    }

    impl Sink<()> for Collect {
        fn feed(&mut self, _flash: &mut (), data: &[u8]) -> Result<(), ImageError> {
            self.out[self.len..self.len + data.len()].copy_from_slice(data);
            self.len += data.len();
            Ok(())
        }
    }

    fn thumb_code() -> [u8; 300] {
        let mut code = [0u8; 300];
        for (i, b) in code.iter_mut().enumerate() {
            *b = (i * 7) as u8;
        }
        // BL pairs at aligned and at chunk straddling offsets
        for at in [0usize, 10, 62, 130, 254, 296] {
            code[at] = 0x12;
            code[at + 1] = 0xf0 | (at as u8 & 7);
            code[at + 2] = 0x34;
            code[at + 3] = 0xf8 | 0x3;
        }
        code
    }

    #[test]
    fn decode_inverts_encode() {
        let plain = thumb_code();
        let mut coded = plain;
        arm_thumb_code(&mut coded, 0, true);
        assert_ne!(coded, plain);
        arm_thumb_code(&mut coded, 0, false);
        assert_eq!(coded, plain);
    }

    #[test]
    fn carry_neither_drops_nor_duplicates_bytes() {
        let plain = thumb_code();
        let mut coded = plain;
        arm_thumb_code(&mut coded, 0, true);

        for split in [1usize, 3, 5, 17, 63, 64, 65, 299] {
            let mut sink = Collect {
                out: [0; 512],
                len: 0,
            };
            let mut filter = ThumbFilter::new(&mut sink, true);
            for piece in coded.chunks(split) {
                filter.feed(&mut (), piece).unwrap();
            }
            let sink = filter.finish(&mut ()).unwrap();
            assert_eq!(sink.len, plain.len(), "split {}", split);
            assert_eq!(&sink.out[..sink.len], &plain[..], "split {}", split);
        }
    }

    #[test]
    fn disabled_filter_passes_through() {
        let mut sink = Collect {
            out: [0; 512],
            len: 0,
        };
        let coded = [0x12, 0xf0, 0x34, 0xfb, 0x00];
        let mut filter = ThumbFilter::new(&mut sink, false);
        filter.feed(&mut (), &coded).unwrap();
        let sink = filter.finish(&mut ()).unwrap();
        assert_eq!(&sink.out[..sink.len], &coded);
    }
}
