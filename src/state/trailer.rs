//! Layout and field access of the trailer at the end of each slot.
//!
//! ```text
//!   status_off  ->  +---------------------------------------+
//!                   | ledger: max_sectors * 3 entries       |
//!                   +---------------------------------------+
//!                   | swap size (u32 LE)                    |
//!                   | swap info (image << 4 | swap type)    |
//!                   | copy done                             |
//!                   | image ok                              |
//!                   | magic, in the last 16 bytes           |
//!   slot end    ->  +---------------------------------------+
//! ```
//!
//! Every field occupies at least one write granule so it can be programmed on its own.

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

use super::{Flag, MagicState, SwapState, SwapType, STATUS_STATE_COUNT};
use crate::hardware::{FlashArea, FlashError, MAX_WRITE_SIZE};
use crate::log;
use crate::Address;

pub const BOOT_MAGIC: [u8; 16] = [
    0x77, 0xc2, 0x95, 0xf3, 0x60, 0xd2, 0xef, 0x7f, 0x35, 0x52, 0x50, 0x0f, 0x2c, 0xb6, 0x79, 0x80,
];

const MAGIC_SIZE: u32 = BOOT_MAGIC.len() as u32;
const MAX_ALIGN: u32 = 8;
const FLAG_SET: u8 = 0x01;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    area: FlashArea,
    write_sz: u32,
    field_sz: u32,
    magic_sz: u32,
    max_sectors: u32,
}

impl Trailer {
    pub fn new<F: NorFlash>(area: FlashArea, max_sectors: u32) -> Self {
        let write_sz = F::WRITE_SIZE.max(1) as u32;
        Self {
            area,
            write_sz,
            field_sz: MAX_ALIGN.max(write_sz),
            magic_sz: MAGIC_SIZE.max(write_sz),
            max_sectors,
        }
    }

    pub fn area(&self) -> &FlashArea {
        &self.area
    }

    /// Width of one ledger entry.
    pub fn write_size(&self) -> u32 {
        self.write_sz
    }

    pub fn magic_off(&self) -> Address {
        self.area.size.saturating_sub(self.magic_sz)
    }

    pub fn image_ok_off(&self) -> Address {
        self.magic_off().saturating_sub(self.field_sz)
    }

    pub fn copy_done_off(&self) -> Address {
        self.image_ok_off().saturating_sub(self.field_sz)
    }

    pub fn swap_info_off(&self) -> Address {
        self.copy_done_off().saturating_sub(self.field_sz)
    }

    pub fn swap_size_off(&self) -> Address {
        self.swap_info_off().saturating_sub(self.field_sz)
    }

    pub fn status_entries(&self) -> u32 {
        self.max_sectors * STATUS_STATE_COUNT
    }

    pub fn status_off(&self) -> Address {
        self.swap_size_off()
            .saturating_sub(self.status_entries() * self.write_sz)
    }

    pub fn status_entry_off(&self, entry: u32) -> Address {
        self.status_off() + entry * self.write_sz
    }

    /// Bytes the trailer occupies, ledger included.
    pub fn size(&self) -> u32 {
        MAGIC_SIZE.max(self.write_sz)
            + 4 * self.field_sz
            + self.status_entries() * self.write_sz
    }

    /// Whether the trailer fits into its slot at all.
    pub fn fits(&self) -> bool {
        self.size() < self.area.size
    }

    /// Index of the lowest sector the trailer reaches into.
    pub fn first_sector(&self) -> u32 {
        self.status_off() / self.area.sector_size
    }

    pub fn read_magic<F: ReadNorFlash>(&self, flash: &mut F) -> Result<MagicState, FlashError> {
        let mut magic = [0u8; BOOT_MAGIC.len()];
        self.area
            .read(flash, self.area.size - MAGIC_SIZE, &mut magic)?;
        Ok(if magic == BOOT_MAGIC {
            MagicState::Good
        } else if self.area.is_erased(&magic) {
            MagicState::Unset
        } else {
            MagicState::Bad
        })
    }

    fn read_flag<F: ReadNorFlash>(&self, flash: &mut F, off: Address) -> Result<Flag, FlashError> {
        let mut buf = [0u8; 1];
        self.area.read(flash, off, &mut buf)?;
        Ok(match buf[0] {
            FLAG_SET => Flag::Set,
            b if b == self.area.erased_val => Flag::Unset,
            _ => Flag::Bad,
        })
    }

    pub fn read_image_ok<F: ReadNorFlash>(&self, flash: &mut F) -> Result<Flag, FlashError> {
        self.read_flag(flash, self.image_ok_off())
    }

    pub fn read_copy_done<F: ReadNorFlash>(&self, flash: &mut F) -> Result<Flag, FlashError> {
        self.read_flag(flash, self.copy_done_off())
    }

    /// Returns the recorded swap type and image number. An unset or undecodable field reads as
    /// [`SwapType::None`] for image 0.
    pub fn read_swap_info<F: ReadNorFlash>(
        &self,
        flash: &mut F,
    ) -> Result<(SwapType, u8), FlashError> {
        let mut buf = [0u8; 1];
        self.area.read(flash, self.swap_info_off(), &mut buf)?;
        if buf[0] == self.area.erased_val {
            return Ok((SwapType::None, 0));
        }
        match SwapType::from_u8(buf[0] & 0x0f) {
            Some(swap_type) => Ok((swap_type, buf[0] >> 4)),
            None => {
                log::warn!("Undecodable swap info {} in area {}", buf[0], self.area.id);
                Ok((SwapType::None, 0))
            }
        }
    }

    pub fn read_swap_size<F: ReadNorFlash>(&self, flash: &mut F) -> Result<u32, FlashError> {
        let mut buf = [0u8; 4];
        self.area.read(flash, self.swap_size_off(), &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_state<F: ReadNorFlash>(&self, flash: &mut F) -> Result<SwapState, FlashError> {
        let (swap_type, image_num) = self.read_swap_info(flash)?;
        Ok(SwapState {
            magic: self.read_magic(flash)?,
            swap_type,
            image_num,
            copy_done: self.read_copy_done(flash)?,
            image_ok: self.read_image_ok(flash)?,
        })
    }

    /// Reads the marker byte of ledger entry `entry`.
    pub fn read_status_entry<F: ReadNorFlash>(
        &self,
        flash: &mut F,
        entry: u32,
    ) -> Result<u8, FlashError> {
        let mut buf = [0u8; 1];
        self.area
            .read(flash, self.status_entry_off(entry), &mut buf)?;
        Ok(buf[0])
    }

    /// Programs `value` at `off`, padded with the erased value to `len` bytes.
    fn write_field<F: NorFlash>(
        &self,
        flash: &mut F,
        off: Address,
        value: &[u8],
        len: u32,
    ) -> Result<(), FlashError> {
        let mut buf = [self.area.erased_val; MAX_WRITE_SIZE];
        let len = len as usize;
        buf[..value.len()].copy_from_slice(value);
        self.area.write(flash, off, &buf[..len])
    }

    pub fn write_magic<F: NorFlash>(&self, flash: &mut F) -> Result<(), FlashError> {
        let mut buf = [self.area.erased_val; MAX_WRITE_SIZE];
        let len = self.magic_sz as usize;
        buf[len - BOOT_MAGIC.len()..len].copy_from_slice(&BOOT_MAGIC);
        log::debug!("Writing magic to area {}", self.area.id);
        self.area.write(flash, self.magic_off(), &buf[..len])
    }

    pub fn write_image_ok<F: NorFlash>(&self, flash: &mut F) -> Result<(), FlashError> {
        log::debug!("Writing image_ok to area {}", self.area.id);
        self.write_field(flash, self.image_ok_off(), &[FLAG_SET], self.field_sz)
    }

    pub fn write_copy_done<F: NorFlash>(&self, flash: &mut F) -> Result<(), FlashError> {
        log::debug!("Writing copy_done to area {}", self.area.id);
        self.write_field(flash, self.copy_done_off(), &[FLAG_SET], self.field_sz)
    }

    pub fn write_swap_info<F: NorFlash>(
        &self,
        flash: &mut F,
        swap_type: SwapType,
        image_num: u8,
    ) -> Result<(), FlashError> {
        let info = (image_num << 4) | (swap_type.to_u8() & 0x0f);
        self.write_field(flash, self.swap_info_off(), &[info], self.field_sz)
    }

    pub fn write_swap_size<F: NorFlash>(&self, flash: &mut F, size: u32) -> Result<(), FlashError> {
        self.write_field(flash, self.swap_size_off(), &size.to_le_bytes(), self.field_sz)
    }

    pub fn write_status_entry<F: NorFlash>(
        &self,
        flash: &mut F,
        entry: u32,
        marker: u8,
    ) -> Result<(), FlashError> {
        self.write_field(flash, self.status_entry_off(entry), &[marker], self.write_sz)
    }

    /// Erases every sector the trailer reaches into.
    pub fn scramble<F: NorFlash>(&self, flash: &mut F) -> Result<(), FlashError> {
        let start = self.area.sector_offset(self.first_sector());
        log::debug!("Scrambling trailer of area {} from {}", self.area.id, start);
        self.area.erase(flash, start, self.area.size - start)
    }
}
