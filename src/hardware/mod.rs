pub mod processor;

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};

use crate::state::trailer::Trailer;
use crate::Address;

#[cfg(feature = "derive")]
use serde::{Deserialize, Serialize};

/// Largest write granule the trailer layout supports.
pub const MAX_WRITE_SIZE: usize = 32;

/// Error occured during flash access
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    Read,
    Write,
    Erase,
    OutOfBounds,
    NotAligned,
}

impl FlashError {
    fn from_kind<E: NorFlashError>(err: E, fallback: FlashError) -> Self {
        match err.kind() {
            NorFlashErrorKind::NotAligned => FlashError::NotAligned,
            NorFlashErrorKind::OutOfBounds => FlashError::OutOfBounds,
            _ => fallback,
        }
    }
}

/// Which of the two image slots an operation addresses.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Slot {
    Primary,
    Secondary,
}

/// A contiguous, erasable region of a flash device. All offsets passed to its accessors are
/// relative to the start of the area.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct FlashArea {
    /// Identifier of this area within the partition map
    pub id: u8,
    /// Flash device the area lives on
    pub device_id: u8,
    /// Start of the area on the device
    pub offset: Address,
    /// Size of the area
    pub size: Address,
    /// Size of one erasable sector, uniform within the area
    pub sector_size: Address,
    /// Value every byte reads as after an erase
    pub erased_val: u8,
}

impl FlashArea {
    fn check_range(&self, off: Address, len: usize) -> Result<Address, FlashError> {
        let len = Address::try_from(len).map_err(|_| FlashError::OutOfBounds)?;
        match off.checked_add(len) {
            Some(end) if end <= self.size => Ok(self.offset + off),
            _ => Err(FlashError::OutOfBounds),
        }
    }

    pub fn read<F: ReadNorFlash>(
        &self,
        flash: &mut F,
        off: Address,
        buf: &mut [u8],
    ) -> Result<(), FlashError> {
        let abs = self.check_range(off, buf.len())?;
        flash
            .read(abs, buf)
            .map_err(|e| FlashError::from_kind(e, FlashError::Read))
    }

    pub fn write<F: NorFlash>(
        &self,
        flash: &mut F,
        off: Address,
        buf: &[u8],
    ) -> Result<(), FlashError> {
        let abs = self.check_range(off, buf.len())?;
        flash
            .write(abs, buf)
            .map_err(|e| FlashError::from_kind(e, FlashError::Write))
    }

    pub fn erase<F: NorFlash>(
        &self,
        flash: &mut F,
        off: Address,
        len: Address,
    ) -> Result<(), FlashError> {
        let abs = self.check_range(off, len as usize)?;
        flash
            .erase(abs, abs + len)
            .map_err(|e| FlashError::from_kind(e, FlashError::Erase))
    }

    /// Minimum write granule of the device backing this area.
    pub fn align<F: NorFlash>(&self) -> usize {
        F::WRITE_SIZE.max(1)
    }

    pub fn erased_value(&self) -> u8 {
        self.erased_val
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn size(&self) -> Address {
        self.size
    }

    pub fn sector_count(&self) -> u32 {
        self.size / self.sector_size
    }

    pub fn sector_offset(&self, idx: u32) -> Address {
        idx * self.sector_size
    }

    /// Returns true when every byte of `buf` holds the erased value.
    pub fn is_erased(&self, buf: &[u8]) -> bool {
        buf.iter().all(|b| *b == self.erased_val)
    }
}

/// What to do when the swap ledger shows more than one erased run.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CorruptLedgerPolicy {
    /// Refuse to boot, flash is left as found
    Halt,
    /// Resume from the furthest entry and validate the primary slot before booting
    Revalidate,
}

/// How a pending upgrade is installed.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum UpgradeMode {
    /// Exchange both slots so the old image can be reverted to
    SwapMove,
    /// Copy the secondary over the primary, no revert possible
    Overwrite,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ConfigError {
    EmptySlot,
    ReadSize,
    WriteSize,
    SectorSize,
    TooManySectors,
    /// the swap trailer does not fit into a slot
    TrailerTooLarge,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Config {
    /// slot the bootloader boots from
    pub primary: FlashArea,
    /// slot updates are staged in
    pub secondary: FlashArea,
    /// capacity of the swap ledger, in sectors per slot
    pub max_image_sectors: u32,
    /// validate the primary image on every boot, not only after a swap
    pub validate_primary_slot: bool,
    pub corrupt_ledger_policy: CorruptLedgerPolicy,
    pub upgrade_mode: UpgradeMode,
    /// reject candidates older than the running image
    pub downgrade_prevention: bool,
    /// image number recorded in the swap info field
    pub image_index: u8,
}

impl Config {
    pub const DEFAULT_MAX_IMAGE_SECTORS: u32 = 128;

    pub fn new(primary: FlashArea, secondary: FlashArea) -> Self {
        Self {
            primary,
            secondary,
            max_image_sectors: Self::DEFAULT_MAX_IMAGE_SECTORS,
            validate_primary_slot: true,
            corrupt_ledger_policy: CorruptLedgerPolicy::Revalidate,
            upgrade_mode: UpgradeMode::SwapMove,
            downgrade_prevention: false,
            image_index: 0,
        }
    }

    pub fn area(&self, slot: Slot) -> FlashArea {
        match slot {
            Slot::Primary => self.primary,
            Slot::Secondary => self.secondary,
        }
    }

    /// Rejects layouts the upgrade engine cannot honour on flash type `F`.
    pub fn check<F: NorFlash>(&self) -> Result<(), ConfigError> {
        if F::READ_SIZE != 1 {
            return Err(ConfigError::ReadSize);
        }
        if !F::WRITE_SIZE.is_power_of_two() || F::WRITE_SIZE > MAX_WRITE_SIZE {
            return Err(ConfigError::WriteSize);
        }
        for area in [self.primary, self.secondary] {
            if area.size == 0 || area.sector_size == 0 {
                return Err(ConfigError::EmptySlot);
            }
            if area.sector_size as usize % F::ERASE_SIZE != 0
                || area.size % area.sector_size != 0
                || area.offset % area.sector_size != 0
            {
                return Err(ConfigError::SectorSize);
            }
            if area.sector_count() > self.max_image_sectors {
                return Err(ConfigError::TooManySectors);
            }
            if !Trailer::new::<F>(area, self.max_image_sectors).fits() {
                return Err(ConfigError::TrailerTooLarge);
            }
        }
        Ok(())
    }
}
