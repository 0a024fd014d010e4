//! Boot requests the application leaves for the bootloader: a boot mode, and per image a
//! preferred slot and a confirmation.
//!
//! The table lives in a small byte-writable area, retention RAM or a flash page behind
//! [`Storage`]:
//!
//! ```text
//! | prefix 0x0B01 (u16 LE) | entries (1 byte each) | CRC-32 of the entries (u32 LE) |
//! ```
//!
//! An optional backup area keeps the last valid table so a torn update of the main area can be
//! recovered and the preferred slots survive [`RequestStore::clear`].

use crc::{Crc, CRC_32_ISO_HDLC};
use embedded_storage::Storage;

use crate::hardware::Slot;
use crate::log;

const PREFIX: u16 = 0x0B01;
const PREFIX_SIZE: usize = 2;
const CHECKSUM_SIZE: usize = 4;
const ENTRY_COUNT: usize = 5;
/// Bytes one request table occupies.
pub const AREA_SIZE: usize = PREFIX_SIZE + ENTRY_COUNT + CHECKSUM_SIZE;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

fn checksum(bytes: &[u8]) -> u32 {
    CRC.checksum(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    BootMode = 0,
    Image0Preference = 1,
    Image0Confirm = 2,
    Image1Preference = 3,
    Image1Confirm = 4,
}

impl Entry {
    fn preference(image: u8) -> Result<Self, RequestError> {
        match image {
            0 => Ok(Entry::Image0Preference),
            1 => Ok(Entry::Image1Preference),
            _ => Err(RequestError::InvalidImage),
        }
    }

    fn confirm(image: u8) -> Result<Self, RequestError> {
        match image {
            0 => Ok(Entry::Image0Confirm),
            1 => Ok(Entry::Image1Confirm),
            _ => Err(RequestError::InvalidImage),
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

const SLOT_INVALID: u8 = 0;
const SLOT_PRIMARY: u8 = 1;
const SLOT_SECONDARY: u8 = 2;

fn slot_value(slot: Slot) -> u8 {
    match slot {
        Slot::Primary => SLOT_PRIMARY,
        Slot::Secondary => SLOT_SECONDARY,
    }
}

/// Boot mode requested for the next boot.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    Regular,
    Recovery,
    FirmwareLoader,
    Invalid,
}

impl BootMode {
    fn to_u8(self) -> u8 {
        match self {
            BootMode::Regular => 0,
            BootMode::Recovery => 1,
            BootMode::FirmwareLoader => 2,
            BootMode::Invalid => 0xff,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => BootMode::Regular,
            1 => BootMode::Recovery,
            2 => BootMode::FirmwareLoader,
            _ => BootMode::Invalid,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// The backing storage failed
    Storage,
    /// Neither area holds a valid table
    NotFound,
    /// Only images 0 and 1 have entries
    InvalidImage,
}

struct Region<S> {
    storage: S,
    offset: u32,
}

impl<S: Storage> Region<S> {
    fn load(&mut self) -> Result<[u8; AREA_SIZE], RequestError> {
        let mut area = [0u8; AREA_SIZE];
        self.storage
            .read(self.offset, &mut area)
            .map_err(|_| RequestError::Storage)?;
        Ok(area)
    }

    fn store(&mut self, area: &[u8; AREA_SIZE]) -> Result<(), RequestError> {
        self.storage
            .write(self.offset, area)
            .map_err(|_| RequestError::Storage)
    }

    fn valid(&mut self) -> Option<[u8; AREA_SIZE]> {
        let area = self.load().ok()?;
        is_valid(&area).then_some(area)
    }

    /// Rewrites prefix and checksum so the current entries become the valid table.
    fn commit(&mut self, mut area: [u8; AREA_SIZE]) -> Result<(), RequestError> {
        area[..PREFIX_SIZE].copy_from_slice(&PREFIX.to_le_bytes());
        let crc = checksum(&area[PREFIX_SIZE..PREFIX_SIZE + ENTRY_COUNT]);
        area[PREFIX_SIZE + ENTRY_COUNT..].copy_from_slice(&crc.to_le_bytes());
        self.store(&area)
    }

    fn clear(&mut self) -> Result<(), RequestError> {
        self.commit([0xff; AREA_SIZE])
    }
}

fn is_valid(area: &[u8; AREA_SIZE]) -> bool {
    let prefix = u16::from_le_bytes([area[0], area[1]]);
    let mut crc = [0u8; CHECKSUM_SIZE];
    crc.copy_from_slice(&area[PREFIX_SIZE + ENTRY_COUNT..]);
    prefix == PREFIX && u32::from_le_bytes(crc) == checksum(&area[PREFIX_SIZE..PREFIX_SIZE + ENTRY_COUNT])
}

/// Boot request table with an optional backup copy.
pub struct RequestStore<M: Storage, B: Storage = M> {
    main: Region<M>,
    backup: Option<Region<B>>,
}

impl<M: Storage> RequestStore<M, M> {
    pub fn new(main: M, offset: u32) -> Self {
        Self {
            main: Region {
                storage: main,
                offset,
            },
            backup: None,
        }
    }
}

impl<M: Storage, B: Storage> RequestStore<M, B> {
    pub fn with_backup(main: M, main_offset: u32, backup: B, backup_offset: u32) -> Self {
        Self {
            main: Region {
                storage: main,
                offset: main_offset,
            },
            backup: Some(Region {
                storage: backup,
                offset: backup_offset,
            }),
        }
    }

    pub fn destroy(self) -> (M, Option<B>) {
        (self.main.storage, self.backup.map(|b| b.storage))
    }

    /// Brings main and backup area in sync, run once per boot.
    pub fn init(&mut self) -> Result<(), RequestError> {
        let main = self.main.valid();
        let Some(backup) = self.backup.as_mut() else {
            if main.is_none() {
                log::info!("Request area is invalid, clearing it");
                return self.main.clear();
            }
            return Ok(());
        };

        match (main, backup.valid()) {
            (Some(main), Some(copy)) if main == copy => Ok(()),
            (Some(main), _) => {
                log::info!("Updating request backup area");
                backup.store(&main)
            }
            (None, Some(copy)) => {
                log::info!("Request main area is invalid, restoring from backup");
                self.main.store(&copy)
            }
            (None, None) => {
                log::info!("Both request areas are invalid, clearing them");
                backup.clear()?;
                self.main.clear()
            }
        }
    }

    /// Makes sure the main area holds a valid table before an entry is modified.
    fn prepare_write(&mut self) -> Result<(), RequestError> {
        if self.main.valid().is_some() {
            return Ok(());
        }
        match self.backup.as_mut().and_then(|b| b.valid()) {
            Some(copy) => {
                log::info!("Broken request main area, restoring from backup");
                self.main.store(&copy)
            }
            None => self.main.clear(),
        }
    }

    fn read(&mut self, entry: Entry) -> Result<u8, RequestError> {
        if let Some(area) = self.main.valid() {
            return Ok(area[PREFIX_SIZE + entry.index()]);
        }
        if let Some(area) = self.backup.as_mut().and_then(|b| b.valid()) {
            return Ok(area[PREFIX_SIZE + entry.index()]);
        }
        Err(RequestError::NotFound)
    }

    /// Updates one entry of the main area. The backup follows on the next `init`.
    fn write(&mut self, entry: Entry, value: u8) -> Result<(), RequestError> {
        self.prepare_write()?;
        let mut area = self.main.load()?;
        let at = PREFIX_SIZE + entry.index();
        if area[at] == value {
            return Ok(());
        }
        log::debug!("Request entry {} set to {}", at, value);
        area[at] = value;
        self.main.commit(area)
    }

    pub fn confirm_slot(&mut self, image: u8, slot: Slot) -> Result<(), RequestError> {
        self.write(Entry::confirm(image)?, slot_value(slot))
    }

    pub fn check_confirmed_slot(&mut self, image: u8, slot: Slot) -> bool {
        let Ok(entry) = Entry::confirm(image) else {
            return false;
        };
        matches!(self.read(entry), Ok(v) if v != SLOT_INVALID && v == slot_value(slot))
    }

    pub fn set_preferred_slot(&mut self, image: u8, slot: Slot) -> Result<(), RequestError> {
        self.write(Entry::preference(image)?, slot_value(slot))
    }

    pub fn preferred_slot(&mut self, image: u8) -> Option<Slot> {
        match self.read(Entry::preference(image).ok()?) {
            Ok(SLOT_PRIMARY) => Some(Slot::Primary),
            Ok(SLOT_SECONDARY) => Some(Slot::Secondary),
            _ => None,
        }
    }

    pub fn boot_mode(&mut self) -> BootMode {
        self.read(Entry::BootMode)
            .map_or(BootMode::Invalid, BootMode::from_u8)
    }

    pub fn enter_recovery(&mut self) -> Result<(), RequestError> {
        self.write(Entry::BootMode, BootMode::Recovery.to_u8())
    }

    pub fn detect_recovery(&mut self) -> bool {
        self.boot_mode() == BootMode::Recovery
    }

    pub fn enter_firmware_loader(&mut self) -> Result<(), RequestError> {
        self.write(Entry::BootMode, BootMode::FirmwareLoader.to_u8())
    }

    pub fn detect_firmware_loader(&mut self) -> bool {
        self.boot_mode() == BootMode::FirmwareLoader
    }

    /// Drops every request. With a backup area the preferred slots are kept, without one the
    /// whole table is reset.
    pub fn clear(&mut self) -> Result<(), RequestError> {
        let Some(backup) = self.backup.as_mut() else {
            return self.main.clear();
        };
        let Some(copy) = backup.valid() else {
            // keep at least one valid table around
            return Ok(());
        };

        let mut fresh = [0xff; AREA_SIZE];
        for entry in [Entry::Image0Preference, Entry::Image1Preference] {
            let at = PREFIX_SIZE + entry.index();
            fresh[at] = copy[at];
        }
        let current = self.main.load()?;
        if current[PREFIX_SIZE..PREFIX_SIZE + ENTRY_COUNT]
            == fresh[PREFIX_SIZE..PREFIX_SIZE + ENTRY_COUNT]
        {
            return Ok(());
        }

        self.main.commit(fresh)?;
        let Some(main) = self.main.valid() else {
            return Err(RequestError::Storage);
        };
        backup.store(&main)
    }
}
