//! Swap progress journal kept in the primary trailer.
//!
//! Each completed step of a swap-move programs one entry. Entries are only ever written in
//! step order, so on a healthy ledger the written entries form at most two blocks: the move
//! entries at the bottom and the swap entries above them. Reading scans from the top, the
//! highest written entry tells the step to resume with.

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

use super::trailer::Trailer;
use super::{BootStatus, MagicState, Flag, StatusSource, Step, SwapType};
use crate::hardware::{Config, FlashError};
use crate::log;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    /// No swap is in progress
    Empty,
    /// A swap was interrupted and resumes at the contained status
    InProgress(BootStatus),
    /// Entries were found out of order, the status is the best guess from the highest entry
    Corrupt(BootStatus),
}

/// Both slot trailers seen as the persistent state of one image pair.
#[derive(Debug, Clone, Copy)]
pub struct Ledger {
    primary: Trailer,
    secondary: Trailer,
    max_sectors: u32,
    image_index: u8,
}

impl Ledger {
    pub fn new<F: NorFlash>(config: &Config) -> Self {
        Self {
            primary: Trailer::new::<F>(config.primary, config.max_image_sectors),
            secondary: Trailer::new::<F>(config.secondary, config.max_image_sectors),
            max_sectors: config.max_image_sectors,
            image_index: config.image_index,
        }
    }

    pub fn primary(&self) -> &Trailer {
        &self.primary
    }

    pub fn secondary(&self) -> &Trailer {
        &self.secondary
    }

    pub fn image_index(&self) -> u8 {
        self.image_index
    }

    /// Locates the live ledger, if any.
    pub fn source<F: ReadNorFlash>(&self, flash: &mut F) -> Result<StatusSource, FlashError> {
        let pri = self.primary.read_state(flash)?;
        let sec_magic = self.secondary.read_magic(flash)?;
        if pri.magic == MagicState::Good
            && pri.copy_done == Flag::Unset
            && sec_magic != MagicState::Good
        {
            Ok(StatusSource::Primary)
        } else {
            Ok(StatusSource::None)
        }
    }

    /// Returns the highest written entry and the number of erased runs below written entries.
    fn scan<F: ReadNorFlash>(&self, flash: &mut F) -> Result<(Option<u32>, u32), FlashError> {
        let erased = self.primary.area().erased_val;
        let mut found = None;
        let mut runs = 0;
        let mut last_erased = true;
        for entry in (0..self.primary.status_entries()).rev() {
            let is_erased = self.primary.read_status_entry(flash, entry)? == erased;
            if is_erased && !last_erased {
                runs += 1;
            }
            if !is_erased && found.is_none() {
                found = Some(entry);
            }
            last_erased = is_erased;
        }
        Ok((found, runs))
    }

    /// Reconstructs the progress of an interrupted swap.
    pub fn read<F: ReadNorFlash>(&self, flash: &mut F) -> Result<LedgerState, FlashError> {
        if self.source(flash)? == StatusSource::None {
            return Ok(LedgerState::Empty);
        }

        let (found, runs) = self.scan(flash)?;
        let step = match found {
            Some(entry) => Step::after_entry(entry, self.max_sectors),
            None => Step::START,
        };
        let (swap_type, _) = self.primary.read_swap_info(flash)?;
        let status = BootStatus {
            step,
            swap_type,
            swap_size: self.primary.read_swap_size(flash)?,
            source: StatusSource::Primary,
        };

        if runs > 1 || !swap_type.is_upgrade() {
            log::error!("Swap ledger is corrupt ({} erased runs)", runs);
            Ok(LedgerState::Corrupt(status))
        } else {
            log::info!("Resuming interrupted swap at {:?}", status.step);
            Ok(LedgerState::InProgress(status))
        }
    }

    /// Records that `step` has completed.
    pub fn write<F: NorFlash>(&self, flash: &mut F, step: Step) -> Result<(), FlashError> {
        log::trace!("Ledger: {:?} done", step);
        self.primary
            .write_status_entry(flash, step.entry(self.max_sectors), step.marker())
    }

    /// Opens a fresh ledger in the primary trailer. The magic goes last so a torn
    /// initialisation never looks like a live ledger.
    pub fn init<F: NorFlash>(&self, flash: &mut F, status: &BootStatus) -> Result<(), FlashError> {
        let sec_image_ok = self.secondary.read_image_ok(flash)?;
        self.primary
            .write_swap_info(flash, status.swap_type, self.image_index)?;
        if sec_image_ok == Flag::Set {
            self.primary.write_image_ok(flash)?;
        }
        self.primary.write_swap_size(flash, status.swap_size)?;
        self.primary.write_magic(flash)
    }

    /// Swap type an interrupted ledger was opened with, [`SwapType::None`] when there is none.
    pub fn pending_type<F: ReadNorFlash>(&self, flash: &mut F) -> Result<SwapType, FlashError> {
        match self.read(flash)? {
            LedgerState::InProgress(status) | LedgerState::Corrupt(status) => {
                Ok(status.swap_type)
            }
            LedgerState::Empty => Ok(SwapType::None),
        }
    }
}
