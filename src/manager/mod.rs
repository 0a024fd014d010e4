use embedded_storage::nor_flash::NorFlash;

use crate::hardware::{Config, ConfigError, FlashError};
use crate::image::{ImageError, ImageHeader};
use crate::log;
use crate::state::ledger::Ledger;
use crate::state::{self, Flag, MagicState, SwapType};

/// Instantiate this in your application to queue upgrades for the bootloader and to confirm
/// the running image after a test swap.
pub struct UpdateManager<F: NorFlash> {
    config: Config,
    flash: F,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitError(pub ConfigError);

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkError {
    UpdateQueuedButNotInstalled,
    /// The primary trailer holds garbage
    BadTrailer,
    Flash(FlashError),
}

impl From<FlashError> for MarkError {
    fn from(e: FlashError) -> Self {
        MarkError::Flash(e)
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeError {
    /// The secondary slot holds no image
    NoImage,
    Flash(FlashError),
}

impl From<FlashError> for UpgradeError {
    fn from(e: FlashError) -> Self {
        UpgradeError::Flash(e)
    }
}

impl<F: NorFlash> UpdateManager<F> {
    pub fn new(config: Config, flash: F) -> Result<Self, InitError> {
        if let Err(e) = config.check::<F>() {
            log::error!("Rejecting slot configuration: {:?}", e);
            return Err(InitError(e));
        }
        Ok(Self { config, flash })
    }

    /// Destroy this instance of the boot manager and return access to the hardware peripheral
    pub fn destroy(self) -> F {
        self.flash
    }

    fn ledger(&self) -> Ledger {
        Ledger::new::<F>(&self.config)
    }

    /// Marks the image in the secondary slot for installation on the next boot. A permanent
    /// request installs it for good, otherwise it has to confirm itself once running.
    pub fn request_upgrade(&mut self, permanent: bool) -> Result<(), UpgradeError> {
        match ImageHeader::read(&mut self.flash, &self.config.secondary) {
            Ok(_) => {}
            Err(ImageError::Flash(e)) => return Err(e.into()),
            Err(_) => {
                log::error!("No image in the secondary slot");
                return Err(UpgradeError::NoImage);
            }
        }

        let ledger = self.ledger();
        let trailer = ledger.secondary();
        let state = trailer.read_state(&mut self.flash)?;
        if state.magic == MagicState::Good {
            log::warn!("Upgrade already requested");
            return Ok(());
        }
        // a leftover revert marker would turn the request into a revert
        if state.magic == MagicState::Bad
            || state.image_ok != Flag::Unset
            || state.swap_type != SwapType::None
        {
            trailer.scramble(&mut self.flash)?;
        }

        log::info!("Requesting upgrade, permanent: {}", permanent);
        if permanent {
            trailer.write_image_ok(&mut self.flash)?;
        }
        trailer.write_magic(&mut self.flash)?;
        Ok(())
    }

    /// Run this immediately after booting your new image successfully to mark the boot as
    /// succesful. If you do not do this, any reset will cause the bootloader to restore to the
    /// previous firmware image.
    pub fn mark_boot_successful(&mut self) -> Result<(), MarkError> {
        let ledger = self.ledger();
        if ledger.secondary().read_magic(&mut self.flash)? == MagicState::Good {
            log::error!(
                "There is an update queued, but it has not been installed yet. Did you skip the bootloader?"
            );
            return Err(MarkError::UpdateQueuedButNotInstalled);
        }

        let primary = ledger.primary();
        match primary.read_magic(&mut self.flash)? {
            MagicState::Unset => {
                log::info!("No Update was done.");
                return Ok(());
            }
            MagicState::Bad => return Err(MarkError::BadTrailer),
            MagicState::Good => {}
        }

        match primary.read_image_ok(&mut self.flash)? {
            Flag::Set => Ok(()),
            Flag::Bad => Err(MarkError::BadTrailer),
            Flag::Unset => {
                log::info!("Software was updated, marking as successful.");
                primary.write_image_ok(&mut self.flash)?;
                Ok(())
            }
        }
    }

    /// What the bootloader would do on the next boot, before validating any image.
    pub fn swap_type(&mut self) -> Result<SwapType, FlashError> {
        let ledger = self.ledger();
        let pending = ledger.pending_type(&mut self.flash)?;
        if pending != SwapType::None {
            return Ok(pending);
        }
        let pri = ledger.primary().read_state(&mut self.flash)?;
        let sec = ledger.secondary().read_state(&mut self.flash)?;
        Ok(state::swap_type(&pri, &sec))
    }
}
