//! One-way upgrade: the secondary image replaces the primary one, no revert possible.
//!
//! The secondary stays pending until its trailer is scrambled at the very end, so an
//! interrupted run simply starts over on the next boot.

use embedded_storage::nor_flash::NorFlash;

use super::moving::last_idx;
use super::{copy_region, Swap, SwapError};
use crate::compression::{self, Decompressor};
use crate::hardware::{Config, FlashArea};
use crate::image::ImageHeader;
use crate::log;
use crate::state::ledger::Ledger;
use crate::state::BootStatus;

pub struct Overwrite<'d, D: Decompressor> {
    primary: FlashArea,
    secondary: FlashArea,
    header: ImageHeader,
    sig_tlv: u16,
    dec: &'d mut D,
}

impl<'d, D: Decompressor> Overwrite<'d, D> {
    /// `header` is the header of the secondary image, `sig_tlv` the signature type the
    /// decompressed trailer is rebuilt with.
    pub fn new(config: &Config, header: ImageHeader, sig_tlv: u16, dec: &'d mut D) -> Self {
        Self {
            primary: config.primary,
            secondary: config.secondary,
            header,
            sig_tlv,
            dec,
        }
    }
}

impl<D: Decompressor> Swap for Overwrite<'_, D> {
    fn exchange<F: NorFlash>(
        &mut self,
        flash: &mut F,
        ledger: &Ledger,
        status: &mut BootStatus,
        scratch: &mut [u8],
    ) -> Result<(), SwapError> {
        log::info!(
            "Overwriting area {} with area {}",
            self.primary.id,
            self.secondary.id
        );
        self.primary.erase(flash, 0, self.primary.size)?;

        if self.header.flags.is_compressed() {
            compression::copy_decompressed(
                flash,
                &self.secondary,
                &self.primary,
                &self.header,
                self.sig_tlv,
                self.dec,
                scratch,
            )?;
        } else {
            let sectors = last_idx(status.swap_size, self.secondary.sector_size);
            let len = (sectors * self.secondary.sector_size)
                .min(self.secondary.size)
                .min(self.primary.size);
            copy_region(flash, &self.secondary, 0, &self.primary, 0, len, scratch)?;
        }

        ledger.secondary().scramble(flash)?;
        self.secondary.erase(flash, 0, self.secondary.size)?;
        log::info!("Overwrite complete");
        Ok(())
    }
}
