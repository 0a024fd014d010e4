pub mod moving;
pub mod overwrite;

use embedded_storage::nor_flash::NorFlash;

use crate::hardware::{Config, FlashArea, FlashError};
use crate::image::ImageError;
use crate::state::ledger::Ledger;
use crate::state::BootStatus;
use crate::Address;

/// Slot layouts the swap engine refuses to work with.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatError {
    /// sector sizes differ between the slots
    SectorSize,
    /// the primary slot has fewer sectors, or more than one extra
    SectorCount,
    /// a slot has more sectors than the ledger can track
    TooManySectors,
}

/// Error occured while installing an upgrade
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    Flash(FlashError),
    Incompatible(CompatError),
    Image(ImageError),
}

impl From<FlashError> for SwapError {
    fn from(e: FlashError) -> Self {
        SwapError::Flash(e)
    }
}

impl From<CompatError> for SwapError {
    fn from(e: CompatError) -> Self {
        SwapError::Incompatible(e)
    }
}

impl From<ImageError> for SwapError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::Flash(e) => SwapError::Flash(e),
            e => SwapError::Image(e),
        }
    }
}

/// An upgrade strategy, driving `status` to completion.
pub trait Swap {
    fn exchange<F: NorFlash>(
        &mut self,
        flash: &mut F,
        ledger: &Ledger,
        status: &mut BootStatus,
        scratch: &mut [u8],
    ) -> Result<(), SwapError>;
}

/// Checks that the slots can exchange their sectors one to one. Touches no flash.
pub fn slots_compatible(config: &Config) -> Result<(), CompatError> {
    let (pri, sec) = (&config.primary, &config.secondary);
    if pri.sector_size != sec.sector_size {
        return Err(CompatError::SectorSize);
    }
    let (n_pri, n_sec) = (pri.sector_count(), sec.sector_count());
    if n_pri > config.max_image_sectors || n_sec > config.max_image_sectors {
        return Err(CompatError::TooManySectors);
    }
    if n_pri != n_sec && n_pri != n_sec + 1 {
        return Err(CompatError::SectorCount);
    }
    Ok(())
}

/// Copies `len` bytes from `src` to `dst`, going through `scratch`. The destination range must
/// be erased.
pub(crate) fn copy_region<F: NorFlash>(
    flash: &mut F,
    src: &FlashArea,
    src_off: Address,
    dst: &FlashArea,
    dst_off: Address,
    len: Address,
    scratch: &mut [u8],
) -> Result<(), FlashError> {
    let chunk = scratch.len() - scratch.len() % F::WRITE_SIZE.max(1);
    if chunk == 0 {
        return Err(FlashError::NotAligned);
    }
    let mut done: Address = 0;
    while done < len {
        let n = (len - done).min(chunk as Address) as usize;
        src.read(flash, src_off + done, &mut scratch[..n])?;
        dst.write(flash, dst_off + done, &scratch[..n])?;
        done += n as Address;
    }
    Ok(())
}

/// Erases the sector `idx` of `area`.
pub(crate) fn erase_sector<F: NorFlash>(
    flash: &mut F,
    area: &FlashArea,
    idx: u32,
) -> Result<(), FlashError> {
    area.erase(flash, area.sector_offset(idx), area.sector_size)
}
