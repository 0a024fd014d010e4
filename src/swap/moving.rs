//! Swap using move: exchanges the slots without a scratch area.
//!
//! The primary image is first shifted up by one sector, top sector first. That frees sector 0
//! of the primary slot, and from then on each pair `j` is exchanged in two halves: secondary
//! sector `j` goes to primary sector `j`, then primary sector `j + 1`, holding the shifted old
//! sector `j`, goes to secondary sector `j`. Every half is a single erase-copy of one sector
//! followed by a ledger entry, so a reset at any point redoes at most the sector in flight.

use embedded_storage::nor_flash::NorFlash;

use super::{copy_region, erase_sector, Swap, SwapError};
use crate::hardware::{Config, FlashArea, Slot};
use crate::log;
use crate::state::ledger::Ledger;
use crate::state::{BootStatus, Flag, MagicState, StatusSource, Step, SwapHalf, SwapType};
use crate::Address;

/// Number of sectors a swap of `swap_size` bytes touches, at least one.
pub fn last_idx(swap_size: u32, sector_size: Address) -> u32 {
    swap_size.div_ceil(sector_size).max(1)
}

/// Where the header of the image that started the swap in `slot` currently lives.
pub fn header_offset(status: &BootStatus, slot: Slot, sector_size: Address) -> (Slot, Address) {
    let last = last_idx(status.swap_size, sector_size);
    match (status.step, slot) {
        (Step::Move { idx }, Slot::Primary) if idx >= last => (Slot::Primary, sector_size),
        (Step::Move { .. }, slot) => (slot, 0),
        (Step::Swap { idx: 0, .. }, Slot::Primary) => (Slot::Primary, sector_size),
        (
            Step::Swap {
                idx: 0,
                half: SwapHalf::ToSecondary,
            },
            Slot::Secondary,
        ) => (Slot::Primary, 0),
        (Step::Swap { idx: 0, .. }, Slot::Secondary) => (Slot::Secondary, 0),
        (Step::Swap { .. }, Slot::Primary) => (Slot::Secondary, 0),
        (Step::Swap { .. }, Slot::Secondary) => (Slot::Primary, 0),
    }
}

pub struct SwapMove {
    primary: FlashArea,
    secondary: FlashArea,
}

impl SwapMove {
    pub fn new(config: &Config) -> Self {
        Self {
            primary: config.primary,
            secondary: config.secondary,
        }
    }

    /// Whether a swap of `swap_size` bytes leaves the sectors of the primary trailer alone.
    pub fn fits(&self, ledger: &Ledger, swap_size: u32) -> bool {
        let last = last_idx(swap_size, self.primary.sector_size);
        let first_trailer = ledger.primary().first_sector();
        if last >= first_trailer {
            log::warn!(
                "Not enough free space to run swap upgrade: {} sectors needed, {} available",
                last + 1,
                first_trailer
            );
            return false;
        }
        true
    }

    /// Makes an interrupted revert resumable by giving the secondary the trailer of a
    /// confirmed upgrade before anything is moved. The swap info marks it as a revert so the
    /// next boot does not take the previous image for a new candidate.
    fn fixup_revert<F: NorFlash>(
        &self,
        flash: &mut F,
        ledger: &Ledger,
        status: &BootStatus,
    ) -> Result<(), SwapError> {
        if status.swap_type != SwapType::Revert || status.step != Step::START {
            return Ok(());
        }
        let sec = ledger.secondary();
        if sec.read_magic(flash)? == MagicState::Unset {
            log::info!("Preparing secondary trailer for revert");
            sec.scramble(flash)?;
            sec.write_image_ok(flash)?;
            sec.write_swap_info(flash, SwapType::Revert, ledger.image_index())?;
            sec.write_swap_size(flash, status.swap_size)?;
            sec.write_magic(flash)?;
        }
        Ok(())
    }

    fn move_sector<F: NorFlash>(
        &self,
        flash: &mut F,
        ledger: &Ledger,
        status: &BootStatus,
        k: u32,
        last: u32,
        scratch: &mut [u8],
    ) -> Result<(), SwapError> {
        if k == 0 {
            if status.source != StatusSource::Primary {
                ledger.primary().scramble(flash)?;
                ledger.init(flash, status)?;
            }
            ledger.secondary().scramble(flash)?;
        }

        let dst = last - k;
        log::trace!("Move: primary sector {} -> {}", dst - 1, dst);
        erase_sector(flash, &self.primary, dst)?;
        copy_region(
            flash,
            &self.primary,
            self.primary.sector_offset(dst - 1),
            &self.primary,
            self.primary.sector_offset(dst),
            self.primary.sector_size,
            scratch,
        )?;
        ledger.write(flash, Step::Move { idx: k })?;
        Ok(())
    }

    fn swap_half<F: NorFlash>(
        &self,
        flash: &mut F,
        ledger: &Ledger,
        idx: u32,
        half: SwapHalf,
        scratch: &mut [u8],
    ) -> Result<(), SwapError> {
        let (src, src_sector, dst) = match half {
            SwapHalf::ToPrimary => (&self.secondary, idx, &self.primary),
            SwapHalf::ToSecondary => (&self.primary, idx + 1, &self.secondary),
        };
        log::trace!("Swap: sector {} of area {} -> {}", src_sector, src.id, dst.id);
        erase_sector(flash, dst, idx)?;
        copy_region(
            flash,
            src,
            src.sector_offset(src_sector),
            dst,
            dst.sector_offset(idx),
            dst.sector_size,
            scratch,
        )?;
        ledger.write(flash, Step::Swap { idx, half })?;
        Ok(())
    }
}

impl Swap for SwapMove {
    fn exchange<F: NorFlash>(
        &mut self,
        flash: &mut F,
        ledger: &Ledger,
        status: &mut BootStatus,
        scratch: &mut [u8],
    ) -> Result<(), SwapError> {
        let last = last_idx(status.swap_size, self.primary.sector_size);
        log::info!(
            "Swap-move of {} sectors, {:?}, from {:?}",
            last,
            status.swap_type,
            status.step
        );

        self.fixup_revert(flash, ledger, status)?;

        if let Step::Move { idx } = status.step {
            for k in idx..last {
                self.move_sector(flash, ledger, status, k, last, scratch)?;
                status.step = Step::Move { idx: k + 1 };
            }
            status.step = Step::Swap {
                idx: 0,
                half: SwapHalf::ToPrimary,
            };
        }

        while let Step::Swap { idx, half } = status.step {
            if idx >= last {
                break;
            }
            self.swap_half(flash, ledger, idx, half, scratch)?;
            status.step = match half {
                SwapHalf::ToPrimary => Step::Swap {
                    idx,
                    half: SwapHalf::ToSecondary,
                },
                SwapHalf::ToSecondary => Step::Swap {
                    idx: idx + 1,
                    half: SwapHalf::ToPrimary,
                },
            };
        }

        let pri = ledger.primary();
        if matches!(status.swap_type, SwapType::Perm | SwapType::Revert)
            && pri.read_image_ok(flash)? != Flag::Set
        {
            pri.write_image_ok(flash)?;
        }
        pri.write_copy_done(flash)?;
        log::info!("Swap complete");
        Ok(())
    }
}
