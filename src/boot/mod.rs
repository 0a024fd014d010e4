use crate::compression;
use crate::fih::FihRet;
use crate::hardware::processor::Processor;
use crate::hardware::{
    Config, ConfigError, CorruptLedgerPolicy, FlashArea, FlashError, UpgradeMode,
};
use crate::image::validate::ImageValidator;
use crate::image::{self, ImageError, ImageHeader};
use crate::log;
use crate::state::ledger::{Ledger, LedgerState};
use crate::state::{self, BootStatus, Flag, SwapType};
use crate::swap::moving::SwapMove;
use crate::swap::overwrite::Overwrite;
use crate::swap::{self, Swap, SwapError};
use crate::verify::revoke::{KeyRevocation, RevocationOracle, RevokeStatus};
use crate::verify::{KeyId, SignatureScheme};
use crate::Context;

/// Error occured while deciding what to boot
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    Flash(FlashError),
    Image(ImageError),
    Swap(SwapError),
    Config(ConfigError),
    /// The swap ledger is corrupt and the policy forbids guessing
    CorruptLedger,
    /// The primary slot holds no image
    NoBootableImage,
    /// The primary image failed validation
    InvalidImage,
}

impl From<FlashError> for BootError {
    fn from(e: FlashError) -> Self {
        BootError::Flash(e)
    }
}

impl From<ImageError> for BootError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::Flash(e) => BootError::Flash(e),
            e => BootError::Image(e),
        }
    }
}

impl From<SwapError> for BootError {
    fn from(e: SwapError) -> Self {
        match e {
            SwapError::Flash(e) => BootError::Flash(e),
            e => BootError::Swap(e),
        }
    }
}

impl From<ConfigError> for BootError {
    fn from(e: ConfigError) -> Self {
        BootError::Config(e)
    }
}

/// The image chosen to boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootResponse {
    /// slot the image executes from
    pub area: FlashArea,
    pub header: ImageHeader,
    /// upgrade performed on this boot
    pub swap_type: SwapType,
    /// key that verified the image, when it was validated
    pub key: Option<KeyId>,
    pub security_counter: Option<u32>,
}

struct Verdict {
    header: ImageHeader,
    rc: FihRet,
    key: Option<KeyId>,
    security_counter: Option<u32>,
}

fn validate_area<C: Context>(
    flash: &mut C::Flash,
    keys: &C::Keys,
    dec: &mut C::Decompressor,
    area: &FlashArea,
    scratch: &mut [u8],
) -> Result<Verdict, ImageError> {
    let header = ImageHeader::read(flash, area)?;
    let mut validator = ImageValidator::<C::Scheme, C::Keys>::new(keys);
    let rc = validator.validate(flash, area, &header, scratch, dec)?;
    Ok(Verdict {
        header,
        rc,
        key: validator.validated_key(),
        security_counter: validator.security_counter(),
    })
}

/// Use this from your bootloader application and call boot() to do the magic: finish or start
/// a pending upgrade, validate the result and jump to it with the Processor.
pub struct Bootloader<C: Context, const SCRATCH_SIZE: usize> {
    config: Config,
    flash: C::Flash,
    keys: C::Keys,
    decompressor: C::Decompressor,
    processor: C::Processor,
    revocation: KeyRevocation,
    validated_key: Option<KeyId>,
    scratch: [u8; SCRATCH_SIZE],
}

impl<C: Context, const SCRATCH_SIZE: usize> Bootloader<C, SCRATCH_SIZE> {
    /// create a new instance of the bootloader
    pub fn new(
        config: Config,
        flash: C::Flash,
        keys: C::Keys,
        decompressor: C::Decompressor,
        processor: C::Processor,
    ) -> Self {
        Self {
            config,
            flash,
            keys,
            decompressor,
            processor,
            revocation: KeyRevocation::new(),
            validated_key: None,
            scratch: [0; SCRATCH_SIZE],
        }
    }

    /// Destroy this instance of the bootloader and return access to the hardware peripheral
    pub fn destroy(self) -> (C::Flash, C::Keys, C::Decompressor, C::Processor) {
        (self.flash, self.keys, self.decompressor, self.processor)
    }

    /// Key that verified the primary image on the last `prepare`.
    pub fn validated_key(&self) -> Option<KeyId> {
        self.validated_key
    }

    /// Revokes the keys tried before the one that verified the running image. Armed once a
    /// confirmed primary image has validated.
    pub fn revoke_keys<O: RevocationOracle>(&mut self, oracle: &mut O) -> RevokeStatus {
        self.revocation.revoke(oracle, self.validated_key)
    }

    /// Execute the update and boot logic of the bootloader
    pub fn boot(&mut self) -> Result<void::Void, BootError> {
        log::info!("Booting with swapboot!");

        self.processor.setup(&self.config);

        let response = self.prepare()?;

        log::info!("Jumping to image in area {}", response.area.id);
        self.processor.do_jump(&response)
    }

    /// Brings the slots into a bootable state and returns the image to boot, without jumping.
    pub fn prepare(&mut self) -> Result<BootResponse, BootError> {
        self.config.check::<C::Flash>()?;
        let ledger = Ledger::new::<C::Flash>(&self.config);

        let mut force_validation = false;
        let swap_type = match ledger.read(&mut self.flash)? {
            LedgerState::InProgress(status) => self.resume(&ledger, status)?,
            LedgerState::Corrupt(status) => match self.config.corrupt_ledger_policy {
                CorruptLedgerPolicy::Halt => {
                    log::error!("Corrupt swap ledger, refusing to boot");
                    return Err(BootError::CorruptLedger);
                }
                CorruptLedgerPolicy::Revalidate => {
                    log::warn!("Corrupt swap ledger, resuming from best guess");
                    force_validation = true;
                    if status.swap_type.is_upgrade() {
                        self.resume(&ledger, status)?
                    } else {
                        SwapType::None
                    }
                }
            },
            LedgerState::Empty => self.start_upgrade(&ledger)?,
        };

        let validate = force_validation
            || self.config.validate_primary_slot
            || swap_type.is_upgrade();
        self.boot_response(&ledger, swap_type, validate)
    }

    fn resume(&mut self, ledger: &Ledger, mut status: BootStatus) -> Result<SwapType, BootError> {
        SwapMove::new(&self.config).exchange(
            &mut self.flash,
            ledger,
            &mut status,
            &mut self.scratch,
        )?;
        Ok(status.swap_type)
    }

    /// Image size of `area`, 0 when it holds no readable image.
    fn stored_size(&mut self, area: &FlashArea) -> Result<u32, BootError> {
        match ImageHeader::read(&mut self.flash, area)
            .and_then(|hdr| image::image_size(&mut self.flash, area, &hdr))
        {
            Ok(size) => Ok(size),
            Err(ImageError::Flash(e)) => Err(e.into()),
            Err(_) => Ok(0),
        }
    }

    /// Validates the candidate in the secondary slot. `None` means it must not be installed.
    fn check_candidate(&mut self) -> Result<Option<ImageHeader>, BootError> {
        let secondary = self.config.secondary;
        let verdict = match validate_area::<C>(
            &mut self.flash,
            &self.keys,
            &mut self.decompressor,
            &secondary,
            &mut self.scratch,
        ) {
            Ok(verdict) => verdict,
            Err(ImageError::Flash(e)) => return Err(e.into()),
            Err(e) => {
                log::warn!("Candidate image is malformed: {:?}", e);
                return Ok(None);
            }
        };
        if verdict.rc != FihRet::SUCCESS {
            log::warn!("Candidate image failed validation");
            return Ok(None);
        }

        if self.config.downgrade_prevention {
            if let Ok(current) = ImageHeader::read(&mut self.flash, &self.config.primary) {
                if verdict.header.version < current.version {
                    log::warn!("Candidate image is older than the running one");
                    return Ok(None);
                }
            }
        }

        if verdict.header.flags.is_compressed() {
            if let Err(e) = compression::check_header(
                &mut self.flash,
                &secondary,
                &verdict.header,
                self.config.primary.size,
                &mut self.scratch,
            ) {
                log::warn!("Compressed candidate rejected: {:?}", e);
                return Ok(None);
            }
        }
        Ok(Some(verdict.header))
    }

    fn start_upgrade(&mut self, ledger: &Ledger) -> Result<SwapType, BootError> {
        let pri = ledger.primary().read_state(&mut self.flash)?;
        let sec = ledger.secondary().read_state(&mut self.flash)?;
        let swap_type = state::swap_type(&pri, &sec);
        log::info!("Swap type: {:?}", swap_type);
        if swap_type == SwapType::None {
            return Ok(swap_type);
        }

        if let Err(e) = swap::slots_compatible(&self.config) {
            log::warn!("Slots are not compatible, not upgrading: {:?}", e);
            return Ok(SwapType::None);
        }

        let mut overwrite_header = None;
        if matches!(swap_type, SwapType::Test | SwapType::Perm) {
            let Some(header) = self.check_candidate()? else {
                return Ok(SwapType::Fail);
            };
            if header.flags.is_compressed() || self.config.upgrade_mode == UpgradeMode::Overwrite
            {
                overwrite_header = Some(header);
            }
        }

        let primary = self.config.primary;
        let secondary = self.config.secondary;
        let swap_size = self
            .stored_size(&primary)?
            .max(self.stored_size(&secondary)?);
        let mut status = BootStatus::new(swap_type, swap_size);

        if let Some(header) = overwrite_header {
            Overwrite::new(
                &self.config,
                header,
                <C::Scheme as SignatureScheme>::SIG_TLV,
                &mut self.decompressor,
            )
            .exchange(&mut self.flash, ledger, &mut status, &mut self.scratch)?;
            return Ok(swap_type);
        }

        let mut engine = SwapMove::new(&self.config);
        if !engine.fits(ledger, swap_size) {
            return Ok(SwapType::None);
        }
        engine.exchange(&mut self.flash, ledger, &mut status, &mut self.scratch)?;
        Ok(swap_type)
    }

    fn boot_response(
        &mut self,
        ledger: &Ledger,
        swap_type: SwapType,
        validate: bool,
    ) -> Result<BootResponse, BootError> {
        let primary = self.config.primary;
        let header = match ImageHeader::read(&mut self.flash, &primary) {
            Ok(header) => header,
            Err(ImageError::Flash(e)) => return Err(e.into()),
            Err(e) => {
                log::error!("No image in the primary slot: {:?}", e);
                return Err(BootError::NoBootableImage);
            }
        };
        if header.flags.is_compressed() {
            log::error!("Primary image is compressed");
            return Err(BootError::NoBootableImage);
        }

        let mut response = BootResponse {
            area: primary,
            header,
            swap_type,
            key: None,
            security_counter: None,
        };
        if !validate {
            return Ok(response);
        }

        let verdict = match validate_area::<C>(
            &mut self.flash,
            &self.keys,
            &mut self.decompressor,
            &primary,
            &mut self.scratch,
        ) {
            Ok(verdict) => verdict,
            Err(ImageError::Flash(e)) => return Err(e.into()),
            Err(e) => {
                log::error!("Primary image is malformed: {:?}", e);
                return Err(BootError::InvalidImage);
            }
        };
        if verdict.rc != FihRet::SUCCESS {
            log::error!("Primary image failed validation");
            return Err(BootError::InvalidImage);
        }

        self.validated_key = verdict.key;
        response.key = verdict.key;
        response.security_counter = verdict.security_counter;
        if ledger.primary().read_image_ok(&mut self.flash)? == Flag::Set {
            self.revocation.allow_revoke();
        }
        Ok(response)
    }
}
