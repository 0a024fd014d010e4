pub mod ledger;
pub mod trailer;

#[cfg(feature = "derive")]
use serde::{Deserialize, Serialize};

/// Ledger entries per sector for the move phase.
pub const MOVE_STATE_COUNT: u32 = 1;
/// Ledger entries per sector for the swap phase.
pub const SWAP_STATE_COUNT: u32 = 2;
/// Ledger entries reserved per sector.
pub const STATUS_STATE_COUNT: u32 = MOVE_STATE_COUNT + SWAP_STATE_COUNT;

/// What the bootloader does with the slots on this boot.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapType {
    /// Boot the primary image as is
    None,
    /// Swap in the secondary image, revert unless it confirms itself
    Test,
    /// Swap in the secondary image for good
    Perm,
    /// Swap back to the previous image, the tested one never confirmed
    Revert,
    /// A candidate was pending but failed validation
    Fail,
    /// Unrecoverable inconsistency
    Panic,
}

impl SwapType {
    pub fn to_u8(self) -> u8 {
        match self {
            SwapType::None => 1,
            SwapType::Test => 2,
            SwapType::Perm => 3,
            SwapType::Revert => 4,
            SwapType::Fail => 5,
            SwapType::Panic => 0xff,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(SwapType::None),
            2 => Some(SwapType::Test),
            3 => Some(SwapType::Perm),
            4 => Some(SwapType::Revert),
            5 => Some(SwapType::Fail),
            0xff => Some(SwapType::Panic),
            _ => None,
        }
    }

    /// Whether this swap type moves images between the slots.
    pub fn is_upgrade(self) -> bool {
        matches!(self, SwapType::Test | SwapType::Perm | SwapType::Revert)
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicState {
    Good,
    Bad,
    Unset,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Set,
    Bad,
    Unset,
}

/// Decoded trailer of one slot.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapState {
    pub magic: MagicState,
    pub swap_type: SwapType,
    pub image_num: u8,
    pub copy_done: Flag,
    pub image_ok: Flag,
}

/// Where the live ledger of an interrupted swap is kept.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
    /// No swap in progress
    None,
    Primary,
}

/// Sub-step of swapping one pair of sectors.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapHalf {
    /// Secondary sector `idx` is copied into primary sector `idx`
    ToPrimary,
    /// Primary sector `idx + 1`, the shifted old image, is copied into secondary sector `idx`
    ToSecondary,
}

/// The next step of a swap-move. Steps are totally ordered: every move step precedes every
/// swap step, and within a phase steps follow their index.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// `idx` sectors have been shifted up by one so far
    Move { idx: u32 },
    /// sector pairs below `idx` are exchanged, `half` tells how far pair `idx` got
    Swap { idx: u32, half: SwapHalf },
}

impl Step {
    pub const START: Step = Step::Move { idx: 0 };

    /// Ledger entry recording that this step completed.
    pub fn entry(&self, max_sectors: u32) -> u32 {
        match *self {
            Step::Move { idx } => idx * MOVE_STATE_COUNT,
            Step::Swap { idx, half } => {
                max_sectors * MOVE_STATE_COUNT
                    + idx * SWAP_STATE_COUNT
                    + match half {
                        SwapHalf::ToPrimary => 0,
                        SwapHalf::ToSecondary => 1,
                    }
            }
        }
    }

    /// The step to perform once the step recorded at ledger `entry` is complete.
    pub fn after_entry(entry: u32, max_sectors: u32) -> Step {
        let move_entries = max_sectors * MOVE_STATE_COUNT;
        if entry < move_entries {
            return Step::Move {
                idx: entry / MOVE_STATE_COUNT + 1,
            };
        }
        let swap = entry - move_entries;
        let idx = swap / SWAP_STATE_COUNT;
        if swap % SWAP_STATE_COUNT == 0 {
            Step::Swap {
                idx,
                half: SwapHalf::ToSecondary,
            }
        } else {
            Step::Swap {
                idx: idx + 1,
                half: SwapHalf::ToPrimary,
            }
        }
    }

    /// Marker byte stored in the ledger entry of this step.
    pub fn marker(&self) -> u8 {
        match self {
            Step::Move { .. } | Step::Swap { half: SwapHalf::ToPrimary, .. } => 0x01,
            Step::Swap { half: SwapHalf::ToSecondary, .. } => 0x02,
        }
    }
}

/// Progress of a swap as persisted in the ledger and slot trailer.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootStatus {
    pub step: Step,
    pub swap_type: SwapType,
    /// bytes to exchange, the larger of both images
    pub swap_size: u32,
    pub source: StatusSource,
}

impl BootStatus {
    pub fn new(swap_type: SwapType, swap_size: u32) -> Self {
        Self {
            step: Step::START,
            swap_type,
            swap_size,
            source: StatusSource::None,
        }
    }

    /// True until the first step of the swap has been recorded.
    pub fn is_reset(&self) -> bool {
        self.step == Step::START
    }
}

struct Rule {
    magic_primary: Option<MagicState>,
    magic_secondary: Option<MagicState>,
    image_ok_primary: Option<Flag>,
    image_ok_secondary: Option<Flag>,
    copy_done_primary: Option<Flag>,
    swap_type: SwapType,
}

// `None` matches any value.
const SWAP_TABLES: [Rule; 3] = [
    Rule {
        magic_primary: None,
        magic_secondary: Some(MagicState::Good),
        image_ok_primary: None,
        image_ok_secondary: Some(Flag::Unset),
        copy_done_primary: None,
        swap_type: SwapType::Test,
    },
    Rule {
        magic_primary: None,
        magic_secondary: Some(MagicState::Good),
        image_ok_primary: None,
        image_ok_secondary: Some(Flag::Set),
        copy_done_primary: None,
        swap_type: SwapType::Perm,
    },
    Rule {
        magic_primary: Some(MagicState::Good),
        magic_secondary: Some(MagicState::Unset),
        image_ok_primary: Some(Flag::Unset),
        image_ok_secondary: None,
        copy_done_primary: Some(Flag::Set),
        swap_type: SwapType::Revert,
    },
];

fn matches<T: PartialEq>(rule: Option<T>, value: T) -> bool {
    rule.map_or(true, |r| r == value)
}

/// Decides the swap type from the trailers of both slots.
///
/// A revert gives the secondary a confirmed trailer before its ledger is opened. Until then
/// the trailers read as a permanent upgrade, which the revert marker in the secondary swap
/// info turns back into a revert.
pub fn swap_type(primary: &SwapState, secondary: &SwapState) -> SwapType {
    let swap_type = SWAP_TABLES
        .iter()
        .find(|rule| {
            matches(rule.magic_primary, primary.magic)
                && matches(rule.magic_secondary, secondary.magic)
                && matches(rule.image_ok_primary, primary.image_ok)
                && matches(rule.image_ok_secondary, secondary.image_ok)
                && matches(rule.copy_done_primary, primary.copy_done)
        })
        .map_or(SwapType::None, |rule| rule.swap_type);
    if swap_type == SwapType::Perm && secondary.swap_type == SwapType::Revert {
        return SwapType::Revert;
    }
    swap_type
}
