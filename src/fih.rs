//! Fault injection hardened verdicts.
//!
//! A verdict is carried as a value and a masked copy of it. The success and failure encodings
//! are far apart bitwise, so no single flipped bit turns one into the other, and a corrupted pair
//! never compares equal to anything. Callers compare against [`FihRet::SUCCESS`] and never test a
//! verdict for truthiness.

use core::fmt;
use core::hint::black_box;
use core::ptr;

const FIH_MASK: u32 = 0xA5C3_5A3C;
const FIH_POSITIVE: u32 = 0x1AAA_AAAA;
const FIH_NEGATIVE: u32 = 0x1555_5555;

#[derive(Clone, Copy)]
pub struct FihRet {
    val: u32,
    msk: u32,
}

impl FihRet {
    pub const SUCCESS: FihRet = FihRet::encode(FIH_POSITIVE);
    pub const FAILURE: FihRet = FihRet::encode(FIH_NEGATIVE);

    const fn encode(val: u32) -> Self {
        Self {
            val,
            msk: val ^ FIH_MASK,
        }
    }

    fn intact(&self) -> bool {
        let val = unsafe { ptr::read_volatile(&self.val) };
        let msk = unsafe { ptr::read_volatile(&self.msk) };
        black_box(val ^ msk) == FIH_MASK
    }

    /// Succeeds only when both verdicts are [`FihRet::SUCCESS`].
    pub fn and(self, other: FihRet) -> FihRet {
        if self != FihRet::SUCCESS {
            return FihRet::FAILURE;
        }
        if other != FihRet::SUCCESS {
            return FihRet::FAILURE;
        }
        FihRet::SUCCESS
    }
}

impl PartialEq for FihRet {
    fn eq(&self, other: &Self) -> bool {
        if !self.intact() || !other.intact() {
            return false;
        }
        if black_box(self.val) != black_box(other.val) {
            return false;
        }
        let a = unsafe { ptr::read_volatile(&self.msk) };
        let b = unsafe { ptr::read_volatile(&other.msk) };
        a == b
    }
}

impl fmt::Debug for FihRet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == FihRet::SUCCESS {
            f.write_str("Success")
        } else if *self == FihRet::FAILURE {
            f.write_str("Failure")
        } else {
            f.write_str("Corrupt")
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for FihRet {
    fn format(&self, f: defmt::Formatter) {
        if *self == FihRet::SUCCESS {
            defmt::write!(f, "Success")
        } else if *self == FihRet::FAILURE {
            defmt::write!(f, "Failure")
        } else {
            defmt::write!(f, "Corrupt")
        }
    }
}

/// Compares two byte strings in time independent of their contents.
pub fn fih_memequal(a: &[u8], b: &[u8]) -> FihRet {
    if a.len() != b.len() {
        return FihRet::FAILURE;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= black_box(x ^ y);
    }
    if black_box(diff) != 0 {
        return FihRet::FAILURE;
    }
    if unsafe { ptr::read_volatile(&diff) } == 0 {
        FihRet::SUCCESS
    } else {
        FihRet::FAILURE
    }
}

/// Control flow counter: every gate on the success path adds its own prime, and the sum is
/// re-read through a volatile load before a success verdict is released.
pub(crate) struct FlowCounter(u32);

impl FlowCounter {
    pub(crate) const fn new() -> Self {
        Self(0)
    }

    pub(crate) fn pass(&mut self, gate: u32) {
        self.0 = black_box(self.0.wrapping_add(gate));
    }

    pub(crate) fn reached(&self, expected: u32) -> bool {
        let sum = unsafe { ptr::read_volatile(&self.0) };
        sum == expected
    }
}
