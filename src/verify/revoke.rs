//! Revocation of signing keys that lost a race against a newer key.
//!
//! Once an image signed with key `n` has verified and been accepted, the keys tried before `n`
//! can be invalidated so images signed with them no longer boot. The bootloader arms the step
//! with [`KeyRevocation::allow_revoke`] when it is safe and triggers it with
//! [`KeyRevocation::revoke`].

use super::KeyId;
use crate::log;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeStatus {
    Ok,
    /// Revocation has not been armed
    NotReady,
    /// No key has verified an image yet
    Invalid,
    /// The key storage refused the revocation
    Failed,
}

/// Hardware key storage able to revoke key slots.
pub trait RevocationOracle {
    /// Revokes every key with a lower id than `validated`.
    fn revoke_before(&mut self, validated: KeyId) -> RevokeStatus;
}

#[derive(Debug, Default)]
pub struct KeyRevocation {
    armed: bool,
}

impl KeyRevocation {
    pub const fn new() -> Self {
        Self { armed: false }
    }

    pub fn allow_revoke(&mut self) {
        self.armed = true;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn revoke<O: RevocationOracle>(
        &mut self,
        oracle: &mut O,
        validated: Option<KeyId>,
    ) -> RevokeStatus {
        if !self.armed {
            return RevokeStatus::NotReady;
        }
        let Some(key) = validated else {
            return RevokeStatus::Invalid;
        };
        let status = oracle.revoke_before(key);
        log::info!("Revoking keys before {}: {:?}", key, status);
        if status == RevokeStatus::Ok {
            self.armed = false;
        }
        status
    }
}
