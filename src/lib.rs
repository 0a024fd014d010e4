#![no_std]

pub mod boot;
pub mod compression;
pub mod fih;
pub mod hardware;
pub mod image;
pub mod manager;
pub mod request;
pub mod state;
pub mod swap;
pub mod verify;

pub use embedded_storage;

use embedded_storage::nor_flash::NorFlash;

/// The bootloader side ...
pub use boot as left_boot;
/// ... and the application side of an upgrade.
pub use manager as right_boot;

// Address type in flash, area relative unless stated otherwise
pub type Address = u32;

/// Bundles the collaborator types a bootloader build is specialised for. Exactly one
/// implementation of each is compiled into a given target.
pub trait Context {
    type Flash: NorFlash;
    type Scheme: verify::SignatureScheme;
    type Keys: verify::KeyStore;
    type Decompressor: compression::Decompressor;
    type Processor: hardware::processor::Processor;
}

#[cfg(feature = "use-defmt")]
pub(crate) use defmt as log;

#[cfg(all(feature = "use-log", not(feature = "use-defmt")))]
pub(crate) use logger_crate as log;

#[cfg(not(any(feature = "use-log", feature = "use-defmt")))]
pub(crate) mod log {
    macro_rules! info {
        ( $( $x:expr ),* $(,)? ) => { $( let _ = &$x; )* };
    }
    pub(crate) use info;
    macro_rules! trace {
        ( $( $x:expr ),* $(,)? ) => { $( let _ = &$x; )* };
    }
    pub(crate) use trace;
    macro_rules! debug {
        ( $( $x:expr ),* $(,)? ) => { $( let _ = &$x; )* };
    }
    pub(crate) use debug;
    macro_rules! error {
        ( $( $x:expr ),* $(,)? ) => { $( let _ = &$x; )* };
    }
    pub(crate) use error;
    macro_rules! warner {
        ( $( $x:expr ),* $(,)? ) => { $( let _ = &$x; )* };
    }
    pub(crate) use warner as warn;
}
