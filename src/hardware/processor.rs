use crate::boot::BootResponse;

// This trait hands control to the image described by a boot response.
// The implementation is ISA-dependent and resolves absolute addresses.
pub trait Processor {
    fn do_jump(&mut self, response: &BootResponse) -> !;
    fn setup(&mut self, config: &crate::hardware::Config);
}

#[cfg(feature = "cortex-m")]
mod cortex_m {
    use super::Processor;
    use crate::{boot::BootResponse, Address};

    pub struct CortexM {
        /// Address the flash device holding the primary slot is mapped at
        flash_base: Address,
    }

    impl CortexM {
        pub fn new(flash_base: Address) -> Self {
            Self { flash_base }
        }
    }

    impl Processor for CortexM {
        fn do_jump(&mut self, response: &BootResponse) -> ! {
            let address = self.flash_base
                + response.area.offset
                + u32::from(response.header.hdr_size);
            unsafe {
                // Set Vector Table to new vector table (unsafe but okay here)
                (*cortex_m::peripheral::SCB::PTR).vtor.write(address);

                cortex_m::asm::bootload(address as *const u32);
            }
        }

        fn setup(&mut self, _config: &crate::hardware::Config) {
            // Nothing to do!
        }
    }
}

#[cfg(feature = "cortex-m")]
// A Processor implementation for use with cortex-m processors
pub use cortex_m::CortexM;
