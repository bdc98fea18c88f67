//! Programming flash through a flash algorithm running on the target.

mod algorithm;
mod flasher;

pub use algorithm::{FlashAlgorithm, FlashProperties};
pub use flasher::{Flasher, Operation};

use crate::architecture::arm::ArmError;

/// Describes any error that happened during the or in preparation for the flashing procedure.
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("The flash algorithm '{name}' is invalid: {reason}")]
    InvalidAlgorithm { name: String, reason: String },
    #[error("The flash algorithm could not be parsed")]
    Yaml(#[from] serde_yaml::Error),
    #[error(
        "The RAM contents did not match the expected contents after loading the flash algorithm."
    )]
    FlashAlgorithmNotLoaded,
    #[error("The execution of '{name}' failed with code {error_code}")]
    RoutineFailed { name: &'static str, error_code: u32 },
    #[error("The '{0}' routine is not supported with the given flash algorithm.")]
    RoutineNotSupported(&'static str),
    #[error("The range {start:#010x}..{end:#010x} is not contained in the flash.")]
    AddressNotInFlash { start: u32, end: u32 },
    #[error("{size} bytes do not fit into a page of {page_size} bytes.")]
    PageTooLarge { size: usize, page_size: u32 },
    #[error("Something during the interaction with the core went wrong")]
    Core(#[from] ArmError),
}
