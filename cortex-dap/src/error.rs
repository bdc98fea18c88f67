use crate::architecture::arm::ArmError;
use crate::config::ConfigError;
use crate::flashing::FlashError;
use crate::probe::DebugProbeError;

/// Any error this crate can raise.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("An error with the usage of the probe occured")]
    Probe(#[from] DebugProbeError),
    #[error("An error occured while accessing the target")]
    Arm(#[from] ArmError),
    #[error("Flashing the target failed")]
    Flash(#[from] FlashError),
    #[error("The configuration is invalid")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
