//! Arm Debug Interface access and Cortex-M processor control.

pub mod adi;
pub mod ap;
pub mod core;
pub mod dp;
mod memory;

use std::time::Duration;

use crate::probe::DebugProbeError;

pub use self::adi::Adi;
pub use self::core::{CoreRegister, CoreState, CortexM};

/// Faults reported by the probe for a DAP transfer.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum DapError {
    #[error("Target device responded with a WAIT response to the request.")]
    WaitResponse,
    #[error("Target device responded with a FAULT response to the request.")]
    FaultResponse,
    #[error("Protocol error on the debug wire.")]
    Protocol,
    #[error("Value of a match read did not match the expected value.")]
    ValueMismatch,
    #[error("Target device did not respond to request.")]
    NoAcknowledge,
    #[error("Transfer count mismatch: requested {requested}, executed {executed} (status {status:#04x})")]
    TransferCountMismatch {
        requested: usize,
        executed: usize,
        status: u8,
    },
}

/// Errors of the ADI and Cortex-M layers.
#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    #[error("An error occured in the communication with the probe")]
    Probe(#[from] DebugProbeError),
    #[error("Timed out after {0:?}")]
    WaitTimedOut(Duration),
    #[error("Code execution did not reach a breakpoint within {0:?}")]
    ExecuteTimeout(Duration),
    #[error("Core register {0:?} was not ready")]
    RegisterNotReady(CoreRegister),
    #[error("The core needs to be halted for this operation")]
    CoreNotHalted,
    #[error("Address {address:#010x} is not aligned to {alignment} bytes")]
    MemoryNotAligned { address: u32, alignment: usize },
    #[error("At most {max} general purpose registers can be passed, got {count}")]
    TooManyRegisters { count: usize, max: usize },
    #[error("No breakpoint is set at {0:#010x}")]
    BreakpointNotFound(u32),
    #[error("{0}")]
    Other(String),
}

impl ArmError {
    /// Whether this error is a WAIT answer of the target.
    pub fn is_wait(&self) -> bool {
        matches!(
            self,
            ArmError::Probe(DebugProbeError::Dap(DapError::WaitResponse))
        )
    }
}

impl From<DapError> for ArmError {
    fn from(error: DapError) -> Self {
        ArmError::Probe(DebugProbeError::Dap(error))
    }
}
