//! # Host-side CMSIS-DAP debugging for Cortex-M targets
//!
//! The crate is built from three layers, each usable on its own:
//!
//! - [`probe`]: the [`Transport`](probe::Transport) byte pipe and the
//!   CMSIS-DAP command layer in [`CmsisDap`](probe::cmsisdap::CmsisDap).
//! - [`architecture::arm::Adi`]: DP and AP register access with SELECT and
//!   CSW caching, and memory access through the MEM-AP.
//! - [`architecture::arm::CortexM`]: halt, resume, step, core registers,
//!   breakpoints and running code on the target.
//!
//! [`flashing`] runs CMSIS flash algorithms on top of these.
//!
//! ## Halting the attached chip
//! ```no_run
//! # #[cfg(feature = "hid")]
//! # fn main() -> Result<(), cortex_dap::Error> {
//! use cortex_dap::probe::hid::{list_devices, HidTransport};
//! use cortex_dap::DapConfig;
//!
//! let probes = list_devices();
//! let transport = HidTransport::from_info(&probes[0]);
//!
//! let mut core = cortex_dap::attach(transport, &DapConfig::default())?;
//! core.halt(true, Some(std::time::Duration::from_millis(100)))?;
//!
//! let word = core.adi().read_mem32(0x2000_0000)?;
//! # let _ = word;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "hid"))]
//! # fn main() {}
//! ```

pub mod architecture;
pub mod config;
mod error;
pub mod flashing;
pub mod probe;

pub use crate::architecture::arm::{Adi, ArmError, CoreRegister, CoreState, CortexM, DapError};
pub use crate::config::{ConfigError, DapConfig};
pub use crate::error::Error;
pub use crate::probe::{
    cmsisdap::CmsisDap, DapOperation, DapProxy, DebugProbeError, Transport, TransportError,
    WireProtocol,
};

/// Connect to a Cortex-M core through a CMSIS-DAP probe on `transport`.
pub fn attach(
    transport: impl Transport + 'static,
    config: &DapConfig,
) -> Result<CortexM<CmsisDap>, Error> {
    config.validate()?;

    let probe = CmsisDap::new(transport, config);
    let adi = Adi::new(probe, config)?;
    let mut core = CortexM::new(adi, config);
    core.connect()?;

    Ok(core)
}
