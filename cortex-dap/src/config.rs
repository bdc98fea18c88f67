//! Session configuration, loadable from YAML.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::probe::WireProtocol;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("The configuration could not be parsed")]
    Yaml(#[from] serde_yaml::Error),
    #[error("The page size {0:#x} is not a power of two of at least 4 bytes")]
    InvalidPageSize(u32),
    #[error("The clock frequency must not be zero")]
    InvalidClockFrequency,
}

/// Settings for a debug session over a CMSIS-DAP probe.
///
/// ```yaml
/// protocol: swd
/// clock_frequency: 4000000
/// wait_retry: 200
/// connect_timeout_ms: 500
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DapConfig {
    /// Requested debug port mode.
    pub protocol: WireProtocol,
    /// SWD/JTAG clock in Hz.
    pub clock_frequency: u32,
    /// Extra idle cycles after each transfer.
    pub idle_cycles: u8,
    /// How often the probe itself retries a transfer answered with WAIT.
    pub wait_retry: u16,
    /// How often the probe re-reads a register on a value mismatch.
    pub match_retry: u16,
    /// Delay between two polls of a wait loop.
    pub poll_interval_ms: u64,
    /// Upper bound for the power-up handshake. `None` waits forever.
    pub connect_timeout_ms: Option<u64>,
    /// Retries of single memory accesses answered with WAIT.
    pub memory_wait_retries: u32,
    /// Upper bound for halts, resumes and code execution on the core.
    pub execute_timeout_ms: u64,
    /// TAR auto-increment page size of the memory AP, in bytes.
    pub page_size: u32,
    /// Index of the memory AP used for memory accesses.
    pub memory_ap: u8,
}

impl Default for DapConfig {
    fn default() -> Self {
        DapConfig {
            protocol: WireProtocol::Swd,
            clock_frequency: 10_000_000,
            idle_cycles: 0,
            wait_retry: 100,
            match_retry: 0,
            poll_interval_ms: 100,
            connect_timeout_ms: Some(1_000),
            memory_wait_retries: 3,
            execute_timeout_ms: 10_000,
            page_size: 0x400,
            memory_ap: 0,
        }
    }
}

impl DapConfig {
    /// Parse and validate a configuration from YAML. Missing fields take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: DapConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size < 4 || !self.page_size.is_power_of_two() {
            return Err(ConfigError::InvalidPageSize(self.page_size));
        }
        if self.clock_frequency == 0 {
            return Err(ConfigError::InvalidClockFrequency);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }
}
