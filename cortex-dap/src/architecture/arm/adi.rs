//! Register access through the Arm Debug Interface.

use std::thread;
use std::time::{Duration, Instant};

use super::ap::{ApRegister, Csw};
use super::dp::{Abort, Ctrl, DpRegister, Dpidr, Select};
use super::ArmError;
use crate::config::{ConfigError, DapConfig};
use crate::probe::{DapOperation, DapProxy, DebugProbeError, PortType};

/// DP and AP register access on top of a [`DapProxy`].
///
/// The last values written to SELECT and to the memory AP's CSW are cached, and
/// writes of an unchanged value are left out. The cache is dropped on connect,
/// disconnect and whenever a dispatched sequence fails.
///
/// The `*_ops` builders update the cache as if their operations had been
/// executed, so every list they return must be dispatched.
#[derive(Debug)]
pub struct Adi<P> {
    proxy: P,
    pub(crate) memory_ap: u8,
    pub(crate) page_size: u32,
    pub(crate) memory_wait_retries: u32,
    poll_interval: Duration,
    connect_timeout: Option<Duration>,
    selected_address: Option<u32>,
    csw_value: Option<u32>,
}

impl<P: DapProxy> Adi<P> {
    /// Wrap `proxy`. Fails if `config` does not pass [`DapConfig::validate`].
    pub fn new(proxy: P, config: &DapConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Adi {
            proxy,
            memory_ap: config.memory_ap,
            page_size: config.page_size,
            memory_wait_retries: config.memory_wait_retries,
            poll_interval: config.poll_interval(),
            connect_timeout: config.connect_timeout(),
            selected_address: None,
            csw_value: None,
        })
    }

    pub fn proxy(&self) -> &P {
        &self.proxy
    }

    pub fn proxy_mut(&mut self) -> &mut P {
        &mut self.proxy
    }

    pub fn into_proxy(self) -> P {
        self.proxy
    }

    /// Forget the cached SELECT and CSW values.
    pub fn invalidate_cache(&mut self) {
        self.selected_address = None;
        self.csw_value = None;
    }

    /// Connect the probe and power up the debug and system domains.
    #[tracing::instrument(skip(self))]
    pub fn connect(&mut self) -> Result<(), ArmError> {
        self.invalidate_cache();
        self.proxy.connect()?;

        let dpidr = Dpidr::from(self.read_dp(Dpidr::ADDRESS)?);
        tracing::debug!("DPIDR: {:?}", dpidr);

        let mut abort = Abort::default();
        abort.set_stkerrclr(true);
        let select = Select::for_ap_register(Csw::address(self.memory_ap));

        let sequence = vec![
            self.write_dp_ops(Abort::ADDRESS, abort.into()),
            self.write_dp_ops(Select::ADDRESS, select.into()),
            self.write_dp_ops(Ctrl::ADDRESS, Ctrl::power_up_request().into()),
        ];
        self.transfer_sequence(sequence)?;

        let timeout = self.connect_timeout;
        self.wait_delay(
            |adi| {
                let ctrl = Ctrl::from(adi.read_dp(Ctrl::ADDRESS)?);
                tracing::trace!("Waiting for power up: {:?}", ctrl);
                Ok(ctrl.is_powered_up())
            },
            timeout,
        )?;

        tracing::debug!("Debug and system domains powered up");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn disconnect(&mut self) -> Result<(), ArmError> {
        self.invalidate_cache();
        self.proxy.disconnect()?;
        Ok(())
    }

    pub fn reconnect(&mut self) -> Result<(), ArmError> {
        self.disconnect()?;
        self.connect()
    }

    /// Reset the target through the probe's reset line.
    pub fn reset(&mut self) -> Result<bool, ArmError> {
        self.invalidate_cache();
        Ok(self.proxy.reset()?)
    }

    pub fn read_dp_ops(&mut self, register: u8) -> Vec<DapOperation> {
        vec![DapOperation::read(PortType::DebugPort, register)]
    }

    /// Operations writing a DP register. A SELECT write of the cached value is empty.
    pub fn write_dp_ops(&mut self, register: u8, value: u32) -> Vec<DapOperation> {
        if register == Select::ADDRESS {
            if self.selected_address == Some(value) {
                return Vec::new();
            }
            self.selected_address = Some(value);
        }
        vec![DapOperation::write(PortType::DebugPort, register, value)]
    }

    pub fn read_dp(&mut self, register: u8) -> Result<u32, ArmError> {
        let operations = self.read_dp_ops(register);
        first_read(self.transfer_sequence(vec![operations])?)
    }

    pub fn write_dp(&mut self, register: u8, value: u32) -> Result<(), ArmError> {
        let operations = self.write_dp_ops(register, value);
        self.transfer_sequence(vec![operations])?;
        Ok(())
    }

    pub fn read_dp_register<R: DpRegister>(&mut self) -> Result<R, ArmError> {
        tracing::trace!("Reading DP register {}", R::NAME);
        Ok(R::from(self.read_dp(R::ADDRESS)?))
    }

    pub fn write_dp_register<R: DpRegister>(&mut self, register: R) -> Result<(), ArmError> {
        tracing::trace!("Writing DP register {}", R::NAME);
        self.write_dp(R::ADDRESS, register.into())
    }

    fn select_ops(&mut self, register: u32) -> Vec<DapOperation> {
        let select = Select::for_ap_register(register);
        self.write_dp_ops(Select::ADDRESS, select.into())
    }

    /// Operations reading the AP register `(APSEL << 24) | offset`.
    pub fn read_ap_ops(&mut self, register: u32) -> Vec<DapOperation> {
        let mut operations = self.select_ops(register);
        operations.push(DapOperation::read(
            PortType::AccessPort,
            (register & 0x0C) as u8,
        ));
        operations
    }

    /// Operations writing the AP register `(APSEL << 24) | offset`.
    /// A CSW write of the cached value is empty.
    pub fn write_ap_ops(&mut self, register: u32, value: u32) -> Vec<DapOperation> {
        if register == Csw::address(self.memory_ap) {
            if self.csw_value == Some(value) {
                return Vec::new();
            }
            self.csw_value = Some(value);
        }

        let mut operations = self.select_ops(register);
        operations.push(DapOperation::write(
            PortType::AccessPort,
            (register & 0x0C) as u8,
            value,
        ));
        operations
    }

    pub fn read_ap(&mut self, register: u32) -> Result<u32, ArmError> {
        let operations = self.read_ap_ops(register);
        first_read(self.transfer_sequence(vec![operations])?)
    }

    pub fn write_ap(&mut self, register: u32, value: u32) -> Result<(), ArmError> {
        let operations = self.write_ap_ops(register, value);
        self.transfer_sequence(vec![operations])?;
        Ok(())
    }

    /// Read a typed register of access port `ap`.
    pub fn read_ap_register<R: ApRegister>(&mut self, ap: u8) -> Result<R, ArmError> {
        tracing::trace!("Reading AP register {}", R::NAME);
        Ok(R::from(self.read_ap(R::address(ap))?))
    }

    pub fn write_ap_register<R: ApRegister>(&mut self, ap: u8, register: R) -> Result<(), ArmError> {
        tracing::trace!("Writing AP register {}", R::NAME);
        self.write_ap(R::address(ap), register.into())
    }

    /// Execute the operation lists in order, packed into as few transfers as
    /// the probe allows, and return all read values in order.
    pub fn transfer_sequence(
        &mut self,
        sequence: Vec<Vec<DapOperation>>,
    ) -> Result<Vec<u32>, ArmError> {
        let operations: Vec<DapOperation> = sequence.into_iter().flatten().collect();
        let batch_size = self.proxy.operation_count().max(1);

        let mut values = Vec::new();
        for batch in operations.chunks(batch_size) {
            values.extend(self.dispatch(|proxy| proxy.transfer(batch))?);
        }

        Ok(values)
    }

    /// Run a proxy call, dropping the register cache if it fails.
    pub(crate) fn dispatch<T>(
        &mut self,
        f: impl FnOnce(&mut P) -> Result<T, DebugProbeError>,
    ) -> Result<T, ArmError> {
        f(&mut self.proxy).map_err(|error| {
            self.invalidate_cache();
            ArmError::from(error)
        })
    }

    /// Poll `condition` until it returns `true`, sleeping the poll interval in between.
    ///
    /// Fails with [`ArmError::WaitTimedOut`] once `timeout` has passed. Without a
    /// timeout the loop only ends when the condition holds or fails.
    pub fn wait_delay<F>(&mut self, mut condition: F, timeout: Option<Duration>) -> Result<(), ArmError>
    where
        F: FnMut(&mut Self) -> Result<bool, ArmError>,
    {
        let start = Instant::now();

        loop {
            if condition(self)? {
                return Ok(());
            }

            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(ArmError::WaitTimedOut(timeout));
                }
            }

            thread::sleep(self.poll_interval);
        }
    }
}

/// The single value read by a one-read sequence.
pub(crate) fn first_read(values: Vec<u32>) -> Result<u32, ArmError> {
    values
        .first()
        .copied()
        .ok_or_else(|| ArmError::Other("The probe returned no value for a read".to_string()))
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;
    use crate::architecture::arm::ap::Idr;
    use crate::probe::cmsisdap::CmsisDap;
    use crate::probe::mock::MockProbe;

    fn config() -> DapConfig {
        DapConfig {
            poll_interval_ms: 1,
            ..Default::default()
        }
    }

    fn adi_with(mock: &MockProbe) -> Adi<CmsisDap> {
        let config = config();
        Adi::new(CmsisDap::new(mock.clone(), &config), &config).unwrap()
    }

    #[test]
    fn connect_powers_up() {
        let mock = MockProbe::new();
        let mut adi = adi_with(&mock);
        adi.connect().unwrap();

        let state = mock.state();
        pretty_assertions::assert_eq!(
            state.dp_writes,
            vec![(0x0, 0x0000_0004), (0x8, 0x0000_0000), (0x4, 0x5000_0000)]
        );
        pretty_assertions::assert_eq!(state.dpidr_reads, 1);
    }

    #[test]
    fn connect_times_out_without_power_up_ack() {
        let mock = MockProbe::new();
        mock.state().power_up_ack = false;

        let config = DapConfig {
            poll_interval_ms: 1,
            connect_timeout_ms: Some(20),
            ..Default::default()
        };
        let mut adi = Adi::new(CmsisDap::new(mock.clone(), &config), &config).unwrap();

        assert!(matches!(adi.connect(), Err(ArmError::WaitTimedOut(_))));
    }

    #[test_case(0 ; "zero")]
    #[test_case(2 ; "smaller than a word")]
    #[test_case(0x300 ; "not a power of two")]
    fn invalid_page_size_is_rejected(page_size: u32) {
        let config = DapConfig {
            page_size,
            ..config()
        };
        let result = Adi::new(CmsisDap::new(MockProbe::new(), &config), &config);

        assert!(matches!(result, Err(ConfigError::InvalidPageSize(size)) if size == page_size));
    }

    #[test]
    fn select_writes_are_elided() {
        let mock = MockProbe::new();
        let mut adi = adi_with(&mock);
        adi.connect().unwrap();
        mock.state().dp_writes.clear();

        for value in [0x0100_0000, 0x0100_0000, 0x0000_00F0, 0x0000_00F0, 0x0100_0000] {
            adi.write_dp(Select::ADDRESS, value).unwrap();
        }

        pretty_assertions::assert_eq!(
            mock.state().select_writes(),
            vec![0x0100_0000, 0x0000_00F0, 0x0100_0000]
        );
    }

    #[test]
    fn csw_writes_are_elided() {
        let mock = MockProbe::new();
        let mut adi = adi_with(&mock);
        adi.connect().unwrap();

        for value in [0x2300_0052, 0x2300_0052, 0x2300_0050, 0x2300_0050] {
            adi.write_ap(0x00, value).unwrap();
        }

        pretty_assertions::assert_eq!(mock.state().csw_writes(), vec![0x2300_0052, 0x2300_0050]);
    }

    #[test]
    fn ap_bank_is_selected() {
        let mock = MockProbe::new();
        let mut adi = adi_with(&mock);
        adi.connect().unwrap();

        let idr: Idr = adi.read_ap_register(0).unwrap();
        pretty_assertions::assert_eq!(u32::from(idr), 0x2477_0011);
        pretty_assertions::assert_eq!(mock.state().select_writes(), vec![0x0000_0000, 0x0000_00F0]);

        // Back to bank 0 for the CSW.
        adi.write_ap(0x00, 0x2300_0052).unwrap();
        pretty_assertions::assert_eq!(
            mock.state().select_writes(),
            vec![0x0000_0000, 0x0000_00F0, 0x0000_0000]
        );
    }

    #[test]
    fn reconnect_clears_the_cache() {
        let mock = MockProbe::new();
        let mut adi = adi_with(&mock);
        adi.connect().unwrap();
        adi.write_ap(0x00, 0x2300_0052).unwrap();

        adi.reconnect().unwrap();
        adi.write_ap(0x00, 0x2300_0052).unwrap();

        let state = mock.state();
        pretty_assertions::assert_eq!(state.csw_writes(), vec![0x2300_0052, 0x2300_0052]);
        pretty_assertions::assert_eq!(state.select_writes(), vec![0x0000_0000, 0x0000_0000]);
    }

    #[test]
    fn failed_sequence_clears_the_cache() {
        let mock = MockProbe::new();
        let mut adi = adi_with(&mock);
        adi.connect().unwrap();
        adi.write_ap(0x00, 0x2300_0052).unwrap();

        mock.state().transfer_status.push_back(0x04);
        assert!(adi.read_ap(0x0C).is_err());

        adi.write_ap(0x00, 0x2300_0052).unwrap();
        pretty_assertions::assert_eq!(mock.state().csw_writes(), vec![0x2300_0052, 0x2300_0052]);
    }

    #[test_case(64, 1 => 1 ; "single operation")]
    #[test_case(64, 12 => 1 ; "exactly one packet")]
    #[test_case(64, 13 => 2 ; "one more than a packet")]
    #[test_case(64, 50 => 5 ; "many packets")]
    #[test_case(128, 51 => 3 ; "larger packets")]
    fn sequences_are_packed(packet_size: usize, operations: usize) -> usize {
        let mock = MockProbe::with_packet_size(packet_size);
        let mut adi = adi_with(&mock);
        adi.connect().unwrap();
        mock.state().transfer_packets = 0;

        // Alternate two registers so the order of the results is visible.
        let sequence: Vec<Vec<DapOperation>> = (0..operations)
            .map(|i| {
                let register = if i % 2 == 0 { Dpidr::ADDRESS } else { Ctrl::ADDRESS };
                adi.read_dp_ops(register)
            })
            .collect();
        let values = adi.transfer_sequence(sequence).unwrap();

        let expected: Vec<u32> = (0..operations)
            .map(|i| if i % 2 == 0 { 0x2BA0_1477 } else { 0xF000_0000 })
            .collect();
        pretty_assertions::assert_eq!(values, expected);

        let packets = mock.state().transfer_packets;
        packets
    }

    #[test]
    fn wait_delay_polls_until_true() {
        let mock = MockProbe::new();
        let mut adi = adi_with(&mock);

        let mut polls = 0;
        adi.wait_delay(
            |_| {
                polls += 1;
                Ok(polls == 3)
            },
            None,
        )
        .unwrap();
        pretty_assertions::assert_eq!(polls, 3);
    }

    #[test]
    fn wait_delay_times_out() {
        let mock = MockProbe::new();
        let mut adi = adi_with(&mock);

        let result = adi.wait_delay(|_| Ok(false), Some(Duration::from_millis(5)));
        assert!(matches!(result, Err(ArmError::WaitTimedOut(_))));
    }
}
