//! CMSIS-DAP implementation of [`DapProxy`].

pub mod commands;

use std::fmt;

use commands::{
    general::{
        connect::ConnectRequest,
        delay::DelayRequest,
        disconnect::DisconnectRequest,
        host_status::HostStatusRequest,
        info::{Capabilities, CapabilitiesCommand, FirmwareVersionCommand, PacketSizeCommand},
        reset::{Execute, ResetRequest},
        write_abort::WriteAbortRequest,
    },
    send_command,
    swd::configure::ConfigureRequest as SwdConfigureRequest,
    swj::{clock::SWJClockRequest, sequence::SequenceRequest},
    transfer::{
        check_transfer_status, configure::ConfigureRequest as TransferConfigureRequest,
        TransferBlockRequest, TransferRequest,
    },
    CmsisDapError, Request, SendError, Status,
};

use crate::architecture::arm::{dp::Abort, DapError};
use crate::config::DapConfig;
use crate::probe::{DapOperation, DapProxy, DebugProbeError, PortType, Transport, WireProtocol};

/// Switch pattern that moves the SWJ-DP from JTAG to SWD.
const JTAG_TO_SWD: u16 = 0xE79E;
/// Switch pattern that moves the SWJ-DP from SWD to JTAG.
const SWD_TO_JTAG: u16 = 0xE73C;

/// A CMSIS-DAP probe behind some [`Transport`].
///
/// Every exchange takes `&mut self`, so one probe only ever has one command in
/// flight. To share a probe between threads, put it behind a mutex.
pub struct CmsisDap {
    transport: Box<dyn Transport>,
    protocol: WireProtocol,
    clock_frequency: u32,
    transfer_config: TransferConfigureRequest,
    connected: bool,
}

impl fmt::Debug for CmsisDap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CmsisDap")
            .field("transport", &self.transport)
            .field("protocol", &self.protocol)
            .field("clock_frequency", &self.clock_frequency)
            .field("connected", &self.connected)
            .finish()
    }
}

impl CmsisDap {
    pub fn new(transport: impl Transport + 'static, config: &DapConfig) -> Self {
        CmsisDap {
            transport: Box::new(transport),
            protocol: config.protocol,
            clock_frequency: config.clock_frequency,
            transfer_config: TransferConfigureRequest {
                idle_cycles: config.idle_cycles,
                wait_retry: config.wait_retry,
                match_retry: config.match_retry,
            },
            connected: false,
        }
    }

    pub fn packet_size(&self) -> usize {
        self.transport.packet_size()
    }

    fn send<Req: Request>(&mut self, request: &Req) -> Result<Req::Response, CmsisDapError> {
        match send_command(&mut *self.transport, request) {
            // Anything but DAP_OK is a failed command, not a broken packet.
            Err(CmsisDapError::Send {
                command_id,
                source: SendError::InvalidResponseStatus,
            }) => Err(CmsisDapError::ErrorResponse(command_id)),
            result => result,
        }
    }

    /// Send a command whose response is a single status byte.
    fn send_checked<Req: Request<Response = Status>>(
        &mut self,
        request: &Req,
    ) -> Result<(), CmsisDapError> {
        match self.send(request)? {
            Status::DapOk => Ok(()),
            Status::DapError => Err(CmsisDapError::ErrorResponse(Req::COMMAND_ID)),
        }
    }

    /// Run `f` and clear the sticky error flags of the DP if it fails.
    ///
    /// A failure of the clear itself is only logged, the original error is returned.
    fn abort_on_error<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, DebugProbeError>,
    ) -> Result<T, DebugProbeError> {
        let result = f(self);

        if let Err(error) = &result {
            tracing::debug!("Clearing sticky errors after: {}", error);
            if let Err(abort_error) = self.send_checked(&WriteAbortRequest {
                dap_index: 0,
                abort: Abort::clear_all().into(),
            }) {
                tracing::warn!("Failed to clear sticky errors: {}", abort_error);
            }
        }

        result
    }

    /// Write the DP ABORT register directly.
    pub fn write_abort(&mut self, abort: Abort) -> Result<(), DebugProbeError> {
        self.abort_on_error(|dap| {
            dap.send_checked(&WriteAbortRequest {
                dap_index: 0,
                abort: abort.into(),
            })?;
            Ok(())
        })
    }

    /// Set the SWD/JTAG clock frequency in Hz.
    pub fn set_swj_clock(&mut self, clock_speed_hz: u32) -> Result<(), DebugProbeError> {
        self.abort_on_error(|dap| {
            dap.send_checked(&SWJClockRequest(clock_speed_hz))?;
            Ok(())
        })
    }

    /// Clock out the given bytes on SWDIO/TMS, least significant bit first.
    pub fn swj_sequence(&mut self, data: &[u8]) -> Result<(), DebugProbeError> {
        self.abort_on_error(|dap| {
            let request = SequenceRequest::new(data)?;
            dap.send_checked(&request)?;
            Ok(())
        })
    }

    /// Let the probe wait for `delay_us` microseconds.
    pub fn delay(&mut self, delay_us: u16) -> Result<(), DebugProbeError> {
        self.abort_on_error(|dap| {
            dap.send_checked(&DelayRequest { delay_us })?;
            Ok(())
        })
    }

    /// Drive the connected and running LEDs of the probe.
    pub fn host_status(&mut self, connected: bool, running: bool) -> Result<(), DebugProbeError> {
        self.abort_on_error(|dap| {
            dap.send_checked(&HostStatusRequest::connected(connected))?;
            dap.send_checked(&HostStatusRequest::running(running))?;
            Ok(())
        })
    }

    /// Packet size as reported by the probe firmware.
    pub fn reported_packet_size(&mut self) -> Result<u16, DebugProbeError> {
        self.abort_on_error(|dap| Ok(dap.send(&PacketSizeCommand {})?))
    }

    pub fn capabilities(&mut self) -> Result<Capabilities, DebugProbeError> {
        self.abort_on_error(|dap| Ok(dap.send(&CapabilitiesCommand {})?))
    }

    pub fn firmware_version(&mut self) -> Result<Option<String>, DebugProbeError> {
        self.abort_on_error(|dap| Ok(dap.send(&FirmwareVersionCommand {})?))
    }

    /// Line reset followed by the switch pattern for `protocol`.
    fn switch_sequence(&mut self, protocol: WireProtocol) -> Result<(), DebugProbeError> {
        let pattern = match protocol {
            WireProtocol::Jtag => SWD_TO_JTAG,
            _ => JTAG_TO_SWD,
        };

        tracing::debug!("Switching to {} with pattern {:#06x}", protocol, pattern);

        for sequence in [
            &[0xFF; 7][..],
            &pattern.to_le_bytes()[..],
            &[0xFF; 7][..],
            &[0x00][..],
        ] {
            self.send_checked(&SequenceRequest::new(sequence)?)?;
        }

        Ok(())
    }

    fn connect_inner(&mut self) -> Result<(), DebugProbeError> {
        self.send_checked(&SWJClockRequest(self.clock_frequency))?;

        let response = self.send(&ConnectRequest(self.protocol))?;
        let active = match (self.protocol, response.protocol()) {
            (WireProtocol::Default, Some(active)) => active,
            (requested, Some(active)) if requested == active => active,
            (requested, _) => {
                return Err(DebugProbeError::ModeNotEnabled {
                    requested,
                    reported: response as u8,
                })
            }
        };
        tracing::debug!("Probe connected using {}", active);

        let transfer_config = self.transfer_config;
        self.send_checked(&transfer_config)?;
        self.send_checked(&SwdConfigureRequest::default())?;
        self.switch_sequence(active)?;

        Ok(())
    }

    fn transfer_inner(&mut self, operations: &[DapOperation]) -> Result<Vec<u32>, DebugProbeError> {
        let max = self.operation_count();
        if operations.len() > max {
            return Err(DebugProbeError::BatchTooLarge {
                count: operations.len(),
                max,
            });
        }

        tracing::debug!("Transferring {} operations", operations.len());
        for operation in operations {
            tracing::trace!("{}", operation);
        }

        let response = self.send(&TransferRequest::new(operations))?;

        // A short count hides which operation failed, so it is reported first.
        if usize::from(response.transfer_count) != operations.len() {
            return Err(DapError::TransferCountMismatch {
                requested: operations.len(),
                executed: usize::from(response.transfer_count),
                status: response.transfer_status,
            }
            .into());
        }
        check_transfer_status(response.transfer_status)?;

        Ok(response.data)
    }

    fn check_block_response(
        &self,
        requested: usize,
        executed: u16,
        status: u8,
    ) -> Result<(), DebugProbeError> {
        if usize::from(executed) != requested {
            return Err(DapError::TransferCountMismatch {
                requested,
                executed: usize::from(executed),
                status,
            }
            .into());
        }
        check_transfer_status(status)?;
        Ok(())
    }

    fn check_block_count(&self, count: usize) -> Result<(), DebugProbeError> {
        let max = self.block_size();
        if count > max {
            return Err(DebugProbeError::BatchTooLarge { count, max });
        }
        Ok(())
    }
}

impl DapProxy for CmsisDap {
    fn operation_count(&self) -> usize {
        // Three header bytes, then at most five bytes per operation.
        (self.packet_size().saturating_sub(3) / 5).min(usize::from(u8::MAX))
    }

    fn block_size(&self) -> usize {
        // Five header bytes, then four bytes per word.
        (self.packet_size().saturating_sub(5) / 4).min(usize::from(u16::MAX))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    #[tracing::instrument(skip(self))]
    fn connect(&mut self) -> Result<(), DebugProbeError> {
        if self.connected {
            return Ok(());
        }

        let result = self.abort_on_error(|dap| {
            dap.transport.open()?;
            dap.connect_inner()
        });
        match result {
            Ok(()) => {
                self.connected = true;
                Ok(())
            }
            Err(error) => {
                if let Err(close_error) = self.transport.close() {
                    tracing::warn!("Failed to close transport: {}", close_error);
                }
                Err(error)
            }
        }
    }

    #[tracing::instrument(skip(self))]
    fn disconnect(&mut self) -> Result<(), DebugProbeError> {
        if !self.connected {
            return Ok(());
        }

        self.abort_on_error(|dap| {
            dap.send_checked(&DisconnectRequest {})?;
            Ok(())
        })?;

        self.transport.close()?;
        self.connected = false;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn reset(&mut self) -> Result<bool, DebugProbeError> {
        self.abort_on_error(|dap| {
            let response = dap.send(&ResetRequest)?;
            if response.status != Status::DapOk {
                return Err(CmsisDapError::ErrorResponse(ResetRequest::COMMAND_ID).into());
            }
            Ok(response.execute == Execute::DeviceSpecificResetSequenceImplemented)
        })
    }

    fn transfer(&mut self, operations: &[DapOperation]) -> Result<Vec<u32>, DebugProbeError> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }
        self.abort_on_error(|dap| dap.transfer_inner(operations))
    }

    #[tracing::instrument(skip(self))]
    fn transfer_block_read(
        &mut self,
        port: PortType,
        register: u8,
        count: usize,
    ) -> Result<Vec<u32>, DebugProbeError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.abort_on_error(|dap| {
            dap.check_block_count(count)?;
            // Bounded by the block size, which never exceeds u16::MAX.
            let request = TransferBlockRequest::read_request(port, register, count as u16);
            let response = dap.send(&request)?;
            dap.check_block_response(count, response.transfer_count, response.transfer_status)?;
            Ok(response.data)
        })
    }

    #[tracing::instrument(skip(self, values), fields(count = values.len()))]
    fn transfer_block_write(
        &mut self,
        port: PortType,
        register: u8,
        values: &[u32],
    ) -> Result<(), DebugProbeError> {
        if values.is_empty() {
            return Ok(());
        }
        self.abort_on_error(|dap| {
            dap.check_block_count(values.len())?;
            let request = TransferBlockRequest::write_request(port, register, values)
                .map_err(|source| CmsisDapError::Send {
                    command_id: commands::CommandId::TransferBlock,
                    source,
                })?;
            let response = dap.send(&request)?;
            dap.check_block_response(
                values.len(),
                response.transfer_count,
                response.transfer_status,
            )
        })
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::commands::CommandId;
    use super::*;
    use crate::probe::mock::MockProbe;
    use crate::probe::TransportError;

    fn connected(mock: &MockProbe) -> CmsisDap {
        let mut dap = CmsisDap::new(mock.clone(), &DapConfig::default());
        dap.connect().unwrap();
        mock.state().commands.clear();
        dap
    }

    #[test_case(64 => (12, 14) ; "full speed hid")]
    #[test_case(512 => (101, 126) ; "high speed bulk")]
    #[test_case(1024 => (204, 254) ; "large packets")]
    fn packet_limits(packet_size: usize) -> (usize, usize) {
        let dap = CmsisDap::new(MockProbe::with_packet_size(packet_size), &DapConfig::default());
        (dap.operation_count(), dap.block_size())
    }

    #[test]
    fn connect_sequence() {
        let mock = MockProbe::new();
        let mut dap = CmsisDap::new(mock.clone(), &DapConfig::default());
        dap.connect().unwrap();

        let state = mock.state();
        pretty_assertions::assert_eq!(
            state.commands,
            vec![
                CommandId::SwjClock as u8,
                CommandId::Connect as u8,
                CommandId::TransferConfigure as u8,
                CommandId::SwdConfigure as u8,
                CommandId::SwjSequence as u8,
                CommandId::SwjSequence as u8,
                CommandId::SwjSequence as u8,
                CommandId::SwjSequence as u8,
            ]
        );
        pretty_assertions::assert_eq!(state.swj_clock, Some(10_000_000));
        assert!(state.open);
    }

    #[test]
    fn connect_is_idempotent() {
        let mock = MockProbe::new();
        let mut dap = connected(&mock);

        dap.connect().unwrap();
        assert!(mock.state().commands.is_empty());
    }

    #[test]
    fn jtag_uses_its_own_switch_pattern() {
        let mock = MockProbe::new();
        let config = DapConfig {
            protocol: WireProtocol::Jtag,
            ..Default::default()
        };
        let mut dap = CmsisDap::new(mock.clone(), &config);
        dap.connect().unwrap();

        pretty_assertions::assert_eq!(mock.state().swj_sequences[1], vec![0x3C, 0xE7]);
    }

    #[test]
    fn mode_not_enabled() {
        let mock = MockProbe::new();
        mock.state().connect_reply = Some(0x02);

        let mut dap = CmsisDap::new(mock.clone(), &DapConfig::default());
        let error = dap.connect().unwrap_err();

        assert!(matches!(
            error,
            DebugProbeError::ModeNotEnabled {
                requested: WireProtocol::Swd,
                reported: 0x02
            }
        ));
        assert!(!dap.is_connected());
        assert!(!mock.state().open);
    }

    #[test]
    fn default_mode_accepts_any_active_mode() {
        let mock = MockProbe::new();
        mock.state().connect_reply = Some(0x02);
        let config = DapConfig {
            protocol: WireProtocol::Default,
            ..Default::default()
        };

        let mut dap = CmsisDap::new(mock.clone(), &config);
        dap.connect().unwrap();
        assert!(dap.is_connected());
    }

    #[test]
    fn default_mode_rejects_failed_init() {
        let mock = MockProbe::new();
        mock.state().connect_reply = Some(0x00);
        let config = DapConfig {
            protocol: WireProtocol::Default,
            ..Default::default()
        };

        let mut dap = CmsisDap::new(mock, &config);
        assert!(matches!(
            dap.connect(),
            Err(DebugProbeError::ModeNotEnabled { reported: 0, .. })
        ));
    }

    #[test]
    fn disconnect_when_not_connected_is_noop() {
        let mock = MockProbe::new();
        let mut dap = CmsisDap::new(mock.clone(), &DapConfig::default());

        dap.disconnect().unwrap();
        assert!(mock.state().commands.is_empty());
    }

    #[test]
    fn disconnect_closes_transport() {
        let mock = MockProbe::new();
        let mut dap = connected(&mock);

        dap.disconnect().unwrap();
        assert!(!dap.is_connected());
        assert!(!mock.state().open);
        pretty_assertions::assert_eq!(mock.state().commands, vec![CommandId::Disconnect as u8]);
    }

    #[test]
    fn bad_status_is_reported_and_aborts() {
        let mock = MockProbe::new();
        let mut dap = connected(&mock);
        mock.state().fail_status_for = Some(CommandId::Disconnect as u8);

        let error = dap.disconnect().unwrap_err();
        assert!(matches!(
            error,
            DebugProbeError::CmsisDap(CmsisDapError::ErrorResponse(CommandId::Disconnect))
        ));
        pretty_assertions::assert_eq!(error.to_string(), "CMSIS-DAP command failed");
        pretty_assertions::assert_eq!(
            mock.state().commands,
            vec![CommandId::Disconnect as u8, CommandId::WriteAbort as u8]
        );
        pretty_assertions::assert_eq!(mock.state().abort_writes, vec![0x1E]);
    }

    #[test]
    fn unknown_status_byte_is_a_bad_status() {
        let mock = MockProbe::new();
        let mut dap = connected(&mock);
        {
            let mut state = mock.state();
            state.fail_status_for = Some(CommandId::Delay as u8);
            state.error_status = 0x01;
        }

        let error = dap.delay(10).unwrap_err();
        assert!(matches!(
            error,
            DebugProbeError::CmsisDap(CmsisDapError::ErrorResponse(CommandId::Delay))
        ));
        pretty_assertions::assert_eq!(mock.state().abort_writes, vec![0x1E]);
    }

    #[test]
    fn failed_info_query_aborts() {
        let mock = MockProbe::new();
        let mut dap = connected(&mock);
        mock.state().corrupt_next_response = true;

        assert!(dap.firmware_version().is_err());
        pretty_assertions::assert_eq!(
            mock.state().commands,
            vec![CommandId::Info as u8, CommandId::WriteAbort as u8]
        );
        pretty_assertions::assert_eq!(mock.state().abort_writes, vec![0x1E]);
    }

    #[test]
    fn failed_open_aborts() {
        let mock = MockProbe::new();
        mock.state().fail_open = true;
        let mut dap = CmsisDap::new(mock.clone(), &DapConfig::default());

        let error = dap.connect().unwrap_err();
        assert!(matches!(error, DebugProbeError::Transport(TransportError::Io(_))));
        assert!(!dap.is_connected());
        pretty_assertions::assert_eq!(mock.state().commands, Vec::<u8>::new());
    }

    #[test]
    fn bad_response_opcode() {
        let mock = MockProbe::new();
        let mut dap = connected(&mock);
        mock.state().corrupt_next_response = true;

        let error = dap.reset().unwrap_err();
        assert!(matches!(
            error,
            DebugProbeError::CmsisDap(CmsisDapError::Send {
                command_id: CommandId::ResetTarget,
                source: SendError::CommandIdMismatch(_),
            })
        ));
    }

    #[test]
    fn reset_reports_execution() {
        let mock = MockProbe::new();
        let mut dap = connected(&mock);

        assert!(!dap.reset().unwrap());
        mock.state().reset_implemented = true;
        assert!(dap.reset().unwrap());
    }

    #[test]
    fn transfer_returns_reads_in_order() {
        let mock = MockProbe::new();
        let mut dap = connected(&mock);

        let values = dap
            .transfer(&[
                DapOperation::read(PortType::DebugPort, 0x0),
                DapOperation::write(PortType::DebugPort, 0x4, 0x5000_0000),
                DapOperation::read(PortType::DebugPort, 0x4),
            ])
            .unwrap();

        pretty_assertions::assert_eq!(values, vec![0x2BA0_1477, 0xF000_0000]);
    }

    #[test]
    fn oversized_transfer_is_rejected() {
        let mock = MockProbe::new();
        let mut dap = connected(&mock);

        let operations = vec![DapOperation::read(PortType::DebugPort, 0x0); 13];
        assert!(matches!(
            dap.transfer(&operations),
            Err(DebugProbeError::BatchTooLarge { count: 13, max: 12 })
        ));
    }

    #[test]
    fn transfer_fault_clears_sticky_errors() {
        let mock = MockProbe::new();
        let mut dap = connected(&mock);
        mock.state().transfer_status.push_back(0x04);

        let error = dap
            .transfer(&[DapOperation::read(PortType::DebugPort, 0x4)])
            .unwrap_err();

        assert!(matches!(
            error,
            DebugProbeError::Dap(DapError::FaultResponse)
        ));
        pretty_assertions::assert_eq!(mock.state().abort_writes, vec![0x1E]);

        // The link is usable again afterwards.
        dap.transfer(&[DapOperation::read(PortType::DebugPort, 0x0)])
            .unwrap();
    }

    #[test]
    fn count_mismatch_is_checked_before_status() {
        let mock = MockProbe::new();
        let mut dap = connected(&mock);
        mock.state().transfer_count_override = Some(1);

        let error = dap
            .transfer(&[
                DapOperation::read(PortType::DebugPort, 0x0),
                DapOperation::read(PortType::DebugPort, 0x4),
            ])
            .unwrap_err();

        assert!(matches!(
            error,
            DebugProbeError::Dap(DapError::TransferCountMismatch {
                requested: 2,
                executed: 1,
                ..
            })
        ));
    }

    #[test]
    fn abort_failure_keeps_original_error() {
        let mock = MockProbe::new();
        let mut dap = connected(&mock);
        {
            let mut state = mock.state();
            state.transfer_status.push_back(0x02);
            state.fail_status_for = Some(CommandId::WriteAbort as u8);
        }

        let error = dap
            .transfer(&[DapOperation::read(PortType::DebugPort, 0x4)])
            .unwrap_err();
        assert!(matches!(error, DebugProbeError::Dap(DapError::WaitResponse)));
    }

    #[test]
    fn info_queries() {
        let mock = MockProbe::new();
        let mut dap = connected(&mock);

        pretty_assertions::assert_eq!(dap.reported_packet_size().unwrap(), 64);
        assert!(dap.capabilities().unwrap().swd_implemented);
        pretty_assertions::assert_eq!(dap.firmware_version().unwrap().as_deref(), Some("2.1.0"));
    }
}
