pub mod general;
pub mod swd;
pub mod swj;
pub mod transfer;

use std::{fmt, str::Utf8Error};

use crate::probe::{Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum CmsisDapError {
    #[error("Error handling CMSIS-DAP command {command_id}")]
    Send {
        command_id: CommandId,
        source: SendError,
    },
    #[error("Bad status for {0}")]
    ErrorResponse(CommandId),
    #[error("Too much data provided for SWJ Sequence command")]
    TooMuchData,
    #[error("No data provided for SWJ Sequence command")]
    EmptySequence,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Error in the transport")]
    Transport(#[from] TransportError),
    #[error("Not enough data in response from probe")]
    NotEnoughData,
    #[error("Status can only be 0x00 or 0xFF")]
    InvalidResponseStatus,
    #[error("Connecting to target failed, received: {0:x}")]
    ConnectResponseError(u8),
    #[error("Command ID in response ({0:#04x}) does not match sent command ID")]
    CommandIdMismatch(u8),
    #[error("String in response is not valid UTF-8.")]
    InvalidString(#[from] Utf8Error),
    #[error("Unexpected answer to command")]
    UnexpectedAnswer,
    #[error("Request does not fit into a packet of {0} bytes")]
    PacketTooSmall(usize),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandId {
    Info = 0x00,
    HostStatus = 0x01,
    Connect = 0x02,
    Disconnect = 0x03,
    TransferConfigure = 0x04,
    Transfer = 0x05,
    TransferBlock = 0x06,
    WriteAbort = 0x08,
    Delay = 0x09,
    ResetTarget = 0x0A,
    SwjClock = 0x11,
    SwjSequence = 0x12,
    SwdConfigure = 0x13,
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CommandId::Info => "DAP_Info",
            CommandId::HostStatus => "DAP_HostStatus",
            CommandId::Connect => "DAP_Connect",
            CommandId::Disconnect => "DAP_Disconnect",
            CommandId::TransferConfigure => "DAP_TransferConfigure",
            CommandId::Transfer => "DAP_Transfer",
            CommandId::TransferBlock => "DAP_TransferBlock",
            CommandId::WriteAbort => "DAP_WriteABORT",
            CommandId::Delay => "DAP_Delay",
            CommandId::ResetTarget => "DAP_ResetTarget",
            CommandId::SwjClock => "DAP_SWJ_Clock",
            CommandId::SwjSequence => "DAP_SWJ_Sequence",
            CommandId::SwdConfigure => "DAP_SWD_Configure",
        };
        f.write_str(name)
    }
}

pub(crate) trait Request {
    const COMMAND_ID: CommandId;

    type Response;

    /// Convert the request to bytes, which can be sent to the probe.
    /// Returns the number of bytes written to the buffer, which starts
    /// right after the command id.
    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, SendError>;

    /// Parse the response to this request from received bytes.
    /// The buffer starts right after the echoed command id.
    fn from_bytes(&self, buffer: &[u8]) -> Result<Self::Response, SendError>;
}

/// Send a single command packet and parse the matching response packet.
pub(crate) fn send_command<Req: Request, T: Transport + ?Sized>(
    transport: &mut T,
    request: &Req,
) -> Result<Req::Response, CmsisDapError> {
    send_command_inner(transport, request).map_err(|source| CmsisDapError::Send {
        command_id: Req::COMMAND_ID,
        source,
    })
}

fn send_command_inner<Req: Request, T: Transport + ?Sized>(
    transport: &mut T,
    request: &Req,
) -> Result<Req::Response, SendError> {
    let packet_size = transport.packet_size();
    if packet_size == 0 {
        return Err(SendError::PacketTooSmall(packet_size));
    }

    // Unused bytes stay zero, every packet is sent at full size.
    let mut buffer = vec![0; packet_size];
    buffer[0] = Req::COMMAND_ID as u8;
    let size = request.to_bytes(&mut buffer[1..])? + 1;

    trace_buffer("Transmit buffer", &buffer[..size]);
    transport.write(&buffer)?;

    let response = transport.read()?;
    trace_buffer("Receive buffer", &response);

    match response.first() {
        None => Err(SendError::NotEnoughData),
        Some(&id) if id == Req::COMMAND_ID as u8 => request.from_bytes(&response[1..]),
        Some(&id) => Err(SendError::CommandIdMismatch(id)),
    }
}

fn trace_buffer(name: &str, buf: &[u8]) {
    if tracing::enabled!(tracing::Level::TRACE) {
        let end = buf
            .iter()
            .rposition(|&x| x != 0)
            .map_or(1, |last| last + 1)
            .min(buf.len());

        tracing::trace!("{}: {:02X?}...", name, &buf[..end]);
    }
}

/// Fail with [`SendError::PacketTooSmall`] if `buffer` can't hold `needed` bytes.
pub(crate) fn ensure_capacity(buffer: &[u8], needed: usize) -> Result<(), SendError> {
    if buffer.len() < needed {
        Err(SendError::PacketTooSmall(buffer.len() + 1))
    } else {
        Ok(())
    }
}

/// Byte `index` of a response, or [`SendError::NotEnoughData`].
pub(crate) fn response_byte(buffer: &[u8], index: usize) -> Result<u8, SendError> {
    buffer.get(index).copied().ok_or(SendError::NotEnoughData)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    DapOk = 0x00,
    DapError = 0xFF,
}

impl Status {
    pub fn from_byte(value: u8) -> Result<Self, SendError> {
        match value {
            0x00 => Ok(Status::DapOk),
            0xFF => Ok(Status::DapError),
            _ => Err(SendError::InvalidResponseStatus),
        }
    }

    /// Parse the status byte that leads most responses.
    pub(crate) fn from_response(buffer: &[u8]) -> Result<Self, SendError> {
        Status::from_byte(response_byte(buffer, 0)?)
    }
}

#[cfg(test)]
mod test {
    use super::general::disconnect::DisconnectRequest;
    use super::*;
    use crate::probe::mock::MockProbe;
    use crate::probe::Transport;

    #[test]
    fn packets_are_zero_padded() {
        let mut probe = MockProbe::new();
        probe.open().unwrap();

        let status = send_command(&mut probe, &DisconnectRequest {}).unwrap();
        assert_eq!(status, Status::DapOk);

        let state = probe.state();
        let packet = state.last_packet.as_ref().unwrap();
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], CommandId::Disconnect as u8);
        assert!(packet[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn mismatched_command_id_is_rejected() {
        let mut probe = MockProbe::new();
        probe.open().unwrap();
        probe.state().corrupt_next_response = true;

        let error = send_command(&mut probe, &DisconnectRequest {}).unwrap_err();
        assert!(matches!(
            error,
            CmsisDapError::Send {
                command_id: CommandId::Disconnect,
                source: SendError::CommandIdMismatch(_)
            }
        ));
    }

    #[test]
    fn invalid_status_byte() {
        assert!(matches!(
            Status::from_byte(0x42),
            Err(SendError::InvalidResponseStatus)
        ));
        assert_eq!(Status::from_byte(0xFF).unwrap(), Status::DapError);
    }
}
