use super::super::{response_byte, CommandId, Request, SendError};
use crate::probe::WireProtocol;

/// DAP_Connect, initialise the debug port in the requested mode.
#[derive(Clone, Copy, Debug)]
pub struct ConnectRequest(pub WireProtocol);

impl Request for ConnectRequest {
    const COMMAND_ID: CommandId = CommandId::Connect;

    type Response = ConnectResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, SendError> {
        super::super::ensure_capacity(buffer, 1)?;
        buffer[0] = self.0 as u8;
        Ok(1)
    }

    fn from_bytes(&self, buffer: &[u8]) -> Result<Self::Response, SendError> {
        match response_byte(buffer, 0)? {
            0 => Ok(ConnectResponse::InitFailed),
            1 => Ok(ConnectResponse::SuccessfulInitForSWD),
            2 => Ok(ConnectResponse::SuccessfulInitForJTAG),
            other => Err(SendError::ConnectResponseError(other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectResponse {
    InitFailed = 0x00,
    SuccessfulInitForSWD = 0x01,
    SuccessfulInitForJTAG = 0x02,
}

impl ConnectResponse {
    /// The protocol the probe switched to, if any.
    pub fn protocol(self) -> Option<WireProtocol> {
        match self {
            ConnectResponse::InitFailed => None,
            ConnectResponse::SuccessfulInitForSWD => Some(WireProtocol::Swd),
            ConnectResponse::SuccessfulInitForJTAG => Some(WireProtocol::Jtag),
        }
    }
}
