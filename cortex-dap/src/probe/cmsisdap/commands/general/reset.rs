use super::super::{response_byte, CommandId, Request, SendError, Status};

/// DAP_ResetTarget, run the probe's device specific reset sequence.
#[derive(Debug)]
pub struct ResetRequest;

impl Request for ResetRequest {
    const COMMAND_ID: CommandId = CommandId::ResetTarget;

    type Response = ResetResponse;

    fn to_bytes(&self, _buffer: &mut [u8]) -> Result<usize, SendError> {
        Ok(0)
    }

    fn from_bytes(&self, buffer: &[u8]) -> Result<Self::Response, SendError> {
        Ok(ResetResponse {
            status: Status::from_response(buffer)?,
            execute: Execute::from_byte(response_byte(buffer, 1)?)?,
        })
    }
}

/// Execute: indicates whether a device specific reset sequence was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execute {
    NoDeviceSpecificResetSequenceImplemented = 0,
    DeviceSpecificResetSequenceImplemented = 1,
}

impl Execute {
    pub(crate) fn from_byte(byte: u8) -> Result<Self, SendError> {
        match byte {
            0 => Ok(Execute::NoDeviceSpecificResetSequenceImplemented),
            1 => Ok(Execute::DeviceSpecificResetSequenceImplemented),
            _ => Err(SendError::UnexpectedAnswer),
        }
    }
}

#[derive(Debug)]
pub struct ResetResponse {
    pub status: Status,
    pub execute: Execute,
}
