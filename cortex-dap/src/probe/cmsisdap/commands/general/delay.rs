use scroll::{Pwrite, LE};

use super::super::{CommandId, Request, SendError, Status};

/// DAP_Delay, wait on the probe for the given number of microseconds.
#[derive(Debug, Clone, Copy)]
pub struct DelayRequest {
    pub delay_us: u16,
}

impl Request for DelayRequest {
    const COMMAND_ID: CommandId = CommandId::Delay;

    type Response = Status;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, SendError> {
        buffer
            .pwrite_with(self.delay_us, 0, LE)
            .map_err(|_| SendError::PacketTooSmall(buffer.len() + 1))
    }

    fn from_bytes(&self, buffer: &[u8]) -> Result<Self::Response, SendError> {
        Status::from_response(buffer)
    }
}
