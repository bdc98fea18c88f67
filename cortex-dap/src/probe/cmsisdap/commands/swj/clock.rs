use scroll::{Pwrite, LE};

use super::super::{CommandId, Request, SendError, Status};

/// DAP_SWJ_Clock, set the SWD/JTAG clock frequency in Hz.
#[derive(Clone, Copy, Debug)]
pub struct SWJClockRequest(pub(crate) u32);

impl Request for SWJClockRequest {
    const COMMAND_ID: CommandId = CommandId::SwjClock;

    type Response = Status;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, SendError> {
        buffer
            .pwrite_with(self.0, 0, LE)
            .map_err(|_| SendError::PacketTooSmall(buffer.len() + 1))
    }

    fn from_bytes(&self, buffer: &[u8]) -> Result<Self::Response, SendError> {
        Status::from_response(buffer)
    }
}
