use scroll::{Pwrite, LE};

use super::super::{CommandId, Request, SendError, Status};

/// DAP_WriteABORT, write the DP ABORT register outside of a transfer.
#[derive(Debug, Clone, Copy)]
pub struct WriteAbortRequest {
    /// Zero based device index of the DAP in a JTAG chain, ignored for SWD.
    pub dap_index: u8,
    pub abort: u32,
}

impl Request for WriteAbortRequest {
    const COMMAND_ID: CommandId = CommandId::WriteAbort;

    type Response = Status;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, SendError> {
        super::super::ensure_capacity(buffer, 5)?;
        buffer[0] = self.dap_index;
        buffer
            .pwrite_with(self.abort, 1, LE)
            .map_err(|_| SendError::PacketTooSmall(buffer.len() + 1))?;
        Ok(5)
    }

    fn from_bytes(&self, buffer: &[u8]) -> Result<Self::Response, SendError> {
        Status::from_response(buffer)
    }
}
