use super::super::{CommandId, Request, SendError, Status};

/// DAP_SWD_Configure, turnaround and data phase settings of the SWD link.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigureRequest {
    /// Turnaround period in clock cycles, minus one.
    pub turnaround: u8,
    /// Generate a data phase on WAIT and FAULT acknowledges.
    pub always_data_phase: bool,
}

impl Request for ConfigureRequest {
    const COMMAND_ID: CommandId = CommandId::SwdConfigure;

    type Response = Status;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, SendError> {
        super::super::ensure_capacity(buffer, 1)?;
        buffer[0] = (self.turnaround & 0x03) | (u8::from(self.always_data_phase) << 2);
        Ok(1)
    }

    fn from_bytes(&self, buffer: &[u8]) -> Result<Self::Response, SendError> {
        Status::from_response(buffer)
    }
}
