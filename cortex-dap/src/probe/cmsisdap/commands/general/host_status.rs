use super::super::{CommandId, Request, SendError, Status};

/// Which of the probe status LEDs to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatusType {
    Connect = 0,
    Running = 1,
}

#[derive(Debug, Clone, Copy)]
pub struct HostStatusRequest {
    status_type: HostStatusType,
    status: bool,
}

impl HostStatusRequest {
    pub fn connected(connected: bool) -> Self {
        HostStatusRequest {
            status_type: HostStatusType::Connect,
            status: connected,
        }
    }

    pub fn running(running: bool) -> Self {
        HostStatusRequest {
            status_type: HostStatusType::Running,
            status: running,
        }
    }
}

impl Request for HostStatusRequest {
    const COMMAND_ID: CommandId = CommandId::HostStatus;

    type Response = Status;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, SendError> {
        super::super::ensure_capacity(buffer, 2)?;
        buffer[0] = self.status_type as u8;
        buffer[1] = u8::from(self.status);
        Ok(2)
    }

    fn from_bytes(&self, buffer: &[u8]) -> Result<Self::Response, SendError> {
        Status::from_response(buffer)
    }
}
