pub mod configure;

use scroll::{Pread, Pwrite, LE};

use super::{ensure_capacity, response_byte, CommandId, Request, SendError};
use crate::architecture::arm::DapError;
use crate::probe::{request_byte, AccessMode, DapOperation, PortType};

/// Bits of the transfer response status byte.
pub(crate) const ACK_OK: u8 = 0x01;
pub(crate) const ACK_WAIT: u8 = 0x02;
pub(crate) const ACK_FAULT: u8 = 0x04;
pub(crate) const ACK_NO_ACK: u8 = 0x07;
pub(crate) const PROTOCOL_ERROR: u8 = 0x08;
pub(crate) const VALUE_MISMATCH: u8 = 0x10;

/// Map the status byte of a DAP_Transfer or DAP_TransferBlock response to an error.
///
/// WAIT wins over FAULT, which wins over a protocol error and a value mismatch.
/// Any other acknowledge than OK is reported as missing.
pub(crate) fn check_transfer_status(status: u8) -> Result<(), DapError> {
    let ack = status & 0x07;

    if ack != ACK_NO_ACK && status & ACK_WAIT != 0 {
        return Err(DapError::WaitResponse);
    }
    if ack != ACK_NO_ACK && status & ACK_FAULT != 0 {
        return Err(DapError::FaultResponse);
    }
    if status & PROTOCOL_ERROR != 0 {
        return Err(DapError::Protocol);
    }
    if status & VALUE_MISMATCH != 0 {
        return Err(DapError::ValueMismatch);
    }
    if ack != ACK_OK {
        return Err(DapError::NoAcknowledge);
    }
    Ok(())
}

/// DAP_Transfer, a batch of single register accesses.
#[derive(Debug, Clone)]
pub(crate) struct TransferRequest<'a> {
    /// Zero based device index of the DAP in a JTAG chain, ignored for SWD.
    dap_index: u8,
    operations: &'a [DapOperation],
}

impl<'a> TransferRequest<'a> {
    pub(crate) fn new(operations: &'a [DapOperation]) -> Self {
        TransferRequest {
            dap_index: 0,
            operations,
        }
    }

    fn read_count(&self) -> usize {
        self.operations.iter().filter(|op| op.is_read()).count()
    }
}

impl Request for TransferRequest<'_> {
    const COMMAND_ID: CommandId = CommandId::Transfer;

    type Response = TransferResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, SendError> {
        let count = u8::try_from(self.operations.len())
            .map_err(|_| SendError::PacketTooSmall(buffer.len() + 1))?;

        ensure_capacity(buffer, 2)?;
        buffer[0] = self.dap_index;
        buffer[1] = count;

        let mut size = 2;
        for operation in self.operations {
            ensure_capacity(buffer, size + 1)?;
            buffer[size] = operation.request_byte();
            size += 1;

            if operation.mode == AccessMode::Write {
                size += buffer
                    .pwrite_with(operation.value, size, LE)
                    .map_err(|_| SendError::PacketTooSmall(buffer.len() + 1))?;
            }
        }

        Ok(size)
    }

    fn from_bytes(&self, buffer: &[u8]) -> Result<Self::Response, SendError> {
        let transfer_count = response_byte(buffer, 0)?;
        let transfer_status = response_byte(buffer, 1)?;

        // Read data is only present when every transfer went through.
        let complete = usize::from(transfer_count) == self.operations.len()
            && transfer_status == ACK_OK;
        let data = if complete {
            read_words(&buffer[2..], self.read_count())?
        } else {
            Vec::new()
        };

        Ok(TransferResponse {
            transfer_count,
            transfer_status,
            data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransferResponse {
    pub transfer_count: u8,
    pub transfer_status: u8,
    pub data: Vec<u32>,
}

/// DAP_TransferBlock, repeated accesses to a single register.
#[derive(Debug, Clone)]
pub(crate) struct TransferBlockRequest<'a> {
    dap_index: u8,
    transfer_count: u16,
    transfer_request: u8,
    data: &'a [u32],
}

impl<'a> TransferBlockRequest<'a> {
    pub(crate) fn read_request(port: PortType, register: u8, read_count: u16) -> Self {
        TransferBlockRequest {
            dap_index: 0,
            transfer_count: read_count,
            transfer_request: request_byte(port, AccessMode::Read, register),
            data: &[],
        }
    }

    pub(crate) fn write_request(
        port: PortType,
        register: u8,
        data: &'a [u32],
    ) -> Result<Self, SendError> {
        let transfer_count = u16::try_from(data.len()).map_err(|_| SendError::PacketTooSmall(0))?;
        Ok(TransferBlockRequest {
            dap_index: 0,
            transfer_count,
            transfer_request: request_byte(port, AccessMode::Write, register),
            data,
        })
    }

    fn is_read(&self) -> bool {
        self.transfer_request & 0x02 != 0
    }
}

impl Request for TransferBlockRequest<'_> {
    const COMMAND_ID: CommandId = CommandId::TransferBlock;

    type Response = TransferBlockResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, SendError> {
        let packet_size = buffer.len() + 1;
        let too_small = move |_: scroll::Error| SendError::PacketTooSmall(packet_size);

        ensure_capacity(buffer, 4 + 4 * self.data.len())?;
        buffer[0] = self.dap_index;
        buffer
            .pwrite_with(self.transfer_count, 1, LE)
            .map_err(too_small)?;
        buffer[3] = self.transfer_request;

        let mut size = 4;
        for word in self.data {
            size += buffer.pwrite_with(*word, size, LE).map_err(too_small)?;
        }

        Ok(size)
    }

    fn from_bytes(&self, buffer: &[u8]) -> Result<Self::Response, SendError> {
        let transfer_count: u16 = buffer
            .pread_with(0, LE)
            .map_err(|_| SendError::NotEnoughData)?;
        let transfer_status = response_byte(buffer, 2)?;

        let complete = transfer_count == self.transfer_count && transfer_status == ACK_OK;
        let data = if complete && self.is_read() {
            read_words(&buffer[3..], usize::from(transfer_count))?
        } else {
            Vec::new()
        };

        Ok(TransferBlockResponse {
            transfer_count,
            transfer_status,
            data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransferBlockResponse {
    pub transfer_count: u16,
    pub transfer_status: u8,
    pub data: Vec<u32>,
}

fn read_words(buffer: &[u8], count: usize) -> Result<Vec<u32>, SendError> {
    (0..count)
        .map(|i| {
            buffer
                .pread_with::<u32>(i * 4, LE)
                .map_err(|_| SendError::NotEnoughData)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test]
    fn transfer_request_encoding() {
        let operations = [
            DapOperation::write(PortType::DebugPort, 0x8, 0x0100_00F0),
            DapOperation::read(PortType::AccessPort, 0xC),
        ];
        let request = TransferRequest::new(&operations);

        let mut buffer = [0u8; 63];
        let size = request.to_bytes(&mut buffer).unwrap();

        assert_eq!(
            &buffer[..size],
            &[0x00, 0x02, 0x08, 0xF0, 0x00, 0x00, 0x01, 0x0F]
        );
    }

    #[test]
    fn transfer_response_with_reads() {
        let operations = [
            DapOperation::read(PortType::DebugPort, 0x0),
            DapOperation::write(PortType::DebugPort, 0x8, 0),
            DapOperation::read(PortType::DebugPort, 0x4),
        ];
        let request = TransferRequest::new(&operations);

        let response = request
            .from_bytes(&[0x03, 0x01, 0x77, 0x14, 0xA0, 0x2B, 0x00, 0x00, 0x00, 0xF0])
            .unwrap();

        assert_eq!(
            response,
            TransferResponse {
                transfer_count: 3,
                transfer_status: ACK_OK,
                data: vec![0x2BA0_1477, 0xF000_0000],
            }
        );
    }

    #[test]
    fn failed_transfer_carries_no_data() {
        let operations = [DapOperation::read(PortType::DebugPort, 0x0)];
        let request = TransferRequest::new(&operations);

        let response = request.from_bytes(&[0x00, ACK_WAIT]).unwrap();
        assert!(response.data.is_empty());
    }

    #[test]
    fn block_request_encoding() {
        let words = [0xDEAD_BEEF, 0x0000_0001];
        let request = TransferBlockRequest::write_request(PortType::AccessPort, 0xC, &words).unwrap();

        let mut buffer = [0u8; 63];
        let size = request.to_bytes(&mut buffer).unwrap();

        assert_eq!(
            &buffer[..size],
            &[0x00, 0x02, 0x00, 0x0D, 0xEF, 0xBE, 0xAD, 0xDE, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn block_read_response() {
        let request = TransferBlockRequest::read_request(PortType::AccessPort, 0xC, 2);
        let response = request
            .from_bytes(&[0x02, 0x00, 0x01, 1, 0, 0, 0, 2, 0, 0, 0])
            .unwrap();
        assert_eq!(response.data, vec![1, 2]);
    }

    #[test_case(0x01 => matches Ok(()) ; "ok")]
    #[test_case(0x02 => matches Err(DapError::WaitResponse) ; "wait")]
    #[test_case(0x04 => matches Err(DapError::FaultResponse) ; "fault")]
    #[test_case(0x06 => matches Err(DapError::WaitResponse) ; "wait before fault")]
    #[test_case(0x07 => matches Err(DapError::NoAcknowledge) ; "no ack")]
    #[test_case(0x09 => matches Err(DapError::Protocol) ; "protocol error")]
    #[test_case(0x0A => matches Err(DapError::WaitResponse) ; "wait before protocol error")]
    #[test_case(0x11 => matches Err(DapError::ValueMismatch) ; "value mismatch")]
    #[test_case(0x18 => matches Err(DapError::Protocol) ; "protocol before mismatch")]
    #[test_case(0x0F => matches Err(DapError::Protocol) ; "protocol error with no ack")]
    #[test_case(0x00 => matches Err(DapError::NoAcknowledge) ; "empty ack")]
    fn status_precedence(status: u8) -> Result<(), DapError> {
        check_transfer_status(status)
    }
}
