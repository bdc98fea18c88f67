use super::super::{CmsisDapError, CommandId, Request, SendError, Status};

/// DAP_SWJ_Sequence, clock out raw bits on SWDIO/TMS.
#[derive(Clone, Copy, Debug)]
pub struct SequenceRequest {
    bit_count: u8,
    data: [u8; 32],
}

impl Request for SequenceRequest {
    const COMMAND_ID: CommandId = CommandId::SwjSequence;

    type Response = Status;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, SendError> {
        // A bit_count of zero means 256 bits.
        let transfer_len_bytes = match self.bit_count {
            0 => 32,
            n => usize::from(n).div_ceil(8),
        };

        super::super::ensure_capacity(buffer, 1 + transfer_len_bytes)?;
        buffer[0] = self.bit_count;
        buffer[1..(1 + transfer_len_bytes)].copy_from_slice(&self.data[..transfer_len_bytes]);

        Ok(1 + transfer_len_bytes)
    }

    fn from_bytes(&self, buffer: &[u8]) -> Result<Self::Response, SendError> {
        Status::from_response(buffer)
    }
}

impl SequenceRequest {
    pub(crate) fn new(data: &[u8]) -> Result<SequenceRequest, CmsisDapError> {
        if data.len() > 32 {
            return Err(CmsisDapError::TooMuchData);
        }
        // A bit count of zero means 256 bits.
        if data.is_empty() {
            return Err(CmsisDapError::EmptySequence);
        }

        let bit_count = match data.len() {
            32 => 0,
            x => x * 8,
        } as u8;

        let mut owned_data = [0u8; 32];
        owned_data[..data.len()].copy_from_slice(data);

        Ok(SequenceRequest {
            bit_count,
            data: owned_data,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_sequence_is_rejected() {
        assert!(matches!(
            SequenceRequest::new(&[]),
            Err(CmsisDapError::EmptySequence)
        ));
    }

    #[test]
    fn sequence_encoding() {
        let request = SequenceRequest::new(&[0x9E, 0xE7]).unwrap();
        let mut buffer = [0u8; 63];
        let len = request.to_bytes(&mut buffer).unwrap();
        assert_eq!(&buffer[..len], &[16, 0x9E, 0xE7]);
    }

    #[test]
    fn full_length_sequence() {
        let request = SequenceRequest::new(&[0xFF; 32]).unwrap();
        let mut buffer = [0u8; 63];
        assert_eq!(request.to_bytes(&mut buffer).unwrap(), 33);
        assert_eq!(buffer[0], 0);

        assert!(matches!(
            SequenceRequest::new(&[0; 33]),
            Err(CmsisDapError::TooMuchData)
        ));
    }
}
