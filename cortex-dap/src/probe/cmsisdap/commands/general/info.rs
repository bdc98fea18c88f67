use scroll::{Pread, LE};

use super::super::{response_byte, CommandId, Request, SendError};

macro_rules! info_command {
    ($id:expr, $name:ident, $response_type:ty) => {
        #[derive(Clone, Default, Debug)]
        pub struct $name {}

        impl Request for $name {
            const COMMAND_ID: CommandId = CommandId::Info;

            type Response = $response_type;

            fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, SendError> {
                super::super::ensure_capacity(buffer, 1)?;
                buffer[0] = $id;
                Ok(1)
            }

            fn from_bytes(&self, buffer: &[u8]) -> Result<Self::Response, SendError> {
                ParseFromResponse::from_response(buffer)
            }
        }
    };
}

info_command!(0x01, VendorCommand, Option<String>);
info_command!(0x02, ProductIdCommand, Option<String>);
info_command!(0x03, SerialNumberCommand, Option<String>);
info_command!(0x04, FirmwareVersionCommand, Option<String>);
info_command!(0xF0, CapabilitiesCommand, Capabilities);
info_command!(0xFE, PacketCountCommand, u8);
info_command!(0xFF, PacketSizeCommand, u16);

trait ParseFromResponse: Sized {
    fn from_response(buffer: &[u8]) -> Result<Self, SendError>;
}

impl ParseFromResponse for Option<String> {
    /// The first byte holds the string length, zero means no string.
    fn from_response(buffer: &[u8]) -> Result<Self, SendError> {
        let string_len = usize::from(response_byte(buffer, 0)?);

        match string_len {
            0 => Ok(None),
            n => {
                let bytes = buffer.get(1..1 + n).ok_or(SendError::NotEnoughData)?;
                let res = std::str::from_utf8(bytes)?;
                Ok(Some(res.trim_end_matches('\0').to_owned()))
            }
        }
    }
}

impl ParseFromResponse for u8 {
    fn from_response(buffer: &[u8]) -> Result<Self, SendError> {
        if response_byte(buffer, 0)? != 1 {
            Err(SendError::UnexpectedAnswer)
        } else {
            response_byte(buffer, 1)
        }
    }
}

impl ParseFromResponse for u16 {
    fn from_response(buffer: &[u8]) -> Result<Self, SendError> {
        if response_byte(buffer, 0)? != 2 {
            Err(SendError::UnexpectedAnswer)
        } else {
            buffer
                .pread_with(1, LE)
                .map_err(|_| SendError::NotEnoughData)
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub swd_implemented: bool,
    pub jtag_implemented: bool,
    pub swo_uart_implemented: bool,
    pub swo_manchester_implemented: bool,
    pub atomic_commands_implemented: bool,
    pub test_domain_timer_implemented: bool,
    pub swo_streaming_trace_implemented: bool,
}

impl ParseFromResponse for Capabilities {
    fn from_response(buffer: &[u8]) -> Result<Self, SendError> {
        // Only the first info byte is described, a second one is ignored.
        if response_byte(buffer, 0)? == 0 {
            return Err(SendError::UnexpectedAnswer);
        }
        let caps = response_byte(buffer, 1)?;
        Ok(Capabilities {
            swd_implemented: caps & 0x01 > 0,
            jtag_implemented: caps & 0x02 > 0,
            swo_uart_implemented: caps & 0x04 > 0,
            swo_manchester_implemented: caps & 0x08 > 0,
            atomic_commands_implemented: caps & 0x10 > 0,
            test_domain_timer_implemented: caps & 0x20 > 0,
            swo_streaming_trace_implemented: caps & 0x40 > 0,
        })
    }
}
