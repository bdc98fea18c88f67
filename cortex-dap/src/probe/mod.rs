//! Debug probe access: the byte-pipe [`Transport`] contract and the
//! register-level [`DapProxy`] built on top of it.

pub mod cmsisdap;
#[cfg(feature = "hid")]
pub mod hid;
#[cfg(any(test, feature = "test"))]
pub mod mock;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::architecture::arm::DapError;
use cmsisdap::commands::CmsisDapError;

/// The protocol used between the probe and the target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    /// Let the probe pick its default port.
    Default = 0x00,
    /// Serial Wire Debug.
    #[default]
    Swd = 0x01,
    /// JTAG.
    Jtag = 0x02,
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireProtocol::Default => write!(f, "default"),
            WireProtocol::Swd => write!(f, "SWD"),
            WireProtocol::Jtag => write!(f, "JTAG"),
        }
    }
}

impl std::str::FromStr for WireProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_ascii_lowercase()[..] {
            "default" => Ok(WireProtocol::Default),
            "swd" => Ok(WireProtocol::Swd),
            "jtag" => Ok(WireProtocol::Jtag),
            _ => Err(format!(
                "'{}' is not a valid protocol. Choose from [default, swd, jtag].",
                s
            )),
        }
    }
}

/// Errors raised by a [`Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("The transport is not open")]
    Closed,
    #[error("Timeout in USB communication.")]
    Timeout,
    #[error("Expected a packet of {expected} bytes, got {actual}")]
    PacketSize { expected: usize, actual: usize },
    #[error("I/O error in the transport")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "hid")]
    #[error("Error in the USB HID access")]
    HidApi(#[from] hidapi::HidError),
}

/// A packet based byte pipe to a debug probe, e.g. a USB HID or bulk endpoint.
///
/// Every call to [`Transport::read`] and [`Transport::write`] moves exactly one
/// packet of [`Transport::packet_size`] bytes. There are no partial packets.
pub trait Transport: Send + fmt::Debug {
    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    /// Read the next packet from the probe.
    fn read(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Write a single packet to the probe.
    fn write(&mut self, packet: &[u8]) -> Result<(), TransportError>;

    /// Size of a single packet in bytes.
    fn packet_size(&self) -> usize;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<(), TransportError> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }

    fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        (**self).read()
    }

    fn write(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        (**self).write(packet)
    }

    fn packet_size(&self) -> usize {
        (**self).packet_size()
    }
}

/// The port a [`DapOperation`] addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PortType {
    DebugPort,
    AccessPort,
}

/// Direction of a [`DapOperation`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// A single DP or AP register access.
///
/// Only the A\[3:2\] bits of `register` reach the wire, bank selection is done
/// through the DP SELECT register by the layer above.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DapOperation {
    pub port: PortType,
    pub mode: AccessMode,
    pub register: u8,
    pub value: u32,
}

impl DapOperation {
    pub fn read(port: PortType, register: u8) -> Self {
        Self {
            port,
            mode: AccessMode::Read,
            register: register & 0x0C,
            value: 0,
        }
    }

    pub fn write(port: PortType, register: u8, value: u32) -> Self {
        Self {
            port,
            mode: AccessMode::Write,
            register: register & 0x0C,
            value,
        }
    }

    pub fn is_read(&self) -> bool {
        self.mode == AccessMode::Read
    }

    /// The CMSIS-DAP transfer request byte: APnDP, RnW, A2 and A3.
    pub(crate) fn request_byte(&self) -> u8 {
        request_byte(self.port, self.mode, self.register)
    }
}

pub(crate) fn request_byte(port: PortType, mode: AccessMode, register: u8) -> u8 {
    let ap_n_dp = u8::from(port == PortType::AccessPort);
    let r_n_w = u8::from(mode == AccessMode::Read);
    ap_n_dp | (r_n_w << 1) | (register & 0x0C)
}

impl fmt::Display for DapOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let port = match self.port {
            PortType::DebugPort => "DP",
            PortType::AccessPort => "AP",
        };
        match self.mode {
            AccessMode::Read => write!(f, "Read({} {:#04x})", port, self.register),
            AccessMode::Write => write!(
                f,
                "Write({} {:#04x}, {:#010x})",
                port, self.register, self.value
            ),
        }
    }
}

/// Errors raised by a [`DapProxy`].
#[derive(Debug, thiserror::Error)]
pub enum DebugProbeError {
    #[error("Transport error")]
    Transport(#[from] TransportError),
    #[error("CMSIS-DAP command failed")]
    CmsisDap(#[from] CmsisDapError),
    #[error(transparent)]
    Dap(#[from] DapError),
    #[error("Mode {requested} was requested, but the probe reported mode {reported:#04x}")]
    ModeNotEnabled {
        requested: WireProtocol,
        reported: u8,
    },
    #[error("You need to connect to the probe to perform this action")]
    NotConnected,
    #[error("{count} operations do not fit into one packet (at most {max})")]
    BatchTooLarge { count: usize, max: usize },
}

/// Register level access to a debug port.
///
/// Implementations translate [`DapOperation`]s into their wire protocol and
/// serialise all traffic over a single transport.
pub trait DapProxy: fmt::Debug {
    /// How many single register operations fit into one [`DapProxy::transfer`].
    fn operation_count(&self) -> usize;

    /// How many words fit into one block transfer.
    fn block_size(&self) -> usize;

    fn is_connected(&self) -> bool;

    /// Open the transport and bring the debug link up. Does nothing when
    /// already connected.
    fn connect(&mut self) -> Result<(), DebugProbeError>;

    /// Take the debug link down and close the transport. Does nothing when
    /// not connected.
    fn disconnect(&mut self) -> Result<(), DebugProbeError>;

    /// Reset the target through the probe.
    ///
    /// Returns `true` if the probe executed a device specific reset sequence.
    fn reset(&mut self) -> Result<bool, DebugProbeError>;

    /// Execute `operations` in order and return the values of all reads.
    fn transfer(&mut self, operations: &[DapOperation]) -> Result<Vec<u32>, DebugProbeError>;

    /// Read the same register `count` times.
    fn transfer_block_read(
        &mut self,
        port: PortType,
        register: u8,
        count: usize,
    ) -> Result<Vec<u32>, DebugProbeError>;

    /// Write `values` to the same register, one after another.
    fn transfer_block_write(
        &mut self,
        port: PortType,
        register: u8,
        values: &[u32],
    ) -> Result<(), DebugProbeError>;
}

impl<P: DapProxy + ?Sized> DapProxy for Box<P> {
    fn operation_count(&self) -> usize {
        (**self).operation_count()
    }

    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn connect(&mut self) -> Result<(), DebugProbeError> {
        (**self).connect()
    }

    fn disconnect(&mut self) -> Result<(), DebugProbeError> {
        (**self).disconnect()
    }

    fn reset(&mut self) -> Result<bool, DebugProbeError> {
        (**self).reset()
    }

    fn transfer(&mut self, operations: &[DapOperation]) -> Result<Vec<u32>, DebugProbeError> {
        (**self).transfer(operations)
    }

    fn transfer_block_read(
        &mut self,
        port: PortType,
        register: u8,
        count: usize,
    ) -> Result<Vec<u32>, DebugProbeError> {
        (**self).transfer_block_read(port, register, count)
    }

    fn transfer_block_write(
        &mut self,
        port: PortType,
        register: u8,
        values: &[u32],
    ) -> Result<(), DebugProbeError> {
        (**self).transfer_block_write(port, register, values)
    }
}
