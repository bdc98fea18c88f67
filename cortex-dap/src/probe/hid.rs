//! CMSIS-DAP v1 probes over USB HID.

use std::fmt;
use std::time::Duration;

use hidapi::{HidApi, HidDevice, HidDeviceInfo};

use super::{Transport, TransportError};

/// HID reports of all known CMSIS-DAP v1 probes are 64 bytes long.
pub const HID_PACKET_SIZE: usize = 64;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// A CMSIS-DAP probe found on the USB bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub identifier: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

fn is_cmsis_dap_device(device: &HidDeviceInfo) -> bool {
    device
        .product_string()
        .map_or(false, |product| product.contains("CMSIS-DAP"))
}

/// All HID devices that announce themselves as CMSIS-DAP probes.
pub fn list_devices() -> Vec<ProbeInfo> {
    match HidApi::new() {
        Ok(api) => api
            .device_list()
            .filter(|device| is_cmsis_dap_device(device))
            .map(|device| ProbeInfo {
                identifier: device
                    .product_string()
                    .unwrap_or("Unknown CMSIS-DAP Probe")
                    .to_owned(),
                vendor_id: device.vendor_id(),
                product_id: device.product_id(),
                serial_number: device.serial_number().map(str::to_owned),
            })
            .collect(),
        Err(error) => {
            tracing::warn!("Failed to enumerate HID devices: {}", error);
            vec![]
        }
    }
}

/// [`Transport`] on a HID device, opened on [`Transport::open`].
pub struct HidTransport {
    vendor_id: u16,
    product_id: u16,
    serial_number: Option<String>,
    timeout: Duration,
    device: Option<HidDevice>,
}

impl fmt::Debug for HidTransport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HidTransport")
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id))
            .field("product_id", &format_args!("{:#06x}", self.product_id))
            .field("serial_number", &self.serial_number)
            .field("open", &self.device.is_some())
            .finish()
    }
}

impl HidTransport {
    pub fn new(vendor_id: u16, product_id: u16, serial_number: Option<String>) -> Self {
        HidTransport {
            vendor_id,
            product_id,
            serial_number,
            timeout: DEFAULT_TIMEOUT,
            device: None,
        }
    }

    pub fn from_info(info: &ProbeInfo) -> Self {
        Self::new(info.vendor_id, info.product_id, info.serial_number.clone())
    }

    /// Read timeout for a single response packet.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl Transport for HidTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.device.is_some() {
            return Ok(());
        }

        let api = HidApi::new()?;
        let device = match &self.serial_number {
            Some(serial) => api.open_serial(self.vendor_id, self.product_id, serial)?,
            None => api.open(self.vendor_id, self.product_id)?,
        };
        tracing::debug!(
            "Opened HID device {:04x}:{:04x}",
            self.vendor_id,
            self.product_id
        );

        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.device = None;
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        let device = self.device.as_ref().ok_or(TransportError::Closed)?;

        let mut buffer = vec![0; HID_PACKET_SIZE];
        let timeout = i32::try_from(self.timeout.as_millis()).unwrap_or(i32::MAX);
        let count = device.read_timeout(&mut buffer, timeout)?;
        if count == 0 {
            return Err(TransportError::Timeout);
        }

        Ok(buffer)
    }

    fn write(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let device = self.device.as_ref().ok_or(TransportError::Closed)?;
        if packet.len() != HID_PACKET_SIZE {
            return Err(TransportError::PacketSize {
                expected: HID_PACKET_SIZE,
                actual: packet.len(),
            });
        }

        // Report ID zero goes first, it is not part of the packet.
        let mut report = Vec::with_capacity(HID_PACKET_SIZE + 1);
        report.push(0);
        report.extend_from_slice(packet);
        device.write(&report)?;
        Ok(())
    }

    fn packet_size(&self) -> usize {
        HID_PACKET_SIZE
    }
}
