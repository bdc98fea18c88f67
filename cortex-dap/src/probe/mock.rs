//! An in-memory CMSIS-DAP probe with a simulated target behind it.
//!
//! The mock answers the CMSIS-DAP commands used by this crate, models the DP
//! and one MEM-AP, and keeps a small Cortex-M debug model for the core
//! registers in the system control space. Every command it sees is recorded
//! so tests can check what went over the wire.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use scroll::{Pread, LE};

use super::{Transport, TransportError};

const DPIDR: u32 = 0x2BA0_1477;
const AP_IDR: u32 = 0x2477_0011;
/// CTRL/STAT with both power-up requests acknowledged.
const CTRL_STAT_POWERED: u32 = 0xF000_0000;

const DHCSR: u32 = 0xE000_EDF0;
const DCRSR: u32 = 0xE000_EDF4;
const DCRDR: u32 = 0xE000_EDF8;
const DEMCR: u32 = 0xE000_EDFC;
const AIRCR: u32 = 0xE000_ED0C;
const DFSR: u32 = 0xE000_ED30;
const FP_CTRL: u32 = 0xE000_2000;

const DBGKEY: u32 = 0xA05F_0000;

/// One DAP_TransferBlock seen on the DRW register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTransfer {
    pub address: u32,
    pub count: usize,
    pub write: bool,
}

/// Debug view of the simulated Cortex-M core.
#[derive(Debug)]
pub struct CoreModel {
    pub halted: bool,
    /// C_DEBUGEN, C_HALT, C_STEP and C_MASKINTS from the last keyed DHCSR write.
    pub control: u32,
    pub registers: [u32; 32],
    pub dcrdr: u32,
    /// Values returned by the next DHCSR reads instead of the model state.
    pub dhcsr_script: VecDeque<u32>,
    /// R0 left behind by code the core runs. Without it, resumed code never halts.
    pub resume_result: Option<u32>,
    /// Halt requests have no effect.
    pub ignore_halt: bool,
    /// Number of DHCSR reads still showing S_RESET_ST.
    pub reset_reads: u32,
    pub demcr: u32,
    pub fp_ctrl: u32,
    pub fpb_enabled: bool,
    pub regrdy: bool,
    /// PC of every run started by a resume.
    pub runs: Vec<u32>,
    pub steps: usize,
    pub resets: usize,
    pub dhcsr_writes: Vec<u32>,
    pub dfsr_writes: Vec<u32>,
    pub fp_ctrl_writes: Vec<u32>,
}

impl Default for CoreModel {
    fn default() -> Self {
        CoreModel {
            halted: false,
            control: 0,
            registers: [0; 32],
            dcrdr: 0,
            dhcsr_script: VecDeque::new(),
            resume_result: None,
            ignore_halt: false,
            reset_reads: 0,
            demcr: 0,
            fp_ctrl: 0,
            fpb_enabled: false,
            regrdy: true,
            runs: Vec::new(),
            steps: 0,
            resets: 0,
            dhcsr_writes: Vec::new(),
            dfsr_writes: Vec::new(),
            fp_ctrl_writes: Vec::new(),
        }
    }
}

impl CoreModel {
    fn read_dhcsr(&mut self) -> u32 {
        if let Some(value) = self.dhcsr_script.pop_front() {
            return value;
        }

        let mut value = self.control;
        if self.reset_reads > 0 {
            self.reset_reads -= 1;
            value |= 1 << 25;
        }
        if self.halted {
            value |= 1 << 17;
        }
        if self.regrdy {
            value |= 1 << 16;
        }
        value
    }

    fn write_dhcsr(&mut self, value: u32) {
        self.dhcsr_writes.push(value);
        if value & 0xFFFF_0000 != DBGKEY {
            return;
        }

        self.control = value & 0xF;
        let halt = value & 0x2 != 0;
        let step = value & 0x4 != 0;

        if halt {
            if !self.ignore_halt {
                self.halted = true;
            }
        } else if step {
            if self.halted {
                self.registers[15] = self.registers[15].wrapping_add(2);
                self.steps += 1;
            }
        } else if self.halted {
            self.halted = false;
            if let Some(r0) = self.resume_result {
                self.runs.push(self.registers[15]);
                self.registers[0] = r0;
                self.halted = true;
            }
        }
    }

    fn write_dcrsr(&mut self, value: u32) {
        if !self.regrdy {
            return;
        }
        let index = (value & 0x7F) as usize;
        if index >= self.registers.len() {
            return;
        }
        if value & (1 << 16) != 0 {
            self.registers[index] = self.dcrdr;
        } else {
            self.dcrdr = self.registers[index];
        }
    }

    fn system_reset(&mut self) {
        self.resets += 1;
        self.reset_reads = 1;
        self.halted = self.demcr & 0x1 != 0;
    }
}

/// Everything the mock has seen and will answer.
#[derive(Debug)]
pub struct MockState {
    pub packet_size: usize,
    pub open: bool,
    pub fail_open: bool,
    /// Command ids in the order they were received.
    pub commands: Vec<u8>,
    pub last_packet: Option<Vec<u8>>,
    response: Option<Vec<u8>>,

    pub swj_clock: Option<u32>,
    pub swj_sequences: Vec<Vec<u8>>,
    /// Answer to DAP_Connect, the requested mode if unset.
    pub connect_reply: Option<u8>,
    pub reset_implemented: bool,
    /// Commands with this id are answered with the error status.
    pub fail_status_for: Option<u8>,
    /// Status byte sent for `fail_status_for`.
    pub error_status: u8,
    pub corrupt_next_response: bool,
    /// Status bytes for the next transfers. The operations are not executed.
    pub transfer_status: VecDeque<u8>,
    /// Report only this many transfers as executed, once.
    pub transfer_count_override: Option<u8>,
    pub power_up_ack: bool,

    pub dp_writes: Vec<(u8, u32)>,
    /// AP writes as `(APSEL << 24 | bank | register, value)`.
    pub ap_writes: Vec<(u32, u32)>,
    pub dpidr_reads: usize,
    pub transfer_packets: usize,
    pub block_transfers: Vec<BlockTransfer>,
    /// Values sent with DAP_WriteABORT.
    pub abort_writes: Vec<u32>,

    pub memory: HashMap<u32, u8>,
    pub select: u32,
    pub ctrl_stat: u32,
    pub csw: u32,
    pub tar: u32,
    pub core: CoreModel,
}

impl MockState {
    fn new(packet_size: usize) -> Self {
        MockState {
            packet_size,
            open: false,
            fail_open: false,
            commands: Vec::new(),
            last_packet: None,
            response: None,
            swj_clock: None,
            swj_sequences: Vec::new(),
            connect_reply: None,
            reset_implemented: false,
            fail_status_for: None,
            error_status: 0xFF,
            corrupt_next_response: false,
            transfer_status: VecDeque::new(),
            transfer_count_override: None,
            power_up_ack: true,
            dp_writes: Vec::new(),
            ap_writes: Vec::new(),
            dpidr_reads: 0,
            transfer_packets: 0,
            block_transfers: Vec::new(),
            abort_writes: Vec::new(),
            memory: HashMap::new(),
            select: 0,
            ctrl_stat: 0,
            csw: 0,
            tar: 0,
            core: CoreModel::default(),
        }
    }

    /// Values written to SELECT.
    pub fn select_writes(&self) -> Vec<u32> {
        self.dp_writes
            .iter()
            .filter(|(register, _)| *register == 0x8)
            .map(|&(_, value)| value)
            .collect()
    }

    /// Values written to the CSW of AP 0.
    pub fn csw_writes(&self) -> Vec<u32> {
        self.ap_writes
            .iter()
            .filter(|(register, _)| *register == 0x00)
            .map(|&(_, value)| value)
            .collect()
    }

    pub fn read_memory(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|offset| self.byte(address.wrapping_add(offset)))
            .collect()
    }

    pub fn write_memory(&mut self, address: u32, data: &[u8]) {
        for (offset, &byte) in data.iter().enumerate() {
            self.memory.insert(address.wrapping_add(offset as u32), byte);
        }
    }

    /// The little endian word at `address`, bypassing the core model.
    pub fn read_word(&self, address: u32) -> u32 {
        let bytes = self.read_memory(address, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn byte(&self, address: u32) -> u8 {
        self.memory.get(&address).copied().unwrap_or(0)
    }

    fn handle(&mut self, packet: &[u8]) -> Vec<u8> {
        let command = packet[0];
        let payload = &packet[1..];
        self.commands.push(command);

        let status = if self.fail_status_for == Some(command) {
            self.error_status
        } else {
            0x00
        };

        let mut response = match command {
            0x00 => self.info(payload),
            0x02 => {
                let requested = match payload[0] {
                    0 => 1,
                    mode => mode,
                };
                vec![self.connect_reply.unwrap_or(requested)]
            }
            0x05 => self.transfer(payload),
            0x06 => self.transfer_block(payload),
            0x08 => {
                let abort: u32 = payload.pread_with(1, LE).unwrap_or(0);
                self.abort_writes.push(abort);
                vec![status]
            }
            0x0A => vec![status, u8::from(self.reset_implemented)],
            0x11 => {
                self.swj_clock = payload.pread_with(0, LE).ok();
                vec![status]
            }
            0x12 => {
                let bytes = match payload[0] {
                    0 => 32,
                    bits => usize::from(bits).div_ceil(8),
                };
                self.swj_sequences.push(payload[1..1 + bytes].to_vec());
                vec![status]
            }
            // HostStatus, Disconnect, TransferConfigure, Delay and SWD_Configure.
            _ => vec![status],
        };

        let id = if self.corrupt_next_response {
            self.corrupt_next_response = false;
            command ^ 0x80
        } else {
            command
        };
        response.insert(0, id);

        if response.len() < self.packet_size {
            response.resize(self.packet_size, 0);
        }
        response
    }

    fn info(&self, payload: &[u8]) -> Vec<u8> {
        let string = |s: &str| {
            let mut bytes = vec![s.len() as u8 + 1];
            bytes.extend_from_slice(s.as_bytes());
            bytes.push(0);
            bytes
        };

        match payload[0] {
            0x01 => string("Mock"),
            0x02 => string("CMSIS-DAP Mock"),
            0x03 => string("0001"),
            0x04 => string("2.1.0"),
            0xF0 => vec![1, 0x13],
            0xFE => vec![1, 1],
            0xFF => {
                let size = self.packet_size as u16;
                let mut bytes = vec![2];
                bytes.extend_from_slice(&size.to_le_bytes());
                bytes
            }
            _ => vec![0],
        }
    }

    fn transfer(&mut self, payload: &[u8]) -> Vec<u8> {
        self.transfer_packets += 1;
        let count = payload[1];

        if let Some(status) = self.transfer_status.pop_front() {
            return vec![count, status];
        }

        let executed = match self.transfer_count_override.take() {
            Some(limit) => limit.min(count),
            None => count,
        };

        let mut data = Vec::new();
        let mut offset = 2;
        for _ in 0..executed {
            let request = payload[offset];
            offset += 1;

            if request & 0x02 != 0 {
                let value = self.read_register(request);
                data.extend_from_slice(&value.to_le_bytes());
            } else {
                let value: u32 = payload.pread_with(offset, LE).unwrap_or(0);
                offset += 4;
                self.write_register(request, value);
            }
        }

        let mut response = vec![executed, 0x01];
        if executed == count {
            response.extend(data);
        }
        response
    }

    fn transfer_block(&mut self, payload: &[u8]) -> Vec<u8> {
        let count: u16 = payload.pread_with(1, LE).unwrap_or(0);
        let request = payload[3];

        let mut response = count.to_le_bytes().to_vec();
        if let Some(status) = self.transfer_status.pop_front() {
            response.push(status);
            return response;
        }
        response.push(0x01);

        let read = request & 0x02 != 0;
        if request & 0x0D == 0x0D {
            self.block_transfers.push(BlockTransfer {
                address: self.tar,
                count: usize::from(count),
                write: !read,
            });
        }

        for i in 0..usize::from(count) {
            if read {
                let value = self.read_register(request);
                response.extend_from_slice(&value.to_le_bytes());
            } else {
                let value: u32 = payload.pread_with(4 + 4 * i, LE).unwrap_or(0);
                self.write_register(request, value);
            }
        }
        response
    }

    fn ap_address(&self, request: u8) -> u32 {
        (self.select & 0xFF00_0000) | (self.select & 0xF0) | u32::from(request & 0x0C)
    }

    fn read_register(&mut self, request: u8) -> u32 {
        let register = request & 0x0C;

        if request & 0x01 == 0 {
            return match register {
                0x0 => {
                    self.dpidr_reads += 1;
                    DPIDR
                }
                0x4 if self.power_up_ack => CTRL_STAT_POWERED,
                0x4 => self.ctrl_stat,
                0x8 => self.select,
                _ => 0,
            };
        }

        match self.ap_address(request) & 0xFF {
            0x00 => self.csw,
            0x04 => self.tar,
            0x0C => {
                let value = self.read_bus(self.tar & !0x3);
                self.increment_tar();
                value
            }
            0xFC => AP_IDR,
            _ => 0,
        }
    }

    fn write_register(&mut self, request: u8, value: u32) {
        let register = request & 0x0C;

        if request & 0x01 == 0 {
            self.dp_writes.push((register, value));
            match register {
                0x4 => self.ctrl_stat = value,
                0x8 => self.select = value,
                _ => {}
            }
            return;
        }

        let address = self.ap_address(request);
        self.ap_writes.push((address, value));
        match address & 0xFF {
            0x00 => self.csw = value,
            0x04 => self.tar = value,
            0x0C => {
                self.write_bus(value);
                self.increment_tar();
            }
            _ => {}
        }
    }

    fn access_size(&self) -> u32 {
        match self.csw & 0x7 {
            0 => 1,
            1 => 2,
            _ => 4,
        }
    }

    /// Single increments wrap inside a 1 KiB page.
    fn increment_tar(&mut self) {
        if self.csw & 0x30 == 0x10 {
            let next = (self.tar & 0x3FF) + self.access_size();
            self.tar = (self.tar & !0x3FF) | (next & 0x3FF);
        }
    }

    fn read_bus(&mut self, address: u32) -> u32 {
        match address {
            DHCSR => self.core.read_dhcsr(),
            DCRDR => self.core.dcrdr,
            DEMCR => self.core.demcr,
            FP_CTRL => self.core.fp_ctrl | u32::from(self.core.fpb_enabled),
            _ => self.read_word(address),
        }
    }

    fn write_bus(&mut self, value: u32) {
        let address = self.tar;
        match self.access_size() {
            1 => {
                let byte = (value >> ((address & 0x3) * 8)) as u8;
                self.write_memory(address, &[byte]);
            }
            2 => {
                let address = address & !0x1;
                let half = (value >> ((address & 0x2) * 8)) as u16;
                self.write_memory(address, &half.to_le_bytes());
            }
            _ => self.write_word(address & !0x3, value),
        }
    }

    fn write_word(&mut self, address: u32, value: u32) {
        match address {
            DHCSR => self.core.write_dhcsr(value),
            DCRSR => self.core.write_dcrsr(value),
            DCRDR => self.core.dcrdr = value,
            DEMCR => self.core.demcr = value,
            DFSR => self.core.dfsr_writes.push(value),
            AIRCR => {
                if value >> 16 == 0x05FA && value & 0x4 != 0 {
                    self.core.system_reset();
                }
            }
            FP_CTRL => {
                self.core.fp_ctrl_writes.push(value);
                if value & 0x2 != 0 {
                    self.core.fpb_enabled = value & 0x1 != 0;
                }
            }
            _ => self.write_memory(address, &value.to_le_bytes()),
        }
    }
}

/// A shared handle on a [`MockState`], usable as a [`Transport`].
#[derive(Debug, Clone)]
pub struct MockProbe {
    state: Arc<Mutex<MockState>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::with_packet_size(64)
    }

    pub fn with_packet_size(packet_size: usize) -> Self {
        MockProbe {
            state: Arc::new(Mutex::new(MockState::new(packet_size))),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MockProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockProbe {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.fail_open {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound).into());
        }
        state.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.state().open = false;
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        self.state().response.take().ok_or(TransportError::Timeout)
    }

    fn write(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.open {
            return Err(TransportError::Closed);
        }
        if packet.len() != state.packet_size {
            return Err(TransportError::PacketSize {
                expected: state.packet_size,
                actual: packet.len(),
            });
        }

        state.last_packet = Some(packet.to_vec());
        let response = state.handle(packet);
        state.response = Some(response);
        Ok(())
    }

    fn packet_size(&self) -> usize {
        self.state().packet_size
    }
}
