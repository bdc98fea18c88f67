//! Memory access through the MEM-AP.

use std::thread;
use std::time::Duration;

use super::adi::{first_read, Adi};
use super::ap::{ApRegister, Csw, DataSize, Drw, Tar};
use super::ArmError;
use crate::probe::{DapOperation, DapProxy, PortType};

/// Pause before a WAIT answered memory access is tried again.
const WAIT_RETRY_DELAY: Duration = Duration::from_millis(100);

impl<P: DapProxy> Adi<P> {
    fn csw_ops(&mut self, size: DataSize) -> Vec<DapOperation> {
        let register = Csw::address(self.memory_ap);
        self.write_ap_ops(register, Csw::for_size(size).into())
    }

    fn tar_ops(&mut self, address: u32) -> Vec<DapOperation> {
        let register = Tar::address(self.memory_ap);
        self.write_ap_ops(register, address)
    }

    /// Operations reading the bus word at `address` with an access of `size`.
    pub fn read_mem_ops(&mut self, address: u32, size: DataSize) -> Vec<DapOperation> {
        let mut operations = self.csw_ops(size);
        operations.extend(self.tar_ops(address));
        operations.extend(self.read_ap_ops(Drw::address(self.memory_ap)));
        operations
    }

    /// Operations writing `value`, already shifted into its byte lane, to `address`.
    pub fn write_mem_ops(&mut self, address: u32, value: u32, size: DataSize) -> Vec<DapOperation> {
        let mut operations = self.csw_ops(size);
        operations.extend(self.tar_ops(address));
        operations.extend(self.write_ap_ops(Drw::address(self.memory_ap), value));
        operations
    }

    pub fn read_mem32_ops(&mut self, address: u32) -> Vec<DapOperation> {
        self.read_mem_ops(address, DataSize::U32)
    }

    pub fn write_mem32_ops(&mut self, address: u32, value: u32) -> Vec<DapOperation> {
        self.write_mem_ops(address, value, DataSize::U32)
    }

    /// Run a single memory access, repeating it while the target answers WAIT.
    fn retry_on_wait<T>(
        &mut self,
        mut access: impl FnMut(&mut Self) -> Result<T, ArmError>,
    ) -> Result<T, ArmError> {
        let mut retries = 0;
        loop {
            match access(self) {
                Err(error) if error.is_wait() && retries < self.memory_wait_retries => {
                    retries += 1;
                    tracing::debug!(
                        "Memory access answered with WAIT, retry {} of {}",
                        retries,
                        self.memory_wait_retries
                    );
                    thread::sleep(WAIT_RETRY_DELAY);
                }
                result => return result,
            }
        }
    }

    fn read_lane(&mut self, address: u32, size: DataSize) -> Result<u32, ArmError> {
        self.retry_on_wait(|adi| {
            let operations = adi.read_mem_ops(address, size);
            first_read(adi.transfer_sequence(vec![operations])?)
        })
    }

    fn write_lane(&mut self, address: u32, value: u32, size: DataSize) -> Result<(), ArmError> {
        self.retry_on_wait(|adi| {
            let operations = adi.write_mem_ops(address, value, size);
            adi.transfer_sequence(vec![operations])?;
            Ok(())
        })
    }

    #[tracing::instrument(skip(self))]
    pub fn read_mem32(&mut self, address: u32) -> Result<u32, ArmError> {
        check_alignment(address, 4)?;
        self.read_lane(address, DataSize::U32)
    }

    #[tracing::instrument(skip(self))]
    pub fn read_mem16(&mut self, address: u32) -> Result<u16, ArmError> {
        check_alignment(address, 2)?;
        let word = self.read_lane(address, DataSize::U16)?;
        Ok((word >> ((address & 0x02) << 3)) as u16)
    }

    #[tracing::instrument(skip(self))]
    pub fn read_mem8(&mut self, address: u32) -> Result<u8, ArmError> {
        let word = self.read_lane(address, DataSize::U8)?;
        Ok((word >> ((address & 0x03) << 3)) as u8)
    }

    #[tracing::instrument(skip(self))]
    pub fn write_mem32(&mut self, address: u32, value: u32) -> Result<(), ArmError> {
        check_alignment(address, 4)?;
        self.write_lane(address, value, DataSize::U32)
    }

    #[tracing::instrument(skip(self))]
    pub fn write_mem16(&mut self, address: u32, value: u16) -> Result<(), ArmError> {
        check_alignment(address, 2)?;
        let lane = u32::from(value) << ((address & 0x02) << 3);
        self.write_lane(address, lane, DataSize::U16)
    }

    #[tracing::instrument(skip(self))]
    pub fn write_mem8(&mut self, address: u32, value: u8) -> Result<(), ArmError> {
        let lane = u32::from(value) << ((address & 0x03) << 3);
        self.write_lane(address, lane, DataSize::U8)
    }

    /// Number of words from `address` up to the next auto-increment boundary.
    fn words_to_page_end(&self, address: u32) -> usize {
        ((self.page_size - (address % self.page_size)) / 4) as usize
    }

    /// Point CSW and TAR at `address` for word sized auto-incrementing access.
    fn start_block(&mut self, address: u32) -> Result<(), ArmError> {
        let csw = self.csw_ops(DataSize::U32);
        let tar = self.tar_ops(address);
        self.transfer_sequence(vec![csw, tar])?;
        Ok(())
    }

    /// Read `count` words starting at the word aligned `address`.
    ///
    /// TAR only auto-increments within a page, so the range is split at page
    /// boundaries first and each page is then read in blocks the probe can carry.
    #[tracing::instrument(skip(self))]
    pub fn read_block(&mut self, address: u32, count: usize) -> Result<Vec<u32>, ArmError> {
        check_alignment(address, 4)?;

        let block_size = self.proxy().block_size().max(1);
        let drw = Drw::ADDRESS;

        let mut values = Vec::with_capacity(count);
        let mut address = address;
        let mut remaining = count;

        while remaining > 0 {
            let page_words = remaining.min(self.words_to_page_end(address));
            tracing::debug!("Reading {} words at {:#010x}", page_words, address);
            self.start_block(address)?;

            let mut page_remaining = page_words;
            while page_remaining > 0 {
                let chunk = page_remaining.min(block_size);
                let words =
                    self.dispatch(|proxy| proxy.transfer_block_read(PortType::AccessPort, drw, chunk))?;
                values.extend(words);
                page_remaining -= chunk;
            }

            address = address.wrapping_add(page_words as u32 * 4);
            remaining -= page_words;
        }

        Ok(values)
    }

    /// Write `data` starting at the word aligned `address`, split like [`Adi::read_block`].
    #[tracing::instrument(skip(self, data), fields(count = data.len()))]
    pub fn write_block(&mut self, address: u32, data: &[u32]) -> Result<(), ArmError> {
        check_alignment(address, 4)?;

        let block_size = self.proxy().block_size().max(1);
        let drw = Drw::ADDRESS;

        let mut address = address;
        let mut data = data;

        while !data.is_empty() {
            let page_words = data.len().min(self.words_to_page_end(address));
            let (page, rest) = data.split_at(page_words);
            tracing::debug!("Writing {} words at {:#010x}", page_words, address);
            self.start_block(address)?;

            for chunk in page.chunks(block_size) {
                self.dispatch(|proxy| proxy.transfer_block_write(PortType::AccessPort, drw, chunk))?;
            }

            address = address.wrapping_add(page_words as u32 * 4);
            data = rest;
        }

        Ok(())
    }

    /// Read `len` bytes starting at any address.
    pub fn read_bytes(&mut self, address: u32, len: usize) -> Result<Vec<u8>, ArmError> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let start = address & !0x3;
        let end = (u64::from(address) + len as u64 + 3) & !0x3;
        let words = ((end - u64::from(start)) / 4) as usize;

        let offset = (address - start) as usize;
        let bytes: Vec<u8> = self
            .read_block(start, words)?
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .skip(offset)
            .take(len)
            .collect();

        Ok(bytes)
    }

    /// Write `data` starting at any address.
    ///
    /// Unaligned head and tail bytes are written with byte and halfword
    /// accesses, everything in between as one word block.
    pub fn write_bytes(&mut self, address: u32, data: &[u8]) -> Result<(), ArmError> {
        let mut address = address;
        let mut data = data;

        if address & 0x1 != 0 {
            if let Some((&byte, rest)) = data.split_first() {
                self.write_mem8(address, byte)?;
                address = address.wrapping_add(1);
                data = rest;
            }
        }

        if address & 0x2 != 0 && data.len() >= 2 {
            self.write_mem16(address, u16::from_le_bytes([data[0], data[1]]))?;
            address = address.wrapping_add(2);
            data = &data[2..];
        }

        let bulk = data.len() / 4 * 4;
        if bulk > 0 {
            let words: Vec<u32> = data[..bulk]
                .chunks_exact(4)
                .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            self.write_block(address, &words)?;
            address = address.wrapping_add(bulk as u32);
            data = &data[bulk..];
        }

        if data.len() >= 2 {
            self.write_mem16(address, u16::from_le_bytes([data[0], data[1]]))?;
            address = address.wrapping_add(2);
            data = &data[2..];
        }

        if let Some(&byte) = data.first() {
            self.write_mem8(address, byte)?;
        }

        Ok(())
    }
}

fn check_alignment(address: u32, alignment: usize) -> Result<(), ArmError> {
    if address as usize % alignment != 0 {
        return Err(ArmError::MemoryNotAligned { address, alignment });
    }
    Ok(())
}
