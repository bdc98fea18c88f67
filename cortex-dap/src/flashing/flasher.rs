use std::time::Duration;

use super::{FlashAlgorithm, FlashError};
use crate::architecture::arm::{CoreRegister, CortexM};
use crate::probe::DapProxy;

/// How long the core may take to stop before a routine is called.
const HALT_TIMEOUT: Duration = Duration::from_secs(2);

/// The function code passed to `Init()` and `UnInit()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Erase = 1,
    Program = 2,
    Verify = 3,
}

/// Runs the routines of a [`FlashAlgorithm`] on a Cortex-M core.
///
/// The algorithm is uploaded on first use.
#[derive(Debug)]
pub struct Flasher<'core, P> {
    core: &'core mut CortexM<P>,
    algorithm: FlashAlgorithm,
    loaded: bool,
}

impl<'core, P: DapProxy> Flasher<'core, P> {
    pub fn new(core: &'core mut CortexM<P>, algorithm: FlashAlgorithm) -> Result<Self, FlashError> {
        algorithm.validate()?;
        Ok(Flasher {
            core,
            algorithm,
            loaded: false,
        })
    }

    pub fn algorithm(&self) -> &FlashAlgorithm {
        &self.algorithm
    }

    /// Copy the algorithm into RAM and read it back.
    #[tracing::instrument(skip(self), fields(name = %self.algorithm.name))]
    pub fn load(&mut self) -> Result<(), FlashError> {
        let algo = &self.algorithm;
        tracing::debug!(
            "Loading {} words of flash algorithm to {:#010x}",
            algo.instructions.len(),
            algo.load_address
        );

        self.core.halt(true, Some(HALT_TIMEOUT))?;

        let adi = self.core.adi();
        adi.write_block(algo.load_address, &algo.instructions)?;
        let read_back = adi.read_block(algo.load_address, algo.instructions.len())?;

        if read_back != algo.instructions {
            tracing::error!("Failed to verify flash algorithm. Data mismatch.");
            return Err(FlashError::FlashAlgorithmNotLoaded);
        }

        self.loaded = true;
        Ok(())
    }

    /// Call the routine at `pc`, failing unless it returns zero.
    fn call(&mut self, name: &'static str, pc: u32, arguments: &[u32]) -> Result<(), FlashError> {
        if !self.loaded {
            self.load()?;
        }
        tracing::debug!("Calling {} at {:#010x} with {:x?}", name, pc, arguments);

        let algo = &self.algorithm;
        self.core.halt(true, Some(HALT_TIMEOUT))?;
        self.core
            .write_core_register(CoreRegister::R9, algo.static_base)?;

        let result =
            self.core
                .run_function(pc, algo.begin_stack, algo.return_address(), arguments)?;

        if result != 0 {
            return Err(FlashError::RoutineFailed {
                name,
                error_code: result,
            });
        }
        Ok(())
    }

    /// Run `Init()` for `operation`, if the algorithm has one.
    #[tracing::instrument(name = "Call to flash algorithm init", skip(self))]
    pub fn init(&mut self, address: u32, clock: u32, operation: Operation) -> Result<(), FlashError> {
        match self.algorithm.pc_init {
            Some(pc) => self.call("init", pc, &[address, clock, operation as u32]),
            None => Ok(()),
        }
    }

    /// Run `UnInit()` for `operation`, if the algorithm has one.
    pub fn uninit(&mut self, operation: Operation) -> Result<(), FlashError> {
        tracing::debug!("Running uninit routine.");
        match self.algorithm.pc_uninit {
            Some(pc) => self.call("uninit", pc, &[operation as u32]),
            None => Ok(()),
        }
    }

    pub fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        let pc = self.algorithm.pc_erase_sector;
        self.call("erase_sector", pc, &[address])
    }

    /// Erase the whole chip, if the algorithm supports it.
    pub fn erase_all(&mut self) -> Result<(), FlashError> {
        let pc = self
            .algorithm
            .pc_erase_all
            .ok_or(FlashError::RoutineNotSupported("erase_all"))?;

        let start = self.algorithm.flash_properties.address_range.start;
        self.init(start, 0, Operation::Erase)?;
        self.call("erase_all", pc, &[])?;
        self.uninit(Operation::Erase)
    }

    /// Program one page at `address`. Short data is padded with the erased value.
    pub fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let props = &self.algorithm.flash_properties;
        let page_size = props.page_size;
        if data.len() > page_size as usize {
            return Err(FlashError::PageTooLarge {
                size: data.len(),
                page_size,
            });
        }

        let mut page = vec![props.erased_byte_value; page_size as usize];
        page[..data.len()].copy_from_slice(data);

        let buffer = self.algorithm.page_buffer;
        self.core.adi().write_bytes(buffer, &page)?;

        let pc = self.algorithm.pc_program_page;
        self.call("program_page", pc, &[address, page_size, buffer])
    }

    fn check_range(&self, start: u32, len: usize) -> Result<u32, FlashError> {
        let flash = &self.algorithm.flash_properties.address_range;
        let end = u32::try_from(len)
            .ok()
            .and_then(|len| start.checked_add(len))
            .ok_or(FlashError::AddressNotInFlash {
                start,
                end: u32::MAX,
            })?;

        if start < flash.start || end > flash.end {
            return Err(FlashError::AddressNotInFlash { start, end });
        }
        Ok(end)
    }

    /// Erase every sector touched by `len` bytes at `address`.
    pub fn erase(&mut self, address: u32, len: usize) -> Result<(), FlashError> {
        let end = self.check_range(address, len)?;
        let sectors = self.algorithm.sectors_in(address..end);
        if sectors.is_empty() {
            return Ok(());
        }

        self.init(address, 0, Operation::Erase)?;
        for sector in sectors {
            tracing::debug!("Erasing sector at {:#010x}", sector);
            self.erase_sector(sector)?;
        }
        self.uninit(Operation::Erase)
    }

    /// Erase and program `data` at `address`.
    ///
    /// `progress` is called with `0.0` before the first page and with the
    /// fraction of programmed pages after each page, ending with `1.0`.
    #[tracing::instrument(skip(self, data, progress), fields(len = data.len()))]
    pub fn program(
        &mut self,
        address: u32,
        data: &[u8],
        mut progress: impl FnMut(f32),
    ) -> Result<(), FlashError> {
        let end = self.check_range(address, data.len())?;
        progress(0.0);

        if data.is_empty() {
            progress(1.0);
            return Ok(());
        }

        self.erase(address, data.len())?;

        let page_size = self.algorithm.flash_properties.page_size;
        let first_page = address - address % page_size;
        let pages: Vec<u32> = (first_page..end).step_by(page_size as usize).collect();

        self.init(address, 0, Operation::Program)?;
        for (index, &page) in pages.iter().enumerate() {
            let erased = self.algorithm.flash_properties.erased_byte_value;
            let mut buffer = vec![erased; page_size as usize];

            // Copy the part of `data` that falls into this page.
            let from = page.max(address);
            let to = page.saturating_add(page_size).min(end);
            let source = (from - address) as usize..(to - address) as usize;
            let target = (from - page) as usize..(to - page) as usize;
            buffer[target].copy_from_slice(&data[source]);

            self.program_page(page, &buffer)?;
            progress((index + 1) as f32 / pages.len() as f32);
        }
        self.uninit(Operation::Program)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::architecture::arm::Adi;
    use crate::config::DapConfig;
    use crate::flashing::FlashProperties;
    use crate::probe::cmsisdap::CmsisDap;
    use crate::probe::mock::MockProbe;

    const INIT: u32 = 0x2000_0005;
    const UNINIT: u32 = 0x2000_0009;
    const ERASE_SECTOR: u32 = 0x2000_000D;
    const PROGRAM_PAGE: u32 = 0x2000_0011;
    const PAGE_BUFFER: u32 = 0x2000_0800;

    fn algorithm() -> FlashAlgorithm {
        FlashAlgorithm {
            name: "mock".to_owned(),
            load_address: 0x2000_0000,
            instructions: vec![0xE7FE_BE00, 0x4770_2000, 0x4770_2000, 0x4770_2000, 0x4770_2000],
            pc_init: Some(INIT),
            pc_uninit: Some(UNINIT),
            pc_program_page: PROGRAM_PAGE,
            pc_erase_sector: ERASE_SECTOR,
            pc_erase_all: None,
            static_base: 0x2000_0400,
            begin_stack: 0x2000_1000,
            page_buffer: PAGE_BUFFER,
            flash_properties: FlashProperties {
                address_range: 0x0800_0000..0x0801_0000,
                page_size: 0x100,
                sector_size: 0x400,
                erased_byte_value: 0xFF,
            },
        }
    }

    fn core_with(mock: &MockProbe) -> CortexM<CmsisDap> {
        let config = DapConfig {
            poll_interval_ms: 1,
            execute_timeout_ms: 200,
            ..Default::default()
        };
        let adi = Adi::new(CmsisDap::new(mock.clone(), &config), &config).unwrap();
        let mut core = CortexM::new(adi, &config);
        core.connect().unwrap();
        core
    }

    #[test]
    fn load_uploads_instructions() {
        let mock = MockProbe::new();
        let mut core = core_with(&mock);
        let mut flasher = Flasher::new(&mut core, algorithm()).unwrap();

        flasher.load().unwrap();
        assert_eq!(mock.state().read_word(0x2000_0000), 0xE7FE_BE00);
        assert_eq!(mock.state().read_word(0x2000_0010), 0x4770_2000);
    }

    #[test]
    fn program_calls_routines_in_order() {
        let mock = MockProbe::new();
        mock.state().core.resume_result = Some(0);
        let mut core = core_with(&mock);
        let mut flasher = Flasher::new(&mut core, algorithm()).unwrap();

        let data: Vec<u8> = (0..0x200u32).map(|i| i as u8).collect();
        let mut reported = Vec::new();
        flasher
            .program(0x0800_0080, &data, |value| reported.push(value))
            .unwrap();

        let state = mock.state();
        assert_eq!(
            state.core.runs,
            vec![
                INIT,
                ERASE_SECTOR,
                UNINIT,
                INIT,
                PROGRAM_PAGE,
                PROGRAM_PAGE,
                PROGRAM_PAGE,
                UNINIT
            ]
        );
        assert_eq!(reported.first(), Some(&0.0));
        assert_eq!(reported.last(), Some(&1.0));
        assert_eq!(reported.len(), 4);

        // R9 holds the static base, the last page is padded with the erased value.
        assert_eq!(state.core.registers[9], 0x2000_0400);
        let page = state.read_memory(PAGE_BUFFER, 0x100);
        assert_eq!(&page[..0x80], &data[0x180..]);
        assert!(page[0x80..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn failing_routine_is_reported() {
        let mock = MockProbe::new();
        mock.state().core.resume_result = Some(1);
        let mut core = core_with(&mock);
        let mut flasher = Flasher::new(&mut core, algorithm()).unwrap();

        let error = flasher.program(0x0800_0000, &[0; 4], |_| {}).unwrap_err();
        assert!(matches!(
            error,
            FlashError::RoutineFailed {
                name: "init",
                error_code: 1
            }
        ));
    }

    #[test]
    fn erase_all_needs_an_entry_point() {
        let mock = MockProbe::new();
        let mut core = core_with(&mock);
        let mut flasher = Flasher::new(&mut core, algorithm()).unwrap();

        assert!(matches!(
            flasher.erase_all(),
            Err(FlashError::RoutineNotSupported("erase_all"))
        ));
    }

    #[test]
    fn data_outside_flash_is_rejected() {
        let mock = MockProbe::new();
        let mut core = core_with(&mock);
        let mut flasher = Flasher::new(&mut core, algorithm()).unwrap();

        assert!(matches!(
            flasher.program(0x0800_FF00, &[0; 0x200], |_| {}),
            Err(FlashError::AddressNotInFlash {
                start: 0x0800_FF00,
                end: 0x0801_0100
            })
        ));
        assert!(mock.state().core.runs.is_empty());
    }

    #[test]
    fn oversized_page_is_rejected() {
        let mock = MockProbe::new();
        let mut core = core_with(&mock);
        let mut flasher = Flasher::new(&mut core, algorithm()).unwrap();

        assert!(matches!(
            flasher.program_page(0x0800_0000, &[0; 0x101]),
            Err(FlashError::PageTooLarge {
                size: 0x101,
                page_size: 0x100
            })
        ));
    }
}
