use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::FlashError;

/// Layout of the flash a [`FlashAlgorithm`] programs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashProperties {
    /// Addresses covered by the flash.
    pub address_range: Range<u32>,
    /// Bytes written by one call to `ProgramPage()`.
    pub page_size: u32,
    /// Bytes cleared by one call to `EraseSector()`. All sectors have the same size.
    pub sector_size: u32,
    /// The value of an erased byte.
    #[serde(default = "default_erased_byte_value")]
    pub erased_byte_value: u8,
}

fn default_erased_byte_value() -> u8 {
    0xFF
}

/// A flash algorithm blob, assembled for one chip.
///
/// The blob is copied to `load_address` and its entry points follow the CMSIS
/// flash algorithm calling convention: arguments in R0 to R3, the static base
/// in R9 and the result in R0, where anything but zero is a failure. The first
/// instruction at `load_address` has to be a breakpoint, it is the return
/// address of every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashAlgorithm {
    pub name: String,
    /// Memory address where the instructions will be loaded to.
    pub load_address: u32,
    /// The position-independent code of the algorithm.
    pub instructions: Vec<u32>,
    /// Address of the `Init()` entry point. Optional.
    #[serde(default)]
    pub pc_init: Option<u32>,
    /// Address of the `UnInit()` entry point. Optional.
    #[serde(default)]
    pub pc_uninit: Option<u32>,
    /// Address of the `ProgramPage()` entry point.
    pub pc_program_page: u32,
    /// Address of the `EraseSector()` entry point.
    pub pc_erase_sector: u32,
    /// Address of the `EraseAll()` entry point. Optional.
    #[serde(default)]
    pub pc_erase_all: Option<u32>,
    /// Initial value of R9, where the position-independent data resides.
    pub static_base: u32,
    /// Initial value of the stack pointer for every call.
    pub begin_stack: u32,
    /// RAM buffer holding the data for `ProgramPage()`, at least one page long.
    pub page_buffer: u32,
    pub flash_properties: FlashProperties,
}

impl FlashAlgorithm {
    /// Parse an algorithm description from YAML and check it for consistency.
    pub fn from_yaml(yaml: &str) -> Result<Self, FlashError> {
        let algorithm: FlashAlgorithm = serde_yaml::from_str(yaml)?;
        algorithm.validate()?;
        Ok(algorithm)
    }

    pub fn validate(&self) -> Result<(), FlashError> {
        let invalid = |reason: &str| {
            Err(FlashError::InvalidAlgorithm {
                name: self.name.clone(),
                reason: reason.to_owned(),
            })
        };

        let props = &self.flash_properties;
        if self.instructions.is_empty() {
            return invalid("no instructions");
        }
        if self.load_address % 4 != 0 {
            return invalid("load address is not word aligned");
        }
        if props.page_size == 0 || props.sector_size == 0 {
            return invalid("page and sector size must not be zero");
        }
        if props.sector_size % props.page_size != 0 {
            return invalid("sector size is not a multiple of the page size");
        }
        if props.address_range.is_empty() {
            return invalid("flash address range is empty");
        }
        if props.address_range.start % props.sector_size != 0 {
            return invalid("flash does not start on a sector boundary");
        }
        Ok(())
    }

    /// The address execution returns to, with the Thumb bit set.
    pub fn return_address(&self) -> u32 {
        self.load_address | 1
    }

    /// Base address of the sector containing `address`, if it is in flash.
    pub fn sector_address(&self, address: u32) -> Option<u32> {
        let props = &self.flash_properties;
        if !props.address_range.contains(&address) {
            tracing::trace!("Address {:08x} not contained in this flash device", address);
            return None;
        }
        let offset = address - props.address_range.start;
        Some(props.address_range.start + offset - offset % props.sector_size)
    }

    /// Base address of the page containing `address`, if it is in flash.
    pub fn page_address(&self, address: u32) -> Option<u32> {
        let props = &self.flash_properties;
        if !props.address_range.contains(&address) {
            return None;
        }
        Some(address - address % props.page_size)
    }

    /// Base addresses of all sectors touched by `range`.
    pub fn sectors_in(&self, range: Range<u32>) -> Vec<u32> {
        let sector_size = self.flash_properties.sector_size;
        let mut sectors = Vec::new();

        let mut address = match self.sector_address(range.start) {
            Some(address) => address,
            None => return sectors,
        };
        while address < range.end && self.flash_properties.address_range.contains(&address) {
            sectors.push(address);
            address = match address.checked_add(sector_size) {
                Some(next) => next,
                None => break,
            };
        }
        sectors
    }
}
