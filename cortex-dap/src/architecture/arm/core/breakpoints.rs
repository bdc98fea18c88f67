//! Hardware breakpoints through the FPB and software breakpoints in RAM.

use std::collections::{BTreeMap, VecDeque};

use super::registers::{FpCompX, FpCtrl, MemoryMappedRegister};
use crate::architecture::arm::{Adi, ArmError};
use crate::probe::DapProxy;

/// The BKPT instruction written over software breakpoints.
pub const BKPT_OPCODE: u16 = 0xBE2A;

/// FPB comparators only match addresses below the end of the code region.
const CODE_REGION_END: u32 = 0x2000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breakpoint {
    /// An FPB comparator at `register` matching `address`.
    Hardware { register: u32, address: u32 },
    /// A BKPT instruction at `address`, replacing `instruction`.
    Software { address: u32, instruction: u16 },
    /// A breakpoint that is remembered but not installed.
    Disabled { address: u32 },
}

impl Breakpoint {
    pub fn address(&self) -> u32 {
        match *self {
            Breakpoint::Hardware { address, .. }
            | Breakpoint::Software { address, .. }
            | Breakpoint::Disabled { address } => address,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Breakpoint::Disabled { .. })
    }
}

/// Bookkeeping of comparators and installed breakpoints.
#[derive(Debug, Default)]
pub(crate) struct BreakpointUnit {
    free_comparators: VecDeque<u32>,
    fpb_enabled: bool,
    breakpoints: BTreeMap<u32, Breakpoint>,
}

impl BreakpointUnit {
    /// Discover the comparators and switch the FPB off.
    ///
    /// Breakpoints known from before are forgotten without being removed.
    pub(crate) fn init<P: DapProxy>(&mut self, adi: &mut Adi<P>) -> Result<(), ArmError> {
        let fp_ctrl = FpCtrl::from(adi.read_mem32(FpCtrl::ADDRESS)?);
        let num_code = fp_ctrl.num_code();
        tracing::debug!("FPB has {} code comparators", num_code);

        adi.write_mem32(FpCtrl::ADDRESS, FpCtrl::with_enable(false).into())?;

        self.fpb_enabled = false;
        self.breakpoints.clear();
        self.free_comparators = (0..num_code).map(|i| FpCompX::COMP0 + 4 * i).collect();

        Ok(())
    }

    pub(crate) fn available_comparators(&self) -> usize {
        self.free_comparators.len()
    }

    pub(crate) fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub(crate) fn get(&self, address: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&address)
    }

    /// Install a breakpoint at `address`, or re-enable a disabled one.
    pub(crate) fn set<P: DapProxy>(
        &mut self,
        adi: &mut Adi<P>,
        address: u32,
    ) -> Result<Breakpoint, ArmError> {
        if let Some(existing) = self.breakpoints.get(&address) {
            if existing.is_enabled() {
                return Ok(*existing);
            }
        }

        let breakpoint = self.install(adi, address)?;
        self.breakpoints.insert(address, breakpoint);
        Ok(breakpoint)
    }

    pub(crate) fn delete<P: DapProxy>(
        &mut self,
        adi: &mut Adi<P>,
        address: u32,
    ) -> Result<(), ArmError> {
        let breakpoint = self
            .breakpoints
            .get(&address)
            .copied()
            .ok_or(ArmError::BreakpointNotFound(address))?;

        self.uninstall(adi, breakpoint)?;
        self.breakpoints.remove(&address);
        Ok(())
    }

    /// Remove a breakpoint from the target but keep it for [`BreakpointUnit::set`].
    pub(crate) fn disable<P: DapProxy>(
        &mut self,
        adi: &mut Adi<P>,
        address: u32,
    ) -> Result<(), ArmError> {
        let breakpoint = self
            .breakpoints
            .get(&address)
            .copied()
            .ok_or(ArmError::BreakpointNotFound(address))?;

        self.uninstall(adi, breakpoint)?;
        self.breakpoints
            .insert(address, Breakpoint::Disabled { address });
        Ok(())
    }

    pub(crate) fn enable<P: DapProxy>(
        &mut self,
        adi: &mut Adi<P>,
        address: u32,
    ) -> Result<Breakpoint, ArmError> {
        if !self.breakpoints.contains_key(&address) {
            return Err(ArmError::BreakpointNotFound(address));
        }
        self.set(adi, address)
    }

    pub(crate) fn clear<P: DapProxy>(&mut self, adi: &mut Adi<P>) -> Result<(), ArmError> {
        let addresses: Vec<u32> = self.breakpoints.keys().copied().collect();
        for address in addresses {
            self.delete(adi, address)?;
        }
        Ok(())
    }

    fn install<P: DapProxy>(&mut self, adi: &mut Adi<P>, address: u32) -> Result<Breakpoint, ArmError> {
        if address < CODE_REGION_END {
            if let Some(register) = self.free_comparators.pop_front() {
                if !self.fpb_enabled {
                    if let Err(error) = adi.write_mem32(FpCtrl::ADDRESS, FpCtrl::with_enable(true).into()) {
                        self.free_comparators.push_front(register);
                        return Err(error);
                    }
                    self.fpb_enabled = true;
                }

                let value = FpCompX::breakpoint_configuration(address);
                tracing::debug!("Hardware breakpoint at {:#010x} in {:#010x}", address, register);
                if let Err(error) = adi.write_mem32(register, value.into()) {
                    self.free_comparators.push_front(register);
                    return Err(error);
                }

                return Ok(Breakpoint::Hardware { register, address });
            }
        }

        if address & 0x1 != 0 {
            return Err(ArmError::MemoryNotAligned {
                address,
                alignment: 2,
            });
        }

        let instruction = adi.read_mem16(address)?;
        adi.write_mem16(address, BKPT_OPCODE)?;
        tracing::debug!(
            "Software breakpoint at {:#010x}, saved instruction {:#06x}",
            address,
            instruction
        );

        Ok(Breakpoint::Software {
            address,
            instruction,
        })
    }

    fn uninstall<P: DapProxy>(&mut self, adi: &mut Adi<P>, breakpoint: Breakpoint) -> Result<(), ArmError> {
        match breakpoint {
            Breakpoint::Hardware { register, .. } => {
                adi.write_mem32(register, 0)?;
                self.free_comparators.push_back(register);
            }
            Breakpoint::Software {
                address,
                instruction,
            } => {
                adi.write_mem16(address, instruction)?;
            }
            Breakpoint::Disabled { .. } => {}
        }
        Ok(())
    }
}
