//! Halt, resume, register access and code execution on a Cortex-M core.

use std::time::Duration;

use super::breakpoints::{Breakpoint, BreakpointUnit, BKPT_OPCODE};
use super::registers::{
    Aircr, Dcrdr, Dcrsr, Demcr, Dfsr, Dhcsr, MemoryMappedRegister,
};
use super::{CoreRegister, CoreState};
use crate::architecture::arm::{Adi, ArmError};
use crate::config::DapConfig;
use crate::probe::{DapOperation, DapProxy};

/// BKPT as a word, terminating code passed to [`CortexM::execute`].
pub const BKPT_WORD: u32 = BKPT_OPCODE as u32;

/// xPSR with only the Thumb bit set.
const XPSR_THUMB: u32 = 0x0100_0000;

/// At most this many registers, R0 upwards, can be preset for executed code.
pub const MAX_ARGUMENT_REGISTERS: usize = 12;

fn core_halted<P: DapProxy>(adi: &mut Adi<P>) -> Result<bool, ArmError> {
    let dhcsr = Dhcsr::from(adi.read_mem32(Dhcsr::ADDRESS)?);
    Ok(dhcsr.s_halt())
}

fn dcrsr_for(register: CoreRegister, write: bool) -> u32 {
    let mut dcrsr = Dcrsr(0);
    dcrsr.set_regsel(register.regsel());
    dcrsr.set_regwnr(write);
    dcrsr.into()
}

/// A Cortex-M core behind a memory AP.
#[derive(Debug)]
pub struct CortexM<P> {
    adi: Adi<P>,
    breakpoints: BreakpointUnit,
    timeout: Duration,
}

impl<P: DapProxy> CortexM<P> {
    pub fn new(adi: Adi<P>, config: &DapConfig) -> Self {
        CortexM {
            adi,
            breakpoints: BreakpointUnit::default(),
            timeout: config.execute_timeout(),
        }
    }

    pub fn adi(&mut self) -> &mut Adi<P> {
        &mut self.adi
    }

    pub fn into_adi(self) -> Adi<P> {
        self.adi
    }

    /// Connect through the ADI and take stock of the breakpoint unit.
    #[tracing::instrument(skip(self))]
    pub fn connect(&mut self) -> Result<(), ArmError> {
        self.adi.connect()?;
        self.breakpoints.init(&mut self.adi)
    }

    pub fn disconnect(&mut self) -> Result<(), ArmError> {
        self.adi.disconnect()
    }

    /// Current run state, see [`CoreState::from_dhcsr`].
    #[tracing::instrument(skip(self))]
    pub fn state(&mut self) -> Result<CoreState, ArmError> {
        let dhcsr = Dhcsr::from(self.adi.read_mem32(Dhcsr::ADDRESS)?);

        let reread = if dhcsr.s_reset_st() {
            Some(Dhcsr::from(self.adi.read_mem32(Dhcsr::ADDRESS)?))
        } else {
            None
        };

        Ok(CoreState::from_dhcsr(dhcsr, reread))
    }

    pub fn is_halted(&mut self) -> Result<bool, ArmError> {
        core_halted(&mut self.adi)
    }

    /// Block until the core halts, or fail with [`ArmError::WaitTimedOut`].
    pub fn wait_for_core_halted(&mut self, timeout: Option<Duration>) -> Result<(), ArmError> {
        self.adi.wait_delay(core_halted, timeout)
    }

    /// Halt the core. Does nothing if it is halted already.
    #[tracing::instrument(skip(self))]
    pub fn halt(&mut self, wait: bool, timeout: Option<Duration>) -> Result<(), ArmError> {
        if self.is_halted()? {
            return Ok(());
        }

        let mut dhcsr = Dhcsr::debug_enabled();
        dhcsr.set_c_halt(true);
        self.adi.write_mem32(Dhcsr::ADDRESS, dhcsr.into())?;

        if wait {
            self.wait_for_core_halted(timeout)?;
        }
        Ok(())
    }

    /// Let a halted core run. Does nothing if it is not halted.
    #[tracing::instrument(skip(self))]
    pub fn resume(&mut self, wait: bool, timeout: Option<Duration>) -> Result<(), ArmError> {
        if !self.is_halted()? {
            return Ok(());
        }

        let sequence = vec![
            self.adi
                .write_mem32_ops(Dfsr::ADDRESS, Dfsr::clear_halt_reasons().into()),
            self.adi
                .write_mem32_ops(Dhcsr::ADDRESS, Dhcsr::debug_enabled().into()),
        ];
        self.adi.transfer_sequence(sequence)?;

        if wait {
            self.adi
                .wait_delay(|adi| core_halted(adi).map(|halted| !halted), timeout)?;
        }
        Ok(())
    }

    /// Execute a single instruction with interrupts masked.
    #[tracing::instrument(skip(self))]
    pub fn step(&mut self) -> Result<(), ArmError> {
        let dhcsr = Dhcsr::from(self.adi.read_mem32(Dhcsr::ADDRESS)?);
        if !dhcsr.c_step() && !dhcsr.c_halt() {
            return Err(ArmError::CoreNotHalted);
        }

        // C_MASKINTS may only change while the core is halted.
        if !dhcsr.c_maskints() {
            let mut mask = Dhcsr::debug_enabled();
            mask.set_c_halt(true);
            mask.set_c_maskints(true);
            self.adi.write_mem32(Dhcsr::ADDRESS, mask.into())?;
        }

        let mut step = Dhcsr::debug_enabled();
        step.set_c_maskints(true);
        step.set_c_step(true);
        self.adi.write_mem32(Dhcsr::ADDRESS, step.into())?;

        let timeout = self.timeout;
        self.wait_for_core_halted(Some(timeout))?;

        let mut halt = Dhcsr::debug_enabled();
        halt.set_c_halt(true);
        self.adi.write_mem32(Dhcsr::ADDRESS, halt.into())
    }

    #[tracing::instrument(skip(self))]
    pub fn read_core_register(&mut self, register: CoreRegister) -> Result<u32, ArmError> {
        let values = self.read_core_registers(&[register])?;
        values
            .first()
            .copied()
            .ok_or_else(|| ArmError::Other(format!("No value read for {:?}", register)))
    }

    #[tracing::instrument(skip(self))]
    pub fn write_core_register(&mut self, register: CoreRegister, value: u32) -> Result<(), ArmError> {
        self.write_core_registers(&[(register, value)])
    }

    /// Read several core registers in one batched sequence.
    ///
    /// Each register is selected through DCRSR, then DHCSR is read to check
    /// `S_REGRDY` before the value is taken from DCRDR.
    pub fn read_core_registers(&mut self, registers: &[CoreRegister]) -> Result<Vec<u32>, ArmError> {
        let mut sequence = Vec::with_capacity(registers.len() * 3);
        for &register in registers {
            sequence.push(
                self.adi
                    .write_mem32_ops(Dcrsr::ADDRESS, dcrsr_for(register, false)),
            );
            sequence.push(self.adi.read_mem32_ops(Dhcsr::ADDRESS));
            sequence.push(self.adi.read_mem32_ops(Dcrdr::ADDRESS));
        }

        let values = self.adi.transfer_sequence(sequence)?;
        if values.len() != registers.len() * 2 {
            return Err(ArmError::Other(format!(
                "Expected {} values from the core register read, got {}",
                registers.len() * 2,
                values.len()
            )));
        }

        registers
            .iter()
            .zip(values.chunks_exact(2))
            .map(|(&register, pair)| {
                if Dhcsr::from(pair[0]).s_regrdy() {
                    Ok(pair[1])
                } else {
                    Err(ArmError::RegisterNotReady(register))
                }
            })
            .collect()
    }

    /// Write several core registers in one batched sequence.
    pub fn write_core_registers(&mut self, writes: &[(CoreRegister, u32)]) -> Result<(), ArmError> {
        let sequence = self.core_register_write_ops(writes);
        let values = self.adi.transfer_sequence(sequence)?;

        for (&(register, _), dhcsr) in writes.iter().zip(values) {
            if !Dhcsr::from(dhcsr).s_regrdy() {
                return Err(ArmError::RegisterNotReady(register));
            }
        }
        Ok(())
    }

    fn core_register_write_ops(&mut self, writes: &[(CoreRegister, u32)]) -> Vec<Vec<DapOperation>> {
        let mut sequence = Vec::with_capacity(writes.len() * 3);
        for &(register, value) in writes {
            sequence.push(self.adi.write_mem32_ops(Dcrdr::ADDRESS, value));
            sequence.push(
                self.adi
                    .write_mem32_ops(Dcrsr::ADDRESS, dcrsr_for(register, true)),
            );
            sequence.push(self.adi.read_mem32_ops(Dhcsr::ADDRESS));
        }
        sequence
    }

    /// The register writes that start code at `pc` with a breakpoint as return address.
    fn entry_registers(
        sp: u32,
        pc: u32,
        lr: u32,
        arguments: &[u32],
    ) -> Result<Vec<(CoreRegister, u32)>, ArmError> {
        if arguments.len() > MAX_ARGUMENT_REGISTERS {
            return Err(ArmError::TooManyRegisters {
                count: arguments.len(),
                max: MAX_ARGUMENT_REGISTERS,
            });
        }

        let mut writes = vec![
            (CoreRegister::Sp, sp),
            (CoreRegister::Pc, pc),
            (CoreRegister::Lr, lr),
        ];
        for (n, &value) in arguments.iter().enumerate() {
            let register = CoreRegister::general(n)
                .ok_or_else(|| ArmError::Other(format!("R{} is no general purpose register", n)))?;
            writes.push((register, value));
        }
        writes.push((CoreRegister::Xpsr, XPSR_THUMB));
        Ok(writes)
    }

    /// Resume and wait for the code to halt on its breakpoint.
    fn run_to_breakpoint(&mut self) -> Result<(), ArmError> {
        self.resume(false, None)?;

        let timeout = self.timeout;
        self.wait_for_core_halted(Some(timeout))
            .map_err(|error| match error {
                ArmError::WaitTimedOut(timeout) => ArmError::ExecuteTimeout(timeout),
                other => other,
            })
    }

    /// Load `code` to `address` and run it until it hits its final breakpoint.
    ///
    /// A BKPT is appended unless `code` already ends with one. `registers` preset
    /// R0 upwards.
    #[tracing::instrument(skip(self, code), fields(words = code.len()))]
    pub fn execute(
        &mut self,
        address: u32,
        code: &[u32],
        sp: u32,
        pc: u32,
        lr: u32,
        registers: &[u32],
    ) -> Result<(), ArmError> {
        let mut code = code.to_vec();
        if code.last() != Some(&BKPT_WORD) {
            code.push(BKPT_WORD);
        }

        let writes = Self::entry_registers(sp, pc, lr, registers)?;

        let timeout = self.timeout;
        self.halt(true, Some(timeout))?;
        self.write_core_registers(&writes)?;
        self.adi.write_block(address, &code)?;

        self.run_to_breakpoint()
    }

    /// Call a routine already in target memory and return R0.
    ///
    /// `lr` has to point at a breakpoint instruction, so that the core halts
    /// when the routine returns.
    #[tracing::instrument(skip(self))]
    pub fn run_function(
        &mut self,
        pc: u32,
        sp: u32,
        lr: u32,
        arguments: &[u32],
    ) -> Result<u32, ArmError> {
        let writes = Self::entry_registers(sp, pc, lr, arguments)?;

        let timeout = self.timeout;
        self.halt(true, Some(timeout))?;
        self.write_core_registers(&writes)?;

        self.run_to_breakpoint()?;
        self.read_core_register(CoreRegister::R0)
    }

    /// Reset the core through AIRCR.SYSRESETREQ.
    ///
    /// With `halt`, the core stops on the reset vector. DEMCR is restored afterwards.
    #[tracing::instrument(skip(self))]
    pub fn reset(&mut self, halt: bool) -> Result<(), ArmError> {
        let demcr = if halt {
            let demcr = Demcr::from(self.adi.read_mem32(Demcr::ADDRESS)?);
            let mut catch = demcr;
            catch.set_vc_corereset(true);
            self.adi.write_mem32(Demcr::ADDRESS, catch.into())?;
            Some(demcr)
        } else {
            None
        };

        self.adi
            .write_mem32(Aircr::ADDRESS, Aircr::system_reset().into())?;

        let timeout = self.timeout;
        self.adi.wait_delay(
            |adi| {
                let dhcsr = Dhcsr::from(adi.read_mem32(Dhcsr::ADDRESS)?);
                Ok(!dhcsr.s_reset_st())
            },
            Some(timeout),
        )?;

        if let Some(demcr) = demcr {
            self.adi.write_mem32(Demcr::ADDRESS, demcr.into())?;
        }
        Ok(())
    }

    /// Reset without halting.
    pub fn soft_reset(&mut self) -> Result<(), ArmError> {
        self.reset(false)
    }

    pub fn set_breakpoint(&mut self, address: u32) -> Result<Breakpoint, ArmError> {
        self.breakpoints.set(&mut self.adi, address)
    }

    pub fn delete_breakpoint(&mut self, address: u32) -> Result<(), ArmError> {
        self.breakpoints.delete(&mut self.adi, address)
    }

    pub fn disable_breakpoint(&mut self, address: u32) -> Result<(), ArmError> {
        self.breakpoints.disable(&mut self.adi, address)
    }

    pub fn enable_breakpoint(&mut self, address: u32) -> Result<Breakpoint, ArmError> {
        self.breakpoints.enable(&mut self.adi, address)
    }

    pub fn clear_breakpoints(&mut self) -> Result<(), ArmError> {
        self.breakpoints.clear(&mut self.adi)
    }

    pub fn breakpoint(&self, address: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(address)
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.breakpoints()
    }

    /// Comparators still free for hardware breakpoints.
    pub fn available_breakpoint_units(&self) -> usize {
        self.breakpoints.available_comparators()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::architecture::arm::core::registers::{FpCompX, FpCtrl};
    use crate::probe::cmsisdap::CmsisDap;
    use crate::probe::mock::MockProbe;

    const S_RESET_ST: u32 = 1 << 25;
    const S_RETIRE_ST: u32 = 1 << 24;
    const S_HALT: u32 = 1 << 17;

    fn config() -> DapConfig {
        DapConfig {
            poll_interval_ms: 1,
            execute_timeout_ms: 200,
            ..Default::default()
        }
    }

    fn connected(mock: &MockProbe) -> CortexM<CmsisDap> {
        let config = config();
        let adi = Adi::new(CmsisDap::new(mock.clone(), &config), &config).unwrap();
        let mut core = CortexM::new(adi, &config);
        core.connect().unwrap();
        core
    }

    #[test]
    fn state_rereads_on_reset() {
        let mock = MockProbe::new();
        let mut core = connected(&mock);

        mock.state()
            .core
            .dhcsr_script
            .extend([S_RESET_ST | S_HALT, S_RESET_ST]);
        assert_eq!(core.state().unwrap(), CoreState::Reset);

        mock.state()
            .core
            .dhcsr_script
            .extend([S_RESET_ST | S_HALT, S_RESET_ST | S_RETIRE_ST]);
        assert_eq!(core.state().unwrap(), CoreState::Halted);

        mock.state().core.dhcsr_script.push_back(S_HALT);
        assert_eq!(core.state().unwrap(), CoreState::Halted);
        assert!(mock.state().core.dhcsr_script.is_empty());
    }

    #[test]
    fn halt_and_resume() {
        let mock = MockProbe::new();
        let mut core = connected(&mock);

        assert_eq!(core.state().unwrap(), CoreState::Running);
        core.halt(true, Some(Duration::from_millis(100))).unwrap();
        assert!(core.is_halted().unwrap());

        core.resume(true, Some(Duration::from_millis(100))).unwrap();
        assert!(!core.is_halted().unwrap());
        assert_eq!(mock.state().core.dfsr_writes, vec![0x7]);
    }

    #[test]
    fn halt_is_noop_when_halted() {
        let mock = MockProbe::new();
        let mut core = connected(&mock);
        core.halt(true, None).unwrap();

        let writes = mock.state().core.dhcsr_writes.len();
        core.halt(true, None).unwrap();
        assert_eq!(mock.state().core.dhcsr_writes.len(), writes);
    }

    #[test]
    fn halt_times_out() {
        let mock = MockProbe::new();
        mock.state().core.ignore_halt = true;
        let mut core = connected(&mock);

        assert!(matches!(
            core.halt(true, Some(Duration::from_millis(10))),
            Err(ArmError::WaitTimedOut(_))
        ));
    }

    #[test]
    fn step_requires_halt() {
        let mock = MockProbe::new();
        let mut core = connected(&mock);

        assert!(matches!(core.step(), Err(ArmError::CoreNotHalted)));

        core.halt(true, None).unwrap();
        core.write_core_register(CoreRegister::Pc, 0x0800_0100).unwrap();
        core.step().unwrap();

        assert_eq!(core.read_core_register(CoreRegister::Pc).unwrap(), 0x0800_0102);
        let last = *mock.state().core.dhcsr_writes.last().unwrap();
        assert_eq!(last, 0xA05F_0003);
    }

    #[test]
    fn core_registers_round_trip() {
        let mock = MockProbe::new();
        let mut core = connected(&mock);
        core.halt(true, None).unwrap();

        core.write_core_registers(&[
            (CoreRegister::R0, 0x1111_1111),
            (CoreRegister::R7, 0x7777_7777),
            (CoreRegister::Sp, 0x2000_1000),
        ])
        .unwrap();

        assert_eq!(
            core.read_core_registers(&[CoreRegister::Sp, CoreRegister::R7, CoreRegister::R0])
                .unwrap(),
            vec![0x2000_1000, 0x7777_7777, 0x1111_1111]
        );
        assert_eq!(mock.state().core.registers[13], 0x2000_1000);
    }

    #[test]
    fn register_not_ready() {
        let mock = MockProbe::new();
        let mut core = connected(&mock);
        core.halt(true, None).unwrap();
        mock.state().core.regrdy = false;

        assert!(matches!(
            core.read_core_register(CoreRegister::R3),
            Err(ArmError::RegisterNotReady(CoreRegister::R3))
        ));
        assert!(matches!(
            core.write_core_register(CoreRegister::Lr, 0),
            Err(ArmError::RegisterNotReady(CoreRegister::Lr))
        ));
    }

    #[test]
    fn too_many_registers() {
        let mock = MockProbe::new();
        let mut core = connected(&mock);

        let error = core
            .execute(0x2000_0000, &[], 0x2000_1000, 0x2000_0001, 0, &[0; 13])
            .unwrap_err();
        assert!(matches!(
            error,
            ArmError::TooManyRegisters { count: 13, max: 12 }
        ));
    }

    #[test]
    fn execute_appends_breakpoint() {
        let mock = MockProbe::new();
        mock.state().core.resume_result = Some(0);
        let mut core = connected(&mock);

        core.execute(0x2000_0000, &[0x4770_2000], 0x2000_1000, 0x2000_0001, 0, &[5])
            .unwrap();
        assert_eq!(
            mock.state().read_word(0x2000_0004),
            BKPT_WORD
        );

        // Already terminated code is left alone.
        core.execute(0x2000_0100, &[0x0000_4770, BKPT_WORD], 0x2000_1000, 0x2000_0101, 0, &[])
            .unwrap();
        assert_eq!(mock.state().read_word(0x2000_0108), 0);
    }

    #[test]
    fn execute_times_out() {
        let mock = MockProbe::new();
        let mut core = connected(&mock);

        let error = core
            .execute(0x2000_0000, &[0x0000_E7FE], 0x2000_1000, 0x2000_0001, 0, &[])
            .unwrap_err();
        assert!(matches!(error, ArmError::ExecuteTimeout(_)));
    }

    #[test]
    fn run_function_returns_r0() {
        let mock = MockProbe::new();
        mock.state().core.resume_result = Some(0x42);
        let mut core = connected(&mock);

        let r0 = core
            .run_function(0x2000_0021, 0x2000_1000, 0x2000_0001, &[1, 2, 3])
            .unwrap();
        assert_eq!(r0, 0x42);

        let state = mock.state();
        assert_eq!(state.core.runs, vec![0x2000_0021]);
        assert_eq!(state.core.registers[16], 0x0100_0000);
        assert_eq!(state.core.registers[14], 0x2000_0001);
    }

    #[test]
    fn reset_and_halt_restores_demcr() {
        let mock = MockProbe::new();
        mock.state().core.demcr = 0x0100_0000;
        let mut core = connected(&mock);

        core.reset(true).unwrap();

        let state = mock.state();
        assert_eq!(state.core.resets, 1);
        assert!(state.core.halted);
        assert_eq!(state.core.demcr, 0x0100_0000);
    }

    #[test]
    fn soft_reset_keeps_running() {
        let mock = MockProbe::new();
        let mut core = connected(&mock);

        core.soft_reset().unwrap();
        assert_eq!(mock.state().core.resets, 1);
        assert!(!mock.state().core.halted);
    }

    fn with_comparators(count: u32) -> (MockProbe, CortexM<CmsisDap>) {
        let mock = MockProbe::new();
        mock.state().core.fp_ctrl = count << 4;
        let core = connected(&mock);
        (mock, core)
    }

    #[test]
    fn breakpoint_pool() {
        let (mock, mut core) = with_comparators(2);
        mock.state().write_memory(0x0000_0300, &[0x00, 0xBF]);
        assert_eq!(core.available_breakpoint_units(), 2);

        let first = core.set_breakpoint(0x0000_0100).unwrap();
        let second = core.set_breakpoint(0x0000_0202).unwrap();
        let third = core.set_breakpoint(0x0000_0300).unwrap();

        assert_eq!(
            first,
            Breakpoint::Hardware {
                register: FpCompX::COMP0,
                address: 0x100
            }
        );
        assert_eq!(
            second,
            Breakpoint::Hardware {
                register: FpCompX::COMP0 + 4,
                address: 0x202
            }
        );
        assert_eq!(
            third,
            Breakpoint::Software {
                address: 0x300,
                instruction: 0xBF00
            }
        );

        {
            let state = mock.state();
            assert!(state.core.fpb_enabled);
            assert_eq!(state.read_word(FpCompX::COMP0), 0x4000_0101);
            assert_eq!(state.read_word(FpCompX::COMP0 + 4), 0x8000_0201);
            assert_eq!(state.read_memory(0x300, 2), vec![0x2A, 0xBE]);
        }

        // A freed comparator is handed out again.
        core.delete_breakpoint(0x0000_0100).unwrap();
        assert_eq!(mock.state().read_word(FpCompX::COMP0), 0);
        assert_eq!(core.available_breakpoint_units(), 1);

        let fourth = core.set_breakpoint(0x0000_0400).unwrap();
        assert_eq!(
            fourth,
            Breakpoint::Hardware {
                register: FpCompX::COMP0,
                address: 0x400
            }
        );

        core.delete_breakpoint(0x0000_0300).unwrap();
        assert_eq!(mock.state().read_memory(0x300, 2), vec![0x00, 0xBF]);
    }

    #[test]
    fn ram_breakpoints_are_software() {
        let (mock, mut core) = with_comparators(4);

        let breakpoint = core.set_breakpoint(0x2000_0010).unwrap();
        assert!(matches!(breakpoint, Breakpoint::Software { .. }));
        assert_eq!(core.available_breakpoint_units(), 4);
        assert!(!mock.state().core.fpb_enabled);
    }

    #[test]
    fn fpb_is_disabled_on_connect() {
        let (mock, _core) = with_comparators(6);
        assert_eq!(mock.state().core.fp_ctrl_writes, vec![u32::from(FpCtrl::with_enable(false))]);
    }

    #[test]
    fn disable_and_enable() {
        let (mock, mut core) = with_comparators(1);

        core.set_breakpoint(0x0000_0100).unwrap();
        core.disable_breakpoint(0x0000_0100).unwrap();
        assert_eq!(
            core.breakpoint(0x100),
            Some(&Breakpoint::Disabled { address: 0x100 })
        );
        assert_eq!(mock.state().read_word(FpCompX::COMP0), 0);
        assert_eq!(core.available_breakpoint_units(), 1);

        let enabled = core.enable_breakpoint(0x0000_0100).unwrap();
        assert!(matches!(enabled, Breakpoint::Hardware { .. }));

        core.clear_breakpoints().unwrap();
        assert_eq!(core.breakpoints().count(), 0);
        assert!(matches!(
            core.delete_breakpoint(0x100),
            Err(ArmError::BreakpointNotFound(0x100))
        ));
    }
}
