//! Cortex-M processor control.

pub mod breakpoints;
pub mod cortex_m;
pub mod registers;

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

use registers::Dhcsr;

pub use breakpoints::Breakpoint;
pub use cortex_m::CortexM;

/// Run state of the core as reported by DHCSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Reset,
    Lockup,
    Sleeping,
    /// Halted in debug state.
    Halted,
    Running,
}

impl CoreState {
    /// Classify one DHCSR read.
    ///
    /// `S_RESET_ST` is sticky, so a set bit needs a second read to tell a core
    /// still held in reset from one that has just left it. `reread` is that
    /// second value, and the core only counts as in reset if it shows
    /// `S_RESET_ST` again without having retired an instruction.
    pub fn from_dhcsr(dhcsr: Dhcsr, reread: Option<Dhcsr>) -> Self {
        let state = if dhcsr.s_lockup() {
            CoreState::Lockup
        } else if dhcsr.s_sleep() {
            CoreState::Sleeping
        } else if dhcsr.s_halt() {
            CoreState::Halted
        } else {
            CoreState::Running
        };

        match reread {
            Some(second) if dhcsr.s_reset_st() && second.s_reset_st() && !second.s_retire_st() => {
                CoreState::Reset
            }
            _ => state,
        }
    }

    pub fn is_halted(&self) -> bool {
        *self == CoreState::Halted
    }
}

/// A core register, numbered as selected through DCRSR.REGSEL.
#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoreRegister {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    Sp = 13,
    Lr = 14,
    Pc = 15,
    Xpsr = 16,
    Msp = 17,
    Psp = 18,
    /// CONTROL, FAULTMASK, BASEPRI and PRIMASK packed into one word.
    Control = 20,
}

impl CoreRegister {
    /// Number of general purpose registers, R0 to R12.
    ///
    /// Executed code only takes arguments in R0 to R11, see
    /// [`MAX_ARGUMENT_REGISTERS`](cortex_m::MAX_ARGUMENT_REGISTERS).
    pub const GENERAL_PURPOSE: usize = 13;

    /// The general purpose register `Rn`.
    pub fn general(n: usize) -> Option<Self> {
        if n < Self::GENERAL_PURPOSE {
            Self::from_usize(n)
        } else {
            None
        }
    }

    pub fn regsel(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    const S_RESET_ST: u32 = 1 << 25;
    const S_RETIRE_ST: u32 = 1 << 24;
    const S_LOCKUP: u32 = 1 << 19;
    const S_SLEEP: u32 = 1 << 18;
    const S_HALT: u32 = 1 << 17;

    #[test_case(0, None => CoreState::Running ; "running")]
    #[test_case(S_HALT, None => CoreState::Halted ; "halted")]
    #[test_case(S_SLEEP | S_HALT, None => CoreState::Sleeping ; "sleep wins over halt")]
    #[test_case(S_LOCKUP | S_SLEEP, None => CoreState::Lockup ; "lockup wins over sleep")]
    #[test_case(S_RESET_ST | S_HALT, Some(S_RESET_ST) => CoreState::Reset ; "still in reset")]
    #[test_case(S_RESET_ST | S_HALT, Some(S_RESET_ST | S_RETIRE_ST) => CoreState::Halted ; "left reset")]
    #[test_case(S_RESET_ST, Some(0) => CoreState::Running ; "reset bit cleared")]
    #[test_case(S_HALT, Some(S_RESET_ST) => CoreState::Halted ; "second read alone is not enough")]
    fn classify(first: u32, second: Option<u32>) -> CoreState {
        CoreState::from_dhcsr(Dhcsr::from(first), second.map(Dhcsr::from))
    }

    #[test]
    fn general_purpose_registers() {
        assert_eq!(CoreRegister::general(0), Some(CoreRegister::R0));
        assert_eq!(CoreRegister::general(12), Some(CoreRegister::R12));
        assert_eq!(CoreRegister::general(13), None);
        assert_eq!(CoreRegister::Xpsr.regsel(), 16);
    }

    #[test]
    fn arguments_stop_below_r12() {
        assert_eq!(cortex_m::MAX_ARGUMENT_REGISTERS, CoreRegister::GENERAL_PURPOSE - 1);
        assert_eq!(
            CoreRegister::general(cortex_m::MAX_ARGUMENT_REGISTERS - 1),
            Some(CoreRegister::R11)
        );
    }
}
