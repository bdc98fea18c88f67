//! Memory mapped debug registers of the Cortex-M system control space.

use bitfield::bitfield;

/// A 32 bit register at a fixed address of the memory map.
pub trait MemoryMappedRegister: From<u32> + Into<u32> {
    const ADDRESS: u32;
    const NAME: &'static str;
}

macro_rules! memory_mapped_register {
    ($name:ident, $address:expr, $display:expr) => {
        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                $name(value)
            }
        }

        impl From<$name> for u32 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl MemoryMappedRegister for $name {
            const ADDRESS: u32 = $address;
            const NAME: &'static str = $display;
        }
    };
}

bitfield! {
    /// Debug Halting Control and Status Register, DHCSR.
    ///
    /// Writes are ignored unless the debug key is set via [`Dhcsr::enable_write`].
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Dhcsr(u32);
    impl Debug;
    /// Sticky, set if the core was reset since the last read.
    pub s_reset_st, _: 25;
    /// Sticky, set if an instruction retired since the last read.
    pub s_retire_st, _: 24;
    pub s_lockup, _: 19;
    pub s_sleep, _: 18;
    pub s_halt, _: 17;
    /// A core register transfer through DCRSR has completed.
    pub s_regrdy, _: 16;
    pub c_maskints, set_c_maskints: 3;
    pub c_step, set_c_step: 2;
    pub c_halt, set_c_halt: 1;
    pub c_debugen, set_c_debugen: 0;
}

impl Dhcsr {
    /// Set the debug key, without it writes to DHCSR have no effect.
    pub fn enable_write(&mut self) {
        self.0 &= !(0xffff << 16);
        self.0 |= 0xa05f << 16;
    }

    /// A writable value with `C_DEBUGEN` set.
    pub fn debug_enabled() -> Self {
        let mut dhcsr = Dhcsr(0);
        dhcsr.enable_write();
        dhcsr.set_c_debugen(true);
        dhcsr
    }
}

memory_mapped_register!(Dhcsr, 0xE000_EDF0, "DHCSR");

bitfield! {
    /// Debug Core Register Selector Register, DCRSR.
    #[derive(Copy, Clone)]
    pub struct Dcrsr(u32);
    impl Debug;
    pub _, set_regwnr: 16;
    pub _, set_regsel: 6, 0;
}

memory_mapped_register!(Dcrsr, 0xE000_EDF4, "DCRSR");

/// Debug Core Register Data Register, DCRDR.
#[derive(Copy, Clone, Debug)]
pub struct Dcrdr(pub u32);

memory_mapped_register!(Dcrdr, 0xE000_EDF8, "DCRDR");

bitfield! {
    /// Debug Exception and Monitor Control Register, DEMCR.
    #[derive(Copy, Clone)]
    pub struct Demcr(u32);
    impl Debug;
    pub trcena, set_trcena: 24;
    pub vc_harderr, set_vc_harderr: 10;
    /// Halt on the reset vector.
    pub vc_corereset, set_vc_corereset: 0;
}

memory_mapped_register!(Demcr, 0xE000_EDFC, "DEMCR");

bitfield! {
    /// Application Interrupt and Reset Control Register, AIRCR.
    #[derive(Copy, Clone)]
    pub struct Aircr(u32);
    impl Debug;
    get_vectkeystat, set_vectkey: 31, 16;
    pub sysresetreq, set_sysresetreq: 2;
    pub vectclractive, set_vectclractive: 1;
}

impl Aircr {
    pub fn vectkey(&mut self) {
        self.set_vectkey(0x05FA);
    }

    /// A writable value requesting a system reset.
    pub fn system_reset() -> Self {
        let mut aircr = Aircr(0);
        aircr.vectkey();
        aircr.set_sysresetreq(true);
        aircr
    }
}

memory_mapped_register!(Aircr, 0xE000_ED0C, "AIRCR");

bitfield! {
    /// Debug Fault Status Register, DFSR. Bits are cleared by writing one.
    #[derive(Copy, Clone)]
    pub struct Dfsr(u32);
    impl Debug;
    pub external, set_external: 4;
    pub vcatch, set_vcatch: 3;
    pub dwttrap, set_dwttrap: 2;
    pub bkpt, set_bkpt: 1;
    pub halted, set_halted: 0;
}

impl Dfsr {
    /// The value that clears the halt reasons left behind by a breakpoint.
    pub fn clear_halt_reasons() -> Self {
        let mut dfsr = Dfsr(0);
        dfsr.set_dwttrap(true);
        dfsr.set_bkpt(true);
        dfsr.set_halted(true);
        dfsr
    }
}

memory_mapped_register!(Dfsr, 0xE000_ED30, "DFSR");

bitfield! {
    /// Flash Patch Control Register, FP_CTRL.
    #[derive(Copy, Clone)]
    pub struct FpCtrl(u32);
    impl Debug;
    pub rev, _: 31, 28;
    num_code_1, _: 14, 12;
    pub num_lit, _: 11, 8;
    num_code_0, _: 7, 4;
    pub _, set_key: 1;
    pub enable, set_enable: 0;
}

impl FpCtrl {
    /// The number of instruction address comparators.
    pub fn num_code(&self) -> u32 {
        (self.num_code_1() << 4) | self.num_code_0()
    }

    /// A writable value that switches the unit on or off.
    pub fn with_enable(enable: bool) -> Self {
        let mut ctrl = FpCtrl(0);
        ctrl.set_key(true);
        ctrl.set_enable(enable);
        ctrl
    }
}

memory_mapped_register!(FpCtrl, 0xE000_2000, "FP_CTRL");

bitfield! {
    /// Flash Patch Comparator register, FP_COMPn.
    #[derive(Copy, Clone)]
    pub struct FpCompX(u32);
    impl Debug;
    /// `01` matches the lower, `10` the upper halfword of the word at COMP.
    pub replace, set_replace: 31, 30;
    pub comp, set_comp: 28, 2;
    pub enable, set_enable: 0;
}

impl FpCompX {
    /// Address of the first comparator.
    pub const COMP0: u32 = 0xE000_2008;

    /// Comparator value for a breakpoint at `address` in the code region.
    pub fn breakpoint_configuration(address: u32) -> Self {
        let mut reg = FpCompX(0);

        let replace = if address & 0x2 == 0 { 0b01 } else { 0b10 };

        reg.set_replace(replace);
        reg.set_comp((address & 0x1FFF_FFFC) >> 2);
        reg.set_enable(true);
        reg
    }
}

impl From<u32> for FpCompX {
    fn from(value: u32) -> Self {
        FpCompX(value)
    }
}

impl From<FpCompX> for u32 {
    fn from(value: FpCompX) -> Self {
        value.0
    }
}
