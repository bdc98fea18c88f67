//! Debug port registers.

use bitfield::bitfield;

/// A register of the debug port, addressed by A\[3:2\].
pub trait DpRegister: From<u32> + Into<u32> {
    const ADDRESS: u8;
    const NAME: &'static str;
}

bitfield! {
    /// ABORT, write only. Clears sticky error flags and aborts transfers.
    #[derive(Clone, Copy, Default)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 4;
    pub _, set_wderrclr: 3;
    pub _, set_stkerrclr: 2;
    pub _, set_stkcmpclr: 1;
    pub _, set_dapabort: 0;
}

impl Abort {
    /// Every sticky error clear flag, without aborting a transfer.
    pub fn clear_all() -> Self {
        let mut abort = Abort(0);
        abort.set_stkcmpclr(true);
        abort.set_stkerrclr(true);
        abort.set_wderrclr(true);
        abort.set_orunerrclr(true);
        abort
    }
}

impl From<u32> for Abort {
    fn from(raw: u32) -> Self {
        Abort(raw)
    }
}

impl From<Abort> for u32 {
    fn from(raw: Abort) -> Self {
        raw.0
    }
}

impl DpRegister for Abort {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "ABORT";
}

bitfield! {
    /// CTRL/STAT, power-up requests and sticky status.
    #[derive(Clone, Copy, Default)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub cdbgrstack, _: 27;
    pub c_dbg_rst_req, set_c_dbg_rst_req: 26;
    pub w_data_err, _ : 7;
    pub read_ok, _ : 6;
    pub sticky_err, _: 5;
    pub stick_cmp, _: 4;
    pub sticky_orun, _: 1;
    pub orun_detect, set_orun_detect: 0;
}

impl Ctrl {
    /// Request power for both the system and the debug domain.
    pub fn power_up_request() -> Self {
        let mut ctrl = Ctrl(0);
        ctrl.set_csyspwrupreq(true);
        ctrl.set_cdbgpwrupreq(true);
        ctrl
    }

    pub fn is_powered_up(&self) -> bool {
        self.csyspwrupack() && self.cdbgpwrupack()
    }
}

impl From<u32> for Ctrl {
    fn from(raw: u32) -> Self {
        Ctrl(raw)
    }
}

impl From<Ctrl> for u32 {
    fn from(raw: Ctrl) -> Self {
        raw.0
    }
}

impl DpRegister for Ctrl {
    const ADDRESS: u8 = 0x4;
    const NAME: &'static str = "CTRL/STAT";
}

bitfield! {
    /// SELECT, chooses the AP and the register bank of following AP accesses.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Select(u32);
    impl Debug;
    pub u8, ap_sel, set_ap_sel: 31, 24;
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

impl Select {
    /// The SELECT value that addresses the bank of an AP register
    /// given as `(APSEL << 24) | offset`.
    pub fn for_ap_register(register: u32) -> Self {
        Select((register & 0xFF00_0000) | (register & 0x0000_00F0))
    }
}

impl From<u32> for Select {
    fn from(raw: u32) -> Self {
        Select(raw)
    }
}

impl From<Select> for u32 {
    fn from(raw: Select) -> Self {
        raw.0
    }
}

impl DpRegister for Select {
    const ADDRESS: u8 = 0x8;
    const NAME: &'static str = "SELECT";
}

bitfield! {
    /// DPIDR, read only identification of the debug port.
    #[derive(Clone, Copy)]
    pub struct Dpidr(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u8, part_no, _: 27, 20;
    pub min, _: 16;
    pub u8, version, _: 15, 12;
    pub u16, designer, _: 11, 1;
}

impl From<u32> for Dpidr {
    fn from(raw: u32) -> Self {
        Dpidr(raw)
    }
}

impl From<Dpidr> for u32 {
    fn from(raw: Dpidr) -> Self {
        raw.0
    }
}

impl DpRegister for Dpidr {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "DPIDR";
}

/// RDBUFF, the result of the last AP read.
#[derive(Clone, Copy, Debug)]
pub struct RdBuff(pub u32);

impl From<u32> for RdBuff {
    fn from(raw: u32) -> Self {
        RdBuff(raw)
    }
}

impl From<RdBuff> for u32 {
    fn from(raw: RdBuff) -> Self {
        raw.0
    }
}

impl DpRegister for RdBuff {
    const ADDRESS: u8 = 0xC;
    const NAME: &'static str = "RDBUFF";
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clear_all_sets_every_flag() {
        assert_eq!(u32::from(Abort::clear_all()), 0x1E);
    }

    #[test]
    fn select_for_ap_register() {
        assert_eq!(u32::from(Select::for_ap_register(0x0100_00FC)), 0x0100_00F0);
        assert_eq!(u32::from(Select::for_ap_register(0x0000_000C)), 0);
    }

    #[test]
    fn dpidr_fields() {
        let dpidr = Dpidr(0x2BA0_1477);
        assert_eq!(dpidr.version(), 1);
        assert_eq!(dpidr.designer(), 0x23B);
        assert_eq!(dpidr.part_no(), 0xBA);
    }
}
